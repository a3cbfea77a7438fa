//! Sequential record log keychain.
//!
//! Records are sector keys (header + unpadded key) appended to
//! `_filemap.NNNNN`. An ordered in-memory map from key to record position is
//! rebuilt at open by scanning every file. Updating a key rewrites its
//! record in place (same key, same length); erasing rewrites the state byte.
//! A torn record at the end of the last file is cut off at open.

use crate::error::{CoreError, CoreResult};
use crate::key::{SectorHeader, SectorKey, SectorState, MAX_KEY_LEN, SECTOR_KEY_HEADER};
use crate::keychain::KeyIndex;
use lld_storage::{StorageBackend, Volume};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

fn file_name(file: u16) -> String {
    format!("_filemap.{file:05}")
}

/// Position of a record in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RecordPos {
    file: u16,
    offset: u64,
}

/// Append-log keychain with an ordered in-memory map.
pub struct FilemapKeychain {
    volume: Arc<dyn Volume>,
    files: Vec<Box<dyn StorageBackend>>,
    map: BTreeMap<Vec<u8>, (RecordPos, SectorKey)>,
    max_file_size: u64,
}

impl FilemapKeychain {
    /// Opens the keychain stored in `volume`, rebuilding the key map.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if no log exists and `create` is false, or
    /// `CorruptIndex` for a record with an unknown state.
    pub fn open(volume: Arc<dyn Volume>, max_file_size: u64, create: bool) -> CoreResult<Self> {
        if !volume.exists(&file_name(0))? && !create {
            return Err(CoreError::invalid_format(format!(
                "no filemap keychain in {}",
                volume.location()
            )));
        }

        let mut keychain = Self {
            volume,
            files: Vec::new(),
            map: BTreeMap::new(),
            max_file_size: max_file_size.max(1),
        };

        let mut file: u16 = 0;
        loop {
            let name = file_name(file);
            if file > 0 && !keychain.volume.exists(&name)? {
                break;
            }
            let backend = keychain.volume.open(&name)?;
            keychain.files.push(backend);
            keychain.scan(file)?;
            file = file
                .checked_add(1)
                .ok_or_else(|| CoreError::corrupt_index("too many filemap files"))?;
        }

        debug!(
            files = keychain.files.len(),
            keys = keychain.map.len(),
            "filemap keychain loaded"
        );
        Ok(keychain)
    }

    fn scan(&mut self, file: u16) -> CoreResult<()> {
        let backend = &self.files[file as usize];
        let size = backend.size()?;
        let data = backend.read_at(0, size as usize)?;

        let mut offset = 0usize;
        while offset < data.len() {
            let rest = &data[offset..];
            if rest.len() < SECTOR_KEY_HEADER {
                break;
            }
            let header = SectorHeader::decode(rest)?;
            let len = SECTOR_KEY_HEADER + header.key_len as usize;
            if rest.len() < len {
                break;
            }
            if header.state == SectorState::Ready {
                let entry = SectorKey::decode(&rest[..len])?;
                let pos = RecordPos {
                    file,
                    offset: offset as u64,
                };
                self.map.insert(entry.key.clone(), (pos, entry));
            }
            offset += len;
        }

        if offset < data.len() {
            warn!(
                file = %file_name(file),
                at = offset,
                dropped = data.len() - offset,
                "cutting torn filemap record"
            );
            self.files[file as usize].truncate(offset as u64)?;
        }
        Ok(())
    }

    fn append_record(&mut self, record: &[u8]) -> CoreResult<RecordPos> {
        let mut current = self.files.len() - 1;
        if self.files[current].size()? + record.len() as u64 > self.max_file_size
            && self.files[current].size()? > 0
        {
            let next = u16::try_from(self.files.len())
                .map_err(|_| CoreError::corrupt_index("too many filemap files"))?;
            self.files[current].sync()?;
            self.files.push(self.volume.open(&file_name(next))?);
            current = next as usize;
        }
        let offset = self.files[current].append(record)?;
        Ok(RecordPos {
            file: current as u16,
            offset,
        })
    }

    /// Number of log files.
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.files.len()
    }
}

impl KeyIndex for FilemapKeychain {
    fn kind(&self) -> &'static str {
        "filemap"
    }

    fn max_key_len(&self) -> usize {
        MAX_KEY_LEN
    }

    fn get(&self, key: &[u8]) -> CoreResult<Option<SectorKey>> {
        Ok(self.map.get(key).map(|(_, entry)| entry.clone()))
    }

    fn has(&self, key: &[u8]) -> CoreResult<bool> {
        Ok(self.map.contains_key(key))
    }

    fn put(&mut self, entry: &SectorKey) -> CoreResult<()> {
        if entry.key.len() > MAX_KEY_LEN {
            return Err(CoreError::KeyTooLarge {
                len: entry.key.len(),
                max: MAX_KEY_LEN,
            });
        }
        if entry.state != SectorState::Ready {
            self.erase(&entry.key)?;
            return Ok(());
        }

        let record = entry.encode();
        let existing = self.map.get(&entry.key).map(|(pos, _)| *pos);
        let pos = match existing {
            Some(pos) => {
                self.files[pos.file as usize].write_at(pos.offset, &record)?;
                pos
            }
            None => self.append_record(&record)?,
        };
        self.map.insert(entry.key.clone(), (pos, entry.clone()));
        Ok(())
    }

    fn erase(&mut self, key: &[u8]) -> CoreResult<bool> {
        let Some((pos, _)) = self.map.remove(key) else {
            return Ok(false);
        };
        self.files[pos.file as usize].write_at(pos.offset, &[SectorState::Empty.as_byte()])?;
        Ok(true)
    }

    fn keys(&self) -> CoreResult<Vec<Vec<u8>>> {
        Ok(self.map.keys().cloned().collect())
    }

    fn len(&self) -> CoreResult<usize> {
        Ok(self.map.len())
    }

    fn flush(&mut self) -> CoreResult<()> {
        for file in &mut self.files {
            file.sync()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for FilemapKeychain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilemapKeychain")
            .field("location", &self.volume.location())
            .field("files", &self.files.len())
            .field("keys", &self.map.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SectorLocation;
    use lld_storage::MemoryVolume;

    fn entry(key: &[u8], offset: u32) -> SectorKey {
        SectorKey::ready(
            key,
            SectorLocation {
                file: 0,
                offset,
                len: 1,
            },
        )
    }

    fn open(volume: &MemoryVolume) -> FilemapKeychain {
        FilemapKeychain::open(Arc::new(volume.clone()), 1 << 20, true).unwrap()
    }

    #[test]
    fn put_get_erase_and_reload() {
        let volume = MemoryVolume::new();
        {
            let mut keychain = open(&volume);
            keychain.put(&entry(b"trust/1", 0)).unwrap();
            keychain.put(&entry(b"trust/2", 1)).unwrap();
            keychain.put(&entry(b"trust/1", 2)).unwrap();
            keychain.erase(b"trust/2").unwrap();
            keychain.put(&entry(b"trust/3", 3)).unwrap();
        }

        let keychain = open(&volume);
        assert_eq!(keychain.get(b"trust/1").unwrap(), Some(entry(b"trust/1", 2)));
        assert_eq!(keychain.get(b"trust/2").unwrap(), None);
        assert_eq!(
            keychain.keys().unwrap(),
            vec![b"trust/1".to_vec(), b"trust/3".to_vec()]
        );
    }

    #[test]
    fn update_rewrites_in_place() {
        let volume = MemoryVolume::new();
        let mut keychain = open(&volume);
        keychain.put(&entry(b"k", 0)).unwrap();
        let size = volume.backend("_filemap.00000").unwrap().data().len();
        keychain.put(&entry(b"k", 99)).unwrap();
        assert_eq!(volume.backend("_filemap.00000").unwrap().data().len(), size);
    }

    #[test]
    fn erase_then_put_appends_fresh_record() {
        let volume = MemoryVolume::new();
        {
            let mut keychain = open(&volume);
            keychain.put(&entry(b"k", 0)).unwrap();
            assert!(keychain.erase(b"k").unwrap());
            assert!(!keychain.erase(b"k").unwrap());
            keychain.put(&entry(b"k", 7)).unwrap();
        }
        let keychain = open(&volume);
        assert_eq!(keychain.get(b"k").unwrap(), Some(entry(b"k", 7)));
    }

    #[test]
    fn rolls_to_new_file() {
        let volume = MemoryVolume::new();
        let mut keychain = FilemapKeychain::open(Arc::new(volume.clone()), 32, true).unwrap();
        for i in 0u8..5 {
            keychain.put(&entry(&[i; 8], u32::from(i))).unwrap();
        }
        assert!(keychain.file_count() > 1);

        let reopened = FilemapKeychain::open(Arc::new(volume), 32, true).unwrap();
        assert_eq!(reopened.keys().unwrap().len(), 5);
    }

    #[test]
    fn torn_tail_is_cut() {
        let volume = MemoryVolume::new();
        {
            let mut keychain = open(&volume);
            keychain.put(&entry(b"whole", 0)).unwrap();
        }
        let mut raw = volume.backend("_filemap.00000").unwrap();
        raw.append(&entry(b"torn", 1).encode()[..9]).unwrap();

        let mut keychain = open(&volume);
        assert_eq!(keychain.keys().unwrap(), vec![b"whole".to_vec()]);
        keychain.put(&entry(b"next", 2)).unwrap();
        drop(keychain);
        assert_eq!(open(&volume).keys().unwrap().len(), 2);
    }

    #[test]
    fn missing_log_without_create() {
        let volume: Arc<dyn Volume> = Arc::new(MemoryVolume::new());
        assert!(FilemapKeychain::open(volume, 1024, false).is_err());
    }
}
