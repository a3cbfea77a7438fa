//! Append-oriented sector data files.
//!
//! Values live back to back in `_block.NNNNN`. Only the last file takes
//! appends; a new one is started when the next value would push the active
//! file past the configured size.

use crate::error::{CoreError, CoreResult};
use crate::types::SectorLocation;
use lld_storage::{StorageBackend, Volume};
use std::sync::Arc;
use tracing::{debug, info};

/// Name of sector file `n`.
#[must_use]
pub fn sector_file_name(file: u16) -> String {
    format!("_block.{file:05}")
}

/// The set of sector files of one instance.
pub(crate) struct SectorFiles {
    volume: Arc<dyn Volume>,
    files: Vec<Box<dyn StorageBackend>>,
    max_file_size: u64,
}

impl SectorFiles {
    /// Opens every existing sector file, creating `_block.00000` if needed.
    pub(crate) fn open(volume: Arc<dyn Volume>, max_file_size: u64) -> CoreResult<Self> {
        let mut files = vec![volume.open(&sector_file_name(0))?];
        let mut next: u16 = 1;
        while volume.exists(&sector_file_name(next))? {
            files.push(volume.open(&sector_file_name(next))?);
            next = next
                .checked_add(1)
                .ok_or_else(|| CoreError::invalid_format("too many sector files"))?;
        }
        debug!(location = %volume.location(), files = files.len(), "sector files opened");
        Ok(Self {
            volume,
            files,
            max_file_size,
        })
    }

    fn backend(&self, file: u16) -> CoreResult<&dyn StorageBackend> {
        self.files
            .get(file as usize)
            .map(|b| &**b)
            .ok_or_else(|| CoreError::corrupt_index(format!("sector file {file} does not exist")))
    }

    /// Reads the value at `location`.
    pub(crate) fn read(&self, location: SectorLocation) -> CoreResult<Vec<u8>> {
        let backend = self.backend(location.file)?;
        let end = u64::from(location.offset) + u64::from(location.len);
        if end > backend.size()? {
            return Err(CoreError::corrupt_index(format!(
                "sector {location} runs past the end of its file"
            )));
        }
        Ok(backend.read_at(u64::from(location.offset), location.len as usize)?)
    }

    /// Largest value one sector can hold.
    pub(crate) fn max_value_len(&self) -> u64 {
        self.max_file_size.min(u64::from(u32::MAX))
    }

    fn check_len(&self, len: usize) -> CoreResult<u32> {
        let max = self.max_value_len();
        if len as u64 > max {
            return Err(CoreError::ValueTooLarge { len, max });
        }
        Ok(len as u32)
    }

    /// Appends a value, rolling to a new file when the active one is full.
    pub(crate) fn append(&mut self, data: &[u8]) -> CoreResult<SectorLocation> {
        let len = self.check_len(data.len())?;
        let mut current = self.files.len() - 1;
        let size = self.files[current].size()?;
        if size > 0 && size + u64::from(len) > self.max_file_size {
            let next = u16::try_from(self.files.len())
                .map_err(|_| CoreError::invalid_format("too many sector files"))?;
            self.files[current].sync()?;
            self.files.push(self.volume.open(&sector_file_name(next))?);
            current = next as usize;
            info!(location = %self.volume.location(), file = %sector_file_name(next), "sector file rollover");
        }

        let offset = self.files[current].append(data)?;
        let offset = u32::try_from(offset).map_err(|_| {
            CoreError::invalid_format(format!("sector offset {offset} exceeds u32 range"))
        })?;
        Ok(SectorLocation {
            file: current as u16,
            offset,
            len,
        })
    }

    /// Overwrites the start of an existing sector with a value no longer
    /// than it, returning the location of the new value.
    pub(crate) fn overwrite(
        &mut self,
        location: SectorLocation,
        data: &[u8],
    ) -> CoreResult<SectorLocation> {
        let len = self.check_len(data.len())?;
        if len > location.len {
            return Err(CoreError::ValueTooLarge {
                len: data.len(),
                max: u64::from(location.len),
            });
        }
        let backend = self
            .files
            .get_mut(location.file as usize)
            .ok_or_else(|| {
                CoreError::corrupt_index(format!("sector file {} does not exist", location.file))
            })?;
        backend.write_at(u64::from(location.offset), data)?;
        Ok(SectorLocation { len, ..location })
    }

    /// Makes every write durable.
    pub(crate) fn sync(&mut self) -> CoreResult<()> {
        for file in &mut self.files {
            file.sync()?;
        }
        Ok(())
    }

    /// Number of sector files.
    pub(crate) fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Total bytes across all sector files, live and dead.
    pub(crate) fn total_size(&self) -> CoreResult<u64> {
        let mut total = 0;
        for file in &self.files {
            total += file.size()?;
        }
        Ok(total)
    }
}

impl std::fmt::Debug for SectorFiles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SectorFiles")
            .field("location", &self.volume.location())
            .field("files", &self.files.len())
            .field("max_file_size", &self.max_file_size)
            .finish()
    }
}
