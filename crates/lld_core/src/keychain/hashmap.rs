//! Bucketed hash table keychain.
//!
//! ## Files
//!
//! ```text
//! _hashmap.index   | magic (4) | version (2) | max key (2) | buckets (4) | reserved (4) |
//!                  | layers in use, u32 per bucket ...                                  |
//! _hashmap.00000   | slot 0 | slot 1 | ... | slot N-1 |     (layer 0)
//! _hashmap.00001   | slot 0 | slot 1 | ... | slot N-1 |     (layer 1)
//! ```
//!
//! A slot is a sector key header followed by the key, zero padded to
//! `max_key_size`. A key lives in bucket `xxh64(key) mod N` of exactly one
//! layer.
//!
//! ## Collisions
//!
//! Fixed-depth overflow: when every slot of a bucket across its layers is
//! taken by other keys, the bucket claims its slot in the next layer,
//! creating that layer's file if no other bucket has yet. The index file
//! records how many layers each bucket uses so lookups stop early. A bucket
//! that needs more than `max_layers` layers fails with `KeychainFull`.

use crate::config::KeychainConfig;
use crate::error::{CoreError, CoreResult};
use crate::hash::xxh64;
use crate::key::{SectorHeader, SectorKey, SectorState, SECTOR_KEY_HEADER};
use crate::keychain::KeyIndex;
use lld_storage::{StorageBackend, Volume};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

const INDEX_FILE: &str = "_hashmap.index";
const INDEX_MAGIC: [u8; 4] = *b"LLDH";
const INDEX_VERSION: u16 = 1;
const INDEX_HEADER: u64 = 16;
const FILL_CHUNK: usize = 64 * 1024;

fn layer_name(layer: u32) -> String {
    format!("_hashmap.{layer:05}")
}

/// What a probe of one bucket found.
struct Probe {
    /// Layer whose slot holds the key.
    found: Option<u32>,
    /// First layer whose slot is free.
    free: Option<u32>,
}

/// Hash table keychain with fixed-width slots and overflow layers.
pub struct HashmapKeychain {
    volume: Arc<dyn Volume>,
    buckets: u32,
    max_key: usize,
    max_layers: u32,
    index: Box<dyn StorageBackend>,
    layer_counts: Vec<u32>,
    layers: Vec<Box<dyn StorageBackend>>,
}

impl HashmapKeychain {
    /// Opens the keychain stored in `volume`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if the index is missing and `create` is false
    /// or was written with a different geometry, `CorruptIndex` if a layer
    /// file is shorter than the index claims.
    pub fn open(volume: Arc<dyn Volume>, config: &KeychainConfig, create: bool) -> CoreResult<Self> {
        if !create && !volume.exists(INDEX_FILE)? {
            return Err(CoreError::invalid_format(format!(
                "no hashmap keychain in {}",
                volume.location()
            )));
        }

        let mut index = volume.open(INDEX_FILE)?;
        let buckets = config.bucket_count;
        let layer_counts = if index.size()? == 0 {
            let mut header = Vec::with_capacity(INDEX_HEADER as usize);
            header.extend_from_slice(&INDEX_MAGIC);
            header.extend_from_slice(&INDEX_VERSION.to_le_bytes());
            header.extend_from_slice(&config.max_key_size.to_le_bytes());
            header.extend_from_slice(&buckets.to_le_bytes());
            header.extend_from_slice(&0u32.to_le_bytes());
            index.append(&header)?;
            index.append(&vec![0u8; buckets as usize * 4])?;
            index.sync()?;
            info!(location = %volume.location(), buckets, "created hashmap keychain");
            vec![0u32; buckets as usize]
        } else {
            Self::read_counts(index.as_ref(), config)?
        };

        let in_use = layer_counts.iter().copied().max().unwrap_or(0);
        let mut keychain = Self {
            volume,
            buckets,
            max_key: config.max_key_size as usize,
            max_layers: config.max_layers,
            index,
            layer_counts,
            layers: Vec::new(),
        };

        for layer in 0..in_use {
            let backend = keychain.volume.open(&layer_name(layer))?;
            if backend.size()? < keychain.layer_size() {
                return Err(CoreError::corrupt_index(format!(
                    "{} holds {} bytes, expected {}",
                    layer_name(layer),
                    backend.size()?,
                    keychain.layer_size()
                )));
            }
            keychain.layers.push(backend);
        }

        debug!(layers = in_use, "hashmap keychain loaded");
        Ok(keychain)
    }

    fn read_counts(index: &dyn StorageBackend, config: &KeychainConfig) -> CoreResult<Vec<u32>> {
        let header = index.read_at(0, INDEX_HEADER as usize)?;
        if header[..4] != INDEX_MAGIC {
            return Err(CoreError::invalid_format("bad hashmap index magic"));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != INDEX_VERSION {
            return Err(CoreError::invalid_format(format!(
                "unsupported hashmap index version {version}"
            )));
        }
        let max_key = u16::from_le_bytes([header[6], header[7]]);
        let buckets = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        if buckets != config.bucket_count || max_key != config.max_key_size {
            return Err(CoreError::invalid_format(format!(
                "hashmap geometry is {buckets} buckets x {max_key} byte keys, configured {} x {}",
                config.bucket_count, config.max_key_size
            )));
        }

        let body = index.read_at(INDEX_HEADER, buckets as usize * 4)?;
        let counts: Vec<u32> = body
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        if let Some(bad) = counts.iter().find(|&&c| c > config.max_layers) {
            return Err(CoreError::corrupt_index(format!(
                "bucket claims {bad} layers, limit is {}",
                config.max_layers
            )));
        }
        Ok(counts)
    }

    fn slot_size(&self) -> usize {
        SECTOR_KEY_HEADER + self.max_key
    }

    fn layer_size(&self) -> u64 {
        u64::from(self.buckets) * self.slot_size() as u64
    }

    fn slot_offset(&self, bucket: u32) -> u64 {
        u64::from(bucket) * self.slot_size() as u64
    }

    /// Bucket a key hashes to.
    #[must_use]
    pub fn bucket_of(&self, key: &[u8]) -> u32 {
        (xxh64(key, 0) % u64::from(self.buckets)) as u32
    }

    /// Number of layer files in use.
    #[must_use]
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    fn read_slot(&self, layer: u32, bucket: u32) -> CoreResult<(SectorHeader, Vec<u8>)> {
        let slot = self.layers[layer as usize].read_at(self.slot_offset(bucket), self.slot_size())?;
        let header = SectorHeader::decode(&slot)?;
        if header.key_len as usize > self.max_key {
            return Err(CoreError::corrupt_index(format!(
                "slot {bucket} of {} holds a {} byte key, limit {}",
                layer_name(layer),
                header.key_len,
                self.max_key
            )));
        }
        Ok((header, slot))
    }

    fn slot_matches(header: &SectorHeader, slot: &[u8], key: &[u8]) -> bool {
        header.state != SectorState::Empty
            && header.key_len as usize == key.len()
            && &slot[SECTOR_KEY_HEADER..SECTOR_KEY_HEADER + key.len()] == key
    }

    fn probe(&self, bucket: u32, key: &[u8]) -> CoreResult<Probe> {
        let mut probe = Probe {
            found: None,
            free: None,
        };
        for layer in 0..self.layer_counts[bucket as usize] {
            let (header, slot) = self.read_slot(layer, bucket)?;
            if Self::slot_matches(&header, &slot, key) {
                probe.found = Some(layer);
                break;
            }
            if header.state == SectorState::Empty && probe.free.is_none() {
                probe.free = Some(layer);
            }
        }
        Ok(probe)
    }

    fn ensure_layer(&mut self, layer: u32) -> CoreResult<()> {
        while self.layers.len() <= layer as usize {
            let next = self.layers.len() as u32;
            let mut backend = self.volume.open(&layer_name(next))?;
            let target = self.layer_size();
            let mut size = backend.size()?;
            let zeros = vec![0u8; FILL_CHUNK];
            while size < target {
                let n = (target - size).min(FILL_CHUNK as u64) as usize;
                backend.append(&zeros[..n])?;
                size += n as u64;
            }
            backend.sync()?;
            debug!(layer = next, "allocated hashmap layer");
            self.layers.push(backend);
        }
        Ok(())
    }

    fn write_slot(&mut self, layer: u32, bucket: u32, entry: &SectorKey) -> CoreResult<()> {
        let mut slot = entry.encode();
        slot.resize(self.slot_size(), 0);
        let offset = self.slot_offset(bucket);
        self.layers[layer as usize].write_at(offset, &slot)?;
        Ok(())
    }
}

impl KeyIndex for HashmapKeychain {
    fn kind(&self) -> &'static str {
        "hashmap"
    }

    fn max_key_len(&self) -> usize {
        self.max_key
    }

    fn get(&self, key: &[u8]) -> CoreResult<Option<SectorKey>> {
        if key.len() > self.max_key {
            return Ok(None);
        }
        let bucket = self.bucket_of(key);
        let Some(layer) = self.probe(bucket, key)?.found else {
            return Ok(None);
        };
        let (header, slot) = self.read_slot(layer, bucket)?;
        if header.state != SectorState::Ready {
            return Ok(None);
        }
        Ok(Some(SectorKey::decode(&slot)?))
    }

    fn put(&mut self, entry: &SectorKey) -> CoreResult<()> {
        if entry.key.len() > self.max_key {
            return Err(CoreError::KeyTooLarge {
                len: entry.key.len(),
                max: self.max_key,
            });
        }

        let bucket = self.bucket_of(&entry.key);
        let probe = self.probe(bucket, &entry.key)?;
        if let Some(layer) = probe.found.or(probe.free) {
            return self.write_slot(layer, bucket, entry);
        }

        let layer = self.layer_counts[bucket as usize];
        if layer >= self.max_layers {
            return Err(CoreError::KeychainFull {
                bucket,
                layers: layer,
            });
        }

        self.ensure_layer(layer)?;
        self.write_slot(layer, bucket, entry)?;
        self.index.write_at(
            INDEX_HEADER + u64::from(bucket) * 4,
            &(layer + 1).to_le_bytes(),
        )?;
        self.layer_counts[bucket as usize] = layer + 1;
        Ok(())
    }

    fn reserve(&self, keys: &[&[u8]]) -> CoreResult<()> {
        let mut needed: BTreeMap<u32, u32> = BTreeMap::new();
        for key in keys {
            if key.len() > self.max_key {
                return Err(CoreError::KeyTooLarge {
                    len: key.len(),
                    max: self.max_key,
                });
            }
            let bucket = self.bucket_of(key);
            if self.probe(bucket, key)?.found.is_none() {
                *needed.entry(bucket).or_default() += 1;
            }
        }

        for (bucket, needed) in needed {
            let used = self.layer_counts[bucket as usize];
            let mut room = self.max_layers.saturating_sub(used);
            for layer in 0..used {
                if self.read_slot(layer, bucket)?.0.state == SectorState::Empty {
                    room += 1;
                }
            }
            if needed > room {
                return Err(CoreError::KeychainFull {
                    bucket,
                    layers: used,
                });
            }
        }
        Ok(())
    }

    fn erase(&mut self, key: &[u8]) -> CoreResult<bool> {
        if key.len() > self.max_key {
            return Ok(false);
        }
        let bucket = self.bucket_of(key);
        let Some(layer) = self.probe(bucket, key)?.found else {
            return Ok(false);
        };
        let (header, _) = self.read_slot(layer, bucket)?;
        let offset = self.slot_offset(bucket);
        self.layers[layer as usize].write_at(offset, &[SectorState::Empty.as_byte()])?;
        Ok(header.state == SectorState::Ready)
    }

    fn keys(&self) -> CoreResult<Vec<Vec<u8>>> {
        let slot_size = self.slot_size();
        let mut keys = Vec::new();
        for (layer, backend) in self.layers.iter().enumerate() {
            let data = backend.read_at(0, self.layer_size() as usize)?;
            for (bucket, slot) in data.chunks_exact(slot_size).enumerate() {
                if self.layer_counts[bucket] as usize <= layer {
                    continue;
                }
                let header = SectorHeader::decode(slot)?;
                if header.state == SectorState::Ready {
                    let end = SECTOR_KEY_HEADER + header.key_len as usize;
                    if end > slot.len() {
                        return Err(CoreError::corrupt_index(format!(
                            "slot {bucket} of {} overruns its width",
                            layer_name(layer as u32)
                        )));
                    }
                    keys.push(slot[SECTOR_KEY_HEADER..end].to_vec());
                }
            }
        }
        Ok(keys)
    }

    fn flush(&mut self) -> CoreResult<()> {
        for layer in &mut self.layers {
            layer.sync()?;
        }
        self.index.sync()?;
        Ok(())
    }
}

impl std::fmt::Debug for HashmapKeychain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashmapKeychain")
            .field("location", &self.volume.location())
            .field("buckets", &self.buckets)
            .field("max_key", &self.max_key)
            .field("layers", &self.layers.len())
            .finish()
    }
}
