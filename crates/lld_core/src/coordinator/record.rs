//! The global commit record.
//!
//! `TXN_COMMIT` at the context root is the commit point of a global
//! transaction. It is written with write-then-rename, so it is either
//! absent or whole:
//!
//! ```text
//! | magic (4) | version (2) | global id (8) | instance set (1) | crc32 (4) |
//! ```

use crate::coordinator::instance::InstanceSet;
use crate::error::{CoreError, CoreResult};
use crate::hash::compute_crc32;
use lld_storage::Volume;

/// File name of the record at the context root.
pub const COMMIT_RECORD_FILE: &str = "TXN_COMMIT";

const MAGIC: [u8; 4] = *b"LLDG";
const VERSION: u16 = 1;
const RECORD_SIZE: usize = 19;

/// Durable proof that a global transaction reached its commit point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitRecord {
    /// Global transaction id.
    pub global: u64,
    /// Instances taking part.
    pub scope: InstanceSet,
}

impl CommitRecord {
    /// Encodes the record.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RECORD_SIZE);
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&self.global.to_le_bytes());
        out.push(self.scope.to_byte());
        let crc = compute_crc32(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        out
    }

    /// Decodes a record.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` or `ChecksumMismatch` for damaged bytes.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() != RECORD_SIZE || data[..4] != MAGIC {
            return Err(CoreError::invalid_format("malformed global commit record"));
        }
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version != VERSION {
            return Err(CoreError::invalid_format(format!(
                "unsupported global commit record version {version}"
            )));
        }
        let expected = u32::from_le_bytes([data[15], data[16], data[17], data[18]]);
        let actual = compute_crc32(&data[..15]);
        if expected != actual {
            return Err(CoreError::ChecksumMismatch { expected, actual });
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&data[6..14]);
        let scope = InstanceSet::from_byte(data[14])
            .ok_or_else(|| CoreError::invalid_format("unknown instance in commit record"))?;
        Ok(Self {
            global: u64::from_le_bytes(id),
            scope,
        })
    }

    /// Writes the record atomically. Returning `Ok` is the commit point.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn write(&self, root: &dyn Volume) -> CoreResult<()> {
        root.write_file_atomic(COMMIT_RECORD_FILE, &self.encode())?;
        Ok(())
    }

    /// Reads the record if present.
    ///
    /// # Errors
    ///
    /// Returns a storage error or a decode error.
    pub fn read(root: &dyn Volume) -> CoreResult<Option<Self>> {
        match root.read_file(COMMIT_RECORD_FILE)? {
            Some(data) => Ok(Some(Self::decode(&data)?)),
            None => Ok(None),
        }
    }

    /// Deletes the record.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn remove(root: &dyn Volume) -> CoreResult<()> {
        root.remove(COMMIT_RECORD_FILE)?;
        Ok(())
    }
}
