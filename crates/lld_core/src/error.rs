//! Error types for LLD core.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in LLD core operations.
///
/// A missing key is never an error: lookups return `Ok(None)` or
/// `Ok(false)`. Filling a cache or saturating a bloom filter is not an
/// error either.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] lld_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A keychain record violates its structural invariants.
    ///
    /// The instance refuses writes after this until it is reopened.
    #[error("corrupt index: {message}")]
    CorruptIndex {
        /// Description of the corruption.
        message: String,
    },

    /// A transaction verb was used out of order.
    #[error("transaction conflict: {message}")]
    TxnConflict {
        /// What was attempted.
        message: String,
    },

    /// Key exceeds the keychain's fixed slot width.
    #[error("key of {len} bytes exceeds the keychain limit of {max}")]
    KeyTooLarge {
        /// Length of the rejected key.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Value exceeds what a sector can address.
    #[error("value of {len} bytes exceeds the sector limit of {max}")]
    ValueTooLarge {
        /// Length of the rejected value.
        len: usize,
        /// Largest accepted value.
        max: u64,
    },

    /// Every overflow layer of a hashmap bucket is occupied.
    #[error("keychain bucket {bucket} is full after {layers} layers")]
    KeychainFull {
        /// The exhausted bucket.
        bucket: u32,
        /// Number of layers searched.
        layers: u32,
    },

    /// The instance was opened without write access.
    #[error("instance {name} is read-only")]
    ReadOnly {
        /// Instance name.
        name: String,
    },

    /// The instance was closed and accepts no further operations.
    #[error("instance {name} is closed")]
    Closed {
        /// Instance name.
        name: String,
    },

    /// Configuration rejected at open.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Why the configuration was rejected.
        message: String,
    },

    /// Database is already open or locked.
    #[error("database locked: another process has exclusive access")]
    DatabaseLocked,

    /// Invalid on-disk format or version.
    #[error("invalid format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// Checksum mismatch detected.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// Value could not be encoded or decoded as CBOR.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },
}

impl CoreError {
    /// Creates a corrupt index error.
    pub fn corrupt_index(message: impl Into<String>) -> Self {
        Self::CorruptIndex {
            message: message.into(),
        }
    }

    /// Creates a transaction conflict error.
    pub fn txn_conflict(message: impl Into<String>) -> Self {
        Self::TxnConflict {
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Returns true if the error marks the instance as structurally damaged.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::CorruptIndex { .. } | Self::ChecksumMismatch { .. } | Self::InvalidFormat { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helper_constructors() {
        let err = CoreError::txn_conflict("nested begin");
        assert_eq!(err.to_string(), "transaction conflict: nested begin");

        let err = CoreError::corrupt_index("bad state byte 9");
        assert!(err.is_corruption());
        assert!(!CoreError::DatabaseLocked.is_corruption());
    }

    #[test]
    fn storage_errors_convert() {
        let err: CoreError = lld_storage::StorageError::NotFound("x".into()).into();
        assert!(matches!(err, CoreError::Storage(_)));
    }
}
