//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of storage.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// Attempted to write with a gap after the end of storage.
    #[error("write would leave a hole: offset {offset}, size {size}")]
    WritePastEnd {
        /// The requested write offset.
        offset: u64,
        /// The current storage size.
        size: u64,
    },

    /// A file name is not usable inside a volume.
    #[error("invalid file name: {0:?}")]
    InvalidName(String),

    /// The named file does not exist in the volume.
    #[error("file not found: {0}")]
    NotFound(String),
}

impl StorageError {
    pub(crate) fn truncate_too_large(new_size: u64, size: u64) -> Self {
        Self::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("cannot truncate to size {new_size} which is greater than current size {size}"),
        ))
    }
}
