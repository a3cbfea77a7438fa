//! Context directory management.
//!
//! A context on disk looks like this:
//!
//! ```text
//! <root>/
//! ├─ LOCK              # Advisory lock for single-writer
//! ├─ TXN_COMMIT        # Global commit record, only mid-commit
//! ├─ _LEDGER/          # One directory per instance
//! │  ├─ _block.00000   # Sector files
//! │  ├─ _hashmap.*     # Keychain (or _filemap.*)
//! │  ├─ _bloom.snapshot
//! │  └─ journal.dat    # Only while a commit is in flight
//! └─ ...
//! ```
//!
//! The LOCK file ensures only one process writes to a context at a time.

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use lld_storage::{DirVolume, Volume};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const LOCK_FILE: &str = "LOCK";

/// An open context directory holding the exclusive lock.
///
/// The lock is released when this value is dropped.
#[derive(Debug)]
pub struct ContextDir {
    path: PathBuf,
    volume: Arc<DirVolume>,
    _lock_file: File,
}

impl ContextDir {
    /// Opens or creates a context directory and takes its lock.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory doesn't exist and `create_if_missing` is false
    /// - Another process holds the lock (returns `DatabaseLocked`)
    /// - I/O errors occur
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_format(format!(
                    "context directory does not exist: {}",
                    path.display()
                )));
            }
        }
        if !path.is_dir() {
            return Err(CoreError::invalid_format(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::DatabaseLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            volume: Arc::new(DirVolume::open(path, false)?),
            _lock_file: lock_file,
        })
    }

    /// Returns the path to the context directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the root volume.
    #[must_use]
    pub fn volume(&self) -> Arc<dyn Volume> {
        Arc::clone(&self.volume) as Arc<dyn Volume>
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_new_directory() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("node");

        let dir = ContextDir::open(&path, true).unwrap();
        assert!(path.exists());
        assert!(path.join(LOCK_FILE).exists());
        assert_eq!(dir.path(), path);
    }

    #[test]
    fn missing_directory_without_create_fails() {
        let temp = tempdir().unwrap();
        let result = ContextDir::open(&temp.path().join("absent"), false);
        assert!(matches!(result, Err(CoreError::InvalidFormat { .. })));
    }

    #[test]
    fn lock_prevents_second_open() {
        let temp = tempdir().unwrap();
        let _dir = ContextDir::open(temp.path(), true).unwrap();
        assert!(matches!(
            ContextDir::open(temp.path(), true),
            Err(CoreError::DatabaseLocked)
        ));
    }

    #[test]
    fn lock_released_on_drop() {
        let temp = tempdir().unwrap();
        {
            let _dir = ContextDir::open(temp.path(), true).unwrap();
        }
        assert!(ContextDir::open(temp.path(), true).is_ok());
    }

    #[test]
    fn volume_scopes_instances() {
        let temp = tempdir().unwrap();
        let dir = ContextDir::open(temp.path(), true).unwrap();
        let ledger = dir.volume().scope("_LEDGER").unwrap();
        ledger.write_file_atomic("probe", b"x").unwrap();
        assert!(temp.path().join("_LEDGER").join("probe").exists());
    }
}
