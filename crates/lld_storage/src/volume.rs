//! Named-file volumes.
//!
//! An LLD instance is a handful of files in one directory: sector files,
//! keychain files, a bloom snapshot and a transient journal. A [`Volume`]
//! hands out a [`StorageBackend`] per file name and owns the directory-level
//! operations (rename, remove, listing, metadata sync) that backends cannot
//! express.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use crate::file::FileBackend;
use crate::memory::InMemoryBackend;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A flat namespace of files plus nested scopes.
pub trait Volume: Send + Sync + fmt::Debug {
    /// Opens the named file, creating it empty if missing.
    fn open(&self, name: &str) -> StorageResult<Box<dyn StorageBackend>>;

    /// Returns true if the named file exists.
    fn exists(&self, name: &str) -> StorageResult<bool>;

    /// Removes the named file. Removing a missing file is not an error.
    fn remove(&self, name: &str) -> StorageResult<()>;

    /// Atomically replaces `to` with `from`.
    fn rename(&self, from: &str, to: &str) -> StorageResult<()>;

    /// Lists file names in this scope, sorted.
    fn list(&self) -> StorageResult<Vec<String>>;

    /// Returns a nested volume, creating it if needed.
    fn scope(&self, name: &str) -> StorageResult<Arc<dyn Volume>>;

    /// Makes creations, renames and removals in this scope durable.
    fn sync(&self) -> StorageResult<()>;

    /// Human-readable location, used in log lines.
    fn location(&self) -> String;

    /// Reads a whole file, or `None` if it does not exist.
    fn read_file(&self, name: &str) -> StorageResult<Option<Vec<u8>>> {
        if !self.exists(name)? {
            return Ok(None);
        }
        let backend = self.open(name)?;
        let size = backend.size()?;
        Ok(Some(backend.read_at(0, size as usize)?))
    }

    /// Replaces a file's content with write-then-rename.
    ///
    /// 1. Write to `<name>.tmp`
    /// 2. Sync the temporary file
    /// 3. Rename over `name`
    /// 4. Sync the scope so the rename is durable
    fn write_file_atomic(&self, name: &str, data: &[u8]) -> StorageResult<()> {
        let temp = format!("{name}.tmp");
        {
            let mut backend = self.open(&temp)?;
            backend.truncate(0)?;
            backend.append(data)?;
            backend.sync()?;
        }
        self.rename(&temp, name)?;
        self.sync()
    }
}

fn check_name(name: &str) -> StorageResult<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
    {
        return Err(StorageError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// A volume backed by a directory on disk.
#[derive(Debug, Clone)]
pub struct DirVolume {
    root: PathBuf,
}

impl DirVolume {
    /// Opens a directory as a volume.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory is missing and `create` is false,
    /// or it cannot be created.
    pub fn open(root: &Path, create: bool) -> StorageResult<Self> {
        if !root.exists() {
            if !create {
                return Err(StorageError::NotFound(root.display().to_string()));
            }
            fs::create_dir_all(root)?;
        }
        if !root.is_dir() {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a directory: {}", root.display()),
            )));
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Returns the directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.root
    }
}

impl Volume for DirVolume {
    fn open(&self, name: &str) -> StorageResult<Box<dyn StorageBackend>> {
        check_name(name)?;
        Ok(Box::new(FileBackend::open(&self.root.join(name))?))
    }

    fn exists(&self, name: &str) -> StorageResult<bool> {
        check_name(name)?;
        Ok(self.root.join(name).is_file())
    }

    fn remove(&self, name: &str) -> StorageResult<()> {
        check_name(name)?;
        match fs::remove_file(self.root.join(name)) {
            Ok(()) => self.sync(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        check_name(from)?;
        check_name(to)?;
        fs::rename(self.root.join(from), self.root.join(to))?;
        self.sync()
    }

    fn list(&self) -> StorageResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn scope(&self, name: &str) -> StorageResult<Arc<dyn Volume>> {
        check_name(name)?;
        Ok(Arc::new(Self::open(&self.root.join(name), true)?))
    }

    #[cfg(unix)]
    fn sync(&self) -> StorageResult<()> {
        File::open(&self.root)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync(&self) -> StorageResult<()> {
        // NTFS journals directory metadata itself
        Ok(())
    }

    fn location(&self) -> String {
        self.root.display().to_string()
    }
}

/// A volume whose files live in memory.
///
/// Clones and scopes share the same file table, so a database dropped
/// mid-operation can be reopened over exactly the bytes it had written.
#[derive(Debug, Clone, Default)]
pub struct MemoryVolume {
    files: Arc<Mutex<BTreeMap<String, InMemoryBackend>>>,
    prefix: String,
}

impl MemoryVolume {
    /// Creates an empty volume.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn full_name(&self, name: &str) -> StorageResult<String> {
        check_name(name)?;
        Ok(format!("{}{}", self.prefix, name))
    }

    /// Returns a handle to a file's bytes, if it exists.
    #[must_use]
    pub fn backend(&self, name: &str) -> Option<InMemoryBackend> {
        let full = self.full_name(name).ok()?;
        self.files.lock().get(&full).cloned()
    }
}

impl Volume for MemoryVolume {
    fn open(&self, name: &str) -> StorageResult<Box<dyn StorageBackend>> {
        let full = self.full_name(name)?;
        let backend = self.files.lock().entry(full).or_default().clone();
        Ok(Box::new(backend))
    }

    fn exists(&self, name: &str) -> StorageResult<bool> {
        let full = self.full_name(name)?;
        Ok(self.files.lock().contains_key(&full))
    }

    fn remove(&self, name: &str) -> StorageResult<()> {
        let full = self.full_name(name)?;
        self.files.lock().remove(&full);
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        let from = self.full_name(from)?;
        let to = self.full_name(to)?;
        let mut files = self.files.lock();
        let backend = files.remove(&from).ok_or(StorageError::NotFound(from))?;
        files.insert(to, backend);
        Ok(())
    }

    fn list(&self) -> StorageResult<Vec<String>> {
        let files = self.files.lock();
        Ok(files
            .keys()
            .filter_map(|k| k.strip_prefix(&self.prefix))
            .filter(|rest| !rest.contains('/'))
            .map(str::to_string)
            .collect())
    }

    fn scope(&self, name: &str) -> StorageResult<Arc<dyn Volume>> {
        let prefix = format!("{}/", self.full_name(name)?);
        Ok(Arc::new(Self {
            files: Arc::clone(&self.files),
            prefix,
        }))
    }

    fn sync(&self) -> StorageResult<()> {
        Ok(())
    }

    fn location(&self) -> String {
        format!("memory:/{}", self.prefix)
    }
}
