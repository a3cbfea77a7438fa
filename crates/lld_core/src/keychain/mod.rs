//! Persistent key → sector key indexes.
//!
//! Two implementations of [`KeyIndex`]:
//!
//! - [`HashmapKeychain`] - bucketed hash table for large key domains
//! - [`FilemapKeychain`] - sequential record log for small or ordered domains
//!
//! Keychains store only committed (READY) and erased (EMPTY) records.
//! Pending transaction writes live in the instance journal until commit.

mod filemap;
mod hashmap;

pub use filemap::FilemapKeychain;
pub use hashmap::HashmapKeychain;

use crate::error::CoreResult;
use crate::key::SectorKey;

/// A persistent index from keys to sector keys.
///
/// Lookups take `&self` and may run concurrently; mutations take `&mut self`
/// and are serialized by the owning database.
pub trait KeyIndex: Send + Sync {
    /// Short name of the implementation, for logs and the CLI.
    fn kind(&self) -> &'static str;

    /// Longest key this index accepts.
    fn max_key_len(&self) -> usize;

    /// Returns the committed sector key for `key`.
    ///
    /// # Errors
    ///
    /// Returns `CorruptIndex` if a record on the probe path is damaged.
    fn get(&self, key: &[u8]) -> CoreResult<Option<SectorKey>>;

    /// Returns true if `key` has a committed entry.
    ///
    /// # Errors
    ///
    /// Same as [`Self::get`].
    fn has(&self, key: &[u8]) -> CoreResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Inserts or replaces the entry for `entry.key`.
    ///
    /// # Errors
    ///
    /// Returns `KeyTooLarge`, `KeychainFull` or a storage error.
    fn put(&mut self, entry: &SectorKey) -> CoreResult<()>;

    /// Checks that every key in `keys` can be put in one batch without
    /// running out of room. Slots freed by erases in the same batch are not
    /// counted.
    ///
    /// # Errors
    ///
    /// Returns `KeyTooLarge`, `KeychainFull` or a read error.
    fn reserve(&self, keys: &[&[u8]]) -> CoreResult<()> {
        let _ = keys;
        Ok(())
    }

    /// Tombstones the entry for `key`, returning whether one was live.
    ///
    /// # Errors
    ///
    /// Returns a storage or corruption error.
    fn erase(&mut self, key: &[u8]) -> CoreResult<bool>;

    /// Lists every committed key.
    ///
    /// # Errors
    ///
    /// Returns a storage or corruption error.
    fn keys(&self) -> CoreResult<Vec<Vec<u8>>>;

    /// Number of committed keys.
    ///
    /// # Errors
    ///
    /// Same as [`Self::keys`].
    fn len(&self) -> CoreResult<usize> {
        Ok(self.keys()?.len())
    }

    /// Makes every previous mutation durable.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    fn flush(&mut self) -> CoreResult<()>;
}

impl<T: KeyIndex + ?Sized> KeyIndex for Box<T> {
    fn kind(&self) -> &'static str {
        (**self).kind()
    }

    fn max_key_len(&self) -> usize {
        (**self).max_key_len()
    }

    fn get(&self, key: &[u8]) -> CoreResult<Option<SectorKey>> {
        (**self).get(key)
    }

    fn has(&self, key: &[u8]) -> CoreResult<bool> {
        (**self).has(key)
    }

    fn put(&mut self, entry: &SectorKey) -> CoreResult<()> {
        (**self).put(entry)
    }

    fn reserve(&self, keys: &[&[u8]]) -> CoreResult<()> {
        (**self).reserve(keys)
    }

    fn erase(&mut self, key: &[u8]) -> CoreResult<bool> {
        (**self).erase(key)
    }

    fn keys(&self) -> CoreResult<Vec<Vec<u8>>> {
        (**self).keys()
    }

    fn len(&self) -> CoreResult<usize> {
        (**self).len()
    }

    fn flush(&mut self) -> CoreResult<()> {
        (**self).flush()
    }
}
