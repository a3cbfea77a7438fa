//! Typed values stored as CBOR.

use crate::cache::ValueCache;
use crate::error::{CoreError, CoreResult};
use crate::keychain::KeyIndex;
use crate::sector::SectorDatabase;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes a value as CBOR.
///
/// # Errors
///
/// Returns `Codec` if serialization fails.
pub fn to_cbor<T: Serialize + ?Sized>(value: &T) -> CoreResult<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::into_writer(value, &mut out).map_err(|e| CoreError::codec(e.to_string()))?;
    Ok(out)
}

/// Decodes a CBOR value.
///
/// # Errors
///
/// Returns `Codec` if the bytes are not a valid encoding of `T`.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> CoreResult<T> {
    ciborium::from_reader(bytes).map_err(|e| CoreError::codec(e.to_string()))
}

impl<K: KeyIndex, C: ValueCache> SectorDatabase<K, C> {
    /// Writes `value` encoded as CBOR.
    ///
    /// # Errors
    ///
    /// Returns `Codec` if encoding fails, otherwise as [`Self::write`].
    pub fn write_object<T: Serialize + ?Sized>(&self, key: &[u8], value: &T) -> CoreResult<()> {
        self.write(key, &to_cbor(value)?)
    }

    /// Reads and decodes a CBOR value.
    ///
    /// # Errors
    ///
    /// Returns `Codec` if the stored bytes do not decode as `T`, otherwise
    /// as [`Self::read`].
    pub fn read_object<T: DeserializeOwned>(&self, key: &[u8]) -> CoreResult<Option<T>> {
        match self.read(key)? {
            Some(bytes) => Ok(Some(from_cbor(&bytes)?)),
            None => Ok(None),
        }
    }
}
