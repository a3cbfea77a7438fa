//! Sector keys: the index record binding a key to its sector.
//!
//! ## Layout
//!
//! ```text
//! | state (1) | key len (2) | file (2) | offset (4) | length (4) | key (N) |
//! ```
//!
//! All integers are little endian. The 13-byte header is followed by the raw
//! key. Hashmap slots pad the key to a fixed width; filemap records and
//! journal entries store it unpadded.

use crate::error::{CoreError, CoreResult};
use crate::types::SectorLocation;

/// Size of the fixed sector key header.
pub const SECTOR_KEY_HEADER: usize = 13;

/// Largest key a sector key can describe.
pub const MAX_KEY_LEN: usize = u16::MAX as usize;

/// State tag of a sector key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SectorState {
    /// Tombstone or never-used slot.
    Empty = 0,
    /// Committed value.
    Ready = 1,
    /// Pending write owned by an open transaction.
    Transaction = 2,
}

impl SectorState {
    /// Converts a byte to a state.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Empty),
            1 => Some(Self::Ready),
            2 => Some(Self::Transaction),
            _ => None,
        }
    }

    /// Converts the state to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Decoded fixed header of a sector key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorHeader {
    /// State tag.
    pub state: SectorState,
    /// Length of the key that follows.
    pub key_len: u16,
    /// Where the value lives.
    pub location: SectorLocation,
}

impl SectorHeader {
    /// Decodes a header from the first 13 bytes of `bytes`.
    ///
    /// # Errors
    ///
    /// Returns `CorruptIndex` if the buffer is short or the state is unknown.
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        if bytes.len() < SECTOR_KEY_HEADER {
            return Err(CoreError::corrupt_index(format!(
                "sector key header needs {SECTOR_KEY_HEADER} bytes, got {}",
                bytes.len()
            )));
        }
        let state = SectorState::from_byte(bytes[0]).ok_or_else(|| {
            CoreError::corrupt_index(format!("unknown sector state {}", bytes[0]))
        })?;
        Ok(Self {
            state,
            key_len: u16::from_le_bytes([bytes[1], bytes[2]]),
            location: SectorLocation {
                file: u16::from_le_bytes([bytes[3], bytes[4]]),
                offset: u32::from_le_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]),
                len: u32::from_le_bytes([bytes[9], bytes[10], bytes[11], bytes[12]]),
            },
        })
    }
}

/// Index record describing a key's state and sector location.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SectorKey {
    /// State tag.
    pub state: SectorState,
    /// Where the value lives.
    pub location: SectorLocation,
    /// Raw key bytes.
    pub key: Vec<u8>,
}

impl SectorKey {
    /// Creates a sector key.
    #[must_use]
    pub fn new(state: SectorState, key: &[u8], location: SectorLocation) -> Self {
        Self {
            state,
            location,
            key: key.to_vec(),
        }
    }

    /// Creates a committed sector key.
    #[must_use]
    pub fn ready(key: &[u8], location: SectorLocation) -> Self {
        Self::new(SectorState::Ready, key, location)
    }

    /// Returns a copy with a different state.
    #[must_use]
    pub fn with_state(&self, state: SectorState) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }

    /// Size of the fixed header; the key starts at this offset.
    #[must_use]
    pub const fn begin() -> usize {
        SECTOR_KEY_HEADER
    }

    /// Header plus key length.
    #[must_use]
    pub fn size(&self) -> usize {
        SECTOR_KEY_HEADER + self.key.len()
    }

    /// True for tombstones.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state == SectorState::Empty
    }

    /// True for committed values.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state == SectorState::Ready
    }

    /// True for pending transaction writes.
    #[must_use]
    pub fn is_txn(&self) -> bool {
        self.state == SectorState::Transaction
    }

    /// Encodes the header only.
    #[must_use]
    pub fn encode_header(&self) -> [u8; SECTOR_KEY_HEADER] {
        let mut out = [0u8; SECTOR_KEY_HEADER];
        out[0] = self.state.as_byte();
        out[1..3].copy_from_slice(&(self.key.len() as u16).to_le_bytes());
        out[3..5].copy_from_slice(&self.location.file.to_le_bytes());
        out[5..9].copy_from_slice(&self.location.offset.to_le_bytes());
        out[9..13].copy_from_slice(&self.location.len.to_le_bytes());
        out
    }

    /// Encodes header and key.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size());
        out.extend_from_slice(&self.encode_header());
        out.extend_from_slice(&self.key);
        out
    }

    /// Decodes a sector key produced by [`Self::encode`].
    ///
    /// Trailing bytes (slot padding) are ignored.
    ///
    /// # Errors
    ///
    /// Returns `CorruptIndex` for an unknown state or a short buffer.
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        let header = SectorHeader::decode(bytes)?;
        let end = SECTOR_KEY_HEADER + header.key_len as usize;
        if bytes.len() < end {
            return Err(CoreError::corrupt_index(format!(
                "sector key claims {} key bytes, only {} available",
                header.key_len,
                bytes.len() - SECTOR_KEY_HEADER
            )));
        }
        Ok(Self {
            state: header.state,
            location: header.location,
            key: bytes[SECTOR_KEY_HEADER..end].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(file: u16, offset: u32, len: u32) -> SectorLocation {
        SectorLocation { file, offset, len }
    }

    #[test]
    fn sizes_and_state_tests() {
        let key = SectorKey::ready(b"alice", loc(0, 0, 4));
        assert_eq!(SectorKey::begin(), 13);
        assert_eq!(key.size(), 18);
        assert!(key.is_ready());
        assert!(!key.is_empty());
        assert!(key.with_state(SectorState::Transaction).is_txn());
        assert!(key.with_state(SectorState::Empty).is_empty());
    }

    #[test]
    fn encode_layout() {
        let key = SectorKey::ready(b"ab", loc(0x0102, 0x0A0B_0C0D, 7));
        let bytes = key.encode();
        assert_eq!(
            bytes,
            vec![1, 2, 0, 0x02, 0x01, 0x0D, 0x0C, 0x0B, 0x0A, 7, 0, 0, 0, b'a', b'b']
        );
        assert_eq!(SectorKey::decode(&bytes).unwrap(), key);
    }

    #[test]
    fn decode_ignores_slot_padding() {
        let key = SectorKey::ready(b"k", loc(1, 2, 3));
        let mut slot = key.encode();
        slot.resize(40, 0);
        assert_eq!(SectorKey::decode(&slot).unwrap(), key);
    }

    #[test]
    fn decode_rejects_damage() {
        let mut bytes = SectorKey::ready(b"key", loc(0, 0, 1)).encode();
        bytes[0] = 9;
        assert!(matches!(
            SectorKey::decode(&bytes),
            Err(CoreError::CorruptIndex { .. })
        ));

        let bytes = SectorKey::ready(b"key", loc(0, 0, 1)).encode();
        assert!(SectorKey::decode(&bytes[..14]).is_err());
        assert!(SectorKey::decode(&bytes[..5]).is_err());
    }
}
