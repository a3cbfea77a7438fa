//! Fixed-size bit vector.

/// A fixed-size bit vector with O(1) set and test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitArray {
    words: Vec<u64>,
    len: u64,
}

impl BitArray {
    /// Creates an all-zero array of `len` bits.
    #[must_use]
    pub fn new(len: u64) -> Self {
        Self {
            words: vec![0; Self::words_for(len)],
            len,
        }
    }

    fn words_for(len: u64) -> usize {
        len.div_ceil(64) as usize
    }

    /// Number of bits.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns true if the array holds no bits.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sets bit `index`. Out-of-range indices are ignored.
    pub fn set(&mut self, index: u64) {
        if index < self.len {
            self.words[(index / 64) as usize] |= 1 << (index % 64);
        }
    }

    /// Tests bit `index`. Out-of-range indices read as unset.
    #[must_use]
    pub fn test(&self, index: u64) -> bool {
        index < self.len && self.words[(index / 64) as usize] & (1 << (index % 64)) != 0
    }

    /// Clears every bit.
    pub fn clear(&mut self) {
        self.words.fill(0);
    }

    /// Number of set bits.
    #[must_use]
    pub fn count_ones(&self) -> u64 {
        self.words.iter().map(|w| u64::from(w.count_ones())).sum()
    }

    /// Serializes the words little endian.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    /// Rebuilds an array of `len` bits from [`Self::to_bytes`] output.
    ///
    /// Returns `None` if the byte count does not match `len`.
    #[must_use]
    pub fn from_bytes(len: u64, bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::words_for(len) * 8 {
            return None;
        }
        let words = bytes
            .chunks_exact(8)
            .map(|chunk| {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(chunk);
                u64::from_le_bytes(buf)
            })
            .collect();
        Some(Self { words, len })
    }
}
