//! Bloom filter over a [`BitArray`].

use crate::bloom::bits::BitArray;
use crate::error::{CoreError, CoreResult};
use crate::hash::{compute_crc32, xxh64};

/// Magic bytes opening a bloom snapshot.
const SNAPSHOT_MAGIC: [u8; 4] = *b"LLDB";

/// Snapshot format version.
const SNAPSHOT_VERSION: u16 = 1;

/// magic (4) + version (2) + hashes (4) + bits (8) + inserted (8)
const SNAPSHOT_HEADER: usize = 26;

/// A probabilistic membership set.
///
/// `has` never returns false for an inserted key. It may return true for a
/// key that was never inserted; callers resolve that with a real lookup.
/// Keys cannot be removed; the filter is rebuilt from the keychain instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bits: BitArray,
    hashes: u32,
    inserted: u64,
}

impl BloomFilter {
    /// Creates a filter with `bits` bits and `hashes` hash rounds.
    ///
    /// Both are clamped to at least one.
    #[must_use]
    pub fn new(bits: u64, hashes: u32) -> Self {
        Self {
            bits: BitArray::new(bits.max(1)),
            hashes: hashes.max(1),
            inserted: 0,
        }
    }

    /// Sizes a filter for `expected` keys at false positive rate `rate`.
    #[must_use]
    pub fn with_rate(expected: u64, rate: f64) -> Self {
        let n = expected.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;
        let bits = (-(n * rate.ln()) / (ln2 * ln2)).ceil().max(1.0);
        let hashes = ((bits / n) * ln2).round().clamp(1.0, 32.0);
        Self::new(bits as u64, hashes as u32)
    }

    #[inline]
    fn position(&self, key: &[u8], round: u32) -> u64 {
        xxh64(key, u64::from(round)) % self.bits.len()
    }

    /// Records `key` as present.
    pub fn insert(&mut self, key: &[u8]) {
        for round in 0..self.hashes {
            let pos = self.position(key, round);
            self.bits.set(pos);
        }
        self.inserted += 1;
    }

    /// Returns false only if `key` was definitely never inserted.
    #[must_use]
    pub fn has(&self, key: &[u8]) -> bool {
        (0..self.hashes).all(|round| self.bits.test(self.position(key, round)))
    }

    /// Forgets every key.
    pub fn clear(&mut self) {
        self.bits.clear();
        self.inserted = 0;
    }

    /// Number of bits in the filter.
    #[must_use]
    pub fn bit_count(&self) -> u64 {
        self.bits.len()
    }

    /// Number of hash rounds per key.
    #[must_use]
    pub fn hash_count(&self) -> u32 {
        self.hashes
    }

    /// Number of insertions since creation or the last clear.
    #[must_use]
    pub fn inserted(&self) -> u64 {
        self.inserted
    }

    /// Expected false positive rate at the current fill.
    #[must_use]
    pub fn estimated_false_positive_rate(&self) -> f64 {
        let fill = self.bits.count_ones() as f64 / self.bits.len() as f64;
        fill.powi(self.hashes as i32)
    }

    /// Encodes the filter for the on-disk snapshot.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let body = self.bits.to_bytes();
        let mut out = Vec::with_capacity(SNAPSHOT_HEADER + body.len() + 4);
        out.extend_from_slice(&SNAPSHOT_MAGIC);
        out.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        out.extend_from_slice(&self.hashes.to_le_bytes());
        out.extend_from_slice(&self.bits.len().to_le_bytes());
        out.extend_from_slice(&self.inserted.to_le_bytes());
        out.extend_from_slice(&body);
        let crc = compute_crc32(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        out
    }

    /// Decodes a snapshot written by [`Self::encode`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` for bad magic, version or length and
    /// `ChecksumMismatch` if the trailing CRC does not match.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() < SNAPSHOT_HEADER + 4 {
            return Err(CoreError::invalid_format("bloom snapshot too short"));
        }
        if data[..4] != SNAPSHOT_MAGIC {
            return Err(CoreError::invalid_format("bad bloom snapshot magic"));
        }

        let (payload, tail) = data.split_at(data.len() - 4);
        let expected = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
        let actual = compute_crc32(payload);
        if expected != actual {
            return Err(CoreError::ChecksumMismatch { expected, actual });
        }

        let version = u16::from_le_bytes([payload[4], payload[5]]);
        if version != SNAPSHOT_VERSION {
            return Err(CoreError::invalid_format(format!(
                "unsupported bloom snapshot version {version}"
            )));
        }

        let mut u32_buf = [0u8; 4];
        u32_buf.copy_from_slice(&payload[6..10]);
        let hashes = u32::from_le_bytes(u32_buf);
        let mut u64_buf = [0u8; 8];
        u64_buf.copy_from_slice(&payload[10..18]);
        let bit_len = u64::from_le_bytes(u64_buf);
        u64_buf.copy_from_slice(&payload[18..26]);
        let inserted = u64::from_le_bytes(u64_buf);

        let bits = BitArray::from_bytes(bit_len, &payload[SNAPSHOT_HEADER..])
            .ok_or_else(|| CoreError::invalid_format("bloom snapshot length mismatch"))?;
        if hashes == 0 || bits.is_empty() {
            return Err(CoreError::invalid_format("empty bloom snapshot"));
        }

        Ok(Self {
            bits,
            hashes,
            inserted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn single_hash_filter_finds_inserted_name() {
        let mut bloom = BloomFilter::new(64, 1);
        bloom.insert(b"alice");
        bloom.insert(b"bob");
        bloom.insert(b"carol");
        assert!(bloom.has(b"alice"));
        assert!(bloom.has(b"bob"));
        assert!(bloom.has(b"carol"));
    }

    #[test]
    fn empty_filter_has_nothing() {
        let bloom = BloomFilter::with_rate(1000, 0.01);
        assert!(!bloom.has(b"anything"));
        assert_eq!(bloom.inserted(), 0);
    }

    #[test]
    fn with_rate_sizing() {
        let bloom = BloomFilter::with_rate(1000, 0.01);
        // m = -n ln p / ln^2 2 ~ 9586, k ~ 7
        assert!((9500..9700).contains(&bloom.bit_count()));
        assert_eq!(bloom.hash_count(), 7);
    }

    #[test]
    fn false_positive_rate_is_near_target() {
        let mut bloom = BloomFilter::with_rate(2000, 0.01);
        for i in 0u32..2000 {
            bloom.insert(&i.to_le_bytes());
        }
        let false_hits = (10_000u32..30_000)
            .filter(|i| bloom.has(&i.to_le_bytes()))
            .count();
        // 1% of 20k is 200; leave room for variance
        assert!(false_hits < 600, "false hits {false_hits}");
    }

    #[test]
    fn clear_forgets_keys() {
        let mut bloom = BloomFilter::new(128, 3);
        bloom.insert(b"k");
        bloom.clear();
        assert!(!bloom.has(b"k"));
    }

    #[test]
    fn snapshot_round_trip() {
        let mut bloom = BloomFilter::with_rate(100, 0.05);
        bloom.insert(b"register");
        let decoded = BloomFilter::decode(&bloom.encode()).unwrap();
        assert_eq!(decoded, bloom);
        assert!(decoded.has(b"register"));
    }

    #[test]
    fn snapshot_detects_damage() {
        let mut bytes = BloomFilter::new(256, 2).encode();
        bytes[30] ^= 0x01;
        assert!(matches!(
            BloomFilter::decode(&bytes),
            Err(CoreError::ChecksumMismatch { .. })
        ));
        assert!(BloomFilter::decode(&bytes[..10]).is_err());
    }

    proptest! {
        #[test]
        fn no_false_negatives(
            keys in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..40), 1..200),
            hashes in 1u32..8,
        ) {
            let mut bloom = BloomFilter::new(512, hashes);
            for (i, key) in keys.iter().enumerate() {
                bloom.insert(key);
                prop_assert!(bloom.has(key));
                for earlier in &keys[..i] {
                    prop_assert!(bloom.has(earlier));
                }
            }
        }
    }
}
