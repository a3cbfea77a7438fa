//! Bounded in-memory value caches.
//!
//! Caches sit in front of the keychain and sector files and hold only
//! committed values. Eviction is silent: the sector files stay
//! authoritative, so a miss only costs a disk read.
//!
//! Both implementations charge each entry its key and value length plus
//! [`NODE_OVERHEAD`] bytes against the byte budget, and also respect an
//! optional entry budget.

mod lfu;
mod lru;

pub use lfu::LfuCache;
pub use lru::LruCache;

use crate::config::{CacheConfig, CachePolicy};

/// Bookkeeping bytes charged per cached entry.
pub const NODE_OVERHEAD: usize = 48;

/// Cost of one entry against the byte budget.
#[must_use]
pub fn entry_cost(key: &[u8], value: &[u8]) -> usize {
    key.len() + value.len() + NODE_OVERHEAD
}

/// A thread-safe, capacity-bounded key → value cache.
pub trait ValueCache: Send + Sync {
    /// Short policy name, for logs and the CLI.
    fn policy(&self) -> &'static str;

    /// Returns a copy of the cached value, updating recency or frequency.
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// Inserts or replaces a value, evicting as needed.
    fn put(&self, key: &[u8], value: &[u8]);

    /// Drops a key, returning whether it was cached.
    fn remove(&self, key: &[u8]) -> bool;

    /// Returns true if the key is cached, without touching its metadata.
    fn contains(&self, key: &[u8]) -> bool;

    /// Number of cached entries.
    fn len(&self) -> usize;

    /// Returns true if nothing is cached.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes charged against the budget.
    fn size_bytes(&self) -> usize;

    /// Drops every entry.
    fn clear(&self);
}

impl<T: ValueCache + ?Sized> ValueCache for Box<T> {
    fn policy(&self) -> &'static str {
        (**self).policy()
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        (**self).get(key)
    }

    fn put(&self, key: &[u8], value: &[u8]) {
        (**self).put(key, value);
    }

    fn remove(&self, key: &[u8]) -> bool {
        (**self).remove(key)
    }

    fn contains(&self, key: &[u8]) -> bool {
        (**self).contains(key)
    }

    fn len(&self) -> usize {
        (**self).len()
    }

    fn size_bytes(&self) -> usize {
        (**self).size_bytes()
    }

    fn clear(&self) {
        (**self).clear();
    }
}

/// Builds the cache a configuration asks for.
#[must_use]
pub fn from_config(config: &CacheConfig) -> Box<dyn ValueCache> {
    match config.policy {
        CachePolicy::Lru => Box::new(LruCache::new(config.max_bytes, config.max_entries)),
        CachePolicy::Lfu => Box::new(LfuCache::new(config.max_bytes, config.max_entries)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn caches(max_bytes: usize, max_entries: usize) -> Vec<Box<dyn ValueCache>> {
        vec![
            Box::new(LruCache::new(max_bytes, max_entries)),
            Box::new(LfuCache::new(max_bytes, max_entries)),
        ]
    }

    #[test]
    fn config_selects_policy() {
        let config = CacheConfig {
            policy: CachePolicy::Lfu,
            ..CacheConfig::default()
        };
        assert_eq!(from_config(&config).policy(), "lfu");
        assert_eq!(from_config(&CacheConfig::default()).policy(), "lru");
    }

    #[test]
    fn oversized_entry_is_not_cached() {
        for cache in caches(100, usize::MAX) {
            cache.put(b"big", &[0u8; 100]);
            assert!(!cache.contains(b"big"));
            assert!(cache.is_empty());
        }
    }

    #[test]
    fn replace_adjusts_size() {
        for cache in caches(1 << 20, usize::MAX) {
            cache.put(b"k", b"short");
            cache.put(b"k", b"a much longer value");
            assert_eq!(cache.len(), 1);
            assert_eq!(cache.size_bytes(), entry_cost(b"k", b"a much longer value"));
            assert_eq!(cache.get(b"k").as_deref(), Some(&b"a much longer value"[..]));
            assert!(cache.remove(b"k"));
            assert_eq!(cache.size_bytes(), 0);
        }
    }

    #[derive(Debug, Clone)]
    enum Op {
        Put(u8, usize),
        Get(u8),
        Remove(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..16, 0usize..64).prop_map(|(k, n)| Op::Put(k, n)),
            (0u8..16).prop_map(Op::Get),
            (0u8..16).prop_map(Op::Remove),
        ]
    }

    proptest! {
        #[test]
        fn budgets_hold_and_hits_are_exact(ops in prop::collection::vec(op(), 1..200)) {
            for cache in caches(400, 6) {
                let mut last = std::collections::HashMap::new();
                for op in &ops {
                    match *op {
                        Op::Put(k, n) => {
                            let value = vec![k; n];
                            cache.put(&[k], &value);
                            last.insert(k, value);
                        }
                        Op::Get(k) => {
                            if let Some(v) = cache.get(&[k]) {
                                prop_assert_eq!(Some(&v), last.get(&k));
                            }
                        }
                        Op::Remove(k) => {
                            cache.remove(&[k]);
                            last.remove(&k);
                        }
                    }
                    prop_assert!(cache.size_bytes() <= 400);
                    prop_assert!(cache.len() <= 6);
                }
            }
        }
    }
}
