//! Least-frequently-used cache.

use crate::cache::{entry_cost, ValueCache};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    freq: u64,
    tick: u64,
}

/// `order` is keyed by (frequency, last touch); its first entry is the
/// eviction victim. Ticks are unique, so ties on frequency go to the
/// entry touched longest ago.
#[derive(Debug, Default)]
struct LfuState {
    entries: HashMap<Vec<u8>, Entry>,
    order: BTreeMap<(u64, u64), Vec<u8>>,
    bytes: usize,
    clock: u64,
}

impl LfuState {
    fn next_tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn touch(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        let tick = self.next_tick();
        let entry = self.entries.get_mut(key)?;
        let owned = self.order.remove(&(entry.freq, entry.tick))?;
        entry.freq += 1;
        entry.tick = tick;
        let value = entry.value.clone();
        self.order.insert((entry.freq, entry.tick), owned);
        Some(value)
    }

    fn remove(&mut self, key: &[u8]) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.order.remove(&(entry.freq, entry.tick));
                self.bytes -= entry_cost(key, &entry.value);
                true
            }
            None => false,
        }
    }

    fn evict_one(&mut self) -> bool {
        match self.order.pop_first() {
            Some((_, key)) => {
                if let Some(entry) = self.entries.remove(&key) {
                    self.bytes -= entry_cost(&key, &entry.value);
                }
                true
            }
            None => false,
        }
    }
}

/// A byte- and entry-bounded LFU cache.
///
/// Each `get` bumps the entry's frequency. Replacing a value keeps its
/// frequency. Operations are O(log n).
#[derive(Debug)]
pub struct LfuCache {
    state: Mutex<LfuState>,
    max_bytes: usize,
    max_entries: usize,
}

impl LfuCache {
    /// Creates a cache bounded by `max_bytes` and `max_entries`.
    #[must_use]
    pub fn new(max_bytes: usize, max_entries: usize) -> Self {
        Self {
            state: Mutex::new(LfuState::default()),
            max_bytes,
            max_entries,
        }
    }

    /// Creates a cache bounded only by entry count.
    #[must_use]
    pub fn with_entries(max_entries: usize) -> Self {
        Self::new(usize::MAX, max_entries)
    }

    /// Access count recorded for `key`.
    #[must_use]
    pub fn frequency(&self, key: &[u8]) -> Option<u64> {
        self.state.lock().entries.get(key).map(|e| e.freq)
    }
}

impl ValueCache for LfuCache {
    fn policy(&self) -> &'static str {
        "lfu"
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.state.lock().touch(key)
    }

    fn put(&self, key: &[u8], value: &[u8]) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let cost = entry_cost(key, value);
        if cost > self.max_bytes || self.max_entries == 0 {
            state.remove(key);
            return;
        }

        let tick = state.next_tick();
        let freq = match state.entries.remove(key) {
            Some(old) => {
                state.order.remove(&(old.freq, old.tick));
                state.bytes -= entry_cost(key, &old.value);
                old.freq
            }
            None => 1,
        };
        state.entries.insert(
            key.to_vec(),
            Entry {
                value: value.to_vec(),
                freq,
                tick,
            },
        );
        state.bytes += cost;

        // Make room without evicting the entry just written.
        while state.bytes > self.max_bytes || state.entries.len() > self.max_entries {
            if !state.evict_one() {
                break;
            }
        }
        state.order.insert((freq, tick), key.to_vec());
    }

    fn remove(&self, key: &[u8]) -> bool {
        self.state.lock().remove(key)
    }

    fn contains(&self, key: &[u8]) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    fn size_bytes(&self) -> usize {
        self.state.lock().bytes
    }

    fn clear(&self) {
        *self.state.lock() = LfuState::default();
    }
}
