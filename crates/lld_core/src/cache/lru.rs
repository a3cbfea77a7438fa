//! Least-recently-used cache.

use crate::cache::{entry_cost, ValueCache};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Default)]
struct Node {
    key: Vec<u8>,
    value: Vec<u8>,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Doubly linked recency list stored in a slab; `head` is most recent.
/// Slots on the free list hold empty nodes.
#[derive(Debug, Default)]
struct LruState {
    index: HashMap<Vec<u8>, usize>,
    nodes: Vec<Node>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    bytes: usize,
}

impl LruState {
    fn node(&self, slot: usize) -> &Node {
        &self.nodes[slot]
    }

    fn node_mut(&mut self, slot: usize) -> &mut Node {
        &mut self.nodes[slot]
    }

    fn detach(&mut self, slot: usize) {
        let (prev, next) = {
            let node = self.node(slot);
            (node.prev, node.next)
        };
        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.node_mut(n).prev = prev,
            None => self.tail = prev,
        }
        let node = self.node_mut(slot);
        node.prev = None;
        node.next = None;
    }

    fn push_front(&mut self, slot: usize) {
        let old_head = self.head;
        {
            let node = self.node_mut(slot);
            node.prev = None;
            node.next = old_head;
        }
        if let Some(h) = old_head {
            self.node_mut(h).prev = Some(slot);
        }
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
    }

    fn allocate(&mut self, node: Node) -> usize {
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = node;
                slot
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn unlink(&mut self, slot: usize) {
        self.detach(slot);
        let node = std::mem::take(&mut self.nodes[slot]);
        self.free.push(slot);
        self.index.remove(&node.key);
        self.bytes -= entry_cost(&node.key, &node.value);
    }

    fn remove(&mut self, key: &[u8]) -> bool {
        match self.index.get(key).copied() {
            Some(slot) => {
                self.unlink(slot);
                true
            }
            None => false,
        }
    }
}

/// A byte- and entry-bounded LRU cache.
///
/// `get` moves the entry to the front; overflow evicts from the back.
/// Every operation is O(1).
#[derive(Debug)]
pub struct LruCache {
    state: Mutex<LruState>,
    max_bytes: usize,
    max_entries: usize,
}

impl LruCache {
    /// Creates a cache bounded by `max_bytes` and `max_entries`.
    #[must_use]
    pub fn new(max_bytes: usize, max_entries: usize) -> Self {
        Self {
            state: Mutex::new(LruState::default()),
            max_bytes,
            max_entries,
        }
    }

    /// Creates a cache bounded only by entry count.
    #[must_use]
    pub fn with_entries(max_entries: usize) -> Self {
        Self::new(usize::MAX, max_entries)
    }

    /// Keys from most to least recently used.
    #[must_use]
    pub fn keys_by_recency(&self) -> Vec<Vec<u8>> {
        let state = self.state.lock();
        let mut keys = Vec::with_capacity(state.index.len());
        let mut cursor = state.head;
        while let Some(slot) = cursor {
            let node = state.node(slot);
            keys.push(node.key.clone());
            cursor = node.next;
        }
        keys
    }
}

impl ValueCache for LruCache {
    fn policy(&self) -> &'static str {
        "lru"
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let mut state = self.state.lock();
        let slot = *state.index.get(key)?;
        state.detach(slot);
        state.push_front(slot);
        Some(state.node(slot).value.clone())
    }

    fn put(&self, key: &[u8], value: &[u8]) {
        let mut state = self.state.lock();
        let cost = entry_cost(key, value);
        if cost > self.max_bytes || self.max_entries == 0 {
            state.remove(key);
            return;
        }

        if let Some(slot) = state.index.get(key).copied() {
            let old = entry_cost(key, &state.node(slot).value);
            state.node_mut(slot).value = value.to_vec();
            state.bytes = state.bytes - old + cost;
            state.detach(slot);
            state.push_front(slot);
        } else {
            let slot = state.allocate(Node {
                key: key.to_vec(),
                value: value.to_vec(),
                prev: None,
                next: None,
            });
            state.push_front(slot);
            state.index.insert(key.to_vec(), slot);
            state.bytes += cost;
        }

        while state.bytes > self.max_bytes || state.index.len() > self.max_entries {
            let Some(tail) = state.tail else { break };
            state.unlink(tail);
        }
    }

    fn remove(&self, key: &[u8]) -> bool {
        self.state.lock().remove(key)
    }

    fn contains(&self, key: &[u8]) -> bool {
        self.state.lock().index.contains_key(key)
    }

    fn len(&self) -> usize {
        self.state.lock().index.len()
    }

    fn size_bytes(&self) -> usize {
        self.state.lock().bytes
    }

    fn clear(&self) {
        *self.state.lock() = LruState::default();
    }
}
