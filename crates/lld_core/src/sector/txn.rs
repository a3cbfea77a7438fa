//! In-memory state of an open instance transaction.

use crate::key::SectorKey;
use crate::sector::journal::JournalOp;
use crate::types::TransactionId;
use std::collections::HashMap;
use std::thread::{self, ThreadId};

/// Lifecycle of an instance transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnPhase {
    /// Accepting writes.
    Open,
    /// Journal is durable; waiting for apply.
    Prepared,
}

/// Buffered mutations of the transaction owned by one thread.
///
/// Each key appears once: a second write to the same key replaces the
/// pending entry but keeps the committed `old` it started from.
#[derive(Debug)]
pub(crate) struct ActiveTxn {
    pub(crate) id: TransactionId,
    pub(crate) owner: ThreadId,
    pub(crate) phase: TxnPhase,
    pub(crate) global: Option<u64>,
    ops: Vec<JournalOp>,
    index: HashMap<Vec<u8>, usize>,
}

impl ActiveTxn {
    pub(crate) fn new(id: TransactionId) -> Self {
        Self {
            id,
            owner: thread::current().id(),
            phase: TxnPhase::Open,
            global: None,
            ops: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Returns true if the calling thread opened this transaction.
    pub(crate) fn owned_by_current(&self) -> bool {
        self.owner == thread::current().id()
    }

    /// Latest pending operation on `key`.
    pub(crate) fn pending(&self, key: &[u8]) -> Option<&JournalOp> {
        self.index.get(key).map(|&i| &self.ops[i])
    }

    /// Buffers a write or erase. `committed` is the entry in the keychain,
    /// used only the first time the key is touched.
    pub(crate) fn record(&mut self, key: &[u8], committed: Option<SectorKey>, new: Option<SectorKey>) {
        match self.index.get(key) {
            Some(&i) => self.ops[i].new = new,
            None => {
                self.index.insert(key.to_vec(), self.ops.len());
                self.ops.push(JournalOp {
                    key: key.to_vec(),
                    old: committed,
                    new,
                });
            }
        }
    }

    pub(crate) fn ops(&self) -> &[JournalOp] {
        &self.ops
    }

    pub(crate) fn len(&self) -> usize {
        self.ops.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SectorLocation;

    fn sector(key: &[u8], offset: u32) -> SectorKey {
        SectorKey::ready(
            key,
            SectorLocation {
                file: 0,
                offset,
                len: 1,
            },
        )
    }

    #[test]
    fn rewrite_keeps_committed_origin() {
        let mut txn = ActiveTxn::new(TransactionId::new(1));
        let committed = Some(sector(b"k", 0));
        txn.record(b"k", committed.clone(), Some(sector(b"k", 1)));
        txn.record(b"k", Some(sector(b"k", 1)), Some(sector(b"k", 2)));
        txn.record(b"k", None, None);

        assert_eq!(txn.len(), 1);
        let op = txn.pending(b"k").unwrap();
        assert_eq!(op.old, committed);
        assert_eq!(op.new, None);
    }

    #[test]
    fn owner_is_opening_thread() {
        let txn = ActiveTxn::new(TransactionId::new(1));
        assert!(txn.owned_by_current());
        let other = std::thread::spawn(move || txn.owned_by_current())
            .join()
            .unwrap();
        assert!(!other);
    }
}
