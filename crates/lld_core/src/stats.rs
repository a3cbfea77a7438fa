//! Per-instance operation counters.
//!
//! # Usage
//!
//! ```rust,ignore
//! let stats = db.stats();
//! println!("reads: {} (cache hits {})", stats.reads, stats.cache_hits);
//! ```

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters for one sector database.
///
/// Counters are monotonically increasing and can be read while operations
/// are in progress.
#[derive(Debug, Default)]
pub struct DatabaseStats {
    // Operation counters
    reads: AtomicU64,
    writes: AtomicU64,
    erases: AtomicU64,

    // Read path
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    /// Lookups answered "absent" by the bloom filter alone.
    bloom_rejections: AtomicU64,

    // Write path
    /// Writes that outgrew their sector and were appended elsewhere.
    relocations: AtomicU64,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,

    // Transaction counters
    transactions_started: AtomicU64,
    transactions_committed: AtomicU64,
    transactions_aborted: AtomicU64,
    /// Journals replayed at open.
    recoveries: AtomicU64,

    errors: AtomicU64,
}

impl DatabaseStats {
    /// Creates a zeroed stats instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_read(&self, bytes: u64) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self, bytes: u64) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_erase(&self) {
        self.erases.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_bloom_rejection(&self) {
        self.bloom_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_relocation(&self) {
        self.relocations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_start(&self) {
        self.transactions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_commit(&self) {
        self.transactions_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_abort(&self) {
        self.transactions_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recovery(&self) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of reads.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Returns the number of writes.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Returns the number of erases.
    pub fn erases(&self) -> u64 {
        self.erases.load(Ordering::Relaxed)
    }

    /// Returns the number of reads served from the cache.
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// Returns the number of reads that went to disk.
    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    /// Returns the number of lookups short-circuited by the bloom filter.
    pub fn bloom_rejections(&self) -> u64 {
        self.bloom_rejections.load(Ordering::Relaxed)
    }

    /// Returns the number of relocated writes.
    pub fn relocations(&self) -> u64 {
        self.relocations.load(Ordering::Relaxed)
    }

    /// Returns the number of committed transactions.
    pub fn transactions_committed(&self) -> u64 {
        self.transactions_committed.load(Ordering::Relaxed)
    }

    /// Returns the number of errors.
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            reads: self.reads(),
            writes: self.writes(),
            erases: self.erases(),
            cache_hits: self.cache_hits(),
            cache_misses: self.cache_misses(),
            bloom_rejections: self.bloom_rejections(),
            relocations: self.relocations(),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            transactions_started: self.transactions_started.load(Ordering::Relaxed),
            transactions_committed: self.transactions_committed(),
            transactions_aborted: self.transactions_aborted.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
            errors: self.errors(),
        }
    }
}

/// A point-in-time copy of [`DatabaseStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    /// Number of reads.
    pub reads: u64,
    /// Number of writes.
    pub writes: u64,
    /// Number of erases.
    pub erases: u64,
    /// Reads served from the cache.
    pub cache_hits: u64,
    /// Reads that went to disk.
    pub cache_misses: u64,
    /// Lookups short-circuited by the bloom filter.
    pub bloom_rejections: u64,
    /// Writes appended because they outgrew their sector.
    pub relocations: u64,
    /// Payload bytes written.
    pub bytes_written: u64,
    /// Payload bytes read.
    pub bytes_read: u64,
    /// Transactions started.
    pub transactions_started: u64,
    /// Transactions committed.
    pub transactions_committed: u64,
    /// Transactions aborted.
    pub transactions_aborted: u64,
    /// Journals replayed at open.
    pub recoveries: u64,
    /// Errors returned to callers.
    pub errors: u64,
}

impl StatsSnapshot {
    /// Fraction of reads served from the cache, or 0 with no reads.
    #[must_use]
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}
