//! The sector database: one named instance.
//!
//! A [`SectorDatabase`] combines a keychain, a value cache, a bloom filter,
//! the sector files and a commit journal behind one read/write lock.
//!
//! ## Read path
//!
//! 1. Pending entry of the caller's own transaction
//! 2. Cache hit
//! 3. Bloom filter says "absent" → `None` without touching disk
//! 4. Keychain lookup → sector bytes → cache
//!
//! ## Commit protocol
//!
//! 1. **Prepare**: fsync sector files, write and fsync `journal.dat`
//!    (the commit point)
//! 2. **Apply**: keychain, bloom and cache; undone on failure
//! 3. **Release**: delete the journal
//!
//! Writes inside a transaction always append, so the sectors named by the
//! committed keychain are never touched before the journal is durable.

use crate::bloom::BloomFilter;
use crate::cache::ValueCache;
use crate::config::{BloomConfig, SectorConfig};
use crate::error::{CoreError, CoreResult};
use crate::key::{SectorKey, SectorState};
use crate::keychain::KeyIndex;
use crate::sector::files::SectorFiles;
use crate::sector::journal::{self, JournalOp, JournalState, JOURNAL_FILE};
use crate::sector::txn::{ActiveTxn, TxnPhase};
use crate::stats::{DatabaseStats, StatsSnapshot};
use crate::types::TransactionId;
use lld_storage::Volume;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// File holding the bloom filter between a clean close and the next open.
pub const BLOOM_SNAPSHOT: &str = "_bloom.snapshot";

/// Outcome of journal recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// No journal was present.
    Clean,
    /// A complete journal was replayed.
    RolledForward {
        /// Transaction that was replayed.
        txid: TransactionId,
        /// Number of replayed entries.
        entries: usize,
    },
    /// A journal was deleted without being applied.
    Discarded,
    /// A journal tagged with a global transaction was left for the
    /// coordinator to decide.
    Deferred {
        /// Global transaction id in the journal.
        global: u64,
    },
    /// A complete journal could not be replayed. It stays on disk and the
    /// instance refuses writes until it is reopened.
    Blocked {
        /// Transaction whose replay failed.
        txid: TransactionId,
    },
}

/// An apply that stopped part way.
struct ApplyFailure {
    error: CoreError,
    /// Whether every entry applied before the failure was rolled back.
    undone: bool,
}

impl From<CoreError> for ApplyFailure {
    fn from(error: CoreError) -> Self {
        Self {
            error,
            undone: true,
        }
    }
}

/// Summary of an instance for tooling.
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseInfo {
    /// Instance name.
    pub name: String,
    /// Keychain implementation.
    pub keychain: &'static str,
    /// Cache policy.
    pub cache_policy: &'static str,
    /// Committed keys.
    pub keys: usize,
    /// Number of sector files.
    pub sector_files: usize,
    /// Bytes in sector files, including dead space.
    pub sector_bytes: u64,
    /// Cached entries.
    pub cache_entries: usize,
    /// Bytes charged to the cache.
    pub cache_bytes: usize,
    /// Bloom filter width.
    pub bloom_bits: u64,
    /// Bloom hash rounds.
    pub bloom_hashes: u32,
    /// Expected bloom false positive rate at the current fill.
    pub bloom_false_positive_rate: f64,
    /// Whether a commit journal is present.
    pub journal_present: bool,
    /// Whether writes are refused after corruption.
    pub corrupt: bool,
}

struct State<K> {
    keychain: K,
    files: SectorFiles,
    bloom: BloomFilter,
    txn: Option<ActiveTxn>,
}

/// How the caller may mutate right now.
enum Writer {
    /// No transaction: change committed state.
    Direct,
    /// The caller owns the open transaction: buffer.
    Buffered,
}

/// One sector database instance.
///
/// Thread-safe: reads share the instance lock, mutations take it
/// exclusively. The cache carries its own lock.
pub struct SectorDatabase<K: KeyIndex, C: ValueCache> {
    config: SectorConfig,
    volume: Arc<dyn Volume>,
    state: RwLock<State<K>>,
    cache: C,
    stats: DatabaseStats,
    next_txid: AtomicU64,
    corrupt: AtomicBool,
    closed: AtomicBool,
}

impl<K: KeyIndex, C: ValueCache> SectorDatabase<K, C> {
    /// Opens an instance over `volume` with the given keychain and cache.
    ///
    /// The bloom filter is taken from the snapshot left by a clean close,
    /// or rebuilt from the keychain. A writable instance then runs
    /// [`Self::txn_recovery`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for a bad configuration, `InvalidFormat` if
    /// the instance does not exist and `create` is false, or a storage error.
    pub fn open(volume: Arc<dyn Volume>, config: SectorConfig, keychain: K, cache: C) -> CoreResult<Self> {
        config.validate()?;
        if !config.create && !volume.exists(&crate::sector::files::sector_file_name(0))? {
            return Err(CoreError::invalid_format(format!(
                "no sector database {} in {}",
                config.name,
                volume.location()
            )));
        }

        let files = SectorFiles::open(Arc::clone(&volume), config.max_sector_file_size)?;
        let bloom = load_bloom(&*volume, &config.bloom, &keychain, config.write)?;

        let db = Self {
            config,
            volume,
            state: RwLock::new(State {
                keychain,
                files,
                bloom,
                txn: None,
            }),
            cache,
            stats: DatabaseStats::new(),
            next_txid: AtomicU64::new(1),
            corrupt: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        };

        if db.config.write {
            db.txn_recovery()?;
        } else if db.volume.exists(JOURNAL_FILE)? {
            warn!(instance = %db.config.name, "journal present on read-only open; not recovering");
        }

        info!(
            instance = %db.config.name,
            location = %db.volume.location(),
            keychain = db.state.read().keychain.kind(),
            cache = db.cache.policy(),
            "sector database opened"
        );
        Ok(db)
    }

    /// Instance name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Configuration the instance was opened with.
    #[must_use]
    pub fn config(&self) -> &SectorConfig {
        &self.config
    }

    /// Volume holding the instance's files.
    #[must_use]
    pub fn volume(&self) -> &Arc<dyn Volume> {
        &self.volume
    }

    /// Returns true once a corruption error has been seen.
    #[must_use]
    pub fn is_corrupt(&self) -> bool {
        self.corrupt.load(Ordering::Acquire)
    }

    /// Returns a snapshot of the operation counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn track<T>(&self, result: CoreResult<T>) -> CoreResult<T> {
        if let Err(e) = &result {
            self.stats.record_error();
            if e.is_corruption() && !self.corrupt.swap(true, Ordering::AcqRel) {
                error!(instance = %self.config.name, error = %e, "corruption detected; refusing writes until reopened");
            }
        }
        result
    }

    fn mark_corrupt(&self, reason: &str) {
        if !self.corrupt.swap(true, Ordering::AcqRel) {
            error!(instance = %self.config.name, reason, "refusing writes until reopened");
        }
    }

    /// Turns an apply failure into the error to report. A failure that
    /// left entries applied poisons the instance.
    fn settle(&self, failure: ApplyFailure) -> CoreError {
        if !failure.undone {
            self.mark_corrupt("apply could not be undone; journal kept for recovery");
        }
        failure.error
    }

    fn check_open(&self) -> CoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CoreError::Closed {
                name: self.config.name.clone(),
            });
        }
        Ok(())
    }

    fn check_writable(&self) -> CoreResult<()> {
        self.check_open()?;
        if !self.config.write {
            return Err(CoreError::ReadOnly {
                name: self.config.name.clone(),
            });
        }
        if self.is_corrupt() {
            return Err(CoreError::corrupt_index(format!(
                "instance {} refuses writes after corruption",
                self.config.name
            )));
        }
        Ok(())
    }

    fn check_key(state: &State<K>, key: &[u8]) -> CoreResult<()> {
        let max = state.keychain.max_key_len();
        if key.len() > max {
            return Err(CoreError::KeyTooLarge {
                len: key.len(),
                max,
            });
        }
        Ok(())
    }

    fn writer(state: &State<K>) -> CoreResult<Writer> {
        match &state.txn {
            None => Ok(Writer::Direct),
            Some(txn) if !txn.owned_by_current() => Err(CoreError::txn_conflict(format!(
                "{} is open on another thread",
                txn.id
            ))),
            Some(txn) if txn.phase == TxnPhase::Prepared => Err(CoreError::txn_conflict(format!(
                "{} is prepared and takes no more writes",
                txn.id
            ))),
            Some(_) => Ok(Writer::Buffered),
        }
    }

    /// The caller's pending operation on `key`, if it owns the transaction.
    fn own_pending<'a>(state: &'a State<K>, key: &[u8]) -> Option<&'a JournalOp> {
        state
            .txn
            .as_ref()
            .filter(|txn| txn.owned_by_current())
            .and_then(|txn| txn.pending(key))
    }

    fn owned_txn<'a>(txn: &'a mut Option<ActiveTxn>, verb: &str) -> CoreResult<&'a mut ActiveTxn> {
        match txn.as_mut() {
            None => Err(CoreError::txn_conflict(format!(
                "{verb} without an open transaction"
            ))),
            Some(txn) if !txn.owned_by_current() => Err(CoreError::txn_conflict(format!(
                "{verb} of {} from a thread that does not own it",
                txn.id
            ))),
            Some(txn) => Ok(txn),
        }
    }

    // ------------------------------------------------------------------
    // CRUD
    // ------------------------------------------------------------------

    /// Writes `value` under `key`.
    ///
    /// Outside a transaction the value replaces the committed one: in place
    /// when it fits the old sector and the instance is not append-only,
    /// otherwise appended. Inside the caller's transaction it is appended
    /// and buffered until commit.
    ///
    /// # Errors
    ///
    /// Returns `KeyTooLarge`, `ValueTooLarge`, `KeychainFull`, `ReadOnly`,
    /// `TxnConflict` if another thread holds a transaction, or a storage
    /// error.
    pub fn write(&self, key: &[u8], value: &[u8]) -> CoreResult<()> {
        let result = self.write_inner(key, value);
        self.track(result)
    }

    fn write_inner(&self, key: &[u8], value: &[u8]) -> CoreResult<()> {
        self.check_writable()?;
        let mut guard = self.state.write();
        self.put_locked(&mut guard, key, value)
    }

    fn put_locked(&self, state: &mut State<K>, key: &[u8], value: &[u8]) -> CoreResult<()> {
        Self::check_key(state, key)?;
        match Self::writer(state)? {
            Writer::Buffered => {
                let location = state.files.append(value)?;
                let origin = match state.txn.as_ref().and_then(|t| t.pending(key)) {
                    Some(_) => None,
                    None => state.keychain.get(key)?,
                };
                let pending = SectorKey::new(SectorState::Transaction, key, location);
                if let Some(txn) = state.txn.as_mut() {
                    txn.record(key, origin, Some(pending));
                }
            }
            Writer::Direct => {
                let old = state.keychain.get(key)?.filter(SectorKey::is_ready);
                let location = match old {
                    Some(old)
                        if !self.config.append && value.len() <= old.location.len as usize =>
                    {
                        state.files.overwrite(old.location, value)?
                    }
                    Some(_) => {
                        self.stats.record_relocation();
                        state.files.append(value)?
                    }
                    None => state.files.append(value)?,
                };
                state.keychain.put(&SectorKey::ready(key, location))?;
                state.bloom.insert(key);
                self.cache.put(key, value);
            }
        }
        self.stats.record_write(value.len() as u64);
        Ok(())
    }

    /// Writes a key with an empty value, for existence markers.
    ///
    /// # Errors
    ///
    /// Same as [`Self::write`].
    pub fn write_key(&self, key: &[u8]) -> CoreResult<()> {
        self.write(key, &[])
    }

    /// Reads the value of `key` as the caller sees it.
    ///
    /// The thread owning an open transaction sees its own pending writes;
    /// every other thread sees committed state.
    ///
    /// # Errors
    ///
    /// Returns `CorruptIndex` for a damaged keychain record or sector
    /// location, or a storage error.
    pub fn read(&self, key: &[u8]) -> CoreResult<Option<Vec<u8>>> {
        let result = self.read_inner(key);
        self.track(result)
    }

    fn read_inner(&self, key: &[u8]) -> CoreResult<Option<Vec<u8>>> {
        self.check_open()?;
        let state = self.state.read();
        let value = self.lookup(&state, key, true)?;
        if let Some(value) = &value {
            self.stats.record_read(value.len() as u64);
        }
        Ok(value)
    }

    fn lookup(&self, state: &State<K>, key: &[u8], count: bool) -> CoreResult<Option<Vec<u8>>> {
        if let Some(op) = Self::own_pending(state, key) {
            return match &op.new {
                Some(pending) => Ok(Some(state.files.read(pending.location)?)),
                None => Ok(None),
            };
        }

        if let Some(value) = self.cache.get(key) {
            if count {
                self.stats.record_cache_hit();
            }
            return Ok(Some(value));
        }
        if count {
            self.stats.record_cache_miss();
        }

        if !state.bloom.has(key) {
            if count {
                self.stats.record_bloom_rejection();
            }
            return Ok(None);
        }

        match state.keychain.get(key)? {
            Some(entry) if entry.is_ready() => {
                let value = state.files.read(entry.location)?;
                self.cache.put(key, &value);
                Ok(Some(value))
            }
            _ => Ok(None),
        }
    }

    /// Erases `key`, returning whether it existed.
    ///
    /// The keychain slot becomes a tombstone; the bloom filter keeps the key
    /// until it is rebuilt.
    ///
    /// # Errors
    ///
    /// Same as [`Self::write`].
    pub fn erase(&self, key: &[u8]) -> CoreResult<bool> {
        let result = self.erase_inner(key);
        self.track(result)
    }

    fn erase_inner(&self, key: &[u8]) -> CoreResult<bool> {
        self.check_writable()?;
        let mut guard = self.state.write();
        let state = &mut *guard;
        Self::check_key(state, key)?;

        let existed = match Self::writer(state)? {
            Writer::Buffered => {
                let pending = state
                    .txn
                    .as_ref()
                    .and_then(|t| t.pending(key))
                    .map(|op| op.new.is_some());
                match pending {
                    Some(existed) => {
                        if let Some(txn) = state.txn.as_mut() {
                            txn.record(key, None, None);
                        }
                        existed
                    }
                    None => {
                        let committed = state.keychain.get(key)?.filter(SectorKey::is_ready);
                        let existed = committed.is_some();
                        if existed {
                            if let Some(txn) = state.txn.as_mut() {
                                txn.record(key, committed, None);
                            }
                        }
                        existed
                    }
                }
            }
            Writer::Direct => {
                let existed = state.keychain.erase(key)?;
                self.cache.remove(key);
                existed
            }
        };
        if existed {
            self.stats.record_erase();
        }
        Ok(existed)
    }

    /// Returns true if `key` exists as the caller sees it.
    ///
    /// # Errors
    ///
    /// Same as [`Self::read`].
    pub fn has_key(&self, key: &[u8]) -> CoreResult<bool> {
        let result = self.has_key_inner(key);
        self.track(result)
    }

    fn has_key_inner(&self, key: &[u8]) -> CoreResult<bool> {
        self.check_open()?;
        let state = self.state.read();
        if let Some(op) = Self::own_pending(&state, key) {
            return Ok(op.new.is_some());
        }
        if self.cache.contains(key) {
            return Ok(true);
        }
        if !state.bloom.has(key) {
            self.stats.record_bloom_rejection();
            return Ok(false);
        }
        Ok(state
            .keychain
            .get(key)?
            .is_some_and(|entry| entry.is_ready()))
    }

    /// Binds `alias` to the current value of `target`.
    ///
    /// The alias receives its own sector, so later writes to either key do
    /// not affect the other. Returns false if `target` does not exist.
    ///
    /// # Errors
    ///
    /// Same as [`Self::write`].
    pub fn index(&self, alias: &[u8], target: &[u8]) -> CoreResult<bool> {
        let result = self.index_inner(alias, target);
        self.track(result)
    }

    fn index_inner(&self, alias: &[u8], target: &[u8]) -> CoreResult<bool> {
        self.check_writable()?;
        let mut guard = self.state.write();
        let Some(value) = self.lookup(&guard, target, false)? else {
            return Ok(false);
        };
        self.put_locked(&mut guard, alias, &value)?;
        Ok(true)
    }

    /// Lists committed keys.
    ///
    /// # Errors
    ///
    /// Returns a keychain error.
    pub fn keys(&self) -> CoreResult<Vec<Vec<u8>>> {
        let result = self.check_open().and_then(|()| self.state.read().keychain.keys());
        self.track(result)
    }

    /// Number of committed keys.
    ///
    /// # Errors
    ///
    /// Returns a keychain error.
    pub fn len(&self) -> CoreResult<usize> {
        let result = self.check_open().and_then(|()| self.state.read().keychain.len());
        self.track(result)
    }

    /// Returns true if no key is committed.
    ///
    /// # Errors
    ///
    /// Returns a keychain error.
    pub fn is_empty(&self) -> CoreResult<bool> {
        Ok(self.len()? == 0)
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Opens a transaction owned by the calling thread.
    ///
    /// # Errors
    ///
    /// Returns `TxnConflict` if a transaction is already open on this
    /// instance, or `ReadOnly`.
    pub fn txn_begin(&self) -> CoreResult<TransactionId> {
        let result = self.txn_begin_inner();
        self.track(result)
    }

    fn txn_begin_inner(&self) -> CoreResult<TransactionId> {
        self.check_writable()?;
        let mut state = self.state.write();
        if let Some(txn) = &state.txn {
            return Err(CoreError::txn_conflict(format!(
                "{} is already open on {}",
                txn.id, self.config.name
            )));
        }
        if self.volume.exists(JOURNAL_FILE)? {
            return Err(CoreError::txn_conflict(format!(
                "{} has a journal awaiting recovery",
                self.config.name
            )));
        }
        let id = TransactionId::new(self.next_txid.fetch_add(1, Ordering::Relaxed));
        state.txn = Some(ActiveTxn::new(id));
        self.stats.record_transaction_start();
        debug!(instance = %self.config.name, txn = %id, "transaction opened");
        Ok(id)
    }

    /// Returns the id of the open transaction, if any.
    #[must_use]
    pub fn current_txn(&self) -> Option<TransactionId> {
        self.state.read().txn.as_ref().map(|txn| txn.id)
    }

    /// Discards the caller's transaction.
    ///
    /// Values it appended become dead space in the sector files.
    ///
    /// # Errors
    ///
    /// Returns `TxnConflict` if the caller has no open transaction.
    pub fn txn_abort(&self) -> CoreResult<()> {
        let mut guard = self.state.write();
        let result = self.abort_locked(&mut guard);
        self.track(result)
    }

    fn abort_locked(&self, state: &mut State<K>) -> CoreResult<()> {
        let id = Self::owned_txn(&mut state.txn, "abort")?.id;
        // A failed prepare can leave a torn journal behind as well.
        journal::remove(&*self.volume)?;
        state.txn = None;
        self.stats.record_transaction_abort();
        debug!(instance = %self.config.name, txn = %id, "transaction aborted");
        Ok(())
    }

    /// Commits the caller's transaction: prepare, apply, release.
    ///
    /// If apply fails its changes are undone and the transaction is
    /// aborted. If the undo fails too, the journal is kept so the next
    /// open rolls the transaction forward, and the instance refuses writes
    /// until then.
    ///
    /// # Errors
    ///
    /// Returns `TxnConflict` if the caller has no open transaction, or the
    /// storage or keychain error that stopped the commit.
    pub fn txn_commit(&self) -> CoreResult<()> {
        let mut guard = self.state.write();
        let result = self.commit_locked(&mut guard);
        self.track(result)
    }

    fn commit_locked(&self, state: &mut State<K>) -> CoreResult<()> {
        self.prepare_locked(state, None)?;
        if let Err(failure) = self.apply_locked(state) {
            if failure.undone {
                if let Err(abort) = self.abort_locked(state) {
                    error!(instance = %self.config.name, error = %abort, "abort after failed apply");
                }
            } else if let Some(txn) = state.txn.take() {
                warn!(instance = %self.config.name, txn = %txn.id, "prepared transaction left for recovery");
            }
            return Err(self.settle(failure));
        }
        self.release_locked(state)
    }

    /// Makes the caller's transaction durable without applying it.
    ///
    /// The keychain must have room for every new key first, so a prepared
    /// transaction can always be applied. `global` tags the journal with a
    /// coordinated transaction id so that recovery can ask the coordinator
    /// whether it committed.
    ///
    /// # Errors
    ///
    /// Returns `TxnConflict` if the caller has no open transaction or it is
    /// already prepared, `KeychainFull`, or a storage error.
    pub fn txn_prepare(&self, global: Option<u64>) -> CoreResult<()> {
        let result = self.check_writable().and_then(|()| {
            let mut guard = self.state.write();
            self.prepare_locked(&mut guard, global)
        });
        self.track(result)
    }

    fn prepare_locked(&self, state: &mut State<K>, global: Option<u64>) -> CoreResult<()> {
        let txn = Self::owned_txn(&mut state.txn, "prepare")?;
        if txn.phase == TxnPhase::Prepared {
            return Err(CoreError::txn_conflict(format!("{} is already prepared", txn.id)));
        }
        let puts: Vec<&[u8]> = txn
            .ops()
            .iter()
            .filter(|op| op.new.is_some())
            .map(|op| op.key.as_slice())
            .collect();
        state.keychain.reserve(&puts)?;
        state.files.sync()?;
        journal::write(&*self.volume, txn.id, global, txn.ops())?;
        txn.phase = TxnPhase::Prepared;
        txn.global = global;
        debug!(
            instance = %self.config.name,
            txn = %txn.id,
            global = ?global,
            entries = txn.len(),
            "journal checkpoint written"
        );
        Ok(())
    }

    /// Applies a prepared transaction to the keychain, bloom filter and
    /// cache. On failure the applied entries are undone and the journal
    /// stays in place.
    ///
    /// # Errors
    ///
    /// Returns `TxnConflict` if the caller's transaction is not prepared,
    /// or the keychain error that stopped the apply.
    pub fn txn_apply(&self) -> CoreResult<()> {
        let mut guard = self.state.write();
        let result = self.apply_locked(&mut guard).map_err(|f| self.settle(f));
        self.track(result)
    }

    fn apply_locked(&self, state: &mut State<K>) -> Result<(), ApplyFailure> {
        let txn = Self::owned_txn(&mut state.txn, "apply")?;
        if txn.phase != TxnPhase::Prepared {
            return Err(CoreError::txn_conflict(format!(
                "{} must be prepared before apply",
                txn.id
            ))
            .into());
        }
        let ops = txn.ops().to_vec();
        self.apply_ops(state, &ops)
    }

    /// Deletes the journal of an applied transaction and closes it.
    ///
    /// # Errors
    ///
    /// Returns `TxnConflict` if the caller's transaction is not prepared,
    /// or a storage error.
    pub fn txn_release(&self) -> CoreResult<()> {
        let mut guard = self.state.write();
        let result = self.release_locked(&mut guard);
        self.track(result)
    }

    fn release_locked(&self, state: &mut State<K>) -> CoreResult<()> {
        let txn = Self::owned_txn(&mut state.txn, "release")?;
        if txn.phase != TxnPhase::Prepared {
            return Err(CoreError::txn_conflict(format!(
                "{} must be prepared before release",
                txn.id
            )));
        }
        let (id, entries) = (txn.id, txn.len());
        journal::remove(&*self.volume)?;
        state.txn = None;
        self.stats.record_transaction_commit();
        debug!(instance = %self.config.name, txn = %id, entries, "transaction committed");
        Ok(())
    }

    /// Forgets the caller's prepared transaction but leaves its journal on
    /// disk, so the next recovery decides its fate.
    ///
    /// # Errors
    ///
    /// Returns `TxnConflict` if the caller's transaction is not prepared.
    pub fn txn_detach(&self) -> CoreResult<()> {
        let mut guard = self.state.write();
        let result = Self::owned_txn(&mut guard.txn, "detach").and_then(|txn| {
            if txn.phase == TxnPhase::Prepared {
                Ok(txn.id)
            } else {
                Err(CoreError::txn_conflict(format!(
                    "{} must be prepared before detach",
                    txn.id
                )))
            }
        });
        let result = result.map(|id| {
            guard.txn = None;
            warn!(instance = %self.config.name, txn = %id, "prepared transaction left for recovery");
        });
        self.track(result)
    }

    fn apply_ops(&self, state: &mut State<K>, ops: &[JournalOp]) -> Result<(), ApplyFailure> {
        for (i, op) in ops.iter().enumerate() {
            if let Err(error) = self.apply_one(state, op) {
                error!(
                    instance = %self.config.name,
                    applied = i,
                    error = %error,
                    "apply failed; undoing"
                );
                let mut undone = true;
                for done in ops[..=i].iter().rev() {
                    if let Err(undo) = self.undo_one(state, done) {
                        error!(instance = %self.config.name, error = %undo, "undo failed");
                        undone = false;
                    }
                }
                return Err(ApplyFailure { error, undone });
            }
        }
        state.keychain.flush().map_err(|error| ApplyFailure {
            error,
            undone: false,
        })
    }

    fn apply_one(&self, state: &mut State<K>, op: &JournalOp) -> CoreResult<()> {
        match &op.new {
            Some(new) => {
                state.keychain.put(&new.with_state(SectorState::Ready))?;
                state.bloom.insert(&op.key);
            }
            None => {
                state.keychain.erase(&op.key)?;
            }
        }
        self.cache.remove(&op.key);
        Ok(())
    }

    fn undo_one(&self, state: &mut State<K>, op: &JournalOp) -> CoreResult<()> {
        match &op.old {
            Some(old) => state.keychain.put(&old.with_state(SectorState::Ready))?,
            None => {
                state.keychain.erase(&op.key)?;
            }
        }
        self.cache.remove(&op.key);
        Ok(())
    }

    /// Replays or discards the journal left by an interrupted commit.
    ///
    /// A complete untagged journal is rolled forward and an incomplete one
    /// is deleted. A journal tagged with a global transaction is deferred
    /// to the coordinator. A journal whose replay fails is kept and the
    /// instance refuses writes, so the open itself still succeeds.
    ///
    /// # Errors
    ///
    /// Returns `TxnConflict` if a transaction is open, `ReadOnly`, or the
    /// error that stopped the replay.
    pub fn txn_recovery(&self) -> CoreResult<Recovery> {
        self.recover_with(|_| None)
    }

    /// Recovery with a decision for tagged journals: `decide(global)`
    /// returns `Some(true)` to roll forward, `Some(false)` to discard and
    /// `None` to leave the journal in place.
    ///
    /// # Errors
    ///
    /// Same as [`Self::txn_recovery`].
    pub fn recover_with(&self, decide: impl Fn(u64) -> Option<bool>) -> CoreResult<Recovery> {
        let result = self.check_writable().and_then(|()| {
            let mut guard = self.state.write();
            self.recover_locked(&mut guard, &decide)
        });
        self.track(result)
    }

    fn recover_locked(
        &self,
        state: &mut State<K>,
        decide: &dyn Fn(u64) -> Option<bool>,
    ) -> CoreResult<Recovery> {
        if let Some(txn) = &state.txn {
            return Err(CoreError::txn_conflict(format!(
                "recovery while {} is open",
                txn.id
            )));
        }

        let committed = match journal::read(&*self.volume)? {
            JournalState::Absent => return Ok(Recovery::Clean),
            JournalState::Incomplete { records } => {
                warn!(instance = %self.config.name, records, "discarding incomplete journal");
                journal::remove(&*self.volume)?;
                return Ok(Recovery::Discarded);
            }
            JournalState::Complete(committed) => committed,
        };

        if let Some(global) = committed.global {
            match decide(global) {
                None => {
                    info!(instance = %self.config.name, global, "journal deferred to coordinator");
                    return Ok(Recovery::Deferred { global });
                }
                Some(false) => {
                    warn!(
                        instance = %self.config.name,
                        global,
                        "discarding journal of uncommitted global transaction"
                    );
                    journal::remove(&*self.volume)?;
                    return Ok(Recovery::Discarded);
                }
                Some(true) => {}
            }
        }

        if let Err(failure) = self.apply_ops(state, &committed.ops) {
            error!(
                instance = %self.config.name,
                txn = %committed.txid,
                error = %failure.error,
                "journal replay failed; keeping it"
            );
            self.mark_corrupt("journal could not be replayed");
            return Ok(Recovery::Blocked {
                txid: committed.txid,
            });
        }
        journal::remove(&*self.volume)?;
        self.stats.record_recovery();
        info!(
            instance = %self.config.name,
            txn = %committed.txid,
            entries = committed.ops.len(),
            "journal rolled forward"
        );
        Ok(Recovery::RolledForward {
            txid: committed.txid,
            entries: committed.ops.len(),
        })
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Syncs sector and keychain files.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn flush(&self) -> CoreResult<()> {
        let result = self.check_open().and_then(|()| {
            let mut guard = self.state.write();
            let state = &mut *guard;
            state.files.sync()?;
            state.keychain.flush()
        });
        self.track(result)
    }

    /// Flushes, saves the bloom filter snapshot and refuses further use.
    ///
    /// An open transaction is discarded first, whichever thread owns it. A
    /// prepared one keeps its journal for recovery.
    ///
    /// # Errors
    ///
    /// Returns a storage error. The instance stays open if closing fails.
    pub fn close(&self) -> CoreResult<()> {
        let result = self.close_inner();
        self.track(result)
    }

    fn close_inner(&self) -> CoreResult<()> {
        self.check_open()?;
        let mut guard = self.state.write();
        let state = &mut *guard;
        if let Some((id, phase)) = state.txn.as_ref().map(|txn| (txn.id, txn.phase)) {
            if phase == TxnPhase::Open {
                warn!(instance = %self.config.name, txn = %id, "closing with an open transaction; discarding it");
                journal::remove(&*self.volume)?;
                self.stats.record_transaction_abort();
            } else {
                warn!(instance = %self.config.name, txn = %id, "closing with a prepared transaction; journal left for recovery");
            }
            state.txn = None;
        }
        if self.config.write {
            state.files.sync()?;
            state.keychain.flush()?;
            if !self.is_corrupt() {
                self.volume
                    .write_file_atomic(BLOOM_SNAPSHOT, &state.bloom.encode())?;
            }
        }
        self.closed.store(true, Ordering::Release);
        info!(instance = %self.config.name, "sector database closed");
        Ok(())
    }

    /// Summarizes the instance.
    ///
    /// # Errors
    ///
    /// Returns a keychain or storage error.
    pub fn info(&self) -> CoreResult<DatabaseInfo> {
        let state = self.state.read();
        Ok(DatabaseInfo {
            name: self.config.name.clone(),
            keychain: state.keychain.kind(),
            cache_policy: self.cache.policy(),
            keys: state.keychain.len()?,
            sector_files: state.files.file_count(),
            sector_bytes: state.files.total_size()?,
            cache_entries: self.cache.len(),
            cache_bytes: self.cache.size_bytes(),
            bloom_bits: state.bloom.bit_count(),
            bloom_hashes: state.bloom.hash_count(),
            bloom_false_positive_rate: state.bloom.estimated_false_positive_rate(),
            journal_present: self.volume.exists(JOURNAL_FILE)?,
            corrupt: self.is_corrupt(),
        })
    }

    /// Direct access to the cache, for tests and tooling.
    #[must_use]
    pub fn cache(&self) -> &C {
        &self.cache
    }
}

impl<K: KeyIndex, C: ValueCache> std::fmt::Debug for SectorDatabase<K, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SectorDatabase")
            .field("name", &self.config.name)
            .field("location", &self.volume.location())
            .field("cache", &self.cache.policy())
            .field("corrupt", &self.is_corrupt())
            .finish_non_exhaustive()
    }
}

/// Loads the bloom snapshot if it matches `config`, otherwise rebuilds the
/// filter from the keychain. A writable open deletes the snapshot so a
/// later crash cannot leave a stale one behind.
fn load_bloom<K: KeyIndex>(
    volume: &dyn Volume,
    config: &BloomConfig,
    keychain: &K,
    consume: bool,
) -> CoreResult<BloomFilter> {
    let fresh = BloomFilter::with_rate(config.expected_keys, config.false_positive_rate);

    if let Some(data) = volume.read_file(BLOOM_SNAPSHOT)? {
        if consume {
            volume.remove(BLOOM_SNAPSHOT)?;
        }
        match BloomFilter::decode(&data) {
            Ok(snapshot)
                if snapshot.bit_count() == fresh.bit_count()
                    && snapshot.hash_count() == fresh.hash_count() =>
            {
                debug!(location = %volume.location(), "bloom filter loaded from snapshot");
                return Ok(snapshot);
            }
            Ok(_) => {
                warn!(location = %volume.location(), "bloom snapshot sized for another configuration");
            }
            Err(e) => {
                warn!(location = %volume.location(), error = %e, "bloom snapshot unreadable");
            }
        }
    }

    let mut bloom = fresh;
    let keys = keychain.keys()?;
    for key in &keys {
        bloom.insert(key);
    }
    info!(location = %volume.location(), keys = keys.len(), "bloom filter rebuilt from keychain");
    Ok(bloom)
}
