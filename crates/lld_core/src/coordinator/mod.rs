//! Global transactions across instances.
//!
//! The [`Coordinator`] runs two-phase commit over the instances of a
//! context:
//!
//! 1. **Prepare** every participant in canonical order; each writes a
//!    journal tagged with the global id
//! 2. Write the [`CommitRecord`] atomically at the context root (the
//!    commit point)
//! 3. **Apply** and **release** every participant
//! 4. Delete the record
//!
//! A crash before step 2 leaves tagged journals without a record, and
//! recovery discards them. A crash after step 2 leaves the record, and
//! recovery rolls every tagged journal forward.

mod instance;
mod record;

pub use instance::{Instance, InstanceSet};
pub use record::{CommitRecord, COMMIT_RECORD_FILE};

use crate::cache::ValueCache;
use crate::error::{CoreError, CoreResult};
use crate::keychain::KeyIndex;
use crate::sector::{Recovery, SectorDatabase};
use crate::types::TransactionId;
use lld_storage::Volume;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

/// The transaction verbs the coordinator drives on each instance.
pub trait Participant: Send + Sync {
    /// Instance name, for logs.
    fn name(&self) -> &str;

    /// Opens a local transaction owned by the calling thread.
    fn txn_begin(&self) -> CoreResult<TransactionId>;

    /// Writes the local journal tagged with `global`.
    fn txn_prepare(&self, global: Option<u64>) -> CoreResult<()>;

    /// Applies the prepared transaction.
    fn txn_apply(&self) -> CoreResult<()>;

    /// Deletes the journal and closes the transaction.
    fn txn_release(&self) -> CoreResult<()>;

    /// Discards the local transaction.
    fn txn_abort(&self) -> CoreResult<()>;

    /// Forgets a prepared transaction, leaving its journal for recovery.
    fn txn_detach(&self) -> CoreResult<()>;

    /// Resolves a leftover journal, asking `decide` about tagged ones.
    fn recover_with(&self, decide: &dyn Fn(u64) -> Option<bool>) -> CoreResult<Recovery>;
}

impl<K: KeyIndex, C: ValueCache> Participant for SectorDatabase<K, C> {
    fn name(&self) -> &str {
        SectorDatabase::name(self)
    }

    fn txn_begin(&self) -> CoreResult<TransactionId> {
        SectorDatabase::txn_begin(self)
    }

    fn txn_prepare(&self, global: Option<u64>) -> CoreResult<()> {
        SectorDatabase::txn_prepare(self, global)
    }

    fn txn_apply(&self) -> CoreResult<()> {
        SectorDatabase::txn_apply(self)
    }

    fn txn_release(&self) -> CoreResult<()> {
        SectorDatabase::txn_release(self)
    }

    fn txn_abort(&self) -> CoreResult<()> {
        SectorDatabase::txn_abort(self)
    }

    fn txn_detach(&self) -> CoreResult<()> {
        SectorDatabase::txn_detach(self)
    }

    fn recover_with(&self, decide: &dyn Fn(u64) -> Option<bool>) -> CoreResult<Recovery> {
        SectorDatabase::recover_with(self, decide)
    }
}

/// Instances a global operation may touch, keyed in canonical order.
pub type Participants = BTreeMap<Instance, Arc<dyn Participant>>;

/// Outcome of coordinator recovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Global id of the commit record found, if any.
    pub committed: Option<u64>,
    /// Per-instance outcome in canonical order.
    pub instances: Vec<(Instance, Recovery)>,
}

impl RecoveryReport {
    /// Number of instances whose journal was rolled forward.
    #[must_use]
    pub fn rolled_forward(&self) -> usize {
        self.instances
            .iter()
            .filter(|(_, r)| matches!(r, Recovery::RolledForward { .. }))
            .count()
    }

    /// Number of instances whose journal was discarded.
    #[must_use]
    pub fn discarded(&self) -> usize {
        self.instances
            .iter()
            .filter(|(_, r)| *r == Recovery::Discarded)
            .count()
    }

    /// Number of instances whose journal is still on disk.
    #[must_use]
    pub fn unresolved(&self) -> usize {
        self.instances
            .iter()
            .filter(|(_, r)| matches!(r, Recovery::Blocked { .. } | Recovery::Deferred { .. }))
            .count()
    }
}

#[derive(Debug, Clone, Copy)]
struct GlobalTxn {
    id: u64,
    scope: InstanceSet,
    owner: ThreadId,
}

/// Runs global transactions over a set of participants.
///
/// One global transaction is open at a time, owned by the thread that began
/// it.
#[derive(Debug)]
pub struct Coordinator {
    root: Arc<dyn Volume>,
    active: Mutex<Option<GlobalTxn>>,
    next_global: AtomicU64,
}

impl Coordinator {
    /// Creates a coordinator whose commit record lives in `root`.
    #[must_use]
    pub fn new(root: Arc<dyn Volume>) -> Self {
        // Ids only need to differ from any journal still on disk; a
        // timestamp seed keeps them apart across restarts.
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .ok()
            .and_then(|d| u64::try_from(d.as_micros()).ok())
            .unwrap_or(1)
            .max(1);
        Self {
            root,
            active: Mutex::new(None),
            next_global: AtomicU64::new(seed),
        }
    }

    /// Global id and scope of the open transaction, if any.
    #[must_use]
    pub fn current(&self) -> Option<(u64, InstanceSet)> {
        self.active.lock().map(|txn| (txn.id, txn.scope))
    }

    /// Opens a global transaction over `scope`.
    ///
    /// Each instance opens a local transaction in canonical order. If one
    /// fails the ones already opened are aborted.
    ///
    /// # Errors
    ///
    /// Returns `TxnConflict` if a global transaction is open or a commit
    /// record still awaits [`Self::txn_recovery`], `InvalidConfig` for an
    /// empty scope or an instance that is not open, or the first instance's
    /// error.
    pub fn txn_begin(&self, scope: InstanceSet, participants: &Participants) -> CoreResult<u64> {
        let mut active = self.active.lock();
        if let Some(txn) = &*active {
            return Err(CoreError::txn_conflict(format!(
                "global transaction {} is already open",
                txn.id
            )));
        }
        if scope.is_empty() {
            return Err(CoreError::invalid_config("global transaction over no instances"));
        }
        self.check_no_pending_record()?;
        let members = Self::members(scope, participants)?;

        let mut begun: Vec<&Arc<dyn Participant>> = Vec::with_capacity(members.len());
        for (instance, participant) in &members {
            if let Err(e) = participant.txn_begin() {
                warn!(instance = %instance, error = %e, "global begin failed; aborting opened instances");
                for opened in begun.iter().rev() {
                    if let Err(abort) = opened.txn_abort() {
                        error!(instance = opened.name(), error = %abort, "abort after failed begin");
                    }
                }
                return Err(e);
            }
            begun.push(*participant);
        }

        let id = self.next_global.fetch_add(1, Ordering::Relaxed);
        *active = Some(GlobalTxn {
            id,
            scope,
            owner: thread::current().id(),
        });
        info!(global = id, scope = %scope, "global transaction opened");
        Ok(id)
    }

    /// Commits the open global transaction.
    ///
    /// A failure before the commit record is written aborts every
    /// instance. A failure after it leaves the record and the failing
    /// instance's journal for recovery, and is still reported. No other
    /// global transaction can begin until [`Self::txn_recovery`] has
    /// resolved that record.
    ///
    /// # Errors
    ///
    /// Returns `TxnConflict` if the caller has no open global transaction
    /// or another commit record is pending, or the first error met.
    pub fn txn_commit(&self, participants: &Participants) -> CoreResult<()> {
        let mut active = self.active.lock();
        let txn = Self::owned(&active, "commit")?;
        let members = Self::members(txn.scope, participants)?;
        *active = None;

        let prepared = self.check_no_pending_record().and_then(|()| {
            for (instance, participant) in &members {
                if let Err(e) = participant.txn_prepare(Some(txn.id)) {
                    warn!(global = txn.id, instance = %instance, error = %e, "prepare failed; aborting");
                    return Err(e);
                }
            }
            Ok(())
        });
        if let Err(e) = prepared {
            Self::abort_members(&members);
            return Err(e);
        }

        let record = CommitRecord {
            global: txn.id,
            scope: txn.scope,
        };
        if let Err(e) = record.write(&*self.root) {
            error!(global = txn.id, error = %e, "commit record write failed; aborting");
            Self::abort_members(&members);
            if let Err(cleanup) = CommitRecord::remove(&*self.root) {
                error!(global = txn.id, error = %cleanup, "commit record cleanup failed");
            }
            return Err(e);
        }
        debug!(global = txn.id, "global commit point reached");

        let mut failure = None;
        for (instance, participant) in &members {
            let applied = participant
                .txn_apply()
                .and_then(|()| participant.txn_release());
            if let Err(e) = applied {
                error!(
                    global = txn.id,
                    instance = %instance,
                    error = %e,
                    "apply after commit point failed; left for recovery"
                );
                if let Err(detach) = participant.txn_detach() {
                    error!(instance = %instance, error = %detach, "detach failed");
                }
                failure.get_or_insert(e);
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }

        CommitRecord::remove(&*self.root)?;
        info!(global = txn.id, scope = %txn.scope, "global transaction committed");
        Ok(())
    }

    /// Aborts the open global transaction on every instance.
    ///
    /// # Errors
    ///
    /// Returns `TxnConflict` if the caller has no open global transaction,
    /// or the first instance error.
    pub fn txn_abort(&self, participants: &Participants) -> CoreResult<()> {
        let mut active = self.active.lock();
        let txn = Self::owned(&active, "abort")?;
        let members = Self::members(txn.scope, participants)?;
        *active = None;

        let mut failure = None;
        for (instance, participant) in members.iter().rev() {
            if let Err(e) = participant.txn_abort() {
                error!(global = txn.id, instance = %instance, error = %e, "abort failed");
                failure.get_or_insert(e);
            }
        }
        info!(global = txn.id, "global transaction aborted");
        failure.map_or(Ok(()), Err)
    }

    /// Resolves journals left by an interrupted global commit.
    ///
    /// A tagged journal rolls forward when the commit record names its
    /// global id and instance, and is discarded otherwise. The record is
    /// deleted once every instance it names has been resolved.
    ///
    /// # Errors
    ///
    /// Returns `TxnConflict` while a global transaction is open, or the
    /// first recovery error. The record is kept on error.
    pub fn txn_recovery(&self, participants: &Participants) -> CoreResult<RecoveryReport> {
        let active = self.active.lock();
        if let Some(txn) = &*active {
            return Err(CoreError::txn_conflict(format!(
                "recovery while global transaction {} is open",
                txn.id
            )));
        }

        let record = CommitRecord::read(&*self.root)?;
        let mut report = RecoveryReport {
            committed: record.map(|r| r.global),
            instances: Vec::with_capacity(participants.len()),
        };
        for (instance, participant) in participants {
            let instance = *instance;
            let decide = |global: u64| {
                Some(record.is_some_and(|r| r.global == global && r.scope.contains(instance)))
            };
            let outcome = participant.recover_with(&decide)?;
            if outcome != Recovery::Clean {
                info!(instance = %instance, outcome = ?outcome, "instance recovered");
            }
            report.instances.push((instance, outcome));
        }

        if let Some(record) = record {
            if report.unresolved() > 0 {
                warn!(
                    global = record.global,
                    unresolved = report.unresolved(),
                    "journals left unresolved; keeping the commit record"
                );
            } else if record.scope.iter().all(|i| participants.contains_key(&i)) {
                CommitRecord::remove(&*self.root)?;
                info!(global = record.global, scope = %record.scope, "global commit record resolved");
            } else {
                warn!(
                    global = record.global,
                    scope = %record.scope,
                    "commit record names instances that are not open; keeping it"
                );
            }
        }
        Ok(report)
    }

    /// A leftover record must be resolved first: a second record would
    /// replace it and its removal would strand the first one's journals.
    fn check_no_pending_record(&self) -> CoreResult<()> {
        if let Some(record) = CommitRecord::read(&*self.root)? {
            return Err(CoreError::txn_conflict(format!(
                "commit record of global transaction {} awaits recovery",
                record.global
            )));
        }
        Ok(())
    }

    fn owned(active: &Option<GlobalTxn>, verb: &str) -> CoreResult<GlobalTxn> {
        match active {
            None => Err(CoreError::txn_conflict(format!(
                "global {verb} without an open transaction"
            ))),
            Some(txn) if txn.owner != thread::current().id() => Err(CoreError::txn_conflict(
                format!("global {verb} of {} from a thread that does not own it", txn.id),
            )),
            Some(txn) => Ok(*txn),
        }
    }

    fn members<'a>(
        scope: InstanceSet,
        participants: &'a Participants,
    ) -> CoreResult<Vec<(Instance, &'a Arc<dyn Participant>)>> {
        scope
            .iter()
            .map(|instance| {
                participants
                    .get(&instance)
                    .map(|p| (instance, p))
                    .ok_or_else(|| {
                        CoreError::invalid_config(format!("instance {instance} is not open"))
                    })
            })
            .collect()
    }

    fn abort_members(members: &[(Instance, &Arc<dyn Participant>)]) {
        for (instance, participant) in members.iter().rev() {
            if let Err(e) = participant.txn_abort() {
                error!(instance = %instance, error = %e, "abort failed");
            }
        }
    }
}
