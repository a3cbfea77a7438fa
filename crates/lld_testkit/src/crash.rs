//! Crash recovery testing for LLD.
//!
//! A [`CrashVolume`] wraps a volume and fails every mutation once a budget
//! of write steps is spent. Dropping the context at that point and
//! reopening it over the untouched inner volume shows exactly what a
//! process killed at that step would find on restart.
//!
//! ## Test Strategy
//!
//! [`CrashRecoveryHarness::run_matrix`] repeats an action with budgets
//! 0, 1, 2, ... until it completes without crashing. After every crash the
//! reopened context must hold either the state before the action or the
//! state after it, never a mix.
//!
//! A step is one `append`, `write_at`, `truncate`, `rename` or `remove`.
//! Steps are atomic: the step that exhausts the budget does not happen.
//! Torn appends are covered by the journal and filemap unit tests.
//!
//! [`CrashSwitch::arm_transient`] fails a window of steps instead and then
//! lets writes through again, like a disk that errors and recovers while
//! the process keeps running.
//!
//! ## Usage
//!
//! ```rust
//! use lld_testkit::crash::CrashRecoveryHarness;
//!
//! let mut harness = CrashRecoveryHarness::new();
//! assert!(harness.test_commit_is_atomic().passed);
//! ```

use lld_core::{CoreResult, Instance, InstanceSet, Lld, LldConfig};
use lld_storage::{MemoryVolume, StorageBackend, StorageError, StorageResult, Volume};
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Every committed key and value, per instance.
pub type ContextSnapshot = BTreeMap<Instance, BTreeMap<Vec<u8>, Vec<u8>>>;

/// Reads every key of every open instance.
///
/// # Errors
///
/// Returns the first read error.
pub fn snapshot(lld: &Lld) -> CoreResult<ContextSnapshot> {
    let mut out = ContextSnapshot::new();
    for instance in lld.open_instances().iter() {
        let sector = lld.instance(instance)?;
        let mut values = BTreeMap::new();
        for key in sector.keys()? {
            if let Some(value) = sector.read(&key)? {
                values.insert(key, value);
            }
        }
        out.insert(instance, values);
    }
    Ok(out)
}

/// Shared crash state for a volume and every backend it handed out.
#[derive(Debug)]
pub struct CrashSwitch {
    remaining: AtomicU64,
    steps: AtomicU64,
    crashed: AtomicBool,
    /// Failures left in a transient window.
    faults: AtomicU64,
    faulted: AtomicBool,
}

impl CrashSwitch {
    fn new() -> Self {
        Self {
            remaining: AtomicU64::new(u64::MAX),
            steps: AtomicU64::new(0),
            crashed: AtomicBool::new(false),
            faults: AtomicU64::new(0),
            faulted: AtomicBool::new(false),
        }
    }

    /// Crashes on the step after `steps` more have succeeded.
    pub fn arm(&self, steps: u64) {
        self.remaining.store(steps, Ordering::SeqCst);
    }

    /// Fails the `failures` steps that follow the next `steps` successful
    /// ones, then disarms.
    pub fn arm_transient(&self, steps: u64, failures: u64) {
        self.faults.store(failures, Ordering::SeqCst);
        self.remaining.store(steps, Ordering::SeqCst);
    }

    /// Clears the budget, the crash and any transient window.
    pub fn reset(&self) {
        self.remaining.store(u64::MAX, Ordering::SeqCst);
        self.steps.store(0, Ordering::SeqCst);
        self.crashed.store(false, Ordering::SeqCst);
        self.faults.store(0, Ordering::SeqCst);
        self.faulted.store(false, Ordering::SeqCst);
    }

    /// Returns whether a transient window failed at least one step.
    pub fn has_faulted(&self) -> bool {
        self.faulted.load(Ordering::SeqCst)
    }

    /// Returns whether the crash happened.
    pub fn has_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    /// Steps performed since the last reset.
    pub fn steps(&self) -> u64 {
        self.steps.load(Ordering::SeqCst)
    }

    fn check(&self, what: &str) -> StorageResult<()> {
        if self.has_crashed() {
            return Err(crash_error(what));
        }
        Ok(())
    }

    fn step(&self, what: &str) -> StorageResult<()> {
        self.check(what)?;
        let spent = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |r| match r {
                0 => None,
                u64::MAX => Some(r),
                _ => Some(r - 1),
            });
        if spent.is_err() {
            let left = self
                .faults
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| f.checked_sub(1));
            if let Ok(before) = left {
                self.faulted.store(true, Ordering::SeqCst);
                if before == 1 {
                    self.remaining.store(u64::MAX, Ordering::SeqCst);
                }
                debug!(step = self.steps(), what, "simulated transient fault");
                return Err(fault_error(what));
            }
            self.crashed.store(true, Ordering::SeqCst);
            debug!(step = self.steps(), what, "simulated crash");
            return Err(crash_error(what));
        }
        self.steps.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn crash_error(what: &str) -> StorageError {
    StorageError::Io(io::Error::other(format!("simulated crash during {what}")))
}

fn fault_error(what: &str) -> StorageError {
    StorageError::Io(io::Error::other(format!("simulated fault during {what}")))
}

/// A storage backend wrapper that can simulate crashes.
pub struct CrashableBackend {
    inner: Box<dyn StorageBackend>,
    switch: Arc<CrashSwitch>,
}

impl CrashableBackend {
    /// Wraps `inner`, charging its writes to `switch`.
    pub fn new(inner: Box<dyn StorageBackend>, switch: Arc<CrashSwitch>) -> Self {
        Self { inner, switch }
    }
}

impl StorageBackend for CrashableBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        self.switch.step("append")?;
        self.inner.append(data)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        self.switch.step("write")?;
        self.inner.write_at(offset, data)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.switch.check("flush")?;
        self.inner.flush()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.switch.check("sync")?;
        self.inner.sync()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.switch.step("truncate")?;
        self.inner.truncate(new_size)
    }
}

/// A volume that stops accepting writes once its budget is spent.
#[derive(Clone)]
pub struct CrashVolume {
    inner: Arc<dyn Volume>,
    switch: Arc<CrashSwitch>,
}

impl CrashVolume {
    /// Wraps `inner` with an unarmed switch.
    pub fn new(inner: Arc<dyn Volume>) -> Self {
        Self {
            inner,
            switch: Arc::new(CrashSwitch::new()),
        }
    }

    /// The switch shared by this volume, its scopes and its backends.
    pub fn switch(&self) -> &Arc<CrashSwitch> {
        &self.switch
    }
}

impl fmt::Debug for CrashVolume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrashVolume")
            .field("inner", &self.inner.location())
            .field("crashed", &self.switch.has_crashed())
            .finish()
    }
}

impl Volume for CrashVolume {
    fn open(&self, name: &str) -> StorageResult<Box<dyn StorageBackend>> {
        self.switch.check("open")?;
        Ok(Box::new(CrashableBackend::new(
            self.inner.open(name)?,
            Arc::clone(&self.switch),
        )))
    }

    fn exists(&self, name: &str) -> StorageResult<bool> {
        self.inner.exists(name)
    }

    fn remove(&self, name: &str) -> StorageResult<()> {
        self.switch.step("remove")?;
        self.inner.remove(name)
    }

    fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        self.switch.step("rename")?;
        self.inner.rename(from, to)
    }

    fn list(&self) -> StorageResult<Vec<String>> {
        self.inner.list()
    }

    fn scope(&self, name: &str) -> StorageResult<Arc<dyn Volume>> {
        Ok(Arc::new(Self {
            inner: self.inner.scope(name)?,
            switch: Arc::clone(&self.switch),
        }))
    }

    fn sync(&self) -> StorageResult<()> {
        self.switch.check("sync")?;
        self.inner.sync()
    }

    fn location(&self) -> String {
        format!("crash:{}", self.inner.location())
    }
}

/// Result of a crash recovery test.
#[derive(Debug, Clone)]
pub struct CrashRecoveryResult {
    /// Whether the test passed.
    pub passed: bool,
    /// Description of what was tested.
    pub description: String,
    /// Crash points exercised.
    pub crash_points: u64,
    /// Any error message.
    pub error: Option<String>,
}

impl CrashRecoveryResult {
    /// Creates a passing result.
    pub fn pass(description: &str, crash_points: u64) -> Self {
        Self {
            passed: true,
            description: description.to_string(),
            crash_points,
            error: None,
        }
    }

    /// Creates a failing result.
    pub fn fail(description: &str, crash_points: u64, error: &str) -> Self {
        Self {
            passed: false,
            description: description.to_string(),
            crash_points,
            error: Some(error.to_string()),
        }
    }
}

/// Test harness for crash recovery scenarios.
pub struct CrashRecoveryHarness {
    /// Context configuration used for every run.
    pub config: LldConfig,
    /// Largest budget tried before giving up on an action.
    pub max_steps: u64,
    /// Results of crash recovery tests.
    pub results: Vec<CrashRecoveryResult>,
}

impl Default for CrashRecoveryHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl CrashRecoveryHarness {
    /// Creates a harness over ledger and register instances with small
    /// hashmap geometry.
    pub fn new() -> Self {
        let instances = InstanceSet::empty()
            .with(Instance::Register)
            .with(Instance::Ledger);
        Self::with_config(LldConfig::new().instances(instances).bucket_count(64))
    }

    /// Creates a harness with a custom configuration.
    pub fn with_config(config: LldConfig) -> Self {
        Self {
            config,
            max_steps: 10_000,
            results: Vec::new(),
        }
    }

    /// Returns true if every recorded test passed.
    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    /// Runs `action` after `setup` under every crash point and checks that
    /// each reopened context shows the state before or after the action.
    pub fn run_matrix<S, A>(&mut self, description: &str, setup: S, action: A) -> CrashRecoveryResult
    where
        S: Fn(&Lld) -> CoreResult<()>,
        A: Fn(&Lld) -> CoreResult<()>,
    {
        let result = self
            .matrix(&setup, &action)
            .map(|points| CrashRecoveryResult::pass(description, points))
            .unwrap_or_else(|(points, e)| CrashRecoveryResult::fail(description, points, &e));
        self.results.push(result.clone());
        result
    }

    fn matrix(
        &self,
        setup: &dyn Fn(&Lld) -> CoreResult<()>,
        action: &dyn Fn(&Lld) -> CoreResult<()>,
    ) -> Result<u64, (u64, String)> {
        let (before, after) = match self.run_once(setup, action, None) {
            Ok(Run { before, after, .. }) => (before, after),
            Err(e) => return Err((0, format!("reference run failed: {e}"))),
        };
        if before == after {
            return Err((0, "action changed nothing".to_string()));
        }

        for budget in 0..self.max_steps {
            let run = self
                .run_once(setup, action, Some(budget))
                .map_err(|e| (budget, format!("crash at step {budget}: {e}")))?;
            if run.after == before || run.after == after {
                if !run.crashed {
                    if run.after != after {
                        return Err((budget, "completed action lost its effect".to_string()));
                    }
                    return Ok(budget);
                }
            } else {
                return Err((
                    budget,
                    format!("crash at step {budget} recovered to a mixed state"),
                ));
            }
        }
        Err((self.max_steps, "action never completed".to_string()))
    }

    fn run_once(
        &self,
        setup: &dyn Fn(&Lld) -> CoreResult<()>,
        action: &dyn Fn(&Lld) -> CoreResult<()>,
        budget: Option<u64>,
    ) -> CoreResult<Run> {
        let memory = MemoryVolume::new();
        let volume = CrashVolume::new(Arc::new(memory.clone()));
        let switch = Arc::clone(volume.switch());

        let lld = Lld::open_volume(Arc::new(volume), self.config.clone())?;
        setup(&lld)?;
        let before = snapshot(&lld)?;
        if let Some(budget) = budget {
            switch.arm(budget);
        }
        let outcome = action(&lld);
        let crashed = switch.has_crashed();
        if !crashed {
            outcome?;
        }
        // Dropping without close leaves the files exactly as written.
        drop(lld);

        let reopened = Lld::open_volume(Arc::new(memory), self.config.clone())?;
        let after = snapshot(&reopened)?;
        reopened.close()?;
        Ok(Run {
            before,
            after,
            crashed,
        })
    }

    /// A single-instance commit of several writes and an erase.
    pub fn test_commit_is_atomic(&mut self) -> CrashRecoveryResult {
        self.run_matrix(
            "Single-instance commit is atomic",
            |lld| {
                let ledger = lld.ledger()?;
                ledger.write(b"height", b"1")?;
                ledger.write(b"stale", b"x")?;
                Ok(())
            },
            |lld| {
                let ledger = lld.ledger()?;
                ledger.txn_begin()?;
                ledger.write(b"height", b"2")?;
                ledger.write(b"block:2", &[0xAB; 300])?;
                ledger.erase(b"stale")?;
                ledger.txn_commit()
            },
        )
    }

    /// A global commit over two instances.
    pub fn test_global_commit_is_atomic(&mut self) -> CrashRecoveryResult {
        self.run_matrix(
            "Global commit is atomic across instances",
            |lld| {
                lld.register()?.write(b"balance", b"10")?;
                lld.ledger()?.write(b"height", b"1")?;
                Ok(())
            },
            |lld| {
                let scope = InstanceSet::empty()
                    .with(Instance::Register)
                    .with(Instance::Ledger);
                lld.txn_begin(scope)?;
                lld.register()?.write(b"balance", b"7")?;
                lld.register()?.write(b"owner", b"alice")?;
                lld.ledger()?.write(b"height", b"2")?;
                lld.txn_commit()
            },
        )
    }

    /// Direct writes outside a transaction: each key lands whole or not at
    /// all, so the matrix runs one write at a time.
    pub fn test_direct_write_is_atomic(&mut self) -> CrashRecoveryResult {
        self.run_matrix(
            "Direct write is atomic",
            |lld| lld.ledger()?.write(b"tip", b"old"),
            |lld| lld.ledger()?.write(b"tip", b"a longer replacement value"),
        )
    }
}

struct Run {
    before: ContextSnapshot,
    after: ContextSnapshot,
    crashed: bool,
}
