//! Test fixtures and context helpers.
//!
//! Provides convenience functions for setting up test contexts
//! and common test scenarios.

use lld_core::{Instance, InstanceSet, Lld, LldConfig};
use lld_storage::MemoryVolume;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// Where a [`TestContext`] keeps its files.
enum Backing {
    Memory(MemoryVolume),
    Dir(TempDir),
}

/// A test context with automatic cleanup.
pub struct TestContext {
    /// The context.
    pub lld: Lld,
    config: LldConfig,
    backing: Backing,
}

impl TestContext {
    /// Creates an in-memory context with every instance and small
    /// hashmap geometry.
    pub fn memory() -> Self {
        Self::memory_with(small_config(InstanceSet::all()))
    }

    /// Creates an in-memory context with a custom configuration.
    pub fn memory_with(config: LldConfig) -> Self {
        let volume = MemoryVolume::new();
        let lld = Lld::open_volume(Arc::new(volume.clone()), config.clone())
            .expect("Failed to open in-memory context");
        Self {
            lld,
            config,
            backing: Backing::Memory(volume),
        }
    }

    /// Creates a context in a temporary directory.
    pub fn file() -> Self {
        Self::file_with(small_config(InstanceSet::all()))
    }

    /// Creates a directory context with a custom configuration.
    pub fn file_with(config: LldConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let lld = Lld::open(temp_dir.path(), config.clone()).expect("Failed to open context");
        Self {
            lld,
            config,
            backing: Backing::Dir(temp_dir),
        }
    }

    /// Returns the directory if file-based, None if in-memory.
    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::Dir(dir) => Some(dir.path()),
            Backing::Memory(_) => None,
        }
    }

    /// Closes cleanly and opens again over the same files.
    pub fn reopen(self) -> Self {
        let Self {
            lld,
            config,
            backing,
        } = self;
        lld.close().expect("Failed to close context");
        Self::open_backing(config, backing)
    }

    /// Drops the context without closing it, as a killed process would,
    /// and opens it again. Recovery runs during the open.
    pub fn crash_reopen(self) -> Self {
        let Self {
            lld,
            config,
            backing,
        } = self;
        drop(lld);
        Self::open_backing(config, backing)
    }

    fn open_backing(config: LldConfig, backing: Backing) -> Self {
        let lld = match &backing {
            Backing::Memory(volume) => Lld::open_volume(Arc::new(volume.clone()), config.clone()),
            Backing::Dir(dir) => Lld::open(dir.path(), config.clone()),
        }
        .expect("Failed to reopen context");
        Self {
            lld,
            config,
            backing,
        }
    }
}

impl std::ops::Deref for TestContext {
    type Target = Lld;

    fn deref(&self) -> &Self::Target {
        &self.lld
    }
}

/// Context configuration with 64 hashmap buckets, so tests stay small.
pub fn small_config(instances: InstanceSet) -> LldConfig {
    LldConfig::new().instances(instances).bucket_count(64)
}

/// Runs a test with a temporary in-memory context.
///
/// # Example
///
/// ```rust
/// use lld_testkit::with_temp_context;
///
/// with_temp_context(|lld| {
///     lld.ledger().unwrap().write(b"height", b"1").unwrap();
/// });
/// ```
pub fn with_temp_context<F, R>(f: F) -> R
where
    F: FnOnce(&Lld) -> R,
{
    let ctx = TestContext::memory();
    f(&ctx.lld)
}

/// Runs a test with a temporary directory context.
pub fn with_file_context<F, R>(f: F) -> R
where
    F: FnOnce(&Lld, &Path) -> R,
{
    let ctx = TestContext::file();
    let path = ctx.path().expect("File context should have a path");
    f(&ctx.lld, path)
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// Key used by [`populated_context`] for entry `i`.
    pub fn key(i: usize) -> Vec<u8> {
        format!("key:{i:06}").into_bytes()
    }

    /// Value used by [`populated_context`] for entry `i`.
    pub fn value(i: usize) -> Vec<u8> {
        format!(r#"{{"index":{i}}}"#).into_bytes()
    }

    /// Creates a context whose `instance` holds `count` entries.
    pub fn populated_context(instance: Instance, count: usize) -> TestContext {
        let ctx = TestContext::memory();
        let sector = ctx.instance(instance).expect("Instance should be open");
        for i in 0..count {
            sector.write(&key(i), &value(i)).expect("Failed to write entry");
        }
        ctx
    }

    /// Creates a context where every instance holds one entry naming it.
    pub fn every_instance_context() -> TestContext {
        let ctx = TestContext::memory();
        for instance in Instance::ALL {
            ctx.instance(instance)
                .expect("Instance should be open")
                .write(b"name", instance.name().as_bytes())
                .expect("Failed to write entry");
        }
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_context() {
        let ctx = TestContext::memory();
        assert_eq!(ctx.open_instances(), InstanceSet::all());
        assert!(ctx.path().is_none());
    }

    #[test]
    fn test_reopen_keeps_data() {
        let ctx = scenarios::populated_context(Instance::Ledger, 20);
        let ctx = ctx.reopen();
        let ledger = ctx.ledger().unwrap();
        assert_eq!(ledger.len().unwrap(), 20);
        assert_eq!(
            ledger.read(&scenarios::key(7)).unwrap(),
            Some(scenarios::value(7))
        );
    }

    #[test]
    fn test_crash_reopen_rolls_back_open_transaction() {
        let ctx = TestContext::file();
        let local = ctx.local().unwrap();
        local.write(b"kept", b"1").unwrap();
        local.txn_begin().unwrap();
        local.write(b"lost", b"2").unwrap();

        let ctx = ctx.crash_reopen();
        let local = ctx.local().unwrap();
        assert_eq!(local.read(b"kept").unwrap(), Some(b"1".to_vec()));
        assert_eq!(local.read(b"lost").unwrap(), None);
    }

    #[test]
    fn test_every_instance_scenario() {
        let ctx = scenarios::every_instance_context();
        for instance in Instance::ALL {
            let name = ctx.instance(instance).unwrap().read(b"name").unwrap();
            assert_eq!(name.as_deref(), Some(instance.name().as_bytes()));
        }
    }
}
