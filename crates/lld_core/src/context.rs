//! The LLD context: every open instance plus the global coordinator.

use crate::cache::{self, ValueCache};
use crate::config::{KeychainKind, LldConfig, SectorConfig};
use crate::coordinator::{Coordinator, Instance, InstanceSet, Participant, Participants, RecoveryReport};
#[cfg(feature = "std")]
use crate::dir::ContextDir;
use crate::error::{CoreError, CoreResult};
use crate::keychain::{FilemapKeychain, HashmapKeychain, KeyIndex};
use crate::sector::{DatabaseInfo, SectorDatabase};
use lld_storage::Volume;
use std::collections::BTreeMap;
#[cfg(feature = "std")]
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// A sector database whose keychain and cache were chosen by configuration.
pub type Sector = SectorDatabase<Box<dyn KeyIndex>, Box<dyn ValueCache>>;

/// Opens one instance with the keychain and cache its configuration names.
///
/// # Errors
///
/// Returns `InvalidConfig`, `InvalidFormat` for a missing instance that may
/// not be created, or a storage error.
pub fn open_sector(volume: Arc<dyn Volume>, config: SectorConfig) -> CoreResult<Sector> {
    config.validate()?;
    let keychain: Box<dyn KeyIndex> = match config.keychain.kind {
        KeychainKind::Hashmap => Box::new(HashmapKeychain::open(
            Arc::clone(&volume),
            &config.keychain,
            config.create,
        )?),
        KeychainKind::Filemap => Box::new(FilemapKeychain::open(
            Arc::clone(&volume),
            config.max_sector_file_size,
            config.create,
        )?),
    };
    let cache = cache::from_config(&config.cache);
    SectorDatabase::open(volume, config, keychain, cache)
}

/// All open instances of one node.
///
/// # Example
///
/// ```rust,ignore
/// use lld_core::{Instance, InstanceSet, Lld, LldConfig};
///
/// let lld = Lld::open(Path::new("chain"), LldConfig::new())?;
/// lld.txn_begin(InstanceSet::consensus())?;
/// lld.ledger()?.write(b"block", &bytes)?;
/// lld.trust()?.write(b"stake", &stake)?;
/// lld.txn_commit()?;
/// ```
pub struct Lld {
    root: Arc<dyn Volume>,
    instances: BTreeMap<Instance, Arc<Sector>>,
    participants: Participants,
    coordinator: Coordinator,
    #[cfg(feature = "std")]
    _dir: Option<ContextDir>,
}

impl Lld {
    /// Opens a context directory, taking its lock.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseLocked` if another process holds the directory,
    /// otherwise as [`Self::open_volume`].
    #[cfg(feature = "std")]
    pub fn open(path: &Path, config: LldConfig) -> CoreResult<Self> {
        let dir = ContextDir::open(path, config.create)?;
        let mut lld = Self::open_volume(dir.volume(), config)?;
        lld._dir = Some(dir);
        Ok(lld)
    }

    /// Opens every configured instance under `root`.
    ///
    /// A writable context then resolves journals left by an interrupted
    /// global commit.
    ///
    /// # Errors
    ///
    /// Returns the first instance's open error, or the recovery error.
    pub fn open_volume(root: Arc<dyn Volume>, config: LldConfig) -> CoreResult<Self> {
        let mut instances = BTreeMap::new();
        for instance in config.instances.iter() {
            let volume = root.scope(instance.dir_name())?;
            let sector = open_sector(volume, config.sector_config(instance))?;
            instances.insert(instance, Arc::new(sector));
        }
        let participants: Participants = instances
            .iter()
            .map(|(instance, sector)| (*instance, Arc::clone(sector) as Arc<dyn Participant>))
            .collect();

        let lld = Self {
            coordinator: Coordinator::new(Arc::clone(&root)),
            root,
            instances,
            participants,
            #[cfg(feature = "std")]
            _dir: None,
        };

        if config.write {
            let report = lld.coordinator.txn_recovery(&lld.participants)?;
            if report.unresolved() > 0 {
                warn!(
                    committed = ?report.committed,
                    unresolved = report.unresolved(),
                    "global recovery left journals on disk"
                );
            } else if report.committed.is_some() || report.discarded() > 0 {
                info!(
                    committed = ?report.committed,
                    rolled_forward = report.rolled_forward(),
                    discarded = report.discarded(),
                    "global recovery finished"
                );
            }
        } else if lld.root.exists(crate::coordinator::COMMIT_RECORD_FILE)? {
            warn!(location = %lld.root.location(), "global commit record present on read-only open");
        }

        info!(
            location = %lld.root.location(),
            instances = %lld.open_instances(),
            "lld context opened"
        );
        Ok(lld)
    }

    /// Instances this context holds.
    #[must_use]
    pub fn open_instances(&self) -> InstanceSet {
        self.instances.keys().copied().collect()
    }

    /// Returns an open instance.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the instance was not opened.
    pub fn instance(&self, instance: Instance) -> CoreResult<&Arc<Sector>> {
        self.instances
            .get(&instance)
            .ok_or_else(|| CoreError::invalid_config(format!("instance {instance} is not open")))
    }

    /// Contract execution state.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the instance was not opened.
    pub fn contract(&self) -> CoreResult<&Arc<Sector>> {
        self.instance(Instance::Contract)
    }

    /// Object registers.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the instance was not opened.
    pub fn register(&self) -> CoreResult<&Arc<Sector>> {
        self.instance(Instance::Register)
    }

    /// Blocks and ledger transactions.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the instance was not opened.
    pub fn ledger(&self) -> CoreResult<&Arc<Sector>> {
        self.instance(Instance::Ledger)
    }

    /// Node-local indices.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the instance was not opened.
    pub fn local(&self) -> CoreResult<&Arc<Sector>> {
        self.instance(Instance::Local)
    }

    /// Light-client data.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the instance was not opened.
    pub fn client(&self) -> CoreResult<&Arc<Sector>> {
        self.instance(Instance::Client)
    }

    /// Trust and stake records.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the instance was not opened.
    pub fn trust(&self) -> CoreResult<&Arc<Sector>> {
        self.instance(Instance::Trust)
    }

    /// Legacy transactions.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the instance was not opened.
    pub fn legacy(&self) -> CoreResult<&Arc<Sector>> {
        self.instance(Instance::Legacy)
    }

    /// Opens a global transaction over `scope`, owned by the calling
    /// thread.
    ///
    /// # Errors
    ///
    /// See [`Coordinator::txn_begin`].
    pub fn txn_begin(&self, scope: InstanceSet) -> CoreResult<u64> {
        self.coordinator.txn_begin(scope, &self.participants)
    }

    /// Commits the open global transaction.
    ///
    /// # Errors
    ///
    /// See [`Coordinator::txn_commit`].
    pub fn txn_commit(&self) -> CoreResult<()> {
        self.coordinator.txn_commit(&self.participants)
    }

    /// Aborts the open global transaction.
    ///
    /// # Errors
    ///
    /// See [`Coordinator::txn_abort`].
    pub fn txn_abort(&self) -> CoreResult<()> {
        self.coordinator.txn_abort(&self.participants)
    }

    /// Resolves journals left by an interrupted global commit. Runs
    /// automatically when a writable context opens.
    ///
    /// # Errors
    ///
    /// See [`Coordinator::txn_recovery`].
    pub fn txn_recovery(&self) -> CoreResult<RecoveryReport> {
        self.coordinator.txn_recovery(&self.participants)
    }

    /// Global id and scope of the open transaction, if any.
    #[must_use]
    pub fn current_txn(&self) -> Option<(u64, InstanceSet)> {
        self.coordinator.current()
    }

    /// Syncs every instance.
    ///
    /// # Errors
    ///
    /// Returns the first instance error.
    pub fn flush(&self) -> CoreResult<()> {
        for sector in self.instances.values() {
            sector.flush()?;
        }
        Ok(())
    }

    /// Summarizes every instance in canonical order.
    ///
    /// # Errors
    ///
    /// Returns the first instance error.
    pub fn info(&self) -> CoreResult<Vec<DatabaseInfo>> {
        self.instances.values().map(|sector| sector.info()).collect()
    }

    /// Closes every instance and releases the directory lock.
    ///
    /// An open global transaction owned by the caller is aborted first.
    ///
    /// # Errors
    ///
    /// Returns the first error, including a failed abort; every instance is
    /// still closed.
    pub fn close(self) -> CoreResult<()> {
        let mut failure = None;
        if self.coordinator.current().is_some() {
            warn!("closing with an open global transaction; aborting");
            if let Err(e) = self.txn_abort() {
                warn!(error = %e, "global abort on close failed");
                failure = Some(e);
            }
        }
        for (instance, sector) in &self.instances {
            if let Err(e) = sector.close() {
                warn!(instance = %instance, error = %e, "close failed");
                failure.get_or_insert(e);
            }
        }
        info!(location = %self.root.location(), "lld context closed");
        failure.map_or(Ok(()), Err)
    }
}

impl std::fmt::Debug for Lld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lld")
            .field("location", &self.root.location())
            .field("instances", &self.open_instances())
            .finish_non_exhaustive()
    }
}
