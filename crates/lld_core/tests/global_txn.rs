//! Global transactions across instances, including interrupted commits.

use lld_core::coordinator::{CommitRecord, COMMIT_RECORD_FILE};
use lld_core::sector::JOURNAL_FILE;
use lld_core::{CoreError, Instance, InstanceSet, Lld, LldConfig};
use lld_storage::{MemoryVolume, Volume};
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

fn config() -> LldConfig {
    LldConfig::new().bucket_count(64).bloom(1_000, 0.01)
}

fn open(root: &MemoryVolume) -> Lld {
    Lld::open_volume(Arc::new(root.clone()), config()).unwrap()
}

fn scope() -> InstanceSet {
    InstanceSet::empty().with(Instance::Ledger).with(Instance::Trust)
}

fn journal_present(root: &MemoryVolume, instance: Instance) -> bool {
    root.scope(instance.dir_name())
        .unwrap()
        .exists(JOURNAL_FILE)
        .unwrap()
}

/// Opens a global transaction, writes to ledger and trust and prepares
/// both, as a commit would right before its commit record.
fn prepare_both(lld: &Lld) -> u64 {
    let global = lld.txn_begin(scope()).unwrap();
    lld.ledger().unwrap().write(b"block", b"7").unwrap();
    lld.trust().unwrap().write(b"stake", b"100").unwrap();
    lld.ledger().unwrap().txn_prepare(Some(global)).unwrap();
    lld.trust().unwrap().txn_prepare(Some(global)).unwrap();
    global
}

#[test]
fn commit_is_visible_in_every_instance() {
    let root = MemoryVolume::new();
    let lld = open(&root);

    lld.txn_begin(InstanceSet::consensus()).unwrap();
    lld.ledger().unwrap().write(b"block", b"7").unwrap();
    lld.trust().unwrap().write(b"stake", b"100").unwrap();
    lld.contract().unwrap().erase(b"absent").unwrap();
    lld.txn_commit().unwrap();

    assert_eq!(lld.ledger().unwrap().read(b"block").unwrap(), Some(b"7".to_vec()));
    assert_eq!(lld.trust().unwrap().read(b"stake").unwrap(), Some(b"100".to_vec()));
    assert!(!root.exists(COMMIT_RECORD_FILE).unwrap());
    assert!(InstanceSet::consensus().iter().all(|i| !journal_present(&root, i)));
    lld.close().unwrap();

    let lld = open(&root);
    assert_eq!(lld.ledger().unwrap().read(b"block").unwrap(), Some(b"7".to_vec()));
}

#[test]
fn abort_is_invisible_everywhere() {
    let root = MemoryVolume::new();
    let lld = open(&root);
    lld.trust().unwrap().write(b"stake", b"50").unwrap();

    lld.txn_begin(scope()).unwrap();
    lld.ledger().unwrap().write(b"block", b"7").unwrap();
    lld.trust().unwrap().write(b"stake", b"100").unwrap();
    lld.txn_abort().unwrap();

    assert_eq!(lld.ledger().unwrap().read(b"block").unwrap(), None);
    assert_eq!(lld.trust().unwrap().read(b"stake").unwrap(), Some(b"50".to_vec()));
    assert!(lld.current_txn().is_none());
}

#[test]
fn pending_writes_are_private_to_the_owner() {
    let root = MemoryVolume::new();
    let lld = open(&root);

    lld.txn_begin(scope()).unwrap();
    lld.ledger().unwrap().write(b"block", b"7").unwrap();

    thread::scope(|s| {
        s.spawn(|| {
            assert_eq!(lld.ledger().unwrap().read(b"block").unwrap(), None);
            assert!(matches!(lld.txn_commit(), Err(CoreError::TxnConflict { .. })));
            assert!(matches!(lld.txn_abort(), Err(CoreError::TxnConflict { .. })));
            assert!(matches!(
                lld.txn_begin(scope()),
                Err(CoreError::TxnConflict { .. })
            ));
        });
    });

    lld.txn_commit().unwrap();
    thread::scope(|s| {
        s.spawn(|| {
            assert_eq!(lld.ledger().unwrap().read(b"block").unwrap(), Some(b"7".to_vec()));
        });
    });
}

#[test]
fn instances_outside_the_scope_stay_free() {
    let root = MemoryVolume::new();
    let lld = open(&root);

    lld.txn_begin(scope()).unwrap();
    lld.local().unwrap().write(b"peer", b"addr").unwrap();
    lld.txn_abort().unwrap();
    assert_eq!(lld.local().unwrap().read(b"peer").unwrap(), Some(b"addr".to_vec()));
}

#[test]
fn crash_before_commit_record_discards_everything() {
    let root = MemoryVolume::new();
    let lld = open(&root);
    prepare_both(&lld);
    drop(lld);
    assert!(journal_present(&root, Instance::Ledger));

    let lld = open(&root);
    assert_eq!(lld.ledger().unwrap().read(b"block").unwrap(), None);
    assert_eq!(lld.trust().unwrap().read(b"stake").unwrap(), None);
    assert!(!journal_present(&root, Instance::Ledger));
    assert!(!journal_present(&root, Instance::Trust));
}

#[test]
fn crash_after_commit_record_applies_everything() {
    let root = MemoryVolume::new();
    let lld = open(&root);
    let global = prepare_both(&lld);
    CommitRecord {
        global,
        scope: scope(),
    }
    .write(&root)
    .unwrap();
    drop(lld);

    let lld = open(&root);
    assert_eq!(lld.ledger().unwrap().read(b"block").unwrap(), Some(b"7".to_vec()));
    assert_eq!(lld.trust().unwrap().read(b"stake").unwrap(), Some(b"100".to_vec()));
    assert!(!root.exists(COMMIT_RECORD_FILE).unwrap());
    assert!(!journal_present(&root, Instance::Trust));
}

#[test]
fn crash_mid_apply_finishes_the_rest() {
    let root = MemoryVolume::new();
    let lld = open(&root);
    let global = prepare_both(&lld);
    CommitRecord {
        global,
        scope: scope(),
    }
    .write(&root)
    .unwrap();
    let ledger = lld.ledger().unwrap();
    ledger.txn_apply().unwrap();
    ledger.txn_release().unwrap();
    drop(lld);

    let lld = open(&root);
    assert_eq!(lld.ledger().unwrap().read(b"block").unwrap(), Some(b"7".to_vec()));
    assert_eq!(lld.trust().unwrap().read(b"stake").unwrap(), Some(b"100".to_vec()));
    assert!(!root.exists(COMMIT_RECORD_FILE).unwrap());
}

#[test]
fn crash_mid_prepare_discards_prepared_instances() {
    let root = MemoryVolume::new();
    let lld = open(&root);
    let global = lld.txn_begin(scope()).unwrap();
    lld.ledger().unwrap().write(b"block", b"7").unwrap();
    lld.trust().unwrap().write(b"stake", b"100").unwrap();
    lld.ledger().unwrap().txn_prepare(Some(global)).unwrap();
    drop(lld);

    let lld = open(&root);
    assert_eq!(lld.ledger().unwrap().read(b"block").unwrap(), None);
    assert_eq!(lld.trust().unwrap().read(b"stake").unwrap(), None);
    assert!(!journal_present(&root, Instance::Ledger));
}

#[test]
fn stale_record_does_not_commit_other_transactions() {
    let root = MemoryVolume::new();
    let lld = open(&root);
    let global = prepare_both(&lld);
    CommitRecord {
        global: global + 1_000,
        scope: scope(),
    }
    .write(&root)
    .unwrap();
    drop(lld);

    let lld = open(&root);
    assert_eq!(lld.ledger().unwrap().read(b"block").unwrap(), None);
    assert!(!root.exists(COMMIT_RECORD_FILE).unwrap());
}

#[test]
fn record_for_unopened_instances_is_kept() {
    let root = MemoryVolume::new();
    let lld = open(&root);
    let global = prepare_both(&lld);
    CommitRecord {
        global,
        scope: scope(),
    }
    .write(&root)
    .unwrap();
    drop(lld);

    let only_ledger = config().instances(InstanceSet::empty().with(Instance::Ledger));
    let lld = Lld::open_volume(Arc::new(root.clone()), only_ledger).unwrap();
    assert_eq!(lld.ledger().unwrap().read(b"block").unwrap(), Some(b"7".to_vec()));
    assert!(root.exists(COMMIT_RECORD_FILE).unwrap());
    assert!(journal_present(&root, Instance::Trust));
    assert!(matches!(
        lld.txn_begin(InstanceSet::empty().with(Instance::Ledger)),
        Err(CoreError::TxnConflict { .. })
    ));
    drop(lld);

    let lld = open(&root);
    assert_eq!(lld.trust().unwrap().read(b"stake").unwrap(), Some(b"100".to_vec()));
    assert!(!root.exists(COMMIT_RECORD_FILE).unwrap());
}

#[test]
fn full_keychain_fails_before_the_commit_point() {
    let root = MemoryVolume::new();
    let cramped = LldConfig::default_for(Instance::Trust)
        .bucket_count(1)
        .max_layers(1);
    let config = config().instance(Instance::Trust, cramped);
    let lld = Lld::open_volume(Arc::new(root.clone()), config.clone()).unwrap();

    lld.txn_begin(scope()).unwrap();
    lld.ledger().unwrap().write(b"block", b"1").unwrap();
    lld.trust().unwrap().write(b"s1", b"a").unwrap();
    lld.trust().unwrap().write(b"s2", b"b").unwrap();
    assert!(matches!(
        lld.txn_commit(),
        Err(CoreError::KeychainFull { bucket: 0, layers: 0 })
    ));

    assert!(lld.current_txn().is_none());
    assert!(!root.exists(COMMIT_RECORD_FILE).unwrap());
    assert_eq!(lld.ledger().unwrap().read(b"block").unwrap(), None);
    assert_eq!(lld.trust().unwrap().read(b"s1").unwrap(), None);
    assert!(scope().iter().all(|i| !journal_present(&root, i)));
    drop(lld);

    let lld = Lld::open_volume(Arc::new(root.clone()), config).unwrap();
    assert_eq!(lld.ledger().unwrap().read(b"block").unwrap(), None);
    lld.txn_begin(scope()).unwrap();
    lld.ledger().unwrap().write(b"block", b"1").unwrap();
    lld.trust().unwrap().write(b"s1", b"a").unwrap();
    lld.txn_commit().unwrap();
    assert_eq!(lld.trust().unwrap().read(b"s1").unwrap(), Some(b"a".to_vec()));
}

#[test]
fn recovery_after_open_is_clean() {
    let root = MemoryVolume::new();
    let lld = open(&root);
    let report = lld.txn_recovery().unwrap();
    assert_eq!(report.committed, None);
    assert_eq!(report.rolled_forward(), 0);
    assert_eq!(report.instances.len(), 7);
}

#[test]
fn directory_context_round_trip() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("chain");

    let lld = Lld::open(&path, config()).unwrap();
    assert!(matches!(
        Lld::open(&path, config()),
        Err(CoreError::DatabaseLocked)
    ));
    lld.txn_begin(scope()).unwrap();
    lld.ledger().unwrap().write(b"block", b"7").unwrap();
    lld.txn_commit().unwrap();
    lld.close().unwrap();

    assert!(path.join("_LEDGER").join("_block.00000").exists());
    let lld = Lld::open(&path, config().write(false)).unwrap();
    assert_eq!(lld.ledger().unwrap().read(b"block").unwrap(), Some(b"7".to_vec()));
    assert!(matches!(
        lld.ledger().unwrap().write(b"x", b"y"),
        Err(CoreError::ReadOnly { .. })
    ));
}
