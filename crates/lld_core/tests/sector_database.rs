//! Behaviour of a single sector database instance.

use lld_core::sector::{journal, JournalOp, BLOOM_SNAPSHOT, JOURNAL_FILE};
use lld_core::{
    open_sector, CachePolicy, CoreError, KeychainKind, Sector, SectorConfig, SectorKey,
    SectorLocation, SectorState, TransactionId,
};
use lld_storage::{MemoryVolume, StorageBackend, Volume};
use std::sync::Arc;
use std::thread;

fn config() -> SectorConfig {
    SectorConfig::new("ledger").bucket_count(64).bloom(1_000, 0.01)
}

fn open(volume: &MemoryVolume, config: SectorConfig) -> Sector {
    open_sector(Arc::new(volume.clone()), config).unwrap()
}

fn value(db: &Sector, key: &[u8]) -> Option<Vec<u8>> {
    db.read(key).unwrap()
}

#[test]
fn write_then_read() {
    let volume = MemoryVolume::new();
    let db = open(&volume, config());

    db.write(b"k1", b"v1").unwrap();
    assert_eq!(value(&db, b"k1"), Some(b"v1".to_vec()));
    assert_eq!(value(&db, b"missing"), None);
    assert!(db.has_key(b"k1").unwrap());
    assert!(!db.has_key(b"missing").unwrap());
}

#[test]
fn overwrite_returns_latest_value() {
    let volume = MemoryVolume::new();
    let db = open(&volume, config());

    db.write(b"k1", b"v1").unwrap();
    db.write(b"k1", b"v2").unwrap();
    assert_eq!(value(&db, b"k1"), Some(b"v2".to_vec()));
    assert_eq!(db.len().unwrap(), 1);
}

#[test]
fn shorter_overwrite_stays_in_place() {
    let volume = MemoryVolume::new();
    let db = open(&volume, config());

    db.write(b"k", b"long value").unwrap();
    let before = db.info().unwrap().sector_bytes;
    db.write(b"k", b"short").unwrap();
    assert_eq!(db.info().unwrap().sector_bytes, before);
    assert_eq!(db.stats().relocations, 0);

    db.write(b"k", b"a value that no longer fits").unwrap();
    assert!(db.info().unwrap().sector_bytes > before);
    assert_eq!(db.stats().relocations, 1);

    drop(db);
    let db = open(&volume, config());
    assert_eq!(value(&db, b"k"), Some(b"a value that no longer fits".to_vec()));
}

#[test]
fn append_mode_never_overwrites() {
    let volume = MemoryVolume::new();
    let db = open(&volume, config().append(true));

    db.write(b"k", b"first").unwrap();
    let before = db.info().unwrap().sector_bytes;
    db.write(b"k", b"2nd").unwrap();
    assert_eq!(db.info().unwrap().sector_bytes, before + 3);
    assert_eq!(value(&db, b"k"), Some(b"2nd".to_vec()));
}

#[test]
fn erase_removes_key() {
    let volume = MemoryVolume::new();
    let db = open(&volume, config());

    db.write(b"k", b"v").unwrap();
    assert!(db.erase(b"k").unwrap());
    assert_eq!(value(&db, b"k"), None);
    assert!(!db.has_key(b"k").unwrap());
    assert!(!db.erase(b"k").unwrap());
    assert!(db.keys().unwrap().is_empty());

    db.write(b"k", b"again").unwrap();
    assert_eq!(value(&db, b"k"), Some(b"again".to_vec()));
}

#[test]
fn write_key_marks_existence() {
    let volume = MemoryVolume::new();
    let db = open(&volume, config());

    db.write_key(b"seen").unwrap();
    assert!(db.has_key(b"seen").unwrap());
    assert_eq!(value(&db, b"seen"), Some(Vec::new()));
}

#[test]
fn index_copies_current_value() {
    let volume = MemoryVolume::new();
    let db = open(&volume, config());

    db.write(b"block:hash", b"body").unwrap();
    assert!(db.index(b"block:height:7", b"block:hash").unwrap());
    assert_eq!(value(&db, b"block:height:7"), Some(b"body".to_vec()));

    db.write(b"block:hash", b"BODY").unwrap();
    assert_eq!(value(&db, b"block:height:7"), Some(b"body".to_vec()));

    assert!(!db.index(b"alias", b"absent").unwrap());
    assert!(!db.has_key(b"alias").unwrap());
}

#[test]
fn keys_lists_committed_keys() {
    for kind in [KeychainKind::Hashmap, KeychainKind::Filemap] {
        let volume = MemoryVolume::new();
        let db = open(&volume, config().keychain(kind));
        for key in [&b"c"[..], b"a", b"b"] {
            db.write(key, key).unwrap();
        }
        db.erase(b"b").unwrap();

        let mut keys = db.keys().unwrap();
        keys.sort();
        assert_eq!(keys, vec![b"a".to_vec(), b"c".to_vec()], "{kind:?}");
    }
}

#[test]
fn oversized_key_is_rejected() {
    let volume = MemoryVolume::new();
    let db = open(&volume, config().max_key_size(8));
    assert!(matches!(
        db.write(b"nine bytes", b"v"),
        Err(CoreError::KeyTooLarge { len: 10, max: 8 })
    ));
}

#[test]
fn full_bucket_reports_keychain_full() {
    let volume = MemoryVolume::new();
    let db = open(&volume, config().bucket_count(1).max_layers(2));

    db.write(b"a", b"1").unwrap();
    db.write(b"b", b"2").unwrap();
    assert!(matches!(
        db.write(b"c", b"3"),
        Err(CoreError::KeychainFull { bucket: 0, layers: 2 })
    ));
    assert_eq!(value(&db, b"a"), Some(b"1".to_vec()));
    assert_eq!(value(&db, b"b"), Some(b"2".to_vec()));
    db.write(b"a", b"updated").unwrap();
    assert!(!db.is_corrupt());
}

#[test]
fn evicted_value_is_read_back_from_disk() {
    let volume = MemoryVolume::new();
    let db = open(&volume, config().cache_policy(CachePolicy::Lru).cache_entries(2));

    db.write(b"a", b"1").unwrap();
    db.write(b"b", b"2").unwrap();
    assert_eq!(value(&db, b"a"), Some(b"1".to_vec()));
    db.write(b"c", b"3").unwrap();

    assert!(!db.cache().contains(b"b"));
    assert!(db.cache().contains(b"a"));
    let misses = db.stats().cache_misses;
    assert_eq!(value(&db, b"b"), Some(b"2".to_vec()));
    assert_eq!(db.stats().cache_misses, misses + 1);
}

#[test]
fn bloom_rejects_absent_keys_without_keychain() {
    let volume = MemoryVolume::new();
    let db = open(&volume, config());
    db.write(b"present", b"v").unwrap();

    let before = db.stats().bloom_rejections;
    let absent = (0..50u32).filter(|i| value(&db, &i.to_le_bytes()).is_none()).count();
    assert_eq!(absent, 50);
    assert!(db.stats().bloom_rejections > before);
}

#[test]
fn read_only_instance_refuses_writes() {
    let volume = MemoryVolume::new();
    open(&volume, config()).write(b"k", b"v").unwrap();

    let db = open(&volume, config().write(false));
    assert_eq!(value(&db, b"k"), Some(b"v".to_vec()));
    assert!(matches!(db.write(b"k", b"x"), Err(CoreError::ReadOnly { .. })));
    assert!(matches!(db.txn_begin(), Err(CoreError::ReadOnly { .. })));
}

#[test]
fn missing_instance_without_create_fails() {
    let volume = MemoryVolume::new();
    let result = open_sector(Arc::new(volume), config().create(false));
    assert!(matches!(result, Err(CoreError::InvalidFormat { .. })));
}

#[test]
fn closed_instance_refuses_use() {
    let volume = MemoryVolume::new();
    let db = open(&volume, config());
    db.write(b"k", b"v").unwrap();
    db.close().unwrap();

    assert!(matches!(db.read(b"k"), Err(CoreError::Closed { .. })));
    assert!(matches!(db.write(b"k", b"v"), Err(CoreError::Closed { .. })));
    assert!(matches!(db.close(), Err(CoreError::Closed { .. })));
}

#[test]
fn bloom_snapshot_survives_clean_close() {
    let volume = MemoryVolume::new();
    let db = open(&volume, config());
    for i in 0..100u32 {
        db.write(&i.to_le_bytes(), b"v").unwrap();
    }
    db.close().unwrap();
    assert!(volume.exists(BLOOM_SNAPSHOT).unwrap());

    let db = open(&volume, config());
    assert!(!volume.exists(BLOOM_SNAPSHOT).unwrap());
    assert!((0..100u32).all(|i| db.has_key(&i.to_le_bytes()).unwrap()));
    db.close().unwrap();

    // A snapshot sized for another configuration is ignored and rebuilt.
    let db = open(&volume, config().bloom(50_000, 0.001));
    assert!((0..100u32).all(|i| db.has_key(&i.to_le_bytes()).unwrap()));
}

#[test]
fn read_only_open_keeps_snapshot() {
    let volume = MemoryVolume::new();
    let db = open(&volume, config());
    db.write(b"k", b"v").unwrap();
    db.close().unwrap();

    let db = open(&volume, config().write(false));
    assert!(db.has_key(b"k").unwrap());
    assert!(volume.exists(BLOOM_SNAPSHOT).unwrap());
}

#[test]
fn corrupt_slot_fails_reads_and_refuses_writes() {
    let volume = MemoryVolume::new();
    let db = open(&volume, config().bucket_count(1).cache_entries(0));
    db.write(b"k", b"v").unwrap();

    let mut layer = volume.backend("_hashmap.00000").unwrap();
    layer.write_at(0, &[9]).unwrap();

    assert!(matches!(db.read(b"k"), Err(CoreError::CorruptIndex { .. })));
    assert!(db.is_corrupt());
    assert!(matches!(
        db.write(b"other", b"v"),
        Err(CoreError::CorruptIndex { .. })
    ));
    assert!(db.stats().errors >= 2);
}

// ----------------------------------------------------------------------
// Transactions
// ----------------------------------------------------------------------

#[test]
fn aborted_write_is_not_found() {
    let volume = MemoryVolume::new();
    let db = open(&volume, config());

    db.txn_begin().unwrap();
    db.write(b"k2", b"v2").unwrap();
    assert_eq!(value(&db, b"k2"), Some(b"v2".to_vec()));
    db.txn_abort().unwrap();
    assert_eq!(value(&db, b"k2"), None);
    assert!(!volume.exists(JOURNAL_FILE).unwrap());
}

#[test]
fn committed_write_is_found() {
    let volume = MemoryVolume::new();
    let db = open(&volume, config());

    db.txn_begin().unwrap();
    db.write(b"k3", b"v3").unwrap();
    db.txn_commit().unwrap();
    assert_eq!(value(&db, b"k3"), Some(b"v3".to_vec()));
    assert!(!volume.exists(JOURNAL_FILE).unwrap());
    assert_eq!(db.stats().transactions_committed, 1);
}

#[test]
fn abort_leaves_state_identical() {
    let volume = MemoryVolume::new();
    let db = open(&volume, config());
    db.write(b"keep", b"original").unwrap();
    db.write(b"drop", b"doomed").unwrap();
    let mut before = db.keys().unwrap();
    before.sort();

    db.txn_begin().unwrap();
    db.write(b"keep", b"changed").unwrap();
    db.write(b"new", b"value").unwrap();
    assert!(db.erase(b"drop").unwrap());
    assert_eq!(value(&db, b"drop"), None);
    db.txn_abort().unwrap();

    let mut after = db.keys().unwrap();
    after.sort();
    assert_eq!(before, after);
    assert_eq!(value(&db, b"keep"), Some(b"original".to_vec()));
    assert_eq!(value(&db, b"drop"), Some(b"doomed".to_vec()));
    assert_eq!(value(&db, b"new"), None);
}

#[test]
fn commit_applies_writes_and_erases() {
    let volume = MemoryVolume::new();
    let db = open(&volume, config());
    db.write(b"keep", b"original").unwrap();
    db.write(b"drop", b"doomed").unwrap();

    db.txn_begin().unwrap();
    db.write(b"keep", b"changed").unwrap();
    db.write(b"keep", b"changed twice").unwrap();
    db.erase(b"drop").unwrap();
    db.write(b"new", b"value").unwrap();
    db.txn_commit().unwrap();

    assert_eq!(value(&db, b"keep"), Some(b"changed twice".to_vec()));
    assert_eq!(value(&db, b"drop"), None);
    assert_eq!(value(&db, b"new"), Some(b"value".to_vec()));
    assert_eq!(db.len().unwrap(), 2);
}

#[test]
fn other_threads_see_committed_state_only() {
    let volume = MemoryVolume::new();
    let db = open(&volume, config());
    db.write(b"k", b"committed").unwrap();

    db.txn_begin().unwrap();
    db.write(b"k", b"pending").unwrap();

    thread::scope(|s| {
        s.spawn(|| {
            assert_eq!(value(&db, b"k"), Some(b"committed".to_vec()));
            assert!(matches!(db.write(b"k", b"x"), Err(CoreError::TxnConflict { .. })));
            assert!(matches!(db.erase(b"k"), Err(CoreError::TxnConflict { .. })));
            assert!(matches!(db.txn_commit(), Err(CoreError::TxnConflict { .. })));
        });
    });

    assert_eq!(value(&db, b"k"), Some(b"pending".to_vec()));
    db.txn_commit().unwrap();

    thread::scope(|s| {
        s.spawn(|| assert_eq!(value(&db, b"k"), Some(b"pending".to_vec())));
    });
}

#[test]
fn transaction_verbs_out_of_order_conflict() {
    let volume = MemoryVolume::new();
    let db = open(&volume, config());

    assert!(matches!(db.txn_commit(), Err(CoreError::TxnConflict { .. })));
    assert!(matches!(db.txn_abort(), Err(CoreError::TxnConflict { .. })));

    let id = db.txn_begin().unwrap();
    assert_eq!(db.current_txn(), Some(id));
    assert!(matches!(db.txn_begin(), Err(CoreError::TxnConflict { .. })));
    assert!(matches!(db.txn_apply(), Err(CoreError::TxnConflict { .. })));
    assert!(matches!(db.txn_recovery(), Err(CoreError::TxnConflict { .. })));

    db.txn_prepare(None).unwrap();
    assert!(matches!(db.write(b"late", b"v"), Err(CoreError::TxnConflict { .. })));
    assert!(matches!(db.txn_prepare(None), Err(CoreError::TxnConflict { .. })));
    db.txn_apply().unwrap();
    db.txn_release().unwrap();
    assert_eq!(db.current_txn(), None);
}

// ----------------------------------------------------------------------
// Crash recovery
// ----------------------------------------------------------------------

#[test]
fn prepared_commit_rolls_forward_after_crash() {
    let volume = MemoryVolume::new();
    let db = open(&volume, config());
    db.write(b"old", b"before").unwrap();

    db.txn_begin().unwrap();
    db.write(b"old", b"after").unwrap();
    db.write(b"new", b"value").unwrap();
    db.txn_prepare(None).unwrap();
    drop(db);
    assert!(volume.exists(JOURNAL_FILE).unwrap());

    let db = open(&volume, config());
    assert!(!volume.exists(JOURNAL_FILE).unwrap());
    assert_eq!(db.stats().recoveries, 1);
    assert_eq!(value(&db, b"old"), Some(b"after".to_vec()));
    assert_eq!(value(&db, b"new"), Some(b"value".to_vec()));
}

#[test]
fn unprepared_transaction_vanishes_after_crash() {
    let volume = MemoryVolume::new();
    let db = open(&volume, config());
    db.write(b"old", b"before").unwrap();

    db.txn_begin().unwrap();
    db.write(b"old", b"after").unwrap();
    db.write(b"new", b"value").unwrap();
    drop(db);

    let db = open(&volume, config());
    assert_eq!(value(&db, b"old"), Some(b"before".to_vec()));
    assert_eq!(value(&db, b"new"), None);
}

#[test]
fn torn_journal_is_discarded() {
    let volume = MemoryVolume::new();
    open(&volume, config()).write(b"k", b"v").unwrap();

    let ops = [JournalOp {
        key: b"k".to_vec(),
        old: None,
        new: Some(SectorKey::new(
            SectorState::Transaction,
            b"k",
            SectorLocation {
                file: 0,
                offset: 0,
                len: 1,
            },
        )),
    }];
    let bytes = journal::encode(TransactionId::new(9), None, &ops);
    {
        let mut file = volume.open(JOURNAL_FILE).unwrap();
        file.append(&bytes[..bytes.len() - 3]).unwrap();
    }

    let db = open(&volume, config());
    assert!(!volume.exists(JOURNAL_FILE).unwrap());
    assert_eq!(value(&db, b"k"), Some(b"v".to_vec()));
    assert_eq!(db.stats().recoveries, 0);
}

#[test]
fn tagged_journal_waits_for_coordinator() {
    let volume = MemoryVolume::new();
    let db = open(&volume, config());
    db.txn_begin().unwrap();
    db.write(b"k", b"v").unwrap();
    db.txn_prepare(Some(42)).unwrap();
    drop(db);

    let db = open(&volume, config());
    assert!(volume.exists(JOURNAL_FILE).unwrap());
    assert_eq!(value(&db, b"k"), None);
    assert!(matches!(db.txn_begin(), Err(CoreError::TxnConflict { .. })));

    let recovered = db.recover_with(|global| Some(global == 42)).unwrap();
    assert!(matches!(
        recovered,
        lld_core::Recovery::RolledForward { entries: 1, .. }
    ));
    assert_eq!(value(&db, b"k"), Some(b"v".to_vec()));
}

#[test]
fn full_keychain_fails_before_the_journal() {
    let volume = MemoryVolume::new();
    let db = open(&volume, config().bucket_count(1).max_layers(1));
    db.write(b"a", b"1").unwrap();

    db.txn_begin().unwrap();
    db.write(b"a", b"2").unwrap();
    db.write(b"b", b"3").unwrap();
    assert!(matches!(
        db.txn_commit(),
        Err(CoreError::KeychainFull { bucket: 0, layers: 1 })
    ));
    assert!(!volume.exists(JOURNAL_FILE).unwrap());
    assert!(!db.is_corrupt());
    db.txn_abort().unwrap();
    assert_eq!(value(&db, b"a"), Some(b"1".to_vec()));

    // Rewrites need no new slot
    db.txn_begin().unwrap();
    db.write(b"a", b"2").unwrap();
    db.txn_commit().unwrap();
    assert_eq!(value(&db, b"a"), Some(b"2".to_vec()));
}

#[test]
fn unreplayable_journal_is_kept_and_open_succeeds() {
    let volume = MemoryVolume::new();
    let roomy = config().bucket_count(1).max_layers(2);
    let db = open(&volume, roomy.clone());
    db.txn_begin().unwrap();
    db.write(b"a", b"1").unwrap();
    db.write(b"b", b"2").unwrap();
    db.txn_prepare(None).unwrap();
    db.txn_detach().unwrap();
    drop(db);

    let db = open(&volume, config().bucket_count(1).max_layers(1));
    assert!(db.is_corrupt());
    assert!(volume.exists(JOURNAL_FILE).unwrap());
    assert_eq!(value(&db, b"a"), None);
    assert!(db.write(b"c", b"3").is_err());
    assert!(matches!(
        db.txn_recovery(),
        Err(CoreError::CorruptIndex { .. })
    ));
    drop(db);

    let db = open(&volume, roomy);
    assert!(!db.is_corrupt());
    assert!(!volume.exists(JOURNAL_FILE).unwrap());
    assert_eq!(value(&db, b"a"), Some(b"1".to_vec()));
    assert_eq!(value(&db, b"b"), Some(b"2".to_vec()));
}

#[test]
fn values_survive_reopen_with_both_keychains() {
    for kind in [KeychainKind::Hashmap, KeychainKind::Filemap] {
        let volume = MemoryVolume::new();
        let db = open(&volume, config().keychain(kind));
        for i in 0..200u32 {
            db.write(&i.to_be_bytes(), &i.to_le_bytes().repeat(3)).unwrap();
        }
        for i in (0..200u32).step_by(3) {
            db.erase(&i.to_be_bytes()).unwrap();
        }
        db.close().unwrap();

        let db = open(&volume, config().keychain(kind));
        for i in 0..200u32 {
            let expected = (i % 3 != 0).then(|| i.to_le_bytes().repeat(3));
            assert_eq!(value(&db, &i.to_be_bytes()), expected, "{kind:?} key {i}");
        }
    }
}

#[test]
fn concurrent_readers_never_see_torn_values() {
    let volume = MemoryVolume::new();
    let db = Arc::new(open(&volume, config().cache_entries(4)));
    db.write(b"k", &[0u8; 8]).unwrap();

    thread::scope(|s| {
        let writer = Arc::clone(&db);
        s.spawn(move || {
            for round in 1..=200u8 {
                let len = 4 + usize::from(round % 13);
                writer.write(b"k", &vec![round; len]).unwrap();
            }
        });
        for _ in 0..4 {
            let reader = Arc::clone(&db);
            s.spawn(move || {
                for _ in 0..500 {
                    let v = reader.read(b"k").unwrap().unwrap();
                    assert!(!v.is_empty());
                    assert!(v.iter().all(|b| *b == v[0]), "torn read {v:?}");
                }
            });
        }
    });
}
