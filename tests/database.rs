use std::fs;
use std::sync::Arc;

use rustkv::{Config, Database, ErrorCode, InsertFlags, MemTracker};
use tempfile::tempdir;

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn file_database_persists_across_reopen() {
    init_logs();
    let dir = tempdir().unwrap();
    let path = dir.path().join("kv.db");

    {
        let db = Database::create(Some(&path), Config::default()).unwrap();
        db.insert(b"alpha", b"1", InsertFlags::empty()).unwrap();
        db.insert(b"beta", &vec![0xBE; 300], InsertFlags::empty()).unwrap();
        db.insert(b"gamma", b"", InsertFlags::empty()).unwrap();
        db.close().unwrap();
    }

    let db = Database::open(&path, Config::default()).unwrap();
    assert_eq!(db.find(b"alpha").unwrap(), b"1");
    assert_eq!(db.find(b"beta").unwrap(), vec![0xBE; 300]);
    assert_eq!(db.find(b"gamma").unwrap(), b"");
    db.check_integrity().unwrap();

    let mut cursor = db.cursor().unwrap();
    let (key, _) = cursor.first().unwrap();
    assert_eq!(key, b"alpha");
}

#[test]
fn splits_persist_across_reopen() {
    init_logs();
    let dir = tempdir().unwrap();
    let path = dir.path().join("deep.db");
    let config = Config {
        page_size: 512,
        key_size: 109,
        ..Config::default()
    };

    {
        let db = Database::create(Some(&path), config.clone()).unwrap();
        for i in 0u8..60 {
            db.insert(&[i], &[i], InsertFlags::empty()).unwrap();
        }
        assert!(db.tree_depth().unwrap() >= 2);
        db.close().unwrap();
    }

    let db = Database::open(&path, config).unwrap();
    assert!(db.tree_depth().unwrap() >= 2);
    let mut cursor = db.cursor().unwrap();
    for i in 0u8..60 {
        let (key, record) = cursor.next().unwrap();
        assert_eq!(key, [i]);
        assert_eq!(record, [i]);
    }
    db.check_integrity().unwrap();
}

#[test]
fn opening_a_missing_file_fails_cleanly() {
    init_logs();
    let dir = tempdir().unwrap();
    let err = Database::open(&dir.path().join("nope.db"), Config::default()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::FileNotFound);
}

#[test]
fn opening_a_foreign_file_fails_cleanly() {
    init_logs();
    let dir = tempdir().unwrap();

    let garbage = dir.path().join("garbage.bin");
    fs::write(&garbage, vec![0xFF; 1024]).unwrap();
    let err = Database::open(&garbage, Config::default()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvFileVersion);

    let short = dir.path().join("short.bin");
    fs::write(&short, b"hello").unwrap();
    let err = Database::open(&short, Config::default()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::IoError);
}

#[test]
fn create_rejects_bad_parameters() {
    init_logs();
    let err = Database::create(
        None,
        Config {
            page_size: 777,
            ..Config::default()
        },
    )
    .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvPagesize);

    let err = Database::create(
        None,
        Config {
            page_size: 512,
            key_size: 500,
            ..Config::default()
        },
    )
    .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvKeysize);
}

#[test]
fn a_full_cycle_is_leak_free() {
    init_logs();
    let tracker = Arc::new(MemTracker::new());
    let config = Config {
        page_size: 512,
        key_size: 32,
        tracker: Some(tracker.clone()),
        ..Config::default()
    };
    {
        let db = Database::create(None, config).unwrap();
        for i in 0u8..50 {
            db.insert(&[i], &vec![i; i as usize * 10], InsertFlags::empty()).unwrap();
        }
        let mut cursor = db.cursor().unwrap();
        let (key, _) = cursor.first().unwrap();
        assert_eq!(key, [0]);
        // leave a second cursor holding an uncoupled key copy
        let mut watcher = db.cursor().unwrap();
        watcher.find(&[10]).unwrap();
        db.erase(&[11]).unwrap();
        drop(cursor);
        drop(watcher);
        db.close().unwrap();
    }
    assert_eq!(tracker.live(), 0, "every allocation must be returned");
    assert!(tracker.peak() > 0);
    assert!(tracker.total_allocated() > 0);
}

#[test]
fn a_file_cycle_with_eviction_is_leak_free() {
    init_logs();
    let dir = tempdir().unwrap();
    let path = dir.path().join("churn.db");
    let tracker = Arc::new(MemTracker::new());
    let config = Config {
        page_size: 512,
        key_size: 109,
        cache_capacity: 8,
        tracker: Some(tracker.clone()),
        ..Config::default()
    };
    {
        let db = Database::create(Some(&path), config).unwrap();
        for i in 0u8..120 {
            db.insert(&[i], &[i], InsertFlags::empty()).unwrap();
        }
        db.check_integrity().unwrap();
        db.close().unwrap();
    }
    assert_eq!(tracker.live(), 0);
}

#[test]
fn outer_transaction_scopes_many_operations() {
    init_logs();
    let db = Database::create(None, Config::default()).unwrap();
    db.insert(b"kept", b"1", InsertFlags::empty()).unwrap();

    let txn = db.txn_begin().unwrap();
    assert_eq!(db.txn_begin().unwrap_err().code(), ErrorCode::TxnInProgress);
    db.insert(b"staged", b"2", InsertFlags::empty()).unwrap();
    db.erase(b"kept").unwrap();
    db.txn_commit(txn).unwrap();

    assert_eq!(db.find(b"staged").unwrap(), b"2");
    assert_eq!(db.find(b"kept").unwrap_err().code(), ErrorCode::KeyNotFound);
}

#[test]
fn abort_rolls_back_every_page_including_splits() {
    init_logs();
    let config = Config {
        page_size: 512,
        key_size: 109,
        ..Config::default()
    };
    let db = Database::create(None, config).unwrap();
    for i in [10u8, 20, 30] {
        db.insert(&[i], &[i], InsertFlags::empty()).unwrap();
    }
    let root_before = db.root_page().unwrap();

    let txn = db.txn_begin().unwrap();
    for i in 40u8..90 {
        db.insert(&[i], &[i], InsertFlags::empty()).unwrap();
    }
    db.erase(&[20]).unwrap();
    assert!(db.tree_depth().unwrap() >= 2);
    db.txn_abort(txn).unwrap();

    assert_eq!(db.root_page().unwrap(), root_before);
    assert_eq!(db.tree_depth().unwrap(), 1);
    for i in [10u8, 20, 30] {
        assert_eq!(db.find(&[i]).unwrap(), vec![i]);
    }
    for i in 40u8..90 {
        assert_eq!(db.find(&[i]).unwrap_err().code(), ErrorCode::KeyNotFound);
    }
    db.check_integrity().unwrap();
}

#[test]
fn cursor_operations_fail_after_close() {
    init_logs();
    let db = Database::create(None, Config::default()).unwrap();
    db.insert(b"key", b"value", InsertFlags::empty()).unwrap();
    let mut cursor = db.cursor().unwrap();
    cursor.find(b"key").unwrap();
    db.close().unwrap();
    assert!(cursor.is_nil());
    let err = cursor.find(b"key").unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotInitialized);
}
