use std::collections::BTreeSet;
use std::sync::Arc;

use quickcheck_macros::quickcheck;
use rustkv::{Config, Database, Direction, ErrorCode, Fetch, InsertFlags, KeyComparator};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn mem_db() -> Database {
    init_logs();
    Database::create(None, Config::default()).unwrap()
}

/// 512-byte pages with 109-byte keys: exactly 4 slots per node
fn small_config() -> Config {
    Config {
        page_size: 512,
        key_size: 109,
        ..Config::default()
    }
}

fn walk(db: &Database) -> Vec<Vec<u8>> {
    let mut cursor = db.cursor().unwrap();
    let mut keys = Vec::new();
    loop {
        match cursor.next() {
            Ok((key, _)) => keys.push(key),
            Err(err) => {
                assert_eq!(err.code(), ErrorCode::KeyNotFound);
                break;
            }
        }
    }
    keys
}

#[test]
fn first_and_next_walk_unsorted_inserts_in_order() {
    let db = mem_db();
    for i in [5u8, 3, 7, 1, 9, 4, 6, 2, 8] {
        db.insert(&[i], b"", InsertFlags::empty()).unwrap();
    }

    let mut cursor = db.cursor().unwrap();
    let (key, record) = cursor.move_to(Some(Direction::First), Fetch::KEY | Fetch::RECORD).unwrap();
    assert_eq!(key.unwrap(), [1]);
    assert_eq!(record.unwrap(), b"");
    for i in 2u8..=9 {
        let (key, _) = cursor.next().unwrap();
        assert_eq!(key, [i]);
    }
    let err = cursor.next().unwrap_err();
    assert_eq!(err.code(), ErrorCode::KeyNotFound);
}

#[test]
fn ascending_inserts_split_and_stay_ordered() {
    init_logs();
    let db = Database::create(None, small_config()).unwrap();
    for i in 1u8..=10 {
        db.insert(&[i], &[i], InsertFlags::empty()).unwrap();
    }
    assert!(db.tree_depth().unwrap() >= 2);
    let keys = walk(&db);
    assert_eq!(keys, (1u8..=10).map(|i| vec![i]).collect::<Vec<_>>());
    db.check_integrity().unwrap();
}

#[test]
fn records_of_every_encoding_round_trip() {
    let db = mem_db();
    let records: Vec<Vec<u8>> = vec![
        vec![],
        vec![1],
        vec![7; 7],
        vec![8; 8],
        vec![9; 9],
        vec![0xCD; 100],
        vec![0xEF; 5000],
    ];
    for (i, record) in records.iter().enumerate() {
        db.insert(&[i as u8 + 1], record, InsertFlags::empty()).unwrap();
    }
    for (i, record) in records.iter().enumerate() {
        assert_eq!(&db.find(&[i as u8 + 1]).unwrap(), record);
    }
}

#[test]
fn duplicate_keys_are_rejected_without_overwrite() {
    let db = mem_db();
    db.insert(b"key", b"one", InsertFlags::empty()).unwrap();
    let err = db.insert(b"key", b"two", InsertFlags::empty()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::DuplicateKey);
    assert_eq!(db.find(b"key").unwrap(), b"one");
}

#[test]
fn overwrite_replaces_the_record_in_place() {
    let db = mem_db();
    db.insert(b"key", b"one", InsertFlags::empty()).unwrap();
    db.insert(b"key", b"two", InsertFlags::OVERWRITE).unwrap();
    assert_eq!(db.find(b"key").unwrap(), b"two");
    // and an overwrite of an absent key is a plain insert
    db.insert(b"other", b"three", InsertFlags::OVERWRITE).unwrap();
    assert_eq!(db.find(b"other").unwrap(), b"three");
}

#[test]
fn erase_removes_only_the_named_key() {
    let db = mem_db();
    for i in 1u8..=5 {
        db.insert(&[i], &[i], InsertFlags::empty()).unwrap();
    }
    db.erase(&[3]).unwrap();
    assert_eq!(db.find(&[3]).unwrap_err().code(), ErrorCode::KeyNotFound);
    assert_eq!(db.erase(&[3]).unwrap_err().code(), ErrorCode::KeyNotFound);
    assert_eq!(walk(&db), vec![vec![1], vec![2], vec![4], vec![5]]);
    // the slot can be filled again
    db.insert(&[3], b"back", InsertFlags::empty()).unwrap();
    assert_eq!(db.find(&[3]).unwrap(), b"back");
}

#[test]
fn custom_comparator_defines_the_walk_order() {
    init_logs();
    let config = Config {
        comparator: KeyComparator::Custom {
            name: "reverse".into(),
            cmp: Arc::new(|lhs, rhs| Some(rhs.cmp(lhs))),
        },
        ..Config::default()
    };
    let db = Database::create(None, config).unwrap();
    for key in [b"aa", b"bb", b"cc"] {
        db.insert(key, b"", InsertFlags::empty()).unwrap();
    }
    let keys = walk(&db);
    assert_eq!(keys, vec![b"cc".to_vec(), b"bb".to_vec(), b"aa".to_vec()]);
    db.check_integrity().unwrap();
}

#[test]
fn refusing_comparator_surfaces_compare_failed() {
    init_logs();
    let config = Config {
        comparator: KeyComparator::Custom {
            name: "refusing".into(),
            cmp: Arc::new(|_, _| None),
        },
        ..Config::default()
    };
    let db = Database::create(None, config).unwrap();
    db.insert(b"first", b"", InsertFlags::empty()).unwrap();
    let err = db.insert(b"second", b"", InsertFlags::empty()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::CompareFailed);
}

#[test]
fn parameter_validation() {
    let db = mem_db();
    assert_eq!(
        db.insert(b"", b"", InsertFlags::empty()).unwrap_err().code(),
        ErrorCode::InvParameter
    );
    let long_key = vec![b'x'; 33];
    assert_eq!(
        db.insert(&long_key, b"", InsertFlags::empty()).unwrap_err().code(),
        ErrorCode::InvKeysize
    );
    assert_eq!(db.find(&long_key).unwrap_err().code(), ErrorCode::InvKeysize);
    assert_eq!(db.erase(&long_key).unwrap_err().code(), ErrorCode::InvKeysize);
}

#[quickcheck]
fn a_full_walk_is_always_sorted_and_complete(keys: Vec<Vec<u8>>) -> bool {
    let config = Config {
        page_size: 512,
        key_size: 32,
        ..Config::default()
    };
    let db = Database::create(None, config).unwrap();
    let mut expected = BTreeSet::new();
    for key in keys {
        let key: Vec<u8> = key.into_iter().take(32).collect();
        if key.is_empty() {
            continue;
        }
        match db.insert(&key, &key, InsertFlags::empty()) {
            Ok(()) => {
                expected.insert(key);
            }
            Err(err) if err.code() == ErrorCode::DuplicateKey => {}
            Err(_) => return false,
        }
    }
    if db.check_integrity().is_err() {
        return false;
    }
    walk(&db) == expected.into_iter().collect::<Vec<_>>()
}
