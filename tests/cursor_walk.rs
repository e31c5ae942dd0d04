use rustkv::{Config, Database, Direction, ErrorCode, Fetch, InsertFlags};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// 512-byte pages with 109-byte keys: exactly 4 slots per node
fn populated_db(n: u8) -> Database {
    init_logs();
    let config = Config {
        page_size: 512,
        key_size: 109,
        ..Config::default()
    };
    let db = Database::create(None, config).unwrap();
    for i in 1..=n {
        db.insert(&[i], &[i], InsertFlags::empty()).unwrap();
    }
    db
}

#[test]
fn nil_cursor_is_seeded_by_next_and_previous() {
    let db = populated_db(9);

    let mut cursor = db.cursor().unwrap();
    let (key, _) = cursor.next().unwrap();
    assert_eq!(key, [1], "NEXT on a NIL cursor behaves as FIRST");

    let mut cursor = db.cursor().unwrap();
    let (key, _) = cursor.previous().unwrap();
    assert_eq!(key, [9], "PREVIOUS on a NIL cursor behaves as LAST");
}

#[test]
fn read_in_place_on_a_nil_cursor() {
    let db = populated_db(3);
    let mut cursor = db.cursor().unwrap();

    // no direction, nothing requested: a plain OK
    let (key, record) = cursor.move_to(None, Fetch::empty()).unwrap();
    assert!(key.is_none() && record.is_none());

    // no direction but a buffer requested: the cursor has no position
    let err = cursor.move_to(None, Fetch::KEY).unwrap_err();
    assert_eq!(err.code(), ErrorCode::CursorIsNil);
    let err = cursor.move_to(None, Fetch::RECORD).unwrap_err();
    assert_eq!(err.code(), ErrorCode::CursorIsNil);
}

#[test]
fn walks_cross_page_boundaries_both_ways() {
    let db = populated_db(30);
    assert!(db.tree_depth().unwrap() >= 2);

    let mut cursor = db.cursor().unwrap();
    for i in 1u8..=30 {
        let (key, record) = cursor.next().unwrap();
        assert_eq!(key, [i]);
        assert_eq!(record, [i]);
    }
    assert_eq!(cursor.next().unwrap_err().code(), ErrorCode::KeyNotFound);

    let mut cursor = db.cursor().unwrap();
    for i in (1u8..=30).rev() {
        let (key, _) = cursor.previous().unwrap();
        assert_eq!(key, [i]);
    }
    assert_eq!(cursor.previous().unwrap_err().code(), ErrorCode::KeyNotFound);
}

#[test]
fn next_after_the_last_key_keeps_the_position() {
    let db = populated_db(3);
    let mut cursor = db.cursor().unwrap();
    let (key, _) = cursor.last().unwrap();
    assert_eq!(key, [3]);
    assert_eq!(cursor.next().unwrap_err().code(), ErrorCode::KeyNotFound);
    // the cursor still stands on the last key
    let (key, _) = cursor.move_to(None, Fetch::KEY).unwrap();
    assert_eq!(key.unwrap(), [3]);
}

#[test]
fn empty_tree_has_no_first_or_last() {
    init_logs();
    let db = Database::create(None, Config::default()).unwrap();
    let mut cursor = db.cursor().unwrap();
    assert_eq!(cursor.first().unwrap_err().code(), ErrorCode::KeyNotFound);
    assert_eq!(cursor.last().unwrap_err().code(), ErrorCode::KeyNotFound);
    assert!(cursor.is_nil());
}

#[test]
fn cursor_insert_couples_to_the_new_slot() {
    let db = populated_db(4);
    let mut cursor = db.cursor().unwrap();
    cursor.insert(&[10], b"ten", InsertFlags::empty()).unwrap();
    assert!(!cursor.is_nil());
    let (key, record) = cursor.move_to(None, Fetch::KEY | Fetch::RECORD).unwrap();
    assert_eq!(key.unwrap(), [10]);
    assert_eq!(record.unwrap(), b"ten");

    let err = cursor.insert(&[10], b"again", InsertFlags::empty()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::DuplicateKey);
}

#[test]
fn overwrite_through_the_cursor_switches_encodings() {
    let db = populated_db(1);
    let mut cursor = db.cursor().unwrap();
    cursor.find(&[1]).unwrap();

    // inline -> blob
    cursor.overwrite(&[0xAB; 40]).unwrap();
    assert_eq!(db.find(&[1]).unwrap(), vec![0xAB; 40]);
    // blob -> blob (possibly relocated)
    cursor.overwrite(&[0xCD; 600]).unwrap();
    assert_eq!(db.find(&[1]).unwrap(), vec![0xCD; 600]);
    // blob -> inline
    cursor.overwrite(b"tiny").unwrap();
    assert_eq!(db.find(&[1]).unwrap(), b"tiny");
    // inline -> empty
    cursor.overwrite(b"").unwrap();
    assert_eq!(db.find(&[1]).unwrap(), b"");
    db.check_integrity().unwrap();

    let mut nil_cursor = db.cursor().unwrap();
    let err = nil_cursor.overwrite(b"x").unwrap_err();
    assert_eq!(err.code(), ErrorCode::CursorIsNil);
}

#[test]
fn find_positions_and_reads_through_the_cursor() {
    let db = populated_db(12);
    let mut cursor = db.cursor().unwrap();
    cursor.find(&[7]).unwrap();
    let (key, record) = cursor.move_to(None, Fetch::KEY | Fetch::RECORD).unwrap();
    assert_eq!(key.unwrap(), [7]);
    assert_eq!(record.unwrap(), [7]);
    // and the walk continues from the found position
    let (key, _) = cursor.next().unwrap();
    assert_eq!(key, [8]);
}

#[test]
fn movement_with_a_direction_also_moves_first() {
    let db = populated_db(5);
    let mut cursor = db.cursor().unwrap();
    let (key, _) = cursor.move_to(Some(Direction::Last), Fetch::KEY).unwrap();
    assert_eq!(key.unwrap(), [5]);
    let (key, _) = cursor.move_to(Some(Direction::Previous), Fetch::KEY).unwrap();
    assert_eq!(key.unwrap(), [4]);
    let (key, _) = cursor.move_to(Some(Direction::First), Fetch::KEY).unwrap();
    assert_eq!(key.unwrap(), [1]);
}

#[test]
fn erased_neighbourhood_does_not_break_the_walk() {
    let db = populated_db(20);
    // empty out a whole leaf in the middle of the chain
    for i in 5u8..=8 {
        db.erase(&[i]).unwrap();
    }
    db.check_integrity().unwrap();
    let mut cursor = db.cursor().unwrap();
    let mut seen = Vec::new();
    while let Ok((key, _)) = cursor.next() {
        seen.push(key[0]);
    }
    let expected: Vec<u8> = (1u8..=20).filter(|i| !(5..=8).contains(i)).collect();
    assert_eq!(seen, expected);
}
