mod common;

use blink_db::{Cursor, Database, Direction, ErrorKind};
use common::{setup, str_key, temp_volume};

#[test]
fn test_committed_writes_visible_to_later_readers() {
    setup();
    let volume = temp_volume("mvcc_commit");

    let writer_tx = Database::begin_transaction();
    let mut writer = Cursor::open_with_transaction(&volume, "t", true, writer_tx).unwrap();
    *writer.key_mut() = str_key("k");
    writer.store(b"v1").unwrap();
    writer_tx.commit().unwrap();

    let reader_tx = Database::begin_transaction();
    let mut reader = Cursor::open_with_transaction(&volume, "t", false, reader_tx).unwrap();
    *reader.key_mut() = str_key("k");
    assert!(reader.fetch().unwrap());
    assert_eq!(reader.get_value(), Some(b"v1" as &[u8]));
    reader_tx.commit().unwrap();
}

#[test]
fn test_snapshot_isolation_hides_later_commits() {
    setup();
    let volume = temp_volume("mvcc_snapshot");

    // baseline value
    let t0 = Database::begin_transaction();
    let mut c0 = Cursor::open_with_transaction(&volume, "t", true, t0).unwrap();
    *c0.key_mut() = str_key("k");
    c0.store(b"old").unwrap();
    t0.commit().unwrap();

    // the reader starts before the overwrite commits
    let reader_tx = Database::begin_transaction();
    let mut reader = Cursor::open_with_transaction(&volume, "t", false, reader_tx).unwrap();

    let writer_tx = Database::begin_transaction();
    let mut writer = Cursor::open_with_transaction(&volume, "t", false, writer_tx).unwrap();
    *writer.key_mut() = str_key("k");
    writer.store(b"new").unwrap();
    writer_tx.commit().unwrap();

    *reader.key_mut() = str_key("k");
    assert!(reader.fetch().unwrap());
    assert_eq!(reader.get_value(), Some(b"old" as &[u8]));
    reader_tx.commit().unwrap();

    // a reader starting now sees the overwrite
    let late_tx = Database::begin_transaction();
    let mut late = Cursor::open_with_transaction(&volume, "t", false, late_tx).unwrap();
    *late.key_mut() = str_key("k");
    assert!(late.fetch().unwrap());
    assert_eq!(late.get_value(), Some(b"new" as &[u8]));
    late_tx.commit().unwrap();
}

#[test]
fn test_own_writes_visible_before_commit() {
    setup();
    let volume = temp_volume("mvcc_own");

    let tx = Database::begin_transaction();
    let mut cursor = Cursor::open_with_transaction(&volume, "t", true, tx).unwrap();
    *cursor.key_mut() = str_key("k");
    cursor.store(b"mine").unwrap();

    assert!(cursor.fetch().unwrap());
    assert_eq!(cursor.get_value(), Some(b"mine" as &[u8]));

    // an independent transaction does not see the uncommitted write
    let other_tx = Database::begin_transaction();
    let mut other = Cursor::open_with_transaction(&volume, "t", false, other_tx).unwrap();
    *other.key_mut() = str_key("k");
    assert!(!other.fetch().unwrap());

    tx.commit().unwrap();
    other_tx.commit().unwrap();
}

// The write-write conflict contract: T1 begins, T2 writes the same key
// and commits, T1's own store must roll back.
#[test]
fn test_write_write_conflict_rolls_back() {
    setup();
    let volume = temp_volume("mvcc_ww");

    let t0 = Database::begin_transaction();
    let mut c0 = Cursor::open_with_transaction(&volume, "t", true, t0).unwrap();
    *c0.key_mut() = str_key("K");
    c0.store(b"base").unwrap();
    t0.commit().unwrap();

    let t1 = Database::begin_transaction();
    let mut c1 = Cursor::open_with_transaction(&volume, "t", false, t1).unwrap();
    *c1.key_mut() = str_key("K");
    assert!(c1.fetch().unwrap());

    let t2 = Database::begin_transaction();
    let mut c2 = Cursor::open_with_transaction(&volume, "t", false, t2).unwrap();
    *c2.key_mut() = str_key("K");
    c2.store(b"t2 wins").unwrap();
    t2.commit().unwrap();

    *c1.key_mut() = str_key("K");
    let err = c1.store(b"t1 loses").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Rollback);
    t1.abort().unwrap();

    let check_tx = Database::begin_transaction();
    let mut check = Cursor::open_with_transaction(&volume, "t", false, check_tx).unwrap();
    *check.key_mut() = str_key("K");
    assert!(check.fetch().unwrap());
    assert_eq!(check.get_value(), Some(b"t2 wins" as &[u8]));
    check_tx.commit().unwrap();
}

#[test]
fn test_aborted_writes_never_surface() {
    setup();
    let volume = temp_volume("mvcc_abort");

    let t0 = Database::begin_transaction();
    let mut c0 = Cursor::open_with_transaction(&volume, "t", true, t0).unwrap();
    *c0.key_mut() = str_key("k");
    c0.store(b"keep").unwrap();
    t0.commit().unwrap();

    let t1 = Database::begin_transaction();
    let mut c1 = Cursor::open_with_transaction(&volume, "t", false, t1).unwrap();
    *c1.key_mut() = str_key("k");
    c1.store(b"discard").unwrap();
    t1.abort().unwrap();

    let t2 = Database::begin_transaction();
    let mut c2 = Cursor::open_with_transaction(&volume, "t", false, t2).unwrap();
    *c2.key_mut() = str_key("k");
    assert!(c2.fetch().unwrap());
    assert_eq!(c2.get_value(), Some(b"keep" as &[u8]));
    t2.commit().unwrap();
}

#[test]
fn test_transactional_remove_leaves_tombstones() {
    setup();
    let volume = temp_volume("mvcc_tombstone");

    let t0 = Database::begin_transaction();
    let mut c0 = Cursor::open_with_transaction(&volume, "t", true, t0).unwrap();
    for name in &["a", "b", "c"] {
        *c0.key_mut() = str_key(name);
        c0.store(b"v").unwrap();
    }
    t0.commit().unwrap();

    // an old reader outlives the delete
    let old_tx = Database::begin_transaction();
    let mut old_reader = Cursor::open_with_transaction(&volume, "t", false, old_tx).unwrap();

    let deleter_tx = Database::begin_transaction();
    let mut deleter =
        Cursor::open_with_transaction(&volume, "t", false, deleter_tx).unwrap();
    *deleter.key_mut() = str_key("b");
    assert!(deleter.remove().unwrap());
    // gone for the deleting transaction itself
    *deleter.key_mut() = str_key("b");
    assert!(!deleter.fetch().unwrap());
    deleter_tx.commit().unwrap();

    // the old reader still sees the pre-delete state
    *old_reader.key_mut() = str_key("b");
    assert!(old_reader.fetch().unwrap());
    old_tx.commit().unwrap();

    // new readers skip the tombstone, traversal included
    let new_tx = Database::begin_transaction();
    let mut new_reader = Cursor::open_with_transaction(&volume, "t", false, new_tx).unwrap();
    *new_reader.key_mut() = str_key("b");
    assert!(!new_reader.fetch().unwrap());

    new_reader.key_mut().clear();
    let mut seen = Vec::new();
    while new_reader.traverse(Direction::Gt, true, 0).unwrap() {
        seen.push(new_reader.key().segments()[0].clone());
    }
    assert_eq!(seen, vec![b"a".to_vec(), b"c".to_vec()]);
    new_tx.commit().unwrap();
}

#[test]
fn test_transactional_range_remove() {
    setup();
    let volume = temp_volume("mvcc_range");

    let t0 = Database::begin_transaction();
    let mut c0 = Cursor::open_with_transaction(&volume, "t", true, t0).unwrap();
    for name in &["a", "b", "c", "d", "e"] {
        *c0.key_mut() = str_key(name);
        c0.store(b"v").unwrap();
    }
    t0.commit().unwrap();

    let tx = Database::begin_transaction();
    let mut cursor = Cursor::open_with_transaction(&volume, "t", false, tx).unwrap();
    *cursor.key_mut() = str_key("b");
    let end = str_key("e");
    assert!(cursor.remove_range(&end).unwrap());
    tx.commit().unwrap();

    let check_tx = Database::begin_transaction();
    let mut check = Cursor::open_with_transaction(&volume, "t", false, check_tx).unwrap();
    check.key_mut().clear();
    let mut seen = Vec::new();
    while check.traverse(Direction::Gt, true, 0).unwrap() {
        seen.push(check.key().segments()[0].clone());
    }
    assert_eq!(seen, vec![b"a".to_vec(), b"e".to_vec()]);
    check_tx.commit().unwrap();
}

#[test]
fn test_no_mvcc_mode_bypasses_versions() {
    setup();
    let volume = temp_volume("mvcc_bypass");

    let tx = Database::begin_transaction();
    let mut cursor = Cursor::open_with_transaction(&volume, "t", true, tx).unwrap();
    cursor.set_mvcc_disabled(true);

    *cursor.key_mut() = str_key("k");
    cursor.store(b"raw").unwrap();

    // the write is primordial: immediately visible to everyone,
    // transaction state notwithstanding
    let mut plain = Cursor::open(&volume, "t", false).unwrap();
    *plain.key_mut() = str_key("k");
    assert!(plain.fetch().unwrap());
    assert_eq!(plain.get_value(), Some(b"raw" as &[u8]));

    tx.abort().unwrap();
    // an aborted transaction takes nothing with it in no-MVCC mode
    *plain.key_mut() = str_key("k");
    assert!(plain.fetch().unwrap());
}
