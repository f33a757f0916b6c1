mod common;

use blink_db::{Cursor, Direction, ErrorKind};
use common::{fill_sequential, numbered_key, setup, store_str, str_key, temp_volume};

#[test]
fn test_store_and_fetch_roundtrip() {
    setup();
    let volume = temp_volume("roundtrip");
    let mut cursor = Cursor::open(&volume, "t", true).unwrap();

    store_str(&mut cursor, "alpha", b"one");
    store_str(&mut cursor, "beta", b"two");

    *cursor.key_mut() = str_key("alpha");
    assert!(cursor.fetch().unwrap());
    assert_eq!(cursor.get_value(), Some(b"one" as &[u8]));

    *cursor.key_mut() = str_key("beta");
    assert!(cursor.fetch().unwrap());
    assert_eq!(cursor.get_value(), Some(b"two" as &[u8]));

    *cursor.key_mut() = str_key("gamma");
    assert!(!cursor.fetch().unwrap());
}

#[test]
fn test_overwrite_reports_prior_value() {
    setup();
    let volume = temp_volume("overwrite");
    let mut cursor = Cursor::open(&volume, "t", true).unwrap();

    *cursor.key_mut() = str_key("k");
    assert!(!cursor.store(b"first").unwrap());
    assert!(cursor.store(b"second").unwrap());

    assert!(cursor.fetch_and_store(b"third").unwrap());
    assert_eq!(cursor.get_value(), Some(b"second" as &[u8]));

    assert!(cursor.fetch().unwrap());
    assert_eq!(cursor.get_value(), Some(b"third" as &[u8]));
}

// Ascending load through several splits: the classic shape check.
// 10 000 keys with 200-byte values cannot fit one page, the tree must
// deepen, and order must survive.
#[test]
fn test_split_propagation_ascending_load() {
    setup();
    let volume = temp_volume("split");
    let mut cursor = Cursor::open(&volume, "t", true).unwrap();

    fill_sequential(&mut cursor, "k", 10_000, 200);

    assert!(cursor.tree().depth() >= 2, "tree did not deepen");

    // forward traversal yields all keys in ascending order
    cursor.key_mut().clear();
    let mut count = 0;
    let mut prev: Option<Vec<u8>> = None;
    while cursor.traverse(Direction::Gt, true, 0).unwrap() {
        let encoded = cursor.key().encoded().to_vec();
        if let Some(p) = &prev {
            assert!(*p < encoded, "keys out of order after {} records", count);
        }
        prev = Some(encoded);
        count += 1;
    }
    assert_eq!(count, 10_000);

    *cursor.key_mut() = numbered_key("k", 5000);
    assert!(cursor.fetch().unwrap());
    let expected = vec![b'v'; 200];
    assert_eq!(cursor.get_value(), Some(expected.as_slice()));
}

#[test]
fn test_descending_load() {
    setup();
    let volume = temp_volume("descending");
    let mut cursor = Cursor::open(&volume, "t", true).unwrap();

    let value = vec![b'v'; 200];
    for i in (0..2000).rev() {
        *cursor.key_mut() = numbered_key("k", i);
        cursor.store(&value).unwrap();
    }

    // min_bytes < 0 must not move the key
    cursor.key_mut().clear();
    assert!(cursor.traverse(Direction::Gt, true, -1).unwrap());
    assert!(cursor.key().is_empty());

    // full walk with key updates
    let mut count = 0;
    cursor.key_mut().clear();
    while cursor.traverse(Direction::Gt, true, 0).unwrap() {
        count += 1;
    }
    assert_eq!(count, 2000);
}

// Random keys instead of an ordered load: splits land everywhere and
// every stored key must come back in encoded order.
#[test]
fn test_random_load() {
    use itertools::Itertools;
    use rand::prelude::*;

    setup();
    let volume = temp_volume("random");
    let mut cursor = Cursor::open(&volume, "t", true).unwrap();

    let mut rng = rand::thread_rng();
    let mut inserted = std::collections::BTreeSet::new();
    let value = vec![b'r'; 120];
    for _ in 0..3000 {
        let k: u64 = rng.gen_range(0, 1_000_000);
        cursor.key_mut().clear().append_u64(k);
        cursor.store(&value).unwrap();
        inserted.insert(k);
    }

    cursor.key_mut().clear();
    let mut seen = Vec::new();
    while cursor.traverse(Direction::Gt, true, 0).unwrap() {
        let segment = cursor.key().segments()[0].clone();
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&segment);
        seen.push(u64::from_be_bytes(raw));
    }

    assert_eq!(seen.len(), inserted.len());
    assert!(seen.iter().tuple_windows().all(|(a, b)| a < b));
    assert!(seen.iter().all(|k| inserted.contains(k)));
}

#[test]
fn test_key_too_long_rejected() {
    setup();
    let volume = temp_volume("longkey");
    let mut cursor = Cursor::open(&volume, "t", true).unwrap();

    let big = vec![b'a'; common::TEST_PAGE_SIZE];
    cursor.key_mut().append_bytes(&big);
    let err = cursor.store(b"v").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyTooLong);
}

#[test]
fn test_empty_key_rejected() {
    setup();
    let volume = temp_volume("emptykey");
    let mut cursor = Cursor::open(&volume, "t", true).unwrap();

    let err = cursor.store(b"v").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidKey);

    let err = cursor.fetch().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidKey);
}

#[test]
fn test_tree_not_found_without_create() {
    setup();
    let volume = temp_volume("nocreate");
    let err = Cursor::open(&volume, "missing", false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TreeNotFound);
}

#[test]
fn test_read_only_volume_rejects_stores() {
    setup();
    let volume = temp_volume("readonly_pre");
    // a read-only volume cannot even create the tree
    let ro = blink_db::Volume::create_read_only(std::env::temp_dir().join(format!(
        "blink_ro_{}.db",
        std::process::id()
    )))
    .unwrap();
    let err = Cursor::open(&ro, "t", true).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReadOnly);

    // a writable volume with the same tree name is unaffected
    let mut cursor = Cursor::open(&volume, "t", true).unwrap();
    store_str(&mut cursor, "k", b"v");
}

#[test]
fn test_volume_statistics_track_operations() {
    setup();
    let volume = temp_volume("stats");
    let mut cursor = Cursor::open(&volume, "t", true).unwrap();

    store_str(&mut cursor, "a", b"1");
    store_str(&mut cursor, "b", b"2");
    *cursor.key_mut() = str_key("a");
    cursor.fetch().unwrap();
    cursor.remove().unwrap();

    use std::sync::atomic::Ordering;
    assert!(volume.stats.stores.load(Ordering::Relaxed) >= 2);
    assert!(volume.stats.fetches.load(Ordering::Relaxed) >= 1);
    assert!(volume.stats.removes.load(Ordering::Relaxed) >= 1);
}
