mod common;

use blink_db::{Cursor, Direction, ErrorKind};
use common::{fill_sequential, numbered_key, setup, store_str, str_key, temp_volume};

#[test]
fn test_remove_single_key() {
    setup();
    let volume = temp_volume("remove_one");
    let mut cursor = Cursor::open(&volume, "t", true).unwrap();

    store_str(&mut cursor, "a", b"1");
    store_str(&mut cursor, "b", b"2");
    store_str(&mut cursor, "c", b"3");

    *cursor.key_mut() = str_key("b");
    assert!(cursor.remove().unwrap());
    assert!(!cursor.fetch().unwrap());
    // removing again is a no-op
    assert!(!cursor.remove().unwrap());

    *cursor.key_mut() = str_key("a");
    assert!(cursor.fetch().unwrap());
    *cursor.key_mut() = str_key("c");
    assert!(cursor.fetch().unwrap());
}

#[test]
fn test_remove_key_leaves_children() {
    setup();
    let volume = temp_volume("remove_parent");
    let mut cursor = Cursor::open(&volume, "t", true).unwrap();

    *cursor.key_mut() = str_key("dir");
    cursor.store(b"parent").unwrap();
    *cursor.key_mut() = str_key("dir");
    cursor.key_mut().append_str("child");
    cursor.store(b"child").unwrap();

    *cursor.key_mut() = str_key("dir");
    assert!(cursor.remove().unwrap());
    assert!(!cursor.fetch().unwrap());

    *cursor.key_mut() = str_key("dir");
    cursor.key_mut().append_str("child");
    assert!(cursor.fetch().unwrap());
}

#[test]
fn test_fetch_and_remove_returns_value() {
    setup();
    let volume = temp_volume("fetch_remove");
    let mut cursor = Cursor::open(&volume, "t", true).unwrap();

    store_str(&mut cursor, "k", b"payload");

    *cursor.key_mut() = str_key("k");
    assert!(cursor.fetch_and_remove().unwrap());
    assert_eq!(cursor.get_value(), Some(b"payload" as &[u8]));
    assert!(!cursor.fetch().unwrap());

    *cursor.key_mut() = str_key("k");
    assert!(!cursor.fetch_and_remove().unwrap());
}

// The range-removal shape check from the system's contract: two leaves
// of disjoint numbered ranges, a removal spanning the boundary, exactly
// the survivors visible afterwards.
#[test]
fn test_remove_range_spanning_pages() {
    setup();
    let volume = temp_volume("range_span");
    let mut cursor = Cursor::open(&volume, "t", true).unwrap();

    fill_sequential(&mut cursor, "n", 2000, 200);
    assert!(cursor.tree().depth() >= 2);

    *cursor.key_mut() = numbered_key("n", 500);
    let end = numbered_key("n", 1500);
    assert!(cursor.remove_range(&end).unwrap());

    for probe in &[0usize, 499, 1500, 1999] {
        *cursor.key_mut() = numbered_key("n", *probe);
        assert!(cursor.fetch().unwrap(), "survivor {} missing", probe);
    }
    for probe in &[500usize, 501, 1000, 1499] {
        *cursor.key_mut() = numbered_key("n", *probe);
        assert!(!cursor.fetch().unwrap(), "casualty {} still present", probe);
    }

    cursor.key_mut().clear();
    let mut count = 0;
    let mut prev: Option<Vec<u8>> = None;
    while cursor.traverse(Direction::Gt, true, 0).unwrap() {
        let encoded = cursor.key().encoded().to_vec();
        if let Some(p) = &prev {
            assert!(*p < encoded);
        }
        prev = Some(encoded);
        count += 1;
    }
    assert_eq!(count, 1000);
}

#[test]
fn test_remove_range_rejects_backwards_range() {
    setup();
    let volume = temp_volume("range_order");
    let mut cursor = Cursor::open(&volume, "t", true).unwrap();

    store_str(&mut cursor, "z", b"v");
    *cursor.key_mut() = str_key("z");
    let before = str_key("a");
    let err = cursor.remove_range(&before).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidKey);
}

#[test]
fn test_remove_all_empties_tree() {
    setup();
    let volume = temp_volume("remove_all");
    let mut cursor = Cursor::open(&volume, "t", true).unwrap();

    fill_sequential(&mut cursor, "n", 3000, 150);
    assert!(cursor.remove_all().unwrap());

    cursor.key_mut().clear();
    assert!(!cursor.traverse(Direction::Gt, true, 0).unwrap());

    // the tree is still usable afterwards
    store_str(&mut cursor, "again", b"v");
    *cursor.key_mut() = str_key("again");
    assert!(cursor.fetch().unwrap());
}

#[test]
fn test_range_remove_frees_pages() {
    setup();
    let volume = temp_volume("page_reclaim");
    let mut cursor = Cursor::open(&volume, "t", true).unwrap();

    fill_sequential(&mut cursor, "n", 4000, 200);
    let before = volume.stats.live_pages();

    *cursor.key_mut() = numbered_key("n", 100);
    let end = numbered_key("n", 3900);
    assert!(cursor.remove_range(&end).unwrap());

    let after = volume.stats.live_pages();
    assert!(
        after < before,
        "no pages reclaimed: {} -> {}",
        before,
        after
    );
}

#[test]
fn test_remove_tree_invalidates_handle() {
    setup();
    let volume = temp_volume("remove_tree");
    let mut cursor = Cursor::open(&volume, "t", true).unwrap();

    fill_sequential(&mut cursor, "n", 100, 50);
    let before = volume.stats.live_pages();
    cursor.remove_tree().unwrap();
    assert!(volume.stats.live_pages() < before);

    *cursor.key_mut() = numbered_key("n", 1);
    let err = cursor.fetch().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TreeNotFound);

    // the name can be reused with a fresh tree
    let mut fresh = Cursor::open(&volume, "t", true).unwrap();
    store_str(&mut fresh, "x", b"v");
    *fresh.key_mut() = str_key("x");
    assert!(fresh.fetch().unwrap());
}
