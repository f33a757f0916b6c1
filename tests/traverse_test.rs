mod common;

use blink_db::{Cursor, Direction, Key, TraverseVisitor};
use common::{setup, store_str, str_key, temp_volume};

#[test]
fn test_reverse_nudge_walks_backward() {
    setup();
    let volume = temp_volume("reverse");
    let mut cursor = Cursor::open(&volume, "t", true).unwrap();

    store_str(&mut cursor, "a", b"1");
    store_str(&mut cursor, "b", b"2");
    store_str(&mut cursor, "c", b"3");

    cursor.key_mut().clear();
    for expected in &["c", "b", "a"] {
        assert!(cursor.traverse(Direction::Lt, false, 0).unwrap());
        assert_eq!(cursor.key().segments()[0], expected.as_bytes().to_vec());
    }
    assert!(!cursor.traverse(Direction::Lt, false, 0).unwrap());
}

fn deep_tree_cursor(name: &str) -> Cursor {
    let volume = temp_volume(name);
    let mut cursor = Cursor::open(&volume, "t", true).unwrap();

    // {A}, {A,1}, {A,2}, {B}
    *cursor.key_mut() = str_key("A");
    cursor.store(b"a").unwrap();
    *cursor.key_mut() = str_key("A");
    cursor.key_mut().append_u64(1);
    cursor.store(b"a1").unwrap();
    *cursor.key_mut() = str_key("A");
    cursor.key_mut().append_u64(2);
    cursor.store(b"a2").unwrap();
    *cursor.key_mut() = str_key("B");
    cursor.store(b"b").unwrap();
    cursor
}

#[test]
fn test_sibling_traversal_skips_children() {
    setup();
    let mut cursor = deep_tree_cursor("sibling");

    *cursor.key_mut() = str_key("A");
    assert!(cursor.traverse(Direction::Gt, false, 0).unwrap());
    assert_eq!(cursor.key().segments(), vec![b"B".to_vec()]);
}

#[test]
fn test_deep_traversal_descends_into_children() {
    setup();
    let mut cursor = deep_tree_cursor("deep");

    *cursor.key_mut() = str_key("A");

    assert!(cursor.traverse(Direction::Gt, true, 0).unwrap());
    assert_eq!(cursor.key().depth(), 2);
    assert_eq!(cursor.key().segments()[1], 1u64.to_be_bytes().to_vec());

    assert!(cursor.traverse(Direction::Gt, true, 0).unwrap());
    assert_eq!(cursor.key().segments()[1], 2u64.to_be_bytes().to_vec());

    assert!(cursor.traverse(Direction::Gt, true, 0).unwrap());
    assert_eq!(cursor.key().segments(), vec![b"B".to_vec()]);

    assert!(!cursor.traverse(Direction::Gt, true, 0).unwrap());
}

#[test]
fn test_gteq_returns_exact_match_first() {
    setup();
    let volume = temp_volume("gteq");
    let mut cursor = Cursor::open(&volume, "t", true).unwrap();

    store_str(&mut cursor, "m", b"mid");
    store_str(&mut cursor, "p", b"post");

    *cursor.key_mut() = str_key("m");
    assert!(cursor.traverse(Direction::Gteq, true, i64::MAX).unwrap());
    assert_eq!(cursor.key().segments()[0], b"m".to_vec());
    assert_eq!(cursor.get_value(), Some(b"mid" as &[u8]));

    // a probe between keys falls through to the next one
    *cursor.key_mut() = str_key("n");
    assert!(cursor.traverse(Direction::Gteq, true, i64::MAX).unwrap());
    assert_eq!(cursor.key().segments()[0], b"p".to_vec());

    *cursor.key_mut() = str_key("n");
    assert!(cursor.traverse(Direction::Lteq, true, i64::MAX).unwrap());
    assert_eq!(cursor.key().segments()[0], b"m".to_vec());
}

#[test]
fn test_eq_direction_is_exact_fetch() {
    setup();
    let volume = temp_volume("eq");
    let mut cursor = Cursor::open(&volume, "t", true).unwrap();

    store_str(&mut cursor, "k", b"v");

    *cursor.key_mut() = str_key("k");
    assert!(cursor.traverse(Direction::Eq, true, i64::MAX).unwrap());
    assert_eq!(cursor.get_value(), Some(b"v" as &[u8]));

    *cursor.key_mut() = str_key("other");
    assert!(!cursor.traverse(Direction::Eq, true, i64::MAX).unwrap());
}

#[test]
fn test_has_next_previous_children() {
    setup();
    let mut cursor = deep_tree_cursor("hasnext");

    *cursor.key_mut() = str_key("A");
    assert!(cursor.has_children().unwrap());
    assert!(cursor.has_next().unwrap());
    // the probes must not have moved the cursor
    assert_eq!(cursor.key().segments(), vec![b"A".to_vec()]);

    *cursor.key_mut() = str_key("B");
    assert!(!cursor.has_children().unwrap());
    assert!(!cursor.has_next().unwrap());
    assert!(cursor.has_previous().unwrap());
}

struct Collector {
    keys: Vec<Vec<u8>>,
    stop_after: usize,
}

impl TraverseVisitor for Collector {
    fn visit(&mut self, key: &Key, _value: Option<&[u8]>) -> bool {
        self.keys.push(key.encoded().to_vec());
        self.keys.len() < self.stop_after
    }
}

#[test]
fn test_visitor_walks_and_stops() {
    setup();
    let volume = temp_volume("visitor");
    let mut cursor = Cursor::open(&volume, "t", true).unwrap();

    for name in &["a", "b", "c", "d", "e"] {
        store_str(&mut cursor, name, b"v");
    }

    // full walk: visitor never stops, traversal reports false
    let mut all = Collector {
        keys: Vec::new(),
        stop_after: usize::MAX,
    };
    cursor.key_mut().clear();
    let stopped = cursor
        .traverse_with_visitor(Direction::Gt, true, 0, &mut all)
        .unwrap();
    assert!(!stopped);
    assert_eq!(all.keys.len(), 5);
    let mut sorted = all.keys.clone();
    sorted.sort();
    assert_eq!(all.keys, sorted);

    // early stop leaves the cursor on the stopping key
    let mut some = Collector {
        keys: Vec::new(),
        stop_after: 2,
    };
    cursor.key_mut().clear();
    let stopped = cursor
        .traverse_with_visitor(Direction::Gt, true, 0, &mut some)
        .unwrap();
    assert!(stopped);
    assert_eq!(some.keys.len(), 2);
    assert_eq!(cursor.key().segments()[0], b"b".to_vec());
}

#[test]
fn test_traverse_filtered_prefix_guard() {
    setup();
    let mut cursor = deep_tree_cursor("filtered");

    // stop as soon as the candidate leaves the {A} prefix
    *cursor.key_mut() = str_key("A");
    let prefix_len = cursor.key().len();
    let mut seen = 0;
    while cursor
        .traverse_filtered(Direction::Gt, true, 0, 0, prefix_len)
        .unwrap()
    {
        seen += 1;
    }
    // {A,1} and {A,2} share the prefix, {B} terminates the walk
    assert_eq!(seen, 2);
}
