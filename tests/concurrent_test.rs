mod common;

use blink_db::{Cursor, Direction};
use common::{numbered_key, setup, temp_volume};

// Lots of inserts from parallel threads, each with its own cursor on
// the same tree; afterwards a single walk must see every key exactly
// once, in order.
#[test]
fn test_parallel_inserters() {
    setup();
    let volume = temp_volume("par_insert");
    // create the tree up front so the workers race on pages, not on
    // tree creation
    Cursor::open(&volume, "t", true).unwrap();

    const WRITERS: usize = 4;
    const PER_WRITER: usize = 500;

    crossbeam::thread::scope(|s| {
        for w in 0..WRITERS {
            let volume = volume.clone();
            s.spawn(move |_| {
                let mut cursor = Cursor::open(&volume, "t", false).unwrap();
                let value = vec![b'v'; 100];
                for i in 0..PER_WRITER {
                    *cursor.key_mut() = numbered_key("k", w * PER_WRITER + i);
                    cursor.store(&value).expect("concurrent store failed");
                }
            });
        }
    })
    .unwrap();

    let mut cursor = Cursor::open(&volume, "t", false).unwrap();
    cursor.key_mut().clear();
    let mut count = 0;
    let mut prev: Option<Vec<u8>> = None;
    while cursor.traverse(Direction::Gt, true, 0).unwrap() {
        let encoded = cursor.key().encoded().to_vec();
        if let Some(p) = &prev {
            assert!(*p < encoded, "order violated at record {}", count);
        }
        prev = Some(encoded);
        count += 1;
    }
    assert_eq!(count, WRITERS * PER_WRITER);
}

// Readers traverse while writers insert. Within any single walk the
// observed keys must be strictly ascending, and every key that was
// committed before the walk started must be present.
#[test]
fn test_readers_during_inserts() {
    setup();
    let volume = temp_volume("par_read");
    {
        let mut cursor = Cursor::open(&volume, "t", true).unwrap();
        let value = vec![b'v'; 100];
        for i in 0..500 {
            *cursor.key_mut() = numbered_key("base", i);
            cursor.store(&value).unwrap();
        }
    }

    crossbeam::thread::scope(|s| {
        // two writers appending beyond the preloaded range
        for w in 0..2 {
            let volume = volume.clone();
            s.spawn(move |_| {
                let mut cursor = Cursor::open(&volume, "t", false).unwrap();
                let value = vec![b'w'; 100];
                for i in 0..300 {
                    *cursor.key_mut() = numbered_key("live", w * 300 + i);
                    cursor.store(&value).expect("writer failed");
                }
            });
        }

        // three readers walking the whole tree repeatedly
        for _ in 0..3 {
            let volume = volume.clone();
            s.spawn(move |_| {
                let mut cursor = Cursor::open(&volume, "t", false).unwrap();
                for _ in 0..5 {
                    cursor.key_mut().clear();
                    let mut base_seen = 0;
                    let mut prev: Option<Vec<u8>> = None;
                    while cursor.traverse(Direction::Gt, true, 0).expect("walk failed") {
                        let encoded = cursor.key().encoded().to_vec();
                        if let Some(p) = &prev {
                            assert!(*p < encoded, "reader saw keys out of order");
                        }
                        if cursor.key().segments()[0].starts_with(b"base") {
                            base_seen += 1;
                        }
                        prev = Some(encoded);
                    }
                    assert_eq!(base_seen, 500, "reader missed preloaded keys");
                }
            });
        }
    })
    .unwrap();
}

// Cursors from different threads on the same tree are fine; the
// confinement rule only rejects interleaved use of one cursor, which
// the unit tests cover. Here, a cursor handed from one thread to
// another between operations must keep working.
#[test]
fn test_cursor_moves_between_threads() {
    setup();
    let volume = temp_volume("moved");
    let mut cursor = Cursor::open(&volume, "t", true).unwrap();
    *cursor.key_mut() = numbered_key("k", 1);
    cursor.store(b"v").unwrap();

    crossbeam::thread::scope(|s| {
        s.spawn(|_| {
            *cursor.key_mut() = numbered_key("k", 1);
            assert!(cursor.fetch().unwrap());
        });
    })
    .unwrap();
}
