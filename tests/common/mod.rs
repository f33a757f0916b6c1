use std::sync::Arc;

use blink_db::{BufferPool, Cursor, Key, Volume};

pub const TEST_PAGE_SIZE: usize = 8192;

/// # Conduct the initialization
///
/// - Setting up log configurations.
/// - Fixing the page size for every test in the binary.
pub fn setup() {
    blink_db::utils::init_log();
    BufferPool::set_page_size(TEST_PAGE_SIZE);
}

/// A fresh volume with a unique backing file, so parallel tests never
/// collide.
pub fn temp_volume(name: &str) -> Arc<Volume> {
    let path = std::env::temp_dir().join(format!(
        "blink_{}_{}_{}.db",
        name,
        std::process::id(),
        blink_db::Database::timestamps().update_timestamp(),
    ));
    Volume::create(path).expect("volume creation failed")
}

pub fn str_key(s: &str) -> Key {
    let mut k = Key::new();
    k.append_str(s);
    k
}

/// "k0000", "k0001", ... style keys used by the ordered-load tests.
pub fn numbered_key(prefix: &str, i: usize) -> Key {
    str_key(&format!("{}{:04}", prefix, i))
}

pub fn store_str(cursor: &mut Cursor, key: &str, value: &[u8]) {
    *cursor.key_mut() = str_key(key);
    cursor.store(value).expect("store failed");
}

/// Insert `count` ascending keys with fixed-size values.
pub fn fill_sequential(cursor: &mut Cursor, prefix: &str, count: usize, value_len: usize) {
    let value = vec![b'v'; value_len];
    for i in 0..count {
        *cursor.key_mut() = numbered_key(prefix, i);
        cursor.store(&value).expect("sequential store failed");
    }
}

/// Walk the whole tree forward, returning every visible key's first
/// segment as a string.
#[allow(dead_code)]
pub fn collect_forward(cursor: &mut Cursor) -> Vec<String> {
    use blink_db::Direction;

    let mut keys = Vec::new();
    cursor.key_mut().clear();
    while cursor.traverse(Direction::Gt, true, 0).expect("traverse failed") {
        let segments = cursor.key().segments();
        keys.push(String::from_utf8_lossy(&segments[0]).to_string());
    }
    keys
}
