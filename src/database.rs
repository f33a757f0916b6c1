use std::{
    mem,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc, Once, RwLock, RwLockWriteGuard,
    },
    time::Duration,
};

use once_cell::sync::OnceCell;

use crate::{
    btree::{buffer_pool::BufferPool, volume::Volume},
    policy::{JoinPolicy, SplitPolicy},
    transaction::{concurrent_status::ConcurrentStatus, transaction_index::TransactionIndex, Transaction},
    tx_log::LogManager,
    types::{ConcurrentHashMap, Pod},
    utils::HandyRwLock,
};

/// Database-wide knobs, fixed at first use.
#[derive(Clone)]
pub struct DbConfig {
    /// How long a page or tree claim request may poll before giving up.
    pub claim_timeout: Duration,
    /// How long a writer waits for an undecided write-write rival
    /// before the dependency counts as timed out.
    pub ww_timeout: Duration,
    pub default_split_policy: SplitPolicy,
    pub default_join_policy: JoinPolicy,
    pub journal_path: String,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            claim_timeout: Duration::from_secs(3),
            ww_timeout: Duration::from_secs(3),
            default_split_policy: SplitPolicy::default(),
            default_join_policy: JoinPolicy::default(),
            journal_path: "blink.journal".to_string(),
        }
    }
}

static CONFIG: OnceCell<DbConfig> = OnceCell::new();

/// Monotonic source of timestamps for transaction starts, commits and
/// page dirty marks.
pub struct TimestampAllocator {
    counter: AtomicU64,
}

impl TimestampAllocator {
    fn new() -> Self {
        Self {
            counter: AtomicU64::new(1),
        }
    }

    pub fn update_timestamp(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn current(&self) -> u64 {
        self.counter.load(Ordering::Acquire)
    }
}

/// We collect all global variables here.
///
/// These variables cannot be initialized as static variables, because
/// their initialization functions all rely on non-const fns. At the
/// same time, most of them should not be wrapped in any kind of lock,
/// because they are internally concurrent already.
pub struct Database {
    buffer_pool: BufferPool,
    concurrent_status: ConcurrentStatus,
    transaction_index: TransactionIndex,
    timestamps: TimestampAllocator,
    log_manager: Pod<LogManager>,

    volumes: ConcurrentHashMap<u32, Arc<Volume>>,
    next_volume_id: AtomicU32,
    next_cursor_id: AtomicU64,
}

impl Database {
    fn new() -> Self {
        Self {
            buffer_pool: BufferPool::new(),
            concurrent_status: ConcurrentStatus::new(),
            transaction_index: TransactionIndex::new(),
            timestamps: TimestampAllocator::new(),
            log_manager: Arc::new(RwLock::new(LogManager::new(
                &Self::config().journal_path,
            ))),
            volumes: ConcurrentHashMap::new(),
            next_volume_id: AtomicU32::new(1),
            next_cursor_id: AtomicU64::new(1),
        }
    }

    /// Install a non-default configuration. Only effective before the
    /// first use of the database.
    pub fn init_config(config: DbConfig) {
        CONFIG.set(config).ok();
    }

    pub fn config() -> &'static DbConfig {
        CONFIG.get_or_init(DbConfig::default)
    }

    pub fn buffer_pool() -> &'static BufferPool {
        &Self::global().buffer_pool
    }

    pub fn concurrent_status() -> &'static ConcurrentStatus {
        &Self::global().concurrent_status
    }

    pub fn transaction_index() -> &'static TransactionIndex {
        &Self::global().transaction_index
    }

    pub fn timestamps() -> &'static TimestampAllocator {
        &Self::global().timestamps
    }

    pub fn mut_log_manager() -> RwLockWriteGuard<'static, LogManager> {
        Self::global().log_manager.wl()
    }

    pub fn begin_transaction() -> Transaction {
        let tx = Transaction::new();
        tx.start().ok();
        tx
    }

    pub(crate) fn register_volume(volume: Arc<Volume>) {
        Self::global().volumes.insert(volume.id(), volume);
    }

    pub(crate) fn unregister_volume(id: u32) {
        Self::global().volumes.remove(&id);
    }

    pub fn get_volume(id: u32) -> Option<Arc<Volume>> {
        Self::global().volumes.get(&id)
    }

    pub(crate) fn next_volume_id() -> u32 {
        Self::global().next_volume_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_cursor_id() -> u64 {
        Self::global().next_cursor_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn global() -> &'static Self {
        // Initialize it to a null value
        static mut SINGLETON: *mut Database = 0 as *mut Database;
        static ONCE: Once = Once::new();

        ONCE.call_once(|| {
            // Make it
            let singleton = Self::new();

            unsafe {
                // Put it in the heap so it can outlive this call
                SINGLETON = mem::transmute(Box::new(singleton));
            }
        });

        unsafe {
            // Now we give out a copy of the data that is safe to use
            // concurrently.
            SINGLETON.as_ref().unwrap()
        }
    }
}
