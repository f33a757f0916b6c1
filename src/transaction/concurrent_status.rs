use core::fmt;
use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
    thread::sleep,
    time::{Duration, Instant},
};

use log::debug;

use crate::{
    btree::page::PageId,
    database::Database,
    error::{DbError, ErrorKind},
    types::DbResult,
};

#[derive(Debug, PartialEq)]
pub enum Lock {
    XLock,
    SLock,
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Permission {
    ReadOnly,
    ReadWrite,
}

impl Permission {
    pub fn to_lock(&self) -> Lock {
        match self {
            Permission::ReadOnly => Lock::SLock,
            Permission::ReadWrite => Lock::XLock,
        }
    }
}

/// Page claim table. Claims are owned by cursors (not transactions):
/// the B-link claim-coupling discipline is a property of one traversal,
/// and a cursor must be able to hold a child claim while it gives up
/// the parent.
///
/// The maps live behind one mutex; acquisition polls. This keeps the
/// grant decision atomic without asking for `&mut self` on a structure
/// that many threads query at once.
pub struct ConcurrentStatus {
    inner: Mutex<LatchMaps>,
}

struct LatchMaps {
    s_latch_map: HashMap<PageId, HashSet<u64>>,
    x_latch_map: HashMap<PageId, u64>,
    held: HashMap<u64, HashSet<PageId>>,
}

impl ConcurrentStatus {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LatchMaps {
                s_latch_map: HashMap::new(),
                x_latch_map: HashMap::new(),
                held: HashMap::new(),
            }),
        }
    }

    /// Claim a page. With `wait` the call polls until the configured
    /// claim timeout; without it a single failed attempt reports
    /// `Retry` so the caller can release its claims and start over.
    pub fn request_latch(
        &self,
        owner: u64,
        lock: &Lock,
        pid: &PageId,
        wait: bool,
    ) -> DbResult {
        if self.add_latch(owner, lock, pid) {
            return Ok(());
        }
        if !wait {
            return Err(DbError::retry(&format!(
                "claim on {} unavailable",
                pid.get_short_repr()
            )));
        }

        let timeout = Database::config().claim_timeout;
        let start_time = Instant::now();
        while start_time.elapsed() < timeout {
            sleep(Duration::from_millis(1));
            if self.add_latch(owner, lock, pid) {
                return Ok(());
            }
        }

        let err = DbError::new(
            ErrorKind::Timeout,
            &format!(
                "claim timeout, owner: {}, lock: {:?}, page: {:?}, table: {:?}",
                owner, lock, pid, self
            ),
        );
        err.show_backtrace();
        Err(err)
    }

    // Try to add a claim. Returns whether it was granted. Idempotent:
    // re-claiming a page the owner already holds succeeds, and an
    // S request on a page the owner holds exclusively is a no-op grant.
    fn add_latch(&self, owner: u64, lock: &Lock, pid: &PageId) -> bool {
        let mut maps = self.inner.lock().unwrap();

        if let Some(x_owner) = maps.x_latch_map.get(pid) {
            if *x_owner != owner {
                return false;
            }
            // already exclusive; any request is a grant
            return true;
        }

        match lock {
            Lock::SLock => {
                maps.s_latch_map
                    .entry(*pid)
                    .or_insert_with(HashSet::new)
                    .insert(owner);
            }
            Lock::XLock => {
                if let Some(readers) = maps.s_latch_map.get(pid) {
                    if readers.iter().any(|r| *r != owner) {
                        return false;
                    }
                }
                maps.s_latch_map.remove(pid);
                maps.x_latch_map.insert(*pid, owner);
            }
        }

        maps.held.entry(owner).or_insert_with(HashSet::new).insert(*pid);
        true
    }

    /// S -> X on a page the owner already holds; succeeds only while it
    /// is the sole reader. Failure reports `Retry`.
    pub fn upgrade_latch(&self, owner: u64, pid: &PageId) -> DbResult {
        if self.add_latch(owner, &Lock::XLock, pid) {
            return Ok(());
        }
        Err(DbError::retry(&format!(
            "upgrade on {} blocked by concurrent readers",
            pid.get_short_repr()
        )))
    }

    pub fn release_latch(&self, owner: u64, pid: &PageId) {
        let mut maps = self.inner.lock().unwrap();
        if let Some(readers) = maps.s_latch_map.get_mut(pid) {
            readers.remove(&owner);
            if readers.is_empty() {
                maps.s_latch_map.remove(pid);
            }
        }
        if maps.x_latch_map.get(pid) == Some(&owner) {
            maps.x_latch_map.remove(pid);
        }
        if let Some(held) = maps.held.get_mut(&owner) {
            held.remove(pid);
        }
    }

    pub fn release_all(&self, owner: u64) {
        let held: Vec<PageId> = {
            let maps = self.inner.lock().unwrap();
            match maps.held.get(&owner) {
                Some(pages) => pages.iter().cloned().collect(),
                None => return,
            }
        };
        debug!("owner {} releasing {} residual claims", owner, held.len());
        for pid in held {
            self.release_latch(owner, &pid);
        }
        self.inner.lock().unwrap().held.remove(&owner);
    }

    pub fn holds_latch(&self, owner: u64, pid: &PageId) -> bool {
        let maps = self.inner.lock().unwrap();
        maps.x_latch_map.get(pid) == Some(&owner)
            || maps
                .s_latch_map
                .get(pid)
                .map(|readers| readers.contains(&owner))
                .unwrap_or(false)
    }

    pub fn held_count(&self, owner: u64) -> usize {
        self.inner
            .lock()
            .unwrap()
            .held
            .get(&owner)
            .map(|h| h.len())
            .unwrap_or(0)
    }

    pub fn clear(&self) {
        let mut maps = self.inner.lock().unwrap();
        maps.s_latch_map.clear();
        maps.x_latch_map.clear();
        maps.held.clear();
    }
}

impl fmt::Display for ConcurrentStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let maps = self.inner.lock().unwrap();
        let mut depiction = "\n".to_string();

        depiction.push_str("s_latch_map: {");
        for (k, v) in maps.s_latch_map.iter() {
            depiction.push_str(&format!("\n\t{:?} -> {:?},", k.get_short_repr(), v));
        }
        depiction.push_str("\n}\n");

        depiction.push_str("x_latch_map: {");
        for (k, v) in maps.x_latch_map.iter() {
            depiction.push_str(&format!("\n\t{:?} -> {:?},", k.get_short_repr(), v));
        }
        depiction.push_str("\n}\n");

        write!(f, "{}", depiction)
    }
}

impl fmt::Debug for ConcurrentStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}
