use core::fmt;
use std::{
    collections::HashSet,
    sync::{Mutex, RwLock},
    thread::sleep,
    time::{Duration, Instant},
};

use crate::{
    database::Database,
    error::{DbError, ErrorKind},
    types::DbResult,
    utils::HandyRwLock,
};

use super::page::PageId;

/// Root metadata of one named tree. Shared by every cursor that refers
/// to the tree; mutations of the root address or depth happen under the
/// tree claim's writer mode.
pub struct Tree {
    name: String,
    volume_id: u32,
    pub claim: TreeClaim,
    inner: RwLock<TreeInner>,
}

struct TreeInner {
    root: PageId,
    depth: usize,
    /// Bumped on any structural change (root growth, join, tree
    /// removal). LevelCache entries from an older generation are dead.
    generation: u64,
    /// Counts logical mutations, for change detection by callers.
    change_count: u64,
    valid: bool,
}

impl Tree {
    pub fn new(name: &str, volume_id: u32, root: PageId) -> Self {
        Self {
            name: name.to_string(),
            volume_id,
            claim: TreeClaim::new(),
            inner: RwLock::new(TreeInner {
                root,
                depth: 1,
                generation: 1,
                change_count: 0,
                valid: true,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn volume_id(&self) -> u32 {
        self.volume_id
    }

    pub fn root(&self) -> PageId {
        self.inner.rl().root
    }

    pub fn depth(&self) -> usize {
        self.inner.rl().depth
    }

    pub fn generation(&self) -> u64 {
        self.inner.rl().generation
    }

    pub fn change_count(&self) -> u64 {
        self.inner.rl().change_count
    }

    pub fn is_valid(&self) -> bool {
        self.inner.rl().valid
    }

    pub fn check_valid(&self) -> DbResult {
        if self.is_valid() {
            Ok(())
        } else {
            Err(DbError::new(
                ErrorKind::TreeNotFound,
                &format!("tree {} was removed", self.name),
            ))
        }
    }

    /// Root address, depth and generation in one consistent view.
    pub fn snapshot(&self) -> (PageId, usize, u64) {
        let inner = self.inner.rl();
        (inner.root, inner.depth, inner.generation)
    }

    /// Publish a new root after growth. Caller holds the writer claim.
    pub fn grow(&self, new_root: PageId) {
        let mut inner = self.inner.wl();
        inner.root = new_root;
        inner.depth += 1;
        inner.generation += 1;
    }

    pub fn bump_generation(&self) {
        self.inner.wl().generation += 1;
    }

    pub fn bump_change_count(&self) {
        self.inner.wl().change_count += 1;
    }

    pub fn invalidate(&self) {
        let mut inner = self.inner.wl();
        inner.valid = false;
        inner.generation += 1;
    }
}

impl fmt::Display for Tree {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.rl();
        write!(
            f,
            "<tree {} root {} depth {} gen {}>",
            self.name, inner.root, inner.depth, inner.generation
        )
    }
}

/// Shared/exclusive claim on a tree's root metadata, with upgrade. The
/// writer mode is what the remove path calls the "exclusive tree
/// claim": while one cursor holds it, no other cursor can even start a
/// descent.
pub struct TreeClaim {
    state: Mutex<ClaimState>,
}

struct ClaimState {
    readers: HashSet<u64>,
    writer: Option<u64>,
}

impl TreeClaim {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ClaimState {
                readers: HashSet::new(),
                writer: None,
            }),
        }
    }

    fn try_read(&self, owner: u64) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.writer {
            Some(w) if w != owner => false,
            _ => {
                state.readers.insert(owner);
                true
            }
        }
    }

    fn try_write(&self, owner: u64) -> bool {
        let mut state = self.state.lock().unwrap();
        if let Some(w) = state.writer {
            return w == owner;
        }
        let sole_reader =
            state.readers.is_empty() || (state.readers.len() == 1 && state.readers.contains(&owner));
        if !sole_reader {
            return false;
        }
        state.readers.remove(&owner);
        state.writer = Some(owner);
        true
    }

    pub fn claim_read(&self, owner: u64) -> DbResult {
        self.poll(owner, Self::try_read, "reader")
    }

    pub fn claim_write(&self, owner: u64) -> DbResult {
        self.poll(owner, Self::try_write, "writer")
    }

    /// Single-shot reader-to-writer upgrade. Fails with `Retry` when
    /// other readers are present; per protocol the caller then releases
    /// everything and starts over with writer intent.
    pub fn try_upgrade(&self, owner: u64) -> DbResult {
        if self.try_write(owner) {
            Ok(())
        } else {
            Err(DbError::retry("tree claim upgrade blocked"))
        }
    }

    fn poll(
        &self,
        owner: u64,
        attempt: fn(&Self, u64) -> bool,
        mode: &str,
    ) -> DbResult {
        if attempt(self, owner) {
            return Ok(());
        }
        let timeout = Database::config().claim_timeout;
        let start_time = Instant::now();
        while start_time.elapsed() < timeout {
            sleep(Duration::from_millis(1));
            if attempt(self, owner) {
                return Ok(());
            }
        }
        Err(DbError::new(
            ErrorKind::Timeout,
            &format!("tree {} claim timeout, owner {}", mode, owner),
        ))
    }

    pub fn release(&self, owner: u64) {
        let mut state = self.state.lock().unwrap();
        state.readers.remove(&owner);
        if state.writer == Some(owner) {
            state.writer = None;
        }
    }

    pub fn is_writer(&self, owner: u64) -> bool {
        self.state.lock().unwrap().writer == Some(owner)
    }

    pub fn holds(&self, owner: u64) -> bool {
        let state = self.state.lock().unwrap();
        state.writer == Some(owner) || state.readers.contains(&owner)
    }
}
