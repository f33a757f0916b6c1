use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, RwLock,
};

use log::debug;

use super::page::{Page, PageId};
use crate::{
    database::Database,
    error::DbError,
    transaction::Permission,
    types::{ConcurrentHashMap, Pod, ResultPod},
};

pub const DEFAULT_PAGE_SIZE: usize = 4096;
static PAGE_SIZE: AtomicUsize = AtomicUsize::new(DEFAULT_PAGE_SIZE);

/// Process-global page cache. Every live page of every open volume is
/// pinned here; eviction is somebody else's problem. What this layer
/// adds on top of the map is claim discipline: `get` hands out a page
/// only after the requested reader/writer claim is granted.
pub struct BufferPool {
    pages: ConcurrentHashMap<PageId, Pod<Page>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            pages: ConcurrentHashMap::new(),
        }
    }

    pub fn set_page_size(page_size: usize) {
        PAGE_SIZE.store(page_size, Ordering::Relaxed);
    }

    pub fn get_page_size() -> usize {
        PAGE_SIZE.load(Ordering::Relaxed)
    }

    /// Claim and return a page. With `wait` unset, a contended claim
    /// reports `Retry` instead of blocking.
    pub fn get(
        &self,
        owner: u64,
        perm: Permission,
        pid: &PageId,
        wait: bool,
    ) -> ResultPod<Page> {
        Database::concurrent_status().request_latch(owner, &perm.to_lock(), pid, wait)?;

        match self.pages.get(pid) {
            Some(page) => Ok(page),
            None => {
                Database::concurrent_status().release_latch(owner, pid);
                Err(DbError::corrupt(&format!(
                    "page {} not resident; pointer out of range",
                    pid
                )))
            }
        }
    }

    /// Look up a page without claiming it. Only for contexts that hold
    /// a structural guarantee instead of a claim (e.g. garbage sweeps
    /// under an exclusive tree claim).
    pub fn peek(&self, pid: &PageId) -> Option<Pod<Page>> {
        self.pages.get(pid)
    }

    /// Install a freshly allocated page, already claimed exclusively by
    /// `owner`. The claim is taken before the page becomes visible, so
    /// no rival can slip in between.
    pub fn install_claimed(&self, owner: u64, page: Page) -> ResultPod<Page> {
        let pid = page.pid();
        Database::concurrent_status().request_latch(
            owner,
            &Permission::ReadWrite.to_lock(),
            &pid,
            false,
        )?;
        let pod = Arc::new(RwLock::new(page));
        self.pages.insert(pid, pod.clone());
        Ok(pod)
    }

    /// Install without any claim; used for pages that are not yet
    /// reachable from any tree (fresh roots, long-record chains under
    /// construction).
    pub fn install(&self, page: Page) -> Pod<Page> {
        let pid = page.pid();
        let pod = Arc::new(RwLock::new(page));
        self.pages.insert(pid, pod.clone());
        pod
    }

    pub fn release(&self, owner: u64, pid: &PageId) {
        Database::concurrent_status().release_latch(owner, pid);
    }

    /// Drop a freed page from the cache.
    pub fn discard(&self, pid: &PageId) {
        debug!("discarding page {}", pid);
        self.pages.remove(pid);
    }

    pub fn resident_count(&self) -> usize {
        self.pages.len()
    }

    pub fn pages_of_volume(&self, volume_id: u32) -> Vec<PageId> {
        self.pages
            .keys()
            .into_iter()
            .filter(|pid| pid.volume_id == volume_id)
            .collect()
    }

    pub fn clear(&self) {
        self.pages.clear();
    }
}
