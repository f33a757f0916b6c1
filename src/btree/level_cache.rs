use super::{
    consts::MAX_TREE_DEPTH,
    page::{FoundAt, Page, PageId},
};
use crate::types::Pod;

/// Per-level traversal state cached across operations on one cursor.
///
/// The page reference is only trusted while both generations still
/// match: the page's own generation (any mutation invalidates) and the
/// tree generation (any structural change invalidates every level).
pub struct LevelCacheEntry {
    pub page: Option<Pod<Page>>,
    pub pid: Option<PageId>,
    pub found_at: Option<FoundAt>,
    pub buffer_generation: u64,
    /// Slot index of the last insert on this level; split policies use
    /// it to recognize sequential loads.
    pub last_insert_at: usize,

    // working state of an in-flight range removal
    pub left_page: Option<Pod<Page>>,
    pub right_page: Option<Pod<Page>>,
    pub left_found_at: Option<FoundAt>,
    pub right_found_at: Option<FoundAt>,
}

impl LevelCacheEntry {
    fn new() -> Self {
        Self {
            page: None,
            pid: None,
            found_at: None,
            buffer_generation: 0,
            last_insert_at: 0,
            left_page: None,
            right_page: None,
            left_found_at: None,
            right_found_at: None,
        }
    }

    pub fn update(
        &mut self,
        page: &Pod<Page>,
        pid: PageId,
        generation: u64,
        found_at: FoundAt,
    ) {
        self.pid = Some(pid);
        self.page = Some(page.clone());
        self.buffer_generation = generation;
        self.found_at = Some(found_at);
    }

    pub fn invalidate(&mut self) {
        self.page = None;
        self.pid = None;
        self.found_at = None;
        self.buffer_generation = 0;
    }

    pub fn clear_remove_state(&mut self) {
        self.left_page = None;
        self.right_page = None;
        self.left_found_at = None;
        self.right_found_at = None;
    }
}

pub struct LevelCache {
    tree_generation: u64,
    entries: Vec<LevelCacheEntry>,
}

impl LevelCache {
    pub fn new() -> Self {
        Self {
            tree_generation: 0,
            entries: (0..MAX_TREE_DEPTH).map(|_| LevelCacheEntry::new()).collect(),
        }
    }

    pub fn entry(&mut self, level: usize) -> &mut LevelCacheEntry {
        &mut self.entries[level]
    }

    pub fn invalidate_all(&mut self) {
        for e in &mut self.entries {
            e.invalidate();
            e.clear_remove_state();
        }
    }

    /// Compare against the tree's current generation; on mismatch the
    /// whole cache resets. Returns whether the cache survived.
    pub fn sync_generation(&mut self, tree_generation: u64) -> bool {
        if self.tree_generation == tree_generation {
            return true;
        }
        self.invalidate_all();
        self.tree_generation = tree_generation;
        false
    }
}
