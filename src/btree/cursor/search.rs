use log::debug;

use super::Cursor;
use crate::{
    btree::{
        consts::{MAX_TREE_DEPTH, MAX_WALK_RIGHT},
        page::{FoundAt, Page, PageId},
    },
    error::DbError,
    transaction::Permission,
    types::Pod,
};

impl Cursor {
    /// Find the data page covering `key` and the position of the key
    /// within it. The page comes back claimed (exclusively when
    /// `leaf_writer` is set); the caller releases it.
    pub(crate) fn search(
        &mut self,
        key: &[u8],
        leaf_writer: bool,
    ) -> Result<(Pod<Page>, FoundAt), DbError> {
        if let Some(hit) = self.search_level_cache(key, leaf_writer)? {
            return Ok(hit);
        }

        let held = self.tree().claim.holds(self.cursor_id());
        if !held {
            self.tree().claim.claim_read(self.cursor_id())?;
        }
        let result = self.search_tree(key, 0, leaf_writer);
        if !held {
            self.tree().claim.release(self.cursor_id());
        }
        result
    }

    /// Fast path: if the cached level-0 page is still valid and the key
    /// does not fall off either of its edges, skip the descent.
    fn search_level_cache(
        &mut self,
        key: &[u8],
        leaf_writer: bool,
    ) -> Result<Option<(Pod<Page>, FoundAt)>, DbError> {
        if !self.level_cache.sync_generation(self.tree().generation()) {
            return Ok(None);
        }

        let (pid, cached_generation) = {
            let entry = self.level_cache.entry(0);
            match (&entry.pid, entry.buffer_generation) {
                (Some(pid), generation) if generation != 0 => (*pid, generation),
                _ => return Ok(None),
            }
        };

        let perm = if leaf_writer {
            Permission::ReadWrite
        } else {
            Permission::ReadOnly
        };
        // zero-timeout attempt: a contended cache hit is not worth
        // waiting for, the descent will find the page again
        let page_pod = match self.claim_page(&pid, perm, false) {
            Ok(pod) => pod,
            Err(_) => return Ok(None),
        };

        let verdict = {
            let page = page_pod.read().unwrap();
            if page.generation() != cached_generation {
                None
            } else {
                let found_at = page.find(key);
                let past_right = found_at.index == page.record_count()
                    && page.right_sibling().is_some();
                let before_left = !found_at.exact && found_at.index == 0;
                if past_right || before_left || page.is_empty() {
                    None
                } else {
                    Some(found_at)
                }
            }
        };

        match verdict {
            Some(found_at) => {
                let generation = page_pod.read().unwrap().generation();
                self.level_cache
                    .entry(0)
                    .update(&page_pod, pid, generation, found_at);
                Ok(Some((page_pod, found_at)))
            }
            None => {
                self.release_page(&pid);
                self.level_cache.entry(0).invalidate();
                Ok(None)
            }
        }
    }

    /// Top-down descent from the root to `target_level`, filling the
    /// level cache on the way. Caller holds the tree claim.
    pub(crate) fn search_tree(
        &mut self,
        key: &[u8],
        target_level: usize,
        leaf_writer: bool,
    ) -> Result<(Pod<Page>, FoundAt), DbError> {
        self.tree().check_valid()?;
        let (root, depth, generation) = self.tree().snapshot();
        if depth > MAX_TREE_DEPTH {
            return Err(self.corrupt_detail(depth, Some(root), "tree depth out of range"));
        }
        self.level_cache.sync_generation(generation);

        let mut pid = root;
        // the claim on the parent is dropped only after the child is
        // claimed, so no split can slip in between the two levels
        let mut parent: Option<PageId> = None;

        for level in (target_level..depth).rev() {
            let writer = leaf_writer && level == target_level;
            let step = self.search_level(key, pid, level, writer);

            let (page_pod, found_at) = match step {
                Ok(v) => v,
                Err(e) => {
                    if let Some(parent_pid) = parent {
                        self.release_page(&parent_pid);
                    }
                    return Err(e);
                }
            };
            if let Some(parent_pid) = parent.take() {
                self.release_page(&parent_pid);
            }

            let page = page_pod.read().unwrap();
            self.level_cache.entry(level).update(
                &page_pod,
                page.pid(),
                page.generation(),
                found_at,
            );

            if level == target_level {
                drop(page);
                return Ok((page_pod, found_at));
            }

            let child = page
                .child_index(found_at)
                .and_then(|i| page.child_at(i));
            pid = match child {
                Ok(pid) => pid,
                Err(e) => {
                    drop(page);
                    self.release_page(&page_pod.read().unwrap().pid());
                    return Err(e);
                }
            };
            parent = Some(page.pid());
        }

        Err(self.corrupt_detail(target_level, Some(pid), "descent fell off the tree"))
    }

    /// Claim the page at `start` and walk right along the sibling chain
    /// until the page covering `key` is found. The next sibling is
    /// claimed before the current page is released, which blocks
    /// insertions between the two while we hop.
    pub(crate) fn search_level(
        &mut self,
        key: &[u8],
        start: PageId,
        level: usize,
        writer: bool,
    ) -> Result<(Pod<Page>, FoundAt), DbError> {
        let perm = if writer {
            Permission::ReadWrite
        } else {
            Permission::ReadOnly
        };

        let mut pid = start;
        let mut page_pod = self.claim_page(&pid, perm, true)?;

        for _hop in 0..MAX_WALK_RIGHT {
            let (found_at, hop_to) = {
                let page = page_pod.read().unwrap();
                if page.category().level() != Some(level) {
                    drop(page);
                    self.release_page(&pid);
                    return Err(self.corrupt_detail(
                        level,
                        Some(pid),
                        "page type does not match its level",
                    ));
                }

                let found_at = page.find(key);
                let past_edge =
                    !found_at.exact && found_at.index == page.record_count();
                match (past_edge, page.right_sibling()) {
                    (true, Some(right)) => (found_at, Some(right)),
                    _ => (found_at, None),
                }
            };

            let right = match hop_to {
                None => return Ok((page_pod, found_at)),
                Some(right) => right,
            };

            // claim-couple into the sibling, then decide whether the
            // key really lives there
            let right_pod = match self.claim_page(&right, perm, true) {
                Ok(pod) => pod,
                Err(e) => {
                    self.release_page(&pid);
                    return Err(e);
                }
            };
            let hop = {
                let right_page = right_pod.read().unwrap();
                match right_page.first_key() {
                    Some(first) => first <= key,
                    // an empty page on the chain is hopped through
                    None => right_page.right_sibling().is_some(),
                }
            };

            if hop {
                debug!("walk right: {} -> {}", pid.get_short_repr(), right.get_short_repr());
                self.release_page(&pid);
                pid = right;
                page_pod = right_pod;
            } else {
                self.release_page(&right);
                let found_at = page_pod.read().unwrap().find(key);
                return Ok((page_pod, found_at));
            }
        }

        self.release_page(&pid);
        Err(self.corrupt_detail(level, Some(pid), "walk-right hop bound exceeded"))
    }
}
