use log::debug;

use super::{Cursor, StoreOptions, StoreValue};
use crate::{
    btree::{
        page::{JoinOutcome, Page, PageId, Slot},
        volume::{ChainLink, GarbageChain, Volume},
    },
    database::Database,
    error::{DbError, ErrorKind},
    key::Key,
    types::Pod,
};

use super::traverse::Direction;

/// What happened to the two edge children one level below, which this
/// level's key-blocks must now reflect.
enum ChildAction {
    Untouched,
    /// The right child was emptied into the left one and freed.
    Coalesced,
    /// The right child survived with a new first key that must be
    /// re-indexed here.
    Rebalanced(Vec<u8>),
}

impl Cursor {
    /// Remove the current key (children are untouched). Returns whether
    /// a visible value was removed.
    pub fn remove(&mut self) -> Result<bool, DbError> {
        self.begin_op()?;
        let r = (|| {
            self.check_key_valid()?;
            let key1 = self.key.clone();
            // children of the key encode strictly above key\0, so this
            // range covers exactly the one key
            let mut key2 = key1.clone();
            key2.nudge_deeper();
            self.remove_key_range(&key1, &key2, false)
        })();
        self.end_op();
        r
    }

    /// Remove the current key, leaving its prior value in the value
    /// work area.
    pub fn fetch_and_remove(&mut self) -> Result<bool, DbError> {
        self.begin_op()?;
        let r = (|| {
            self.check_key_valid()?;
            let present = self.fetch_internal(i64::MAX)?;
            if !present {
                return Ok(false);
            }
            let key1 = self.key.clone();
            let mut key2 = key1.clone();
            key2.nudge_deeper();
            self.remove_key_range(&key1, &key2, false)?;
            Ok(true)
        })();
        self.end_op();
        r
    }

    /// Remove every key of the tree.
    pub fn remove_all(&mut self) -> Result<bool, DbError> {
        self.begin_op()?;
        let key1 = Key::new();
        let key2 = Key::from_encoded(&[0xff]);
        let r = self.remove_key_range(&key1, &key2, false);
        self.end_op();
        r
    }

    /// Remove all keys in `[current key, key2)`.
    pub fn remove_range(&mut self, key2: &Key) -> Result<bool, DbError> {
        self.begin_op()?;
        let r = (|| {
            self.check_key_valid()?;
            let key1 = self.key.clone();
            if key2.encoded() <= key1.encoded() {
                return Err(DbError::new(
                    ErrorKind::InvalidKey,
                    "range end does not follow range start",
                ));
            }
            self.remove_key_range(&key1, key2, false)
        })();
        self.end_op();
        r
    }

    /// Shared removal entry: transactional deletes leave anti-value
    /// tombstones; raw deletes restructure pages.
    pub(crate) fn remove_key_range(
        &mut self,
        key1: &Key,
        key2: &Key,
        tombstone_only: bool,
    ) -> Result<bool, DbError> {
        self.volume().check_writable()?;
        self.tree().check_valid()?;
        self.volume()
            .stats
            .removes
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        if self.mvcc_active() && !tombstone_only {
            return self.remove_transactional(key1, key2);
        }

        loop {
            match self.remove_raw(key1, key2, tombstone_only) {
                Ok(any) => {
                    self.tree().claim.release(self.cursor_id());
                    self.volume().sweep_garbage();
                    return Ok(any);
                }
                Err(e) if e.kind() == ErrorKind::Retry => {
                    self.release_all_claims();
                    continue;
                }
                Err(e) => {
                    self.release_all_claims();
                    self.volume().sweep_garbage();
                    return Err(e);
                }
            }
        }
    }

    /// Walk the visible keys of the range and store an anti-value MVV
    /// tombstone over each: readers of this transaction see them as
    /// gone, and pruning coalesces them once every older reader drains.
    fn remove_transactional(&mut self, key1: &Key, key2: &Key) -> Result<bool, DbError> {
        // park the caller's key in the spare work area for the walk
        std::mem::swap(&mut self.key, &mut self.spare_key);
        let mut any = false;

        self.key = key1.clone();
        let mut direction = Direction::Gteq;
        let result = loop {
            match self.traverse_internal(direction, true, 0, 0, 0, None) {
                Ok(true) => {}
                Ok(false) => break Ok(any),
                Err(e) => break Err(e),
            }
            if self.key.encoded() >= key2.encoded() {
                break Ok(any);
            }
            let key = self.key.clone();
            match self.store_internal(&key, StoreValue::Anti, 0, &StoreOptions::anti_value())
            {
                Ok(true) => any = true,
                Ok(false) => {}
                Err(e) => break Err(e),
            }
            direction = Direction::Gt;
        };

        std::mem::swap(&mut self.key, &mut self.spare_key);
        if result.is_ok() {
            Database::mut_log_manager()
                .log_remove(self.tree().name(), key1, key2)
                .ok();
            self.tree().bump_change_count();
        }
        result
    }

    fn remove_raw(
        &mut self,
        key1: &Key,
        key2: &Key,
        tombstone_only: bool,
    ) -> Result<bool, DbError> {
        // hold at least a reader claim for the whole removal, so a
        // rival's spanning remove cannot free pages under us
        if !self.tree().claim.holds(self.cursor_id()) {
            self.tree().claim.claim_read(self.cursor_id())?;
        }

        // quick path: the whole range inside one data page
        let (page_pod, found_at) = self.search(key1.encoded(), true)?;
        let pid = page_pod.read().unwrap().pid();

        let quick = {
            let page = page_pod.read().unwrap();
            let end = page.find(key2.encoded());
            let contained =
                end.index < page.record_count() || page.right_sibling().is_none();
            if contained {
                Some((found_at.index, end.index))
            } else {
                None
            }
        };

        if let Some((from, to)) = quick {
            if to <= from {
                self.release_page(&pid);
                return Ok(false);
            }
            if tombstone_only {
                let clean = {
                    let page = page_pod.read().unwrap();
                    page.records()[from..to]
                        .iter()
                        .all(|r| matches!(r.slot, Slot::AntiValue))
                };
                if !clean {
                    self.release_page(&pid);
                    return Ok(false);
                }
            }

            let mut chains = Vec::new();
            {
                let mut page = page_pod.write().unwrap();
                Volume::harvest_long_records(&page, from, to, &mut chains);
                page.remove_records(from, to);
                page.mark_dirty(Database::timestamps().update_timestamp());
            }
            self.release_page(&pid);
            for ptr in &chains {
                self.free_long_record(ptr);
            }

            Database::mut_log_manager()
                .log_remove(self.tree().name(), key1, key2)
                .ok();
            self.tree().bump_change_count();
            return Ok(true);
        }

        // the range spans pages; tombstone verification is a
        // single-page affair only
        self.release_page(&pid);
        if tombstone_only {
            return Ok(false);
        }

        self.ensure_tree_writer()?;
        let result = self.remove_spanning(key1, key2);

        self.tree().claim.release(self.cursor_id());
        self.release_all_page_claims();
        self.level_cache.invalidate_all();

        if result.is_ok() {
            Database::mut_log_manager()
                .log_remove(self.tree().name(), key1, key2)
                .ok();
            self.tree().bump_generation();
            self.tree().bump_change_count();
        }
        result
    }

    /// The general range removal, under the exclusive tree claim:
    /// descend both edges in lockstep, then walk back up joining or
    /// rebalancing at each level and deferring re-indexing of promoted
    /// keys to the store path.
    fn remove_spanning(&mut self, key1: &Key, key2: &Key) -> Result<bool, DbError> {
        let (root, depth, generation) = self.tree().snapshot();
        self.level_cache.sync_generation(generation);
        debug!(
            "spanning remove on {}: [{} .. {})",
            self.tree().name(),
            hex::encode(key1.encoded()),
            hex::encode(key2.encoded()),
        );

        // lockstep descent of both edges
        let mut left_pid = root;
        let mut right_pid = root;
        for level in (0..depth).rev() {
            let (left_pod, left_fa) =
                self.search_level(key1.encoded(), left_pid, level, true)?;
            let (right_pod, right_fa) =
                self.search_level(key2.encoded(), right_pid, level, true)?;

            if level > 0 {
                let left = left_pod.read().unwrap();
                left_pid = left.child_at(left.child_index(left_fa)?)?;
                let right = right_pod.read().unwrap();
                right_pid = right.child_at(right.child_index(right_fa)?)?;
            }

            let entry = self.level_cache.entry(level);
            entry.left_page = Some(left_pod);
            entry.left_found_at = Some(left_fa);
            entry.right_page = Some(right_pod);
            entry.right_found_at = Some(right_fa);
        }

        // walk back up
        let mut any = false;
        let mut action = ChildAction::Untouched;
        let mut garbage: Vec<GarbageChain> = Vec::new();
        let mut deferred: Vec<(Vec<u8>, PageId, usize)> = Vec::new();

        for level in 0..depth {
            let (left_pod, right_pod) = {
                let entry = self.level_cache.entry(level);
                (
                    entry.left_page.clone().expect("descent filled this level"),
                    entry.right_page.clone().expect("descent filled this level"),
                )
            };
            let left_pid = left_pod.read().unwrap().pid();
            let right_pid = right_pod.read().unwrap().pid();
            let right_child_pid = if level > 0 {
                self.level_cache.entry(level - 1).right_page.as_ref().map(|p| {
                    p.read().unwrap().pid()
                })
            } else {
                None
            };
            let ts = Database::timestamps().update_timestamp();

            if left_pid == right_pid {
                let next_action = self.remove_within_page(
                    &left_pod,
                    level,
                    key1,
                    key2,
                    &action,
                    right_child_pid,
                    ts,
                    &mut any,
                )?;
                action = next_action;
            } else {
                let next_action = self.join_level(
                    &left_pod,
                    &right_pod,
                    level,
                    key1,
                    key2,
                    &action,
                    right_child_pid,
                    ts,
                    &mut garbage,
                    &mut deferred,
                )?;
                any = true;
                action = next_action;
            }
        }

        for chain in garbage {
            self.volume().record_garbage_chain(chain);
        }
        for (promoted, child, level) in deferred {
            let promoted_key = Key::from_encoded(&promoted);
            self.store_internal(
                &promoted_key,
                StoreValue::Pointer(child),
                level,
                &StoreOptions::primordial(),
            )?;
        }

        Ok(any)
    }

    /// Both edges fell into the same page at this level: remove the
    /// interior key-blocks and apply the child action.
    fn remove_within_page(
        &mut self,
        page_pod: &Pod<Page>,
        level: usize,
        key1: &Key,
        key2: &Key,
        action: &ChildAction,
        right_child_pid: Option<PageId>,
        ts: u64,
        any: &mut bool,
    ) -> Result<ChildAction, DbError> {
        let mut chains = Vec::new();
        let mut needs_reindex: Option<(Vec<u8>, PageId)> = None;

        {
            let mut page = page_pod.write().unwrap();
            let (from, to) = if level == 0 {
                (
                    page.find(key1.encoded()).index,
                    page.find(key2.encoded()).index,
                )
            } else {
                let li = page.child_index(page.find(key1.encoded()))?;
                let ri = page.child_index(page.find(key2.encoded()))?;
                match action {
                    // children between the edges were freed below;
                    // with a coalesce the right child went too
                    ChildAction::Coalesced | ChildAction::Rebalanced(_) => (li + 1, ri + 1),
                    ChildAction::Untouched => (li + 1, li + 1),
                }
            };

            if to > from {
                if level == 0 {
                    Volume::harvest_long_records(&page, from, to, &mut chains);
                    *any = true;
                }
                page.remove_records(from, to);
                page.mark_dirty(ts);
            }

            if let ChildAction::Rebalanced(promoted) = action {
                let child = right_child_pid
                    .ok_or_else(|| DbError::corrupt("rebalance with no child level"))?;
                match page.put(promoted, Slot::Child(child)) {
                    crate::btree::page::PutResult::Fit(_) => page.mark_dirty(ts),
                    crate::btree::page::PutResult::NeedsSplit => {
                        needs_reindex = Some((promoted.clone(), child));
                    }
                }
            }
        }

        for ptr in &chains {
            self.free_long_record(ptr);
        }
        if let Some((promoted, child)) = needs_reindex {
            let promoted_key = Key::from_encoded(&promoted);
            self.store_internal(
                &promoted_key,
                StoreValue::Pointer(child),
                level,
                &StoreOptions::primordial(),
            )?;
        }

        Ok(ChildAction::Untouched)
    }

    /// The edges landed on different pages: clear the deletion window
    /// out of both, free the pages between them, then join.
    fn join_level(
        &mut self,
        left_pod: &Pod<Page>,
        right_pod: &Pod<Page>,
        level: usize,
        key1: &Key,
        key2: &Key,
        action: &ChildAction,
        right_child_pid: Option<PageId>,
        ts: u64,
        garbage: &mut Vec<GarbageChain>,
        deferred: &mut Vec<(Vec<u8>, PageId, usize)>,
    ) -> Result<ChildAction, DbError> {
        let mut chains = Vec::new();
        let right_pid = right_pod.read().unwrap().pid();

        let outcome = {
            let mut left = left_pod.write().unwrap();
            let mut right = right_pod.write().unwrap();

            // left tail of the window
            let left_from = if level == 0 {
                left.find(key1.encoded()).index
            } else {
                left.child_index(left.find(key1.encoded()))? + 1
            };
            if level == 0 {
                Volume::harvest_long_records(&left, left_from, left.record_count(), &mut chains);
            }
            let left_count = left.record_count();
            left.remove_records(left_from, left_count);

            // right head of the window
            let right_to = if level == 0 {
                right.find(key2.encoded()).index
            } else {
                let ri = right.child_index(right.find(key2.encoded()))?;
                match action {
                    ChildAction::Coalesced => ri + 1,
                    ChildAction::Rebalanced(_) => ri + 1,
                    ChildAction::Untouched => ri,
                }
            };
            if level == 0 {
                Volume::harvest_long_records(&right, 0, right_to, &mut chains);
            }
            right.remove_records(0, right_to);

            if let ChildAction::Rebalanced(promoted) = action {
                let child = right_child_pid
                    .ok_or_else(|| DbError::corrupt("rebalance with no child level"))?;
                match right.put(promoted, Slot::Child(child)) {
                    crate::btree::page::PutResult::Fit(_) => {}
                    crate::btree::page::PutResult::NeedsSplit => {
                        deferred.push((promoted.clone(), child, level));
                    }
                }
            }

            // pages strictly between the two edges hold only keys of
            // the deletion window; queue the whole run
            if left.right_sibling() != Some(right_pid) {
                if let Some(middle_head) = left.right_sibling() {
                    if level == 0 {
                        self.harvest_chain_long_records(middle_head, right_pid, &mut chains)?;
                    }
                    garbage.push(GarbageChain {
                        head: middle_head,
                        stop: Some(right_pid),
                        link: ChainLink::Sibling,
                    });
                }
            }
            left.set_right_sibling(Some(right_pid));

            let outcome = Page::join(&mut left, &mut right, self.join_policy());
            left.mark_dirty(ts);
            if matches!(outcome, JoinOutcome::Rebalanced(_)) {
                right.mark_dirty(ts);
            }
            outcome
        };

        for ptr in &chains {
            self.free_long_record(ptr);
        }

        match outcome {
            JoinOutcome::Coalesced => {
                // the right page is unreachable now; its own right
                // pointer still bounds the chain
                let stop = left_pod.read().unwrap().right_sibling();
                garbage.push(GarbageChain {
                    head: right_pid,
                    stop,
                    link: ChainLink::Sibling,
                });
                Ok(ChildAction::Coalesced)
            }
            JoinOutcome::Rebalanced(promoted) => Ok(ChildAction::Rebalanced(promoted)),
            JoinOutcome::RebalanceOverflow => {
                // make room by splitting the left page through the
                // normal split path, then reprocess the level from
                // scratch
                self.rebalance_split(left_pod, level, ts)?;
                Err(DbError::retry("rebalance overflow, level reprocessed"))
            }
        }
    }

    /// Harvest the long-record pointers of every record on the chain of
    /// pages `[head, stop)`.
    fn harvest_chain_long_records(
        &self,
        head: PageId,
        stop: PageId,
        chains: &mut Vec<crate::btree::page::LongRecordPointer>,
    ) -> Result<(), DbError> {
        let mut next = Some(head);
        while let Some(pid) = next {
            if pid == stop {
                break;
            }
            let pod = Database::buffer_pool().peek(&pid).ok_or_else(|| {
                self.corrupt_detail(0, Some(pid), "deletion window chain broken")
            })?;
            let page = pod.read().unwrap();
            Volume::harvest_long_records(&page, 0, page.record_count(), chains);
            next = page.right_sibling();
        }
        Ok(())
    }

    /// Rare escape hatch: the join could not find a boundary that fits
    /// both pages. Split the overloaded left page via the regular split
    /// machinery (an empty placeholder insert) and let the caller
    /// retry the removal.
    fn rebalance_split(&mut self, left_pod: &Pod<Page>, level: usize, ts: u64) -> Result<(), DbError> {
        let (sibling_pid, promoted) = {
            let sibling_pod = self
                .volume()
                .alloc_page(self.cursor_id(), left_pod.read().unwrap().category())?;
            let mut left = left_pod.write().unwrap();
            let mut sibling = sibling_pod.write().unwrap();
            let middle = left.record_count() / 2;
            let promoted = left.split_into(
                &mut sibling,
                middle,
                crate::policy::SplitPolicy::EvenBias,
            );
            left.set_right_sibling(Some(sibling.pid()));
            left.mark_dirty(ts);
            sibling.mark_dirty(ts);
            (sibling.pid(), promoted)
        };
        self.release_page(&sibling_pid);

        let promoted_key = Key::from_encoded(&promoted);
        self.store_internal(
            &promoted_key,
            StoreValue::Pointer(sibling_pid),
            level + 1,
            &StoreOptions::primordial(),
        )?;
        Ok(())
    }
}
