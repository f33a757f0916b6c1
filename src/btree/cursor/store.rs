use bytes::Bytes;
use log::debug;

use super::Cursor;
use crate::{
    btree::{
        buffer_pool::BufferPool,
        consts::{inline_value_limit, VERSIONS_OUT_OF_ORDER_RETRIES},
        mvv,
        page::{
            FoundAt, LongKind, LongRecordPointer, Page, PageCategory, PageId, PutResult,
            Slot,
        },
    },
    database::Database,
    error::{DbError, ErrorKind},
    key::Key,
    transaction::transaction_index::{tss2vh, VersionState},
    types::DbResult,
};

/// Option flags of the store path, mirrored from the operation surface:
/// FETCH, MVCC, WAIT, ONLY_IF_VISIBLE, DONT_JOURNAL.
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// Capture the prior visible value in the cursor's value area.
    pub fetch: bool,
    /// Append an MVCC version instead of replacing the slot.
    pub mvcc: bool,
    /// Block on contended claims instead of raising retry.
    pub wait: bool,
    /// Skip the write entirely when no version is visible to the
    /// transaction (or the visible version is an anti-value).
    pub only_if_visible: bool,
    pub dont_journal: bool,
}

impl StoreOptions {
    pub fn primordial() -> Self {
        Self {
            fetch: false,
            mvcc: false,
            wait: true,
            only_if_visible: false,
            dont_journal: false,
        }
    }

    pub fn transactional() -> Self {
        Self {
            mvcc: true,
            ..Self::primordial()
        }
    }

    /// The flag set of a transactional delete:
    /// MVCC | WAIT | ONLY_IF_VISIBLE | DONT_JOURNAL.
    pub fn anti_value() -> Self {
        Self {
            mvcc: true,
            only_if_visible: true,
            dont_journal: true,
            ..Self::primordial()
        }
    }
}

/// What is being stored: raw bytes at the leaf level, a child pointer
/// during split propagation and re-indexing, or a tombstone.
pub enum StoreValue<'a> {
    Raw(&'a [u8]),
    Pointer(PageId),
    Anti,
}

/// Leaf-level slot preparation outcome.
enum PreparedSlot {
    Install {
        slot: Slot,
        existed: bool,
        superseded: Option<LongRecordPointer>,
    },
    /// ONLY_IF_VISIBLE failed; nothing to write.
    NoEffect,
}

impl Cursor {
    /// Store the value under the current key. Returns whether a prior
    /// visible value existed.
    pub fn store(&mut self, value: &[u8]) -> Result<bool, DbError> {
        self.begin_op()?;
        let r = self.store_entry(value, false);
        self.end_op();
        r
    }

    /// Store and report the prior value through the value work area.
    pub fn fetch_and_store(&mut self, value: &[u8]) -> Result<bool, DbError> {
        self.begin_op()?;
        let r = self.store_entry(value, true);
        self.end_op();
        r
    }

    fn store_entry(&mut self, value: &[u8], fetch: bool) -> Result<bool, DbError> {
        let mut opts = if self.mvcc_active() {
            StoreOptions::transactional()
        } else {
            StoreOptions::primordial()
        };
        opts.fetch = fetch;
        let key = self.key.clone();
        self.store_internal(&key, StoreValue::Raw(value), 0, &opts)
    }

    /// The single store loop: insert/replace at `start_level`,
    /// propagating splits upward and growing the root when the
    /// propagation runs off the top. Used by the public store surface
    /// (level 0) and by the remove path's deferred re-indexing
    /// (level > 0).
    pub(crate) fn store_internal(
        &mut self,
        key: &Key,
        value: StoreValue,
        start_level: usize,
        opts: &StoreOptions,
    ) -> Result<bool, DbError> {
        self.volume().check_writable()?;
        self.tree().check_valid()?;
        if start_level == 0 {
            self.check_stored_key(key)?;
            self.volume()
                .stats
                .stores
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Database::mut_log_manager().throttle();
        }

        // one version handle per logical store; retries reuse it so a
        // half-done attempt is simply overwritten
        let version_handle = match (&self.transaction(), opts.mvcc) {
            (Some(tx), true) => tss2vh(tx.start_ts(), tx.next_step()),
            _ => 0,
        };

        let caller_held_tree = self.tree().claim.holds(self.cursor_id());
        let mut new_chains: Vec<LongRecordPointer> = Vec::new();

        let result =
            self.store_loop(key, &value, start_level, opts, version_handle, &mut new_chains);

        match &result {
            Ok(_) => {
                if start_level == 0 && !opts.dont_journal {
                    let value_len = match &value {
                        StoreValue::Raw(b) => b.len(),
                        _ => 0,
                    };
                    Database::mut_log_manager()
                        .log_store(self.tree().name(), key, value_len)
                        .ok();
                }
                self.tree().bump_change_count();
            }
            Err(_) => {
                for ptr in new_chains.drain(..) {
                    self.free_long_record(&ptr);
                }
                self.release_all_page_claims();
            }
        }

        if !caller_held_tree {
            self.tree().claim.release(self.cursor_id());
        }
        self.volume().sweep_garbage();
        result
    }

    fn store_loop(
        &mut self,
        key: &Key,
        value: &StoreValue,
        start_level: usize,
        opts: &StoreOptions,
        version_handle: u64,
        new_chains: &mut Vec<LongRecordPointer>,
    ) -> Result<bool, DbError> {
        let index = Database::transaction_index();
        let mut ooo_retries = 0;

        loop {
            // writers keep at least a reader claim on the tree for the
            // whole attempt; a range remove holding the writer claim
            // therefore excludes every store, fast path included
            if !self.tree().claim.holds(self.cursor_id()) {
                self.tree().claim.claim_read(self.cursor_id())?;
            }

            let attempt =
                self.store_attempt(key, value, start_level, opts, version_handle, new_chains);
            let err = match attempt {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };

            // every retry starts from scratch: no claims, no chains
            self.release_all_page_claims();
            for ptr in new_chains.drain(..) {
                self.free_long_record(&ptr);
            }

            match err.kind() {
                ErrorKind::Retry => continue,
                ErrorKind::VersionsOutOfOrder => {
                    ooo_retries += 1;
                    if ooo_retries >= VERSIONS_OUT_OF_ORDER_RETRIES {
                        return Err(err);
                    }
                    continue;
                }
                ErrorKind::WwRetry => {
                    // wait for the rival with no claims held at all
                    self.tree().claim.release(self.cursor_id());
                    let vh = err.conflict_handle().unwrap_or(0);
                    match index.wait_for(vh, Database::config().ww_timeout) {
                        VersionState::Committed(tc) => {
                            return Err(DbError::rollback(&format!(
                                "rival transaction committed at {} while storing {}",
                                tc,
                                hex::encode(key.encoded()),
                            )));
                        }
                        VersionState::Aborted => continue,
                        VersionState::Active => {
                            return Err(DbError::rollback(
                                "write-write dependency timed out",
                            ));
                        }
                    }
                }
                _ => return Err(err),
            }
        }
    }

    fn store_attempt(
        &mut self,
        key: &Key,
        value: &StoreValue,
        start_level: usize,
        opts: &StoreOptions,
        version_handle: u64,
        new_chains: &mut Vec<LongRecordPointer>,
    ) -> Result<bool, DbError> {
        let inline_limit = inline_value_limit(BufferPool::get_page_size());
        let mut existed = false;

        // a raw primordial value that exceeds the inline limit goes to
        // a long-record chain before any page claim is taken
        let mut pending_slot: Slot = match value {
            StoreValue::Raw(b) if !opts.mvcc && b.len() > inline_limit => {
                let ptr = self.write_long_record(b, LongKind::Raw)?;
                new_chains.push(ptr);
                Slot::Long(ptr)
            }
            StoreValue::Raw(b) => Slot::Primordial(Bytes::copy_from_slice(b)),
            StoreValue::Anti => Slot::AntiValue,
            StoreValue::Pointer(pid) => Slot::Child(*pid),
        };
        let mut pending_key: Vec<u8> = key.encoded().to_vec();
        let mut level = start_level;
        let mut left_of_pending: Option<PageId> = None;

        loop {
            if level >= self.tree().depth() {
                self.ensure_tree_writer()?;
                if level < self.tree().depth() {
                    // a rival grew the tree while we acquired the claim
                    continue;
                }
                self.grow_root(level, left_of_pending, &pending_key, &pending_slot)?;
                return Ok(existed);
            }

            let (page_pod, found_at) = if level == 0 {
                self.search(&pending_key, true)?
            } else {
                self.search_tree(&pending_key, level, true)?
            };
            let pid = page_pod.read().unwrap().pid();

            // leaf-level slot resolution: MVCC dance, fetch capture,
            // superseded-chain harvest
            let mut superseded: Option<LongRecordPointer> = None;
            let install_slot = if level == start_level && !matches!(value, StoreValue::Pointer(_)) {
                let raw_payload: Option<&[u8]> = match value {
                    StoreValue::Raw(b) => Some(*b),
                    _ => None,
                };
                let prepared = {
                    let page = page_pod.read().unwrap();
                    self.prepare_leaf_slot(
                        &page,
                        found_at,
                        raw_payload,
                        opts,
                        version_handle,
                        new_chains,
                    )?
                };
                match prepared {
                    PreparedSlot::NoEffect => {
                        self.release_page(&pid);
                        return Ok(false);
                    }
                    PreparedSlot::Install {
                        slot,
                        existed: e,
                        superseded: s,
                    } => {
                        existed = e;
                        superseded = s;
                        slot
                    }
                }
            } else {
                pending_slot.clone()
            };

            let put_result = {
                let mut page = page_pod.write().unwrap();
                page.put(&pending_key, install_slot.clone())
            };

            match put_result {
                PutResult::Fit(fit_at) => {
                    let ts = Database::timestamps().update_timestamp();
                    let generation = {
                        let mut page = page_pod.write().unwrap();
                        page.mark_dirty(ts);
                        page.generation()
                    };
                    let entry = self.level_cache.entry(level);
                    entry.update(&page_pod, pid, generation, fit_at);
                    entry.last_insert_at = fit_at.index;
                    self.release_page(&pid);

                    if let Some(old) = superseded {
                        self.free_long_record(&old);
                    }
                    return Ok(existed);
                }
                PutResult::NeedsSplit => {
                    if !self.tree().claim.is_writer(self.cursor_id()) {
                        // try to win space back by pruning the page's
                        // MVV containers before escalating
                        let refit = {
                            let mut page = page_pod.write().unwrap();
                            self.prune_page_mvvs(&mut page)?
                                && matches!(
                                    page.put(&pending_key, install_slot.clone()),
                                    PutResult::Fit(_)
                                )
                        };
                        if refit {
                            let ts = Database::timestamps().update_timestamp();
                            page_pod.write().unwrap().mark_dirty(ts);
                            self.release_page(&pid);
                            if let Some(old) = superseded {
                                self.free_long_record(&old);
                            }
                            return Ok(existed);
                        }

                        self.release_page(&pid);
                        self.ensure_tree_writer()?;
                        // restart this level under the stronger claim
                        continue;
                    }

                    // split: sibling is linked into the chain before
                    // the parent learns about it
                    let sibling_pod = self
                        .volume()
                        .alloc_page(self.cursor_id(), page_pod.read().unwrap().category())?;
                    let (promoted, sibling_pid) = {
                        let mut page = page_pod.write().unwrap();
                        let mut sibling = sibling_pod.write().unwrap();

                        let insert_at = page.find(&pending_key).index;
                        let promoted =
                            page.split_into(&mut sibling, insert_at, self.split_policy());

                        let target: &mut Page = if pending_key.as_slice() < promoted.as_slice()
                        {
                            &mut *page
                        } else {
                            &mut *sibling
                        };
                        match target.put(&pending_key, install_slot.clone()) {
                            PutResult::Fit(_) => {}
                            PutResult::NeedsSplit => {
                                return Err(self.corrupt_detail(
                                    level,
                                    Some(pid),
                                    "record does not fit either half after split",
                                ));
                            }
                        }

                        page.set_right_sibling(Some(sibling.pid()));
                        let ts = Database::timestamps().update_timestamp();
                        page.mark_dirty(ts);
                        sibling.mark_dirty(ts);
                        (promoted, sibling.pid())
                    };
                    debug!(
                        "split level {}: {} -> {} promoted {}",
                        level,
                        pid.get_short_repr(),
                        sibling_pid.get_short_repr(),
                        hex::encode(&promoted),
                    );

                    self.release_page(&pid);
                    self.release_page(&sibling_pid);

                    if let Some(old) = superseded {
                        self.free_long_record(&old);
                    }

                    left_of_pending = Some(pid);
                    pending_key = promoted;
                    pending_slot = Slot::Child(sibling_pid);
                    level += 1;
                }
            }
        }
    }

    /// Resolve what actually lands in the leaf slot. For MVCC stores
    /// this is the pruned container with the new version appended (or
    /// converted to a long MVV); for primordial stores the pending slot
    /// itself, with bookkeeping for fetch and superseded chains.
    fn prepare_leaf_slot(
        &mut self,
        page: &Page,
        found_at: FoundAt,
        raw_payload: Option<&[u8]>,
        opts: &StoreOptions,
        version_handle: u64,
        new_chains: &mut Vec<LongRecordPointer>,
    ) -> Result<PreparedSlot, DbError> {
        let index = Database::transaction_index();
        let inline_limit = inline_value_limit(BufferPool::get_page_size());

        let existing: Option<Slot> = if found_at.exact {
            Some(page.record(found_at.index).slot.clone())
        } else {
            None
        };

        if !opts.mvcc {
            let (reader_ts, reader_step) = self.reader_view();
            let existed = match &existing {
                None => false,
                Some(slot) => self
                    .resolve_visible_slot(slot, reader_ts, reader_step, if opts.fetch { i64::MAX } else { -1 })?
                    .map(|old| {
                        if opts.fetch {
                            self.value = Some(old);
                        }
                        true
                    })
                    .unwrap_or(false),
            };
            if opts.only_if_visible && !existed {
                return Ok(PreparedSlot::NoEffect);
            }

            let superseded = match &existing {
                Some(Slot::Long(ptr)) => Some(*ptr),
                _ => None,
            };
            let slot = match raw_payload {
                Some(b) if b.len() > inline_limit => {
                    // already converted by the caller; rebuild defensively
                    match new_chains.last() {
                        Some(ptr) => Slot::Long(*ptr),
                        None => {
                            let ptr = self.write_long_record(b, LongKind::Raw)?;
                            new_chains.push(ptr);
                            Slot::Long(ptr)
                        }
                    }
                }
                Some(b) => Slot::Primordial(Bytes::copy_from_slice(b)),
                None => Slot::AntiValue,
            };
            return Ok(PreparedSlot::Install {
                slot,
                existed,
                superseded,
            });
        }

        // --- MVCC path ---
        let tx = self.transaction().ok_or_else(|| {
            DbError::new(ErrorKind::Unsupported, "MVCC store without a transaction")
        })?;

        let (mut container, superseded) = match &existing {
            None => (mvv::new_container(), None),
            Some(Slot::Primordial(b)) => (mvv::from_primordial(Some(b)), None),
            Some(Slot::AntiValue) => (mvv::from_primordial(None), None),
            Some(Slot::Mvv(bytes)) => (bytes.clone(), None),
            Some(Slot::Long(ptr)) => {
                let bytes = self.read_long_record(ptr, i64::MAX)?;
                let container = match ptr.kind {
                    LongKind::Mvv => bytes,
                    LongKind::Raw => mvv::from_primordial(Some(&bytes)),
                };
                (container, Some(*ptr))
            }
            Some(Slot::Child(_)) => {
                return Err(DbError::corrupt("child pointer in a data slot"))
            }
        };

        // prune obsolete versions in place before visiting
        match mvv::prune(&container, index)? {
            mvv::Pruned::Unchanged => {}
            mvv::Pruned::Rewritten(c) => container = c,
            mvv::Pruned::CollapsedValue(v) => container = mvv::from_primordial(Some(&v)),
            mvv::Pruned::CollapsedAnti => container = mvv::from_primordial(None),
        }

        // write-write dependency pass
        match mvv::store_check(&container, index, tx.start_ts())? {
            mvv::StoreCheck::Clear { .. } => {}
            mvv::StoreCheck::Conflict { committer_ts } => {
                return Err(DbError::rollback(&format!(
                    "write-write conflict with transaction committed at {}",
                    committer_ts
                )));
            }
            mvv::StoreCheck::Retry { handle } => {
                return Err(DbError::ww_retry(handle));
            }
        }

        // visibility gate and fetch capture
        let visible_value = match mvv::fetch_visible(
            &container,
            index,
            tx.start_ts(),
            tx.current_step(),
        )? {
            mvv::Visible::Value(p) => Some(p.to_vec()),
            _ => None,
        };
        let existed = visible_value.is_some();
        if opts.only_if_visible && !existed {
            return Ok(PreparedSlot::NoEffect);
        }
        if opts.fetch {
            self.value = visible_value;
        }

        mvv::append_version(&mut container, version_handle, raw_payload)?;

        let slot = if container.len() > inline_limit {
            let ptr = self.write_long_record(&container, LongKind::Mvv)?;
            new_chains.push(ptr);
            Slot::Long(ptr)
        } else {
            Slot::Mvv(container)
        };

        Ok(PreparedSlot::Install {
            slot,
            existed,
            superseded,
        })
    }

    fn grow_root(
        &mut self,
        level: usize,
        left_of_pending: Option<PageId>,
        pending_key: &[u8],
        pending_slot: &Slot,
    ) -> DbResult {
        let old_root = left_of_pending.ok_or_else(|| {
            self.corrupt_detail(level, None, "root growth without a split below")
        })?;
        debug_assert_eq!(old_root, self.tree().root());

        let new_root_pod = self
            .volume()
            .alloc_page(self.cursor_id(), PageCategory::for_level(level))?;
        let new_root_pid = {
            let mut new_root = new_root_pod.write().unwrap();
            // the left guard is the empty key: every key descends at or
            // after it
            new_root.put(b"", Slot::Child(old_root));
            new_root.put(pending_key, pending_slot.clone());
            let ts = Database::timestamps().update_timestamp();
            new_root.mark_dirty(ts);
            new_root.pid()
        };
        self.release_page(&new_root_pid);

        self.tree().grow(new_root_pid);
        debug!(
            "tree {} grew to depth {}, new root {}",
            self.tree().name(),
            self.tree().depth(),
            new_root_pid.get_short_repr(),
        );
        Ok(())
    }

    pub(crate) fn ensure_tree_writer(&mut self) -> DbResult {
        let id = self.cursor_id();
        if self.tree().claim.is_writer(id) {
            return Ok(());
        }
        if self.tree().claim.holds(id) {
            if self.tree().claim.try_upgrade(id).is_ok() {
                return Ok(());
            }
            self.tree().claim.release(id);
        }
        // claims must not be held while we block on the tree claim
        self.release_all_page_claims();
        self.tree().claim.claim_write(id)
    }

    /// Prune every MVV container on the page, reclaiming space from
    /// obsolete versions. Returns whether anything shrank.
    pub(crate) fn prune_page_mvvs(&self, page: &mut Page) -> Result<bool, DbError> {
        let index = Database::transaction_index();
        let mut changed = false;
        for i in 0..page.record_count() {
            let rewritten = match &page.record(i).slot {
                Slot::Mvv(container) => match mvv::prune(container, index)? {
                    mvv::Pruned::Unchanged => None,
                    mvv::Pruned::Rewritten(c) => Some(Slot::Mvv(c)),
                    mvv::Pruned::CollapsedValue(v) => {
                        Some(Slot::Primordial(Bytes::from(v)))
                    }
                    mvv::Pruned::CollapsedAnti => Some(Slot::AntiValue),
                },
                _ => None,
            };
            if let Some(slot) = rewritten {
                page.replace_slot(i, slot);
                changed = true;
            }
        }
        Ok(changed)
    }

    fn check_stored_key(&self, key: &Key) -> DbResult {
        if key.is_empty() {
            return Err(DbError::new(ErrorKind::InvalidKey, "empty key"));
        }
        let max = crate::btree::consts::max_key_len(BufferPool::get_page_size());
        if key.len() > max {
            return Err(DbError::new(
                ErrorKind::KeyTooLong,
                &format!("encoded key length {} exceeds {}", key.len(), max),
            ));
        }
        Ok(())
    }
}
