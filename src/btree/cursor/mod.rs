mod remove;
mod search;
mod store;
mod traverse;

use core::fmt;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{self, ThreadId},
};

use log::debug;

use crate::{
    database::Database,
    error::{DbError, ErrorKind},
    key::Key,
    policy::{JoinPolicy, SplitPolicy},
    transaction::{Permission, Transaction},
    types::{DbResult, Pod, ResultPod},
};

use super::{
    buffer_pool::BufferPool,
    consts::{long_record_chunk, max_key_len},
    level_cache::LevelCache,
    mvv,
    page::{LongKind, LongRecordPointer, Page, PageCategory, PageId, Slot},
    tree::Tree,
    volume::{ChainLink, GarbageChain, Volume},
};

pub use store::{StoreOptions, StoreValue};
pub use traverse::{Direction, TraverseVisitor};

/// One bucket of a key histogram: the first key of a data page and how
/// many records the page holds.
#[derive(Debug, Clone)]
pub struct HistogramSample {
    pub key: Vec<u8>,
    pub records: usize,
}

/// The handle through which all tree operations run: it owns the key
/// and value work areas, the per-level traversal cache, and the claim
/// bookkeeping of one flow of control.
///
/// A cursor is confined to one thread at a time. It records the last
/// thread that used it and rejects interleaved use.
pub struct Cursor {
    id: u64,
    volume: Arc<Volume>,
    tree: Arc<Tree>,

    pub(crate) key: Key,
    pub(crate) value: Option<Vec<u8>>,
    pub(crate) spare_key: Key,

    pub(crate) level_cache: LevelCache,

    transaction: Option<Transaction>,
    /// Set for the directory tree and other internal exchanges that
    /// bypass MVCC even inside a transaction.
    mvcc_disabled: bool,

    split_policy: SplitPolicy,
    join_policy: JoinPolicy,

    busy: AtomicBool,
    last_thread: Mutex<Option<ThreadId>>,
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor").field("id", &self.id).finish()
    }
}

impl Cursor {
    /// Open a cursor on `tree_name` within the volume, creating the
    /// tree if asked to.
    pub fn open(volume: &Arc<Volume>, tree_name: &str, create: bool) -> Result<Cursor, DbError> {
        let tree = volume.get_tree(tree_name, create)?;
        let config = Database::config();
        Ok(Cursor {
            id: Database::next_cursor_id(),
            volume: volume.clone(),
            tree,
            key: Key::new(),
            value: None,
            spare_key: Key::new(),
            level_cache: LevelCache::new(),
            transaction: None,
            mvcc_disabled: false,
            split_policy: config.default_split_policy,
            join_policy: config.default_join_policy,
            busy: AtomicBool::new(false),
            last_thread: Mutex::new(None),
        })
    }

    pub fn open_with_transaction(
        volume: &Arc<Volume>,
        tree_name: &str,
        create: bool,
        tx: Transaction,
    ) -> Result<Cursor, DbError> {
        let mut cursor = Self::open(volume, tree_name, create)?;
        cursor.transaction = Some(tx);
        Ok(cursor)
    }

    pub fn set_transaction(&mut self, tx: Option<Transaction>) {
        self.transaction = tx;
    }

    pub fn transaction(&self) -> Option<Transaction> {
        self.transaction
    }

    /// Explicit no-MVCC mode: stores and removes work on primordial
    /// values even when a transaction is bound. The directory tree
    /// runs in this mode.
    pub fn set_mvcc_disabled(&mut self, disabled: bool) {
        self.mvcc_disabled = disabled;
    }

    pub(crate) fn mvcc_active(&self) -> bool {
        !self.mvcc_disabled
            && self
                .transaction
                .as_ref()
                .map(|tx| tx.is_active())
                .unwrap_or(false)
    }

    pub fn volume(&self) -> &Arc<Volume> {
        &self.volume
    }

    pub fn tree(&self) -> &Arc<Tree> {
        &self.tree
    }

    pub fn set_split_policy(&mut self, policy: SplitPolicy) {
        self.split_policy = policy;
    }

    pub fn set_join_policy(&mut self, policy: JoinPolicy) {
        self.join_policy = policy;
    }

    pub(crate) fn split_policy(&self) -> SplitPolicy {
        self.split_policy
    }

    pub(crate) fn join_policy(&self) -> JoinPolicy {
        self.join_policy
    }

    // ------------------------------------------------------------------
    // key / value work areas

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn key_mut(&mut self) -> &mut Key {
        &mut self.key
    }

    pub fn get_key(&self) -> &Key {
        &self.key
    }

    pub fn get_value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    pub fn clear_value(&mut self) {
        self.value = None;
    }

    // ------------------------------------------------------------------
    // thread confinement

    pub(crate) fn begin_op(&self) -> DbResult {
        if self.busy.swap(true, Ordering::Acquire) {
            let last = *self.last_thread.lock().unwrap();
            return Err(DbError::new(
                ErrorKind::WrongThread,
                &format!(
                    "cursor {} already in use by {:?}, current thread {:?}",
                    self.id,
                    last,
                    thread::current().id()
                ),
            ));
        }
        *self.last_thread.lock().unwrap() = Some(thread::current().id());
        Ok(())
    }

    pub(crate) fn end_op(&self) {
        self.busy.store(false, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // claim plumbing

    pub(crate) fn cursor_id(&self) -> u64 {
        self.id
    }

    pub(crate) fn claim_page(
        &self,
        pid: &PageId,
        perm: Permission,
        wait: bool,
    ) -> ResultPod<Page> {
        Database::buffer_pool().get(self.id, perm, pid, wait)
    }

    pub(crate) fn release_page(&self, pid: &PageId) {
        Database::buffer_pool().release(self.id, pid);
    }

    /// Release every page claim this cursor still holds. The tree claim
    /// is handled separately: retry loops usually keep it.
    pub(crate) fn release_all_page_claims(&self) {
        Database::concurrent_status().release_all(self.id);
    }

    pub(crate) fn release_all_claims(&self) {
        self.release_all_page_claims();
        self.tree.claim.release(self.id);
    }

    /// The (timestamp, step) pair this cursor reads at: its own
    /// transaction when one is active, otherwise a snapshot of the
    /// current timestamp.
    pub(crate) fn reader_view(&self) -> (u64, u16) {
        match &self.transaction {
            Some(tx) if tx.is_active() && !self.mvcc_disabled => {
                (tx.start_ts(), tx.current_step())
            }
            _ => (Database::timestamps().current(), 0),
        }
    }

    pub(crate) fn check_key_valid(&self) -> DbResult {
        if self.key.is_empty() {
            return Err(DbError::new(ErrorKind::InvalidKey, "empty key"));
        }
        let max = max_key_len(BufferPool::get_page_size());
        if self.key.len() > max {
            return Err(DbError::new(
                ErrorKind::KeyTooLong,
                &format!("encoded key length {} exceeds {}", self.key.len(), max),
            ));
        }
        Ok(())
    }

    /// A detail snapshot for corruption reports.
    pub(crate) fn corrupt_detail(&self, level: usize, pid: Option<PageId>, msg: &str) -> DbError {
        let err = DbError::corrupt(&format!(
            "{}; tree: {}, volume: {}, level: {}, page: {:?}, key: {}",
            msg,
            self.tree.name(),
            self.volume.path(),
            level,
            pid,
            hex::encode(self.key.encoded()),
        ));
        err.show_backtrace();
        err
    }

    // ------------------------------------------------------------------
    // fetch

    /// Fetch the value under the current key. Returns whether a visible
    /// value exists; the value work area holds it afterwards.
    pub fn fetch(&mut self) -> Result<bool, DbError> {
        self.begin_op()?;
        let r = self.fetch_internal(i64::MAX);
        self.end_op();
        r
    }

    /// Like `fetch`, but reads at most `min_bytes` of the value
    /// (negative: presence check only, value untouched).
    pub fn fetch_limited(&mut self, min_bytes: i64) -> Result<bool, DbError> {
        self.begin_op()?;
        let r = self.fetch_internal(min_bytes);
        self.end_op();
        r
    }

    pub(crate) fn fetch_internal(&mut self, min_bytes: i64) -> Result<bool, DbError> {
        self.volume.check_open()?;
        self.tree.check_valid()?;
        self.check_key_valid()?;
        self.volume.stats.fetches.fetch_add(1, Ordering::Relaxed);

        let (reader_ts, reader_step) = self.reader_view();
        let probe = self.key.clone();

        let result = (|| {
            let (page_pod, found_at) = self.search(probe.encoded(), false)?;
            let slot = {
                let page = page_pod.read().unwrap();
                if found_at.exact {
                    Some(page.record(found_at.index).slot.clone())
                } else {
                    None
                }
            };
            self.release_page(&page_pod.read().unwrap().pid());

            match slot {
                None => Ok(None),
                Some(slot) => {
                    self.resolve_visible_slot(&slot, reader_ts, reader_step, min_bytes)
                }
            }
        })();

        match result {
            Ok(visible) => {
                let present = visible.is_some();
                if min_bytes >= 0 {
                    self.value = visible;
                }
                Ok(present)
            }
            Err(e) => {
                self.release_all_page_claims();
                Err(e)
            }
        }
    }

    /// Resolve a slot to the value visible at `(reader_ts, reader_step)`.
    /// `None` means not present (missing version or anti-value).
    /// `limit` caps materialization: negative returns an empty marker
    /// for visible values without touching long-record chains where
    /// possible.
    pub(crate) fn resolve_visible_slot(
        &self,
        slot: &Slot,
        reader_ts: u64,
        reader_step: u16,
        limit: i64,
    ) -> Result<Option<Vec<u8>>, DbError> {
        let index = Database::transaction_index();
        match slot {
            Slot::Primordial(b) => Ok(Some(Self::clip(b, limit))),
            Slot::AntiValue => Ok(None),
            Slot::Child(_) => Err(DbError::corrupt("child pointer in a data slot")),
            Slot::Long(ptr) => match ptr.kind {
                LongKind::Raw => {
                    if limit < 0 {
                        return Ok(Some(Vec::new()));
                    }
                    Ok(Some(self.read_long_record(ptr, limit)?))
                }
                LongKind::Mvv => {
                    let container = self.read_long_record(ptr, i64::MAX)?;
                    match mvv::fetch_visible(&container, index, reader_ts, reader_step)? {
                        mvv::Visible::Value(p) => Ok(Some(Self::clip(p, limit))),
                        _ => Ok(None),
                    }
                }
            },
            Slot::Mvv(container) => {
                match mvv::fetch_visible(container, index, reader_ts, reader_step)? {
                    mvv::Visible::Value(p) => Ok(Some(Self::clip(p, limit))),
                    _ => Ok(None),
                }
            }
        }
    }

    fn clip(bytes: &[u8], limit: i64) -> Vec<u8> {
        if limit >= 0 && (limit as usize) < bytes.len() {
            bytes[..limit as usize].to_vec()
        } else {
            bytes.to_vec()
        }
    }

    // ------------------------------------------------------------------
    // long records

    /// Write `bytes` as a chain of LONG_RECORD pages and return the
    /// descriptor. The chain is not reachable from the tree until the
    /// descriptor is installed, so no claims are involved.
    pub(crate) fn write_long_record(
        &self,
        bytes: &[u8],
        kind: LongKind,
    ) -> Result<LongRecordPointer, DbError> {
        let chunk = long_record_chunk(BufferPool::get_page_size());
        debug!(
            "writing long record of {} bytes ({} pages)",
            bytes.len(),
            (bytes.len() + chunk - 1) / chunk,
        );

        let mut head: Option<PageId> = None;
        let mut prev: Option<Pod<Page>> = None;
        for piece in bytes.chunks(chunk.max(1)) {
            let pod = self.volume.alloc_unclaimed_page(PageCategory::LongRecord);
            let pid = pod.read().unwrap().pid();
            pod.write().unwrap().set_long_payload(piece.to_vec());
            if head.is_none() {
                head = Some(pid);
            }
            if let Some(prev) = prev.take() {
                prev.write().unwrap().set_long_next(Some(pid));
            }
            prev = Some(pod);
        }

        let head = head.ok_or_else(|| DbError::corrupt("empty long record"))?;
        Ok(LongRecordPointer {
            size: bytes.len() as u64,
            head,
            kind,
        })
    }

    /// Read back a long-record chain, up to `limit` bytes when the
    /// limit is non-negative.
    pub(crate) fn read_long_record(
        &self,
        ptr: &LongRecordPointer,
        limit: i64,
    ) -> Result<Vec<u8>, DbError> {
        let want = if limit < 0 {
            0
        } else {
            (limit as u64).min(ptr.size) as usize
        };
        let mut out = Vec::with_capacity(want.min(ptr.size as usize));

        let mut next = Some(ptr.head);
        while let Some(pid) = next {
            let pod = Database::buffer_pool().peek(&pid).ok_or_else(|| {
                DbError::corrupt(&format!("long record chain broken at {}", pid))
            })?;
            let page = pod.read().unwrap();
            if page.category() != PageCategory::LongRecord {
                return Err(DbError::corrupt(&format!(
                    "page {} in long record chain has type {}",
                    pid,
                    page.category()
                )));
            }
            out.extend_from_slice(page.long_payload());
            if out.len() >= want {
                out.truncate(want);
                break;
            }
            next = page.long_next();
        }

        if (out.len() as u64) < want as u64 {
            return Err(DbError::corrupt(&format!(
                "long record truncated: wanted {} got {}",
                want,
                out.len()
            )));
        }
        Ok(out)
    }

    /// Queue a superseded or removed chain for the deallocation sweep.
    pub(crate) fn free_long_record(&self, ptr: &LongRecordPointer) {
        self.volume.record_garbage_chain(GarbageChain {
            head: ptr.head,
            stop: None,
            link: ChainLink::Long,
        });
    }

    // ------------------------------------------------------------------
    // convenience iteration

    pub fn next(&mut self) -> Result<bool, DbError> {
        self.traverse(Direction::Gt, true, i64::MAX)
    }

    pub fn previous(&mut self) -> Result<bool, DbError> {
        self.traverse(Direction::Lt, true, i64::MAX)
    }

    pub fn has_next(&mut self) -> Result<bool, DbError> {
        self.traverse(Direction::Gt, true, -1)
    }

    pub fn has_previous(&mut self) -> Result<bool, DbError> {
        self.traverse(Direction::Lt, true, -1)
    }

    /// Whether the current key has at least one descendant key.
    pub fn has_children(&mut self) -> Result<bool, DbError> {
        let prefix_len = self.key.len();
        if prefix_len == 0 {
            return Err(DbError::new(ErrorKind::InvalidKey, "empty key"));
        }
        self.begin_op()?;
        let r = self.traverse_internal(Direction::Gt, true, -1, 0, prefix_len, None);
        self.end_op();
        r
    }

    // ------------------------------------------------------------------
    // tree removal

    /// Invalidate the tree, drop it from the volume directory and free
    /// all of its pages.
    pub fn remove_tree(&mut self) -> Result<(), DbError> {
        self.begin_op()?;
        let r = self.remove_tree_internal();
        self.end_op();
        r
    }

    fn remove_tree_internal(&mut self) -> Result<(), DbError> {
        self.volume.check_writable()?;
        self.tree.claim.claim_write(self.id)?;

        let result = (|| -> DbResult {
            self.tree.check_valid()?;
            let (root, depth, _) = self.tree.snapshot();

            // every level is one sibling chain starting at the leftmost
            // page; walk down the leftmost spine recording one garbage
            // chain per level
            let mut level_head = root;
            for level in (0..depth).rev() {
                self.volume.record_garbage_chain(GarbageChain {
                    head: level_head,
                    stop: None,
                    link: ChainLink::Sibling,
                });
                if level > 0 {
                    let pod = Database::buffer_pool().peek(&level_head).ok_or_else(
                        || self.corrupt_detail(level, Some(level_head), "missing page"),
                    )?;
                    let page = pod.read().unwrap();
                    // harvest long records from every leaf later; index
                    // levels only carry pointers
                    level_head = page.child_at(0)?;
                }
            }

            // harvest long-record chains from the leaf level before the
            // sweep frees the leaves
            let mut chains = Vec::new();
            let mut next = Some(level_head);
            while let Some(pid) = next {
                let pod = Database::buffer_pool().peek(&pid).ok_or_else(|| {
                    self.corrupt_detail(0, Some(pid), "missing leaf during removal")
                })?;
                let page = pod.read().unwrap();
                Volume::harvest_long_records(&page, 0, page.record_count(), &mut chains);
                next = page.right_sibling();
            }
            for ptr in &chains {
                self.free_long_record(ptr);
            }

            self.tree.invalidate();
            self.volume.drop_directory_entry(self.tree.name());
            Database::mut_log_manager().log_tree("remove", self.tree.name())?;
            Ok(())
        })();

        self.tree.claim.release(self.id);
        self.volume.sweep_garbage();
        self.level_cache.invalidate_all();
        result
    }

    // ------------------------------------------------------------------
    // histogram & page export

    /// Sample the key ranges of the tree: one bucket per data page.
    pub fn key_histogram(&mut self) -> Result<Vec<HistogramSample>, DbError> {
        self.begin_op()?;
        let r = self.key_histogram_internal();
        self.end_op();
        r
    }

    fn key_histogram_internal(&mut self) -> Result<Vec<HistogramSample>, DbError> {
        self.tree.check_valid()?;
        self.tree.claim.claim_read(self.id)?;

        let result = (|| {
            let mut samples = Vec::new();
            let (page_pod, _) = self.search_tree(&[], 0, false)?;
            let mut current = page_pod;
            loop {
                let (sample, next) = {
                    let page = current.read().unwrap();
                    (
                        HistogramSample {
                            key: page.first_key().map(|k| k.to_vec()).unwrap_or_default(),
                            records: page.record_count(),
                        },
                        page.right_sibling(),
                    )
                };
                if sample.records > 0 {
                    samples.push(sample);
                }
                match next {
                    None => break,
                    Some(next_pid) => {
                        let next_pod =
                            self.claim_page(&next_pid, Permission::ReadOnly, true)?;
                        self.release_page(&current.read().unwrap().pid());
                        current = next_pod;
                    }
                }
            }
            self.release_page(&current.read().unwrap().pid());
            Ok(samples)
        })();

        self.tree.claim.release(self.id);
        if result.is_err() {
            self.release_all_page_claims();
        }
        result
    }

    /// Copy the page images of the whole tree, top level first. Backup
    /// tooling feeds on this.
    pub fn export_pages(&mut self) -> Result<Vec<Vec<u8>>, DbError> {
        self.begin_op()?;
        let r = self.export_pages_internal();
        self.end_op();
        r
    }

    fn export_pages_internal(&mut self) -> Result<Vec<Vec<u8>>, DbError> {
        self.tree.check_valid()?;
        self.tree.claim.claim_read(self.id)?;

        let result = (|| {
            let mut images = Vec::new();
            let (root, depth, _) = self.tree.snapshot();
            let mut level_head = root;
            for level in (0..depth).rev() {
                let mut next = Some(level_head);
                let mut first = true;
                while let Some(pid) = next {
                    let pod = self.claim_page(&pid, Permission::ReadOnly, true)?;
                    let page = pod.read().unwrap();
                    if first && level > 0 {
                        level_head = page.child_at(0)?;
                        first = false;
                    }
                    images.push(page.encode());
                    next = page.right_sibling();
                    drop(page);
                    self.release_page(&pid);
                }
            }
            Ok(images)
        })();

        self.tree.claim.release(self.id);
        if result.is_err() {
            self.release_all_page_claims();
        }
        result
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<cursor {} on {} key {}>",
            self.id,
            self.tree.name(),
            self.key
        )
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.release_all_claims();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn test_cursor(name: &str) -> Cursor {
        let path = std::env::temp_dir().join(format!(
            "blink_unit_{}_{}.db",
            name,
            std::process::id()
        ));
        let volume = Volume::create(path).unwrap();
        Cursor::open(&volume, "t", true).unwrap()
    }

    #[test]
    fn test_interleaved_use_rejected() {
        let mut cursor = test_cursor("confined");
        cursor.key.append_str("k");
        cursor.store(b"v").unwrap();

        // an operation left open (e.g. by a hung thread) blocks any
        // further use of the handle
        cursor.begin_op().unwrap();
        let err = cursor.fetch().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WrongThread);
        cursor.end_op();

        assert!(cursor.fetch().unwrap());
    }

    #[test]
    fn test_long_record_chain_shapes() {
        let cursor = test_cursor("chain");
        let bytes: Vec<u8> = (0..100_000).map(|i| (i % 13) as u8).collect();

        let ptr = cursor.write_long_record(&bytes, LongKind::Raw).unwrap();
        assert_eq!(ptr.size, bytes.len() as u64);

        let back = cursor.read_long_record(&ptr, i64::MAX).unwrap();
        assert_eq!(back, bytes);

        let prefix = cursor.read_long_record(&ptr, 10).unwrap();
        assert_eq!(prefix, &bytes[..10]);
    }
}
