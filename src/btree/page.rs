use core::fmt;
use std::convert::TryInto;

use bytes::Bytes;

use super::{
    buffer_pool::BufferPool,
    consts::{PAGE_HEADER_BYTES, RECORD_OVERHEAD},
};
use crate::{
    error::{DbError, ErrorKind},
    policy::{JoinPolicy, SplitPolicy},
};

/// Address of a page: which volume it belongs to plus its index within
/// that volume's file.
#[derive(PartialEq, Eq, Hash, Copy, Clone, PartialOrd, Ord)]
pub struct PageId {
    pub volume_id: u32,
    pub index: u64,
}

impl PageId {
    pub fn new(volume_id: u32, index: u64) -> Self {
        Self { volume_id, index }
    }

    pub fn get_short_repr(&self) -> String {
        format!("v{}p{}", self.volume_id, self.index)
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<page v{} #{}>", self.volume_id, self.index)
    }
}

impl fmt::Debug for PageId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

#[derive(PartialEq, Eq, Hash, Copy, Clone)]
pub enum PageCategory {
    /// Leaf page holding key/value records; level 0 of the tree.
    Data,
    /// Index page at the given level (1 and up).
    Index(u8),
    /// One page of a long-record chain.
    LongRecord,
}

impl PageCategory {
    pub fn for_level(level: usize) -> Self {
        if level == 0 {
            PageCategory::Data
        } else {
            PageCategory::Index(level as u8)
        }
    }

    /// Tree level of this category, if it participates in the tree.
    pub fn level(&self) -> Option<usize> {
        match self {
            PageCategory::Data => Some(0),
            PageCategory::Index(l) => Some(*l as usize),
            PageCategory::LongRecord => None,
        }
    }
}

impl fmt::Display for PageCategory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PageCategory::Data => write!(f, "DATA"),
            PageCategory::Index(l) => write!(f, "INDEX_{}", l),
            PageCategory::LongRecord => write!(f, "LONG_RECORD"),
        }
    }
}

impl fmt::Debug for PageCategory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// A position within a page: the key-block index plus a flag telling
/// whether the probed key is actually present there.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct FoundAt {
    pub index: usize,
    pub exact: bool,
}

impl FoundAt {
    pub fn new(index: usize, exact: bool) -> Self {
        Self { index, exact }
    }
}

impl fmt::Debug for FoundAt {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}{}",
            self.index,
            if self.exact { "=" } else { "^" }
        )
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LongKind {
    Raw,
    Mvv,
}

/// Descriptor stored in a leaf slot whose value lives in an external
/// chain of LONG_RECORD pages.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LongRecordPointer {
    pub size: u64,
    pub head: PageId,
    pub kind: LongKind,
}

/// The four states of a leaf slot (plus the child pointer used on index
/// levels). `Long` covers both the primordial and the MVV variant of an
/// overflowing value, discriminated by `LongKind`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    Primordial(Bytes),
    Mvv(Vec<u8>),
    Long(LongRecordPointer),
    AntiValue,
    Child(PageId),
}

impl Slot {
    pub fn size(&self) -> usize {
        match self {
            Slot::Primordial(b) => b.len(),
            Slot::Mvv(b) => b.len(),
            Slot::Long(_) => 24,
            Slot::AntiValue => 1,
            Slot::Child(_) => 8,
        }
    }

    pub fn as_child(&self) -> Option<PageId> {
        match self {
            Slot::Child(pid) => Some(*pid),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct Record {
    pub key: Vec<u8>,
    pub slot: Slot,
}

impl Record {
    pub fn new(key: Vec<u8>, slot: Slot) -> Self {
        Self { key, slot }
    }

    pub fn size(&self) -> usize {
        self.key.len() + self.slot.size() + RECORD_OVERHEAD
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} -> {:?}", hex::encode(&self.key), self.slot)
    }
}

/// Outcome of a page-level put.
pub enum PutResult {
    Fit(FoundAt),
    NeedsSplit,
}

/// Outcome of joining two adjacent pages during a range removal.
pub enum JoinOutcome {
    /// Right page emptied into the left one; the caller frees it.
    Coalesced,
    /// Records redistributed; the right page's new first key must be
    /// re-indexed at the parent level.
    Rebalanced(Vec<u8>),
    /// No boundary lets both pages fit; the caller must split first.
    RebalanceOverflow,
}

pub struct Page {
    pid: PageId,
    category: PageCategory,

    /// Bumped on every mutation. LevelCache validity and B-link search
    /// restarts both hinge on it.
    generation: u64,

    right_sibling: Option<PageId>,

    // data / index pages
    records: Vec<Record>,

    // long-record pages
    long_payload: Vec<u8>,
    long_next: Option<PageId>,

    /// Timestamp of the last dirtying mutation; 0 when clean.
    dirty_ts: u64,
}

impl Page {
    pub fn new(pid: PageId, category: PageCategory) -> Self {
        Self {
            pid,
            category,
            generation: 1,
            right_sibling: None,
            records: Vec::new(),
            long_payload: Vec::new(),
            long_next: None,
            dirty_ts: 0,
        }
    }

    pub fn pid(&self) -> PageId {
        self.pid
    }

    pub fn category(&self) -> PageCategory {
        self.category
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn bump_generation(&mut self) {
        self.generation += 1;
    }

    pub fn mark_dirty(&mut self, ts: u64) {
        self.dirty_ts = ts;
    }

    pub fn clear_dirty(&mut self) {
        self.dirty_ts = 0;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty_ts != 0
    }

    pub fn dirty_ts(&self) -> u64 {
        self.dirty_ts
    }

    pub fn right_sibling(&self) -> Option<PageId> {
        self.right_sibling
    }

    pub fn set_right_sibling(&mut self, pid: Option<PageId>) {
        self.right_sibling = pid;
        self.bump_generation();
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn record(&self, index: usize) -> &Record {
        &self.records[index]
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn first_key(&self) -> Option<&[u8]> {
        self.records.first().map(|r| r.key.as_slice())
    }

    pub fn last_key(&self) -> Option<&[u8]> {
        self.records.last().map(|r| r.key.as_slice())
    }

    pub fn capacity() -> usize {
        BufferPool::get_page_size() - PAGE_HEADER_BYTES
    }

    pub fn used_bytes(&self) -> usize {
        self.records.iter().map(|r| r.size()).sum()
    }

    /// Position of the first key-block at or after `key`.
    /// `exact` is set when the key is present.
    pub fn find(&self, key: &[u8]) -> FoundAt {
        match self
            .records
            .binary_search_by(|r| r.key.as_slice().cmp(key))
        {
            Ok(i) => FoundAt::new(i, true),
            Err(i) => FoundAt::new(i, false),
        }
    }

    /// On an index page, the child to descend into for `key`: the entry
    /// exactly at the key, or the one just before it.
    pub fn child_index(&self, found_at: FoundAt) -> Result<usize, DbError> {
        if found_at.exact {
            return Ok(found_at.index);
        }
        if found_at.index == 0 {
            return Err(DbError::corrupt(&format!(
                "page {} claims to precede its own left edge",
                self.pid
            )));
        }
        Ok(found_at.index - 1)
    }

    pub fn child_at(&self, index: usize) -> Result<PageId, DbError> {
        self.records[index].slot.as_child().ok_or_else(|| {
            DbError::corrupt(&format!(
                "page {} holds a non-pointer slot at index level",
                self.pid
            ))
        })
    }

    /// Key-block order invariant, checked in debug builds (and with
    /// the `debug_checks` feature) only. Never mutates.
    fn assert_ordered(&self) {
        #[cfg(any(debug_assertions, feature = "debug_checks"))]
        assert!(
            self.records.windows(2).all(|w| w[0].key < w[1].key),
            "page {} keys out of order",
            self.pid
        );
    }

    /// Install `slot` under `key`, replacing an existing record of the
    /// same key. Reports `NeedsSplit` without mutating when the page
    /// byte budget would overflow.
    pub fn put(&mut self, key: &[u8], slot: Slot) -> PutResult {
        let found_at = self.find(key);
        let incoming = key.len() + slot.size() + RECORD_OVERHEAD;

        if found_at.exact {
            let old = self.records[found_at.index].size();
            if self.used_bytes() - old + incoming > Self::capacity() {
                return PutResult::NeedsSplit;
            }
            self.records[found_at.index].slot = slot;
        } else {
            if self.used_bytes() + incoming > Self::capacity() {
                return PutResult::NeedsSplit;
            }
            self.records
                .insert(found_at.index, Record::new(key.to_vec(), slot));
        }

        self.bump_generation();
        self.assert_ordered();
        PutResult::Fit(found_at)
    }

    /// Replace a slot in place without a capacity check. Only for
    /// rewrites that cannot grow (pruning, tombstone collapse).
    pub fn replace_slot(&mut self, index: usize, slot: Slot) {
        self.records[index].slot = slot;
        self.bump_generation();
    }

    /// Drain the key-blocks in `[from, to)` and hand them back, e.g. for
    /// long-record harvesting.
    pub fn remove_records(&mut self, from: usize, to: usize) -> Vec<Record> {
        let removed = self.records.drain(from..to).collect();
        self.bump_generation();
        removed
    }

    /// Move the tail of this page into `sibling` per the split policy,
    /// returning the promoted key (first key of the sibling).
    ///
    /// The caller re-tries its insert against whichever half now covers
    /// the key, and links `sibling` into the right-sibling chain
    /// *before* re-indexing the parent.
    pub fn split_into(
        &mut self,
        sibling: &mut Page,
        insert_at: usize,
        policy: SplitPolicy,
    ) -> Vec<u8> {
        debug_assert!(self.records.len() >= 2);
        debug_assert!(sibling.records.is_empty());

        let sizes: Vec<usize> = self.records.iter().map(|r| r.size()).collect();
        let split = policy.split_index(&sizes, insert_at);

        sibling.records = self.records.split_off(split);
        sibling.right_sibling = self.right_sibling;

        self.bump_generation();
        sibling.bump_generation();
        self.assert_ordered();
        sibling.assert_ordered();

        sibling.records[0].key.clone()
    }

    /// Join two adjacent pages after a range removal. The removal itself
    /// (and the freeing of any whole pages between the two) has already
    /// happened; `left.right_sibling` already points at `right`.
    pub fn join(left: &mut Page, right: &mut Page, policy: JoinPolicy) -> JoinOutcome {
        let capacity = Self::capacity();

        if left.used_bytes() + right.used_bytes() <= capacity {
            left.records.append(&mut right.records);
            left.right_sibling = right.right_sibling;
            left.bump_generation();
            right.bump_generation();
            left.assert_ordered();
            return JoinOutcome::Coalesced;
        }

        let sizes: Vec<usize> = left
            .records
            .iter()
            .chain(right.records.iter())
            .map(|r| r.size())
            .collect();

        let boundary = match policy.rebalance_index(&sizes, capacity) {
            Some(k) => k,
            None => return JoinOutcome::RebalanceOverflow,
        };

        let mut all = std::mem::take(&mut left.records);
        all.append(&mut right.records);
        right.records = all.split_off(boundary);
        left.records = all;

        left.bump_generation();
        right.bump_generation();
        left.assert_ordered();
        right.assert_ordered();

        JoinOutcome::Rebalanced(right.records[0].key.clone())
    }

    // ------------------------------------------------------------------
    // long-record pages

    pub fn long_payload(&self) -> &[u8] {
        &self.long_payload
    }

    pub fn set_long_payload(&mut self, payload: Vec<u8>) {
        self.long_payload = payload;
        self.bump_generation();
    }

    pub fn long_next(&self) -> Option<PageId> {
        self.long_next
    }

    pub fn set_long_next(&mut self, next: Option<PageId>) {
        self.long_next = next;
        self.bump_generation();
    }

    // ------------------------------------------------------------------
    // page image (flush / export)

    const NO_SIBLING: u64 = u64::MAX;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(BufferPool::get_page_size());

        let tag: u8 = match self.category {
            PageCategory::Data => 0,
            PageCategory::Index(l) => l,
            PageCategory::LongRecord => 0xff,
        };
        buf.push(tag);
        buf.extend_from_slice(
            &self
                .right_sibling
                .map(|p| p.index)
                .unwrap_or(Self::NO_SIBLING)
                .to_be_bytes(),
        );
        buf.extend_from_slice(&self.generation.to_be_bytes());

        if self.category == PageCategory::LongRecord {
            buf.extend_from_slice(
                &self
                    .long_next
                    .map(|p| p.index)
                    .unwrap_or(Self::NO_SIBLING)
                    .to_be_bytes(),
            );
            buf.extend_from_slice(&(self.long_payload.len() as u32).to_be_bytes());
            buf.extend_from_slice(&self.long_payload);
            return buf;
        }

        buf.extend_from_slice(&(self.records.len() as u32).to_be_bytes());
        for r in &self.records {
            buf.extend_from_slice(&(r.key.len() as u16).to_be_bytes());
            buf.extend_from_slice(&r.key);
            match &r.slot {
                Slot::Primordial(b) => {
                    buf.push(0);
                    buf.extend_from_slice(&(b.len() as u32).to_be_bytes());
                    buf.extend_from_slice(b);
                }
                Slot::Mvv(b) => {
                    buf.push(1);
                    buf.extend_from_slice(&(b.len() as u32).to_be_bytes());
                    buf.extend_from_slice(b);
                }
                Slot::Long(ptr) => {
                    buf.push(2);
                    buf.extend_from_slice(&ptr.size.to_be_bytes());
                    buf.extend_from_slice(&ptr.head.index.to_be_bytes());
                    buf.push(match ptr.kind {
                        LongKind::Raw => 0,
                        LongKind::Mvv => 1,
                    });
                }
                Slot::AntiValue => buf.push(3),
                Slot::Child(pid) => {
                    buf.push(4);
                    buf.extend_from_slice(&pid.index.to_be_bytes());
                }
            }
        }
        buf
    }

    pub fn decode(pid: PageId, bytes: &[u8]) -> Result<Self, DbError> {
        let mut r = ImageReader::new(pid, bytes);

        let tag = r.u8()?;
        let category = match tag {
            0 => PageCategory::Data,
            0xff => PageCategory::LongRecord,
            l if (l as usize) < super::consts::MAX_TREE_DEPTH => {
                PageCategory::Index(l)
            }
            other => {
                return Err(DbError::corrupt(&format!(
                    "page {} has invalid type tag {:#x}",
                    pid, other
                )))
            }
        };

        let sibling = r.u64()?;
        let generation = r.u64()?;
        let mut page = Page::new(pid, category);
        page.generation = generation;
        page.right_sibling = (sibling != Self::NO_SIBLING)
            .then(|| PageId::new(pid.volume_id, sibling));

        if category == PageCategory::LongRecord {
            let next = r.u64()?;
            page.long_next =
                (next != Self::NO_SIBLING).then(|| PageId::new(pid.volume_id, next));
            let len = r.u32()? as usize;
            page.long_payload = r.bytes(len)?.to_vec();
            return Ok(page);
        }

        let count = r.u32()? as usize;
        for _ in 0..count {
            let key_len = r.u16()? as usize;
            let key = r.bytes(key_len)?.to_vec();
            let slot = match r.u8()? {
                0 => {
                    let len = r.u32()? as usize;
                    Slot::Primordial(Bytes::copy_from_slice(r.bytes(len)?))
                }
                1 => {
                    let len = r.u32()? as usize;
                    Slot::Mvv(r.bytes(len)?.to_vec())
                }
                2 => {
                    let size = r.u64()?;
                    let head = PageId::new(pid.volume_id, r.u64()?);
                    let kind = if r.u8()? == 0 {
                        LongKind::Raw
                    } else {
                        LongKind::Mvv
                    };
                    Slot::Long(LongRecordPointer { size, head, kind })
                }
                3 => Slot::AntiValue,
                4 => Slot::Child(PageId::new(pid.volume_id, r.u64()?)),
                other => {
                    return Err(DbError::corrupt(&format!(
                        "page {} has invalid slot tag {:#x}",
                        pid, other
                    )))
                }
            };
            page.records.push(Record::new(key, slot));
        }
        Ok(page)
    }
}

impl fmt::Display for Page {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<{} {} gen {} records {} right {:?}>",
            self.category,
            self.pid,
            self.generation,
            self.records.len(),
            self.right_sibling.map(|p| p.index),
        )
    }
}

struct ImageReader<'a> {
    pid: PageId,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ImageReader<'a> {
    fn new(pid: PageId, bytes: &'a [u8]) -> Self {
        Self { pid, bytes, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], DbError> {
        if self.pos + n > self.bytes.len() {
            return Err(DbError::new(
                ErrorKind::Corrupt,
                &format!("page {} image truncated at {}", self.pid, self.pos),
            ));
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DbError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DbError> {
        Ok(u16::from_be_bytes(self.bytes(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, DbError> {
        Ok(u32::from_be_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, DbError> {
        Ok(u64::from_be_bytes(self.bytes(8)?.try_into().unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_with(keys: &[&str]) -> Page {
        let mut p = Page::new(PageId::new(1, 2), PageCategory::Data);
        for k in keys {
            p.put(
                k.as_bytes(),
                Slot::Primordial(Bytes::copy_from_slice(b"v")),
            );
        }
        p
    }

    #[test]
    fn test_find_positions() {
        let p = page_with(&["b", "d", "f"]);

        let fa = p.find(b"d");
        assert!(fa.exact);
        assert_eq!(fa.index, 1);

        let fa = p.find(b"c");
        assert!(!fa.exact);
        assert_eq!(fa.index, 1);

        let fa = p.find(b"a");
        assert_eq!(fa.index, 0);

        let fa = p.find(b"g");
        assert_eq!(fa.index, 3);
    }

    #[test]
    fn test_put_keeps_order_and_generation() {
        let mut p = page_with(&["b", "f"]);
        let before = p.generation();

        match p.put(b"d", Slot::AntiValue) {
            PutResult::Fit(fa) => assert_eq!(fa.index, 1),
            PutResult::NeedsSplit => panic!("unexpected split"),
        }

        assert!(p.generation() > before);
        let keys: Vec<&[u8]> = p.records().iter().map(|r| r.key.as_slice()).collect();
        assert_eq!(keys, vec![b"b" as &[u8], b"d", b"f"]);
    }

    #[test]
    fn test_split_promotes_sibling_first_key() {
        let mut p = page_with(&["a", "b", "c", "d"]);
        let mut sibling = Page::new(PageId::new(1, 3), PageCategory::Data);

        let promoted = p.split_into(&mut sibling, 4, SplitPolicy::EvenBias);

        assert_eq!(promoted, sibling.first_key().unwrap().to_vec());
        assert!(p.last_key().unwrap() < sibling.first_key().unwrap());
        assert_eq!(p.record_count() + sibling.record_count(), 4);
    }

    #[test]
    fn test_join_coalesces_small_pages() {
        let mut left = page_with(&["a", "b"]);
        let mut right = page_with(&["c", "d"]);
        right.set_right_sibling(Some(PageId::new(1, 9)));
        left.set_right_sibling(Some(right.pid()));

        match Page::join(&mut left, &mut right, JoinPolicy::EvenBias) {
            JoinOutcome::Coalesced => {}
            _ => panic!("expected coalesce"),
        }

        assert_eq!(left.record_count(), 4);
        assert_eq!(left.right_sibling(), Some(PageId::new(1, 9)));
    }

    #[test]
    fn test_image_roundtrip() {
        let mut p = page_with(&["k1", "k2"]);
        p.put(
            b"k3",
            Slot::Long(LongRecordPointer {
                size: 4096,
                head: PageId::new(1, 77),
                kind: LongKind::Mvv,
            }),
        );
        p.set_right_sibling(Some(PageId::new(1, 8)));

        let image = p.encode();
        let decoded = Page::decode(p.pid(), &image).unwrap();

        assert_eq!(decoded.record_count(), 3);
        assert_eq!(decoded.right_sibling(), Some(PageId::new(1, 8)));
        assert_eq!(decoded.record(2).slot, p.record(2).slot);
    }
}
