use super::Cursor;
use crate::{
    btree::page::Slot,
    error::DbError,
    key::Key,
    transaction::Permission,
};

/// Traversal directions. EQ answers presence of the exact key; the
/// others seek the adjacent key in encoded order, strictly or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Eq,
    Gt,
    Gteq,
    Lt,
    Lteq,
}

/// Callback driven by `traverse_with_visitor`: invoked once per visible
/// key, in traversal order. Returning `true` advances to the next key;
/// `false` stops with the cursor positioned at the current one.
pub trait TraverseVisitor {
    fn visit(&mut self, key: &Key, value: Option<&[u8]>) -> bool;
}

/// Probe above every storable key: content bytes never exceed 0x1f.
const RIGHT_EDGE_PROBE: u8 = 0xff;

impl Cursor {
    /// Position the cursor on the adjacent key in the given direction.
    ///
    /// `deep` selects between full-tree order and sibling-only order
    /// (keys sharing the current key's parent prefix). `min_bytes`
    /// controls what is materialized: negative leaves key and value
    /// untouched, zero updates the key only, positive also fetches up
    /// to that many value bytes.
    pub fn traverse(
        &mut self,
        direction: Direction,
        deep: bool,
        min_bytes: i64,
    ) -> Result<bool, DbError> {
        self.begin_op()?;
        let r = self.traverse_internal(direction, deep, min_bytes, 0, 0, None);
        self.end_op();
        r
    }

    /// Traversal with the filter-layer guards: stop early when the
    /// candidate key is shallower than `min_key_depth` or stops sharing
    /// the first `match_prefix_len` encoded bytes of the current key.
    pub fn traverse_filtered(
        &mut self,
        direction: Direction,
        deep: bool,
        min_bytes: i64,
        min_key_depth: usize,
        match_prefix_len: usize,
    ) -> Result<bool, DbError> {
        self.begin_op()?;
        let r = self.traverse_internal(
            direction,
            deep,
            min_bytes,
            min_key_depth,
            match_prefix_len,
            None,
        );
        self.end_op();
        r
    }

    /// Traversal driving a visitor over each visible key until it asks
    /// to stop. Returns whether any key stopped the visitor.
    pub fn traverse_with_visitor(
        &mut self,
        direction: Direction,
        deep: bool,
        min_bytes: i64,
        visitor: &mut dyn TraverseVisitor,
    ) -> Result<bool, DbError> {
        self.begin_op()?;
        let r = self.traverse_internal(direction, deep, min_bytes, 0, 0, Some(visitor));
        self.end_op();
        r
    }

    pub(crate) fn traverse_internal(
        &mut self,
        direction: Direction,
        deep: bool,
        min_bytes: i64,
        min_key_depth: usize,
        match_prefix_len: usize,
        mut visitor: Option<&mut dyn TraverseVisitor>,
    ) -> Result<bool, DbError> {
        self.volume().check_open()?;
        self.tree().check_valid()?;
        self.volume()
            .stats
            .traversals
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        if direction == Direction::Eq {
            let present = self.fetch_internal(min_bytes)?;
            if present {
                if let Some(v) = visitor.as_mut() {
                    let key = self.key.clone();
                    v.visit(&key, self.value.as_deref());
                }
            }
            return Ok(present);
        }

        let result = self.traverse_loop(
            direction,
            deep,
            min_bytes,
            min_key_depth,
            match_prefix_len,
            &mut visitor,
        );
        if result.is_err() {
            self.release_all_page_claims();
        }
        result
    }

    fn traverse_loop(
        &mut self,
        direction: Direction,
        deep: bool,
        min_bytes: i64,
        min_key_depth: usize,
        match_prefix_len: usize,
        visitor: &mut Option<&mut dyn TraverseVisitor>,
    ) -> Result<bool, DbError> {
        let forward = matches!(direction, Direction::Gt | Direction::Gteq);
        let (reader_ts, reader_step) = self.reader_view();

        let origin = self.key.clone();
        let origin_depth = origin.depth();

        let mut base = origin.clone();
        let mut strict = matches!(direction, Direction::Gt | Direction::Lt);

        loop {
            // 1. build the probe; strict directions nudge the key so
            // the page search lands on the strictly adjacent record
            let probe: Vec<u8> = if base.is_empty() {
                if forward {
                    Vec::new()
                } else {
                    vec![RIGHT_EDGE_PROBE]
                }
            } else {
                let mut p = base.clone();
                if strict {
                    if forward {
                        if deep {
                            p.nudge_deeper();
                        } else {
                            p.nudge_right();
                        }
                    } else {
                        p.nudge_left();
                    }
                }
                p.encoded().to_vec()
            };

            // 2. locate the leaf and the candidate record
            let (page_pod, found_at) = self.search(&probe, false)?;
            let mut page_pod = page_pod;
            let non_strict_exact = found_at.exact && !strict;
            let mut idx: isize = if forward {
                found_at.index as isize
            } else if non_strict_exact {
                found_at.index as isize
            } else {
                found_at.index as isize - 1
            };

            let mut left_retried = false;
            let candidate: Option<(Vec<u8>, Slot)> = loop {
                let (count, right, pid) = {
                    let page = page_pod.read().unwrap();
                    (page.record_count(), page.right_sibling(), page.pid())
                };

                if forward {
                    if (idx as usize) < count {
                        let page = page_pod.read().unwrap();
                        let record = page.record(idx as usize);
                        let out = (record.key.clone(), record.slot.clone());
                        drop(page);
                        self.release_page(&pid);
                        break Some(out);
                    }
                    match right {
                        Some(right_pid) => {
                            // claim-couple into the sibling
                            let right_pod =
                                self.claim_page(&right_pid, Permission::ReadOnly, true)?;
                            self.release_page(&pid);
                            page_pod = right_pod;
                            idx = 0;
                        }
                        None => {
                            self.release_page(&pid);
                            break None;
                        }
                    }
                } else {
                    if idx >= 0 && count > 0 {
                        let page = page_pod.read().unwrap();
                        let record = page.record(idx as usize);
                        let out = (record.key.clone(), record.slot.clone());
                        drop(page);
                        self.release_page(&pid);
                        break Some(out);
                    }
                    // positioned at the left edge going left: the cache
                    // or an in-flight change misled us; re-search from
                    // the top once
                    self.release_page(&pid);
                    if left_retried {
                        break None;
                    }
                    left_retried = true;
                    self.level_cache.invalidate_all();
                    let (fresh_pod, fresh_fa) = self.search(&probe, false)?;
                    page_pod = fresh_pod;
                    idx = if fresh_fa.exact && !strict {
                        fresh_fa.index as isize
                    } else {
                        fresh_fa.index as isize - 1
                    };
                }
            };

            let (cand_key, slot) = match candidate {
                Some(c) => c,
                None => return Ok(false),
            };
            let cand = Key::from_encoded(&cand_key);

            // 3. early-termination guards for filter layers
            if match_prefix_len > 0 {
                let len = match_prefix_len.min(origin.len());
                if cand_key.len() < len || cand_key[..len] != origin.encoded()[..len] {
                    return Ok(false);
                }
            }
            if min_key_depth > 0 && cand.depth() < min_key_depth {
                return Ok(false);
            }

            // 4. sibling-only scope: the candidate must share the
            // parent prefix of the starting key
            if !deep && !origin.is_empty() {
                let parent_len =
                    Key::prefix_len_at_depth(origin.encoded(), origin_depth.saturating_sub(1));
                if cand_key.len() < parent_len
                    || cand_key[..parent_len] != origin.encoded()[..parent_len]
                {
                    return Ok(false);
                }
            }

            // 5. MVCC visibility: an invisible candidate (or a
            // tombstone) is treated as not present and the traversal
            // continues past it
            let value = self.resolve_visible_slot(&slot, reader_ts, reader_step, min_bytes)?;
            let value = match value {
                Some(v) => v,
                None => {
                    base = cand;
                    strict = true;
                    continue;
                }
            };

            // 6. sibling-only reporting of a deeper candidate: truncate
            // back to the sibling depth, result not exact
            let mut report = cand.clone();
            let mut exact = true;
            if !deep && report.depth() > origin_depth {
                report.truncate_depth(origin_depth);
                exact = false;
            }

            if let Some(v) = visitor.as_mut() {
                let keep_going =
                    v.visit(&report, if exact { Some(value.as_slice()) } else { None });
                if keep_going {
                    // skip the whole reported subtree in sibling-only
                    // mode, just this key otherwise
                    base = report;
                    strict = true;
                    continue;
                }
            }

            if min_bytes >= 0 {
                self.key = report;
            }
            if min_bytes > 0 {
                self.value = if exact { Some(value) } else { None };
            }
            return Ok(true);
        }
    }
}
