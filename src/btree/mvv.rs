//! Multi-version value containers.
//!
//! An MVV is a self-describing byte sequence stored in a leaf slot: a
//! marker byte followed by (version handle, length, payload) entries in
//! ascending handle order. A zero handle marks the primordial version
//! (the value that existed before the slot went multi-version); the
//! antivalue length sentinel marks a tombstone version.

use std::convert::TryInto;
use std::time::Duration;

use crate::{
    error::{DbError, ErrorKind},
    transaction::{
        transaction_index::{vh2step, vh2ts, TransactionIndex, VersionState, TS_ABORTED,
            TS_TIMED_OUT},
    },
    types::DbResult,
};

pub const PRIMORDIAL_HANDLE: u64 = 0;

const MARKER: u8 = 0xfe;
const ANTIVALUE_LEN: u32 = u32::MAX;
const ENTRY_HEADER: usize = 12;

pub fn is_mvv(bytes: &[u8]) -> bool {
    bytes.first() == Some(&MARKER)
}

pub fn new_container() -> Vec<u8> {
    vec![MARKER]
}

/// Wrap an existing single value (or tombstone) as the primordial
/// version of a fresh container.
pub fn from_primordial(payload: Option<&[u8]>) -> Vec<u8> {
    let mut container = new_container();
    push_entry(&mut container, PRIMORDIAL_HANDLE, payload);
    container
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version<'a> {
    pub handle: u64,
    /// `None` is an anti-value tombstone.
    pub payload: Option<&'a [u8]>,
}

pub struct VersionIter<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for VersionIter<'a> {
    type Item = Result<Version<'a>, DbError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.bytes.len() {
            return None;
        }
        if self.pos + ENTRY_HEADER > self.bytes.len() {
            self.pos = self.bytes.len();
            return Some(Err(DbError::corrupt("truncated MVV entry header")));
        }
        let handle =
            u64::from_be_bytes(self.bytes[self.pos..self.pos + 8].try_into().unwrap());
        let len = u32::from_be_bytes(
            self.bytes[self.pos + 8..self.pos + 12].try_into().unwrap(),
        );
        self.pos += ENTRY_HEADER;

        if len == ANTIVALUE_LEN {
            return Some(Ok(Version {
                handle,
                payload: None,
            }));
        }

        let len = len as usize;
        if self.pos + len > self.bytes.len() {
            self.pos = self.bytes.len();
            return Some(Err(DbError::corrupt("truncated MVV payload")));
        }
        let payload = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Some(Ok(Version {
            handle,
            payload: Some(payload),
        }))
    }
}

/// Enumerate the versions of a container.
pub fn versions(container: &[u8]) -> Result<VersionIter, DbError> {
    if !is_mvv(container) {
        return Err(DbError::corrupt("value is not an MVV container"));
    }
    Ok(VersionIter {
        bytes: container,
        pos: 1,
    })
}

fn push_entry(container: &mut Vec<u8>, handle: u64, payload: Option<&[u8]>) {
    container.extend_from_slice(&handle.to_be_bytes());
    match payload {
        Some(p) => {
            container.extend_from_slice(&(p.len() as u32).to_be_bytes());
            container.extend_from_slice(p);
        }
        None => container.extend_from_slice(&ANTIVALUE_LEN.to_be_bytes()),
    }
}

/// Append a new version. The handle must be strictly greater than every
/// version already present; a concurrent pruning pass can break that
/// expectation, which surfaces as `VersionsOutOfOrder` and is retried a
/// bounded number of times by the store path.
///
/// An existing version with the *same* handle (same transaction, same
/// step overwriting its own write) is replaced in place.
pub fn append_version(
    container: &mut Vec<u8>,
    handle: u64,
    payload: Option<&[u8]>,
) -> DbResult {
    let mut max_handle = 0;
    let mut same: Option<(usize, usize)> = None;

    {
        let mut iter = versions(container)?;
        let mut entry_start = 1;
        while let Some(v) = iter.next() {
            let v = v?;
            if v.handle == handle {
                same = Some((entry_start, iter.pos));
            }
            max_handle = max_handle.max(v.handle);
            entry_start = iter.pos;
        }
    }

    if let Some((start, end)) = same {
        let mut rebuilt = container[..start].to_vec();
        push_entry(&mut rebuilt, handle, payload);
        rebuilt.extend_from_slice(&container[end..]);
        *container = rebuilt;
        return Ok(());
    }

    if handle <= max_handle {
        return Err(DbError::new(
            ErrorKind::VersionsOutOfOrder,
            &format!(
                "appending handle {:#x} behind existing {:#x}",
                handle, max_handle
            ),
        ));
    }

    push_entry(container, handle, payload);
    Ok(())
}

/// What a reader sees in a container.
#[derive(Debug, PartialEq, Eq)]
pub enum Visible<'a> {
    /// No version is visible at the reader's timestamp.
    None,
    /// The visible version is an anti-value tombstone.
    Anti,
    Value(&'a [u8]),
}

/// Pick the version with the greatest commit timestamp at or below the
/// reader's start timestamp, step as tiebreak. The reader's own
/// uncommitted writes are visible to it.
pub fn fetch_visible<'a>(
    container: &'a [u8],
    index: &TransactionIndex,
    reader_ts: u64,
    reader_step: u16,
) -> Result<Visible<'a>, DbError> {
    let mut best: Option<(u64, u16, Option<&'a [u8]>)> = None;

    for v in versions(container)? {
        let v = v?;
        let tc = index.commit_status(v.handle, reader_ts, reader_step);
        if tc >= TS_TIMED_OUT {
            continue;
        }
        let rank = (tc, vh2step(v.handle));
        if best.map_or(true, |(btc, bstep, _)| rank > (btc, bstep)) {
            best = Some((tc, vh2step(v.handle), v.payload));
        }
    }

    Ok(match best {
        None => Visible::None,
        Some((_, _, None)) => Visible::Anti,
        Some((_, _, Some(p))) => Visible::Value(p),
    })
}

/// Outcome of the write-write dependency pass over a container.
pub enum StoreCheck {
    /// No undecided rival; `max_handle` is the greatest handle seen,
    /// for the ordering check on append.
    Clear { max_handle: u64 },
    /// A rival committed after the writer started.
    Conflict { committer_ts: u64 },
    /// A rival is still undecided; release claims and wait on it.
    Retry { handle: u64 },
}

/// Visit every version for write-write dependencies relative to the
/// writing transaction. Runs with a zero wait: undecided rivals surface
/// as `Retry` so the caller can drop its claims before blocking.
pub fn store_check(
    container: &[u8],
    index: &TransactionIndex,
    writer_ts: u64,
) -> Result<StoreCheck, DbError> {
    let mut max_handle = 0;

    for v in versions(container)? {
        let v = v?;
        max_handle = max_handle.max(v.handle);

        if v.handle == PRIMORDIAL_HANDLE || vh2ts(v.handle) == writer_ts {
            continue;
        }

        let dep = index.ww_dependency(v.handle, writer_ts, Duration::from_millis(0));
        if dep == TS_TIMED_OUT {
            return Ok(StoreCheck::Retry { handle: v.handle });
        }
        if dep != 0 && dep != TS_ABORTED {
            return Ok(StoreCheck::Conflict { committer_ts: dep });
        }
    }

    Ok(StoreCheck::Clear { max_handle })
}

/// Result of pruning a container.
pub enum Pruned {
    Unchanged,
    /// Versions dropped, container still multi-version.
    Rewritten(Vec<u8>),
    /// A single committed value remains; collapse the slot back to a
    /// primordial value.
    CollapsedValue(Vec<u8>),
    /// A single committed tombstone remains.
    CollapsedAnti,
}

/// Drop versions no current or future reader can see: aborted versions,
/// and committed versions shadowed by a later committed version at or
/// below the oldest active transaction's timestamp.
pub fn prune(container: &[u8], index: &TransactionIndex) -> Result<Pruned, DbError> {
    let floor = index.min_active_timestamp();

    let mut resolved: Vec<(Version, VersionState)> = Vec::new();
    for v in versions(container)? {
        let v = v?;
        resolved.push((v, index.resolve(v.handle)));
    }

    // greatest committed timestamp that every reader is guaranteed to see
    let shadow = resolved
        .iter()
        .filter_map(|(_, s)| match s {
            VersionState::Committed(tc) if *tc <= floor => Some(*tc),
            _ => None,
        })
        .max();

    let mut kept: Vec<&(Version, VersionState)> = Vec::new();
    for entry in &resolved {
        match entry.1 {
            VersionState::Aborted => continue,
            VersionState::Committed(tc) => {
                if let Some(shadow) = shadow {
                    if tc < shadow {
                        continue;
                    }
                }
                kept.push(entry);
            }
            VersionState::Active => kept.push(entry),
        }
    }

    if kept.len() == resolved.len() {
        return Ok(Pruned::Unchanged);
    }

    if kept.len() == 1 {
        if let (v, VersionState::Committed(tc)) = kept[0] {
            if *tc <= floor {
                return Ok(match v.payload {
                    Some(p) => Pruned::CollapsedValue(p.to_vec()),
                    None => Pruned::CollapsedAnti,
                });
            }
        }
    }

    let mut rewritten = new_container();
    for (v, _) in kept {
        push_entry(&mut rewritten, v.handle, v.payload);
    }
    Ok(Pruned::Rewritten(rewritten))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::transaction_index::tss2vh;

    #[test]
    fn test_container_roundtrip() {
        let mut c = from_primordial(Some(b"base"));
        append_version(&mut c, tss2vh(10, 1), Some(b"v10")).unwrap();
        append_version(&mut c, tss2vh(20, 1), None).unwrap();

        let got: Vec<Version> = versions(&c).unwrap().map(|v| v.unwrap()).collect();
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].handle, PRIMORDIAL_HANDLE);
        assert_eq!(got[1].payload, Some(b"v10" as &[u8]));
        assert_eq!(got[2].payload, None);
    }

    #[test]
    fn test_out_of_order_append_rejected() {
        let mut c = from_primordial(Some(b"base"));
        append_version(&mut c, tss2vh(20, 1), Some(b"late")).unwrap();

        let err = append_version(&mut c, tss2vh(10, 1), Some(b"early")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VersionsOutOfOrder);
    }

    #[test]
    fn test_same_handle_replaces() {
        let mut c = from_primordial(Some(b"base"));
        let vh = tss2vh(10, 3);
        append_version(&mut c, vh, Some(b"first")).unwrap();
        append_version(&mut c, vh, Some(b"second")).unwrap();

        let got: Vec<Version> = versions(&c).unwrap().map(|v| v.unwrap()).collect();
        assert_eq!(got.len(), 2);
        assert_eq!(got[1].payload, Some(b"second" as &[u8]));
    }
}
