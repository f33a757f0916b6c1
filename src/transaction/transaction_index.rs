use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc, Condvar, Mutex, RwLock,
    },
    time::{Duration, Instant},
};

use log::debug;

use crate::utils::HandyRwLock;

/// Sentinels returned by `commit_status` / `ww_dependency`. Real commit
/// timestamps never reach this range.
pub const TS_UNCOMMITTED: u64 = u64::MAX;
pub const TS_ABORTED: u64 = u64::MAX - 1;
pub const TS_TIMED_OUT: u64 = u64::MAX - 2;

/// A version handle packs the writing transaction's start timestamp and
/// its logical step within that transaction.
pub fn tss2vh(start_ts: u64, step: u16) -> u64 {
    (start_ts << 16) | step as u64
}

pub fn vh2ts(vh: u64) -> u64 {
    vh >> 16
}

pub fn vh2step(vh: u64) -> u16 {
    (vh & 0xffff) as u16
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionState {
    Committed(u64),
    Aborted,
    Active,
}

struct TxEntry {
    start_ts: u64,
    /// TS_UNCOMMITTED while running, TS_ABORTED after an abort,
    /// otherwise the commit timestamp.
    commit_ts: AtomicU64,
    step: AtomicU32,
    decided: Mutex<bool>,
    cond: Condvar,
}

impl TxEntry {
    fn state(&self) -> VersionState {
        match self.commit_ts.load(Ordering::Acquire) {
            TS_UNCOMMITTED => VersionState::Active,
            TS_ABORTED => VersionState::Aborted,
            tc => VersionState::Committed(tc),
        }
    }
}

/// Registry of transaction outcomes keyed by start timestamp. The MVV
/// visitor resolves version handles against it; writers wait on it for
/// undecided rivals.
pub struct TransactionIndex {
    entries: RwLock<HashMap<u64, Arc<TxEntry>>>,
}

impl TransactionIndex {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, start_ts: u64) {
        let entry = Arc::new(TxEntry {
            start_ts,
            commit_ts: AtomicU64::new(TS_UNCOMMITTED),
            step: AtomicU32::new(0),
            decided: Mutex::new(false),
            cond: Condvar::new(),
        });
        self.entries.wl().insert(start_ts, entry);
    }

    fn entry(&self, start_ts: u64) -> Option<Arc<TxEntry>> {
        self.entries.rl().get(&start_ts).cloned()
    }

    /// Next logical step of the transaction; used to build version
    /// handles for successive writes.
    pub fn next_step(&self, start_ts: u64) -> u16 {
        match self.entry(start_ts) {
            Some(e) => (e.step.fetch_add(1, Ordering::AcqRel) + 1) as u16,
            None => 0,
        }
    }

    pub fn current_step(&self, start_ts: u64) -> u16 {
        match self.entry(start_ts) {
            Some(e) => e.step.load(Ordering::Acquire) as u16,
            None => 0,
        }
    }

    pub fn is_active(&self, start_ts: u64) -> bool {
        self.entry(start_ts)
            .map(|e| e.state() == VersionState::Active)
            .unwrap_or(false)
    }

    fn decide(&self, start_ts: u64, outcome: u64) {
        if let Some(e) = self.entry(start_ts) {
            e.commit_ts.store(outcome, Ordering::Release);
            let mut decided = e.decided.lock().unwrap();
            *decided = true;
            e.cond.notify_all();
        }
    }

    pub fn commit(&self, start_ts: u64, commit_ts: u64) {
        debug!("tx_{} committed at {}", start_ts, commit_ts);
        self.decide(start_ts, commit_ts);
        self.retire_completed();
    }

    pub fn abort(&self, start_ts: u64) {
        debug!("tx_{} aborted", start_ts);
        self.decide(start_ts, TS_ABORTED);
    }

    /// Resolve a version handle to the state of its writing transaction.
    /// A retired entry means the writer committed long before any
    /// current reader started.
    pub fn resolve(&self, vh: u64) -> VersionState {
        let ts = vh2ts(vh);
        if ts == 0 {
            return VersionState::Committed(0);
        }
        match self.entry(ts) {
            Some(e) => e.state(),
            None => VersionState::Committed(ts),
        }
    }

    /// Commit timestamp of a version as seen by a reader at
    /// `(reader_ts, reader_step)`, or a sentinel. A reader sees its own
    /// writes up to its current step.
    pub fn commit_status(&self, vh: u64, reader_ts: u64, reader_step: u16) -> u64 {
        let ts = vh2ts(vh);
        if ts == reader_ts && ts != 0 {
            if vh2step(vh) <= reader_step {
                return reader_ts;
            }
            return TS_UNCOMMITTED;
        }
        match self.resolve(vh) {
            VersionState::Committed(tc) if tc <= reader_ts => tc,
            VersionState::Committed(_) => TS_UNCOMMITTED,
            VersionState::Aborted => TS_ABORTED,
            VersionState::Active => TS_UNCOMMITTED,
        }
    }

    /// Write-write dependency of `writer_ts` on the transaction that
    /// wrote `vh`: 0 when there is none, TS_ABORTED when the rival
    /// aborted, TS_TIMED_OUT when it stayed undecided for `max_wait`,
    /// else the rival's commit timestamp (a conflict).
    pub fn ww_dependency(&self, vh: u64, writer_ts: u64, max_wait: Duration) -> u64 {
        let ts = vh2ts(vh);
        if ts == writer_ts || ts == 0 {
            return 0;
        }

        let entry = match self.entry(ts) {
            Some(e) => e,
            // retired: committed before the writer started
            None => return 0,
        };

        let deadline = Instant::now() + max_wait;
        loop {
            match entry.state() {
                VersionState::Committed(tc) => {
                    return if tc > writer_ts { tc } else { 0 };
                }
                VersionState::Aborted => return TS_ABORTED,
                VersionState::Active => {
                    let now = Instant::now();
                    if now >= deadline {
                        return TS_TIMED_OUT;
                    }
                    let decided = entry.decided.lock().unwrap();
                    if !*decided {
                        let (_guard, timeout) = entry
                            .cond
                            .wait_timeout(decided, deadline - now)
                            .unwrap();
                        if timeout.timed_out() {
                            return TS_TIMED_OUT;
                        }
                    }
                }
            }
        }
    }

    /// Block until the transaction behind `vh` is decided, bounded by
    /// `max_wait`. Used by the store path after it has released every
    /// claim.
    pub fn wait_for(&self, vh: u64, max_wait: Duration) -> VersionState {
        let ts = vh2ts(vh);
        let entry = match self.entry(ts) {
            Some(e) => e,
            None => return VersionState::Committed(ts),
        };

        let deadline = Instant::now() + max_wait;
        loop {
            match entry.state() {
                VersionState::Active => {
                    let now = Instant::now();
                    if now >= deadline {
                        return VersionState::Active;
                    }
                    let decided = entry.decided.lock().unwrap();
                    if !*decided {
                        let (_guard, timeout) = entry
                            .cond
                            .wait_timeout(decided, deadline - now)
                            .unwrap();
                        if timeout.timed_out() && entry.state() == VersionState::Active
                        {
                            return VersionState::Active;
                        }
                    }
                }
                decided => return decided,
            }
        }
    }

    /// Smallest start timestamp among active transactions; the MVV
    /// pruning floor. `u64::MAX` when none are active.
    pub fn min_active_timestamp(&self) -> u64 {
        self.entries
            .rl()
            .values()
            .filter(|e| e.state() == VersionState::Active)
            .map(|e| e.start_ts)
            .min()
            .unwrap_or(u64::MAX)
    }

    /// Drop decided entries no active transaction can still query.
    fn retire_completed(&self) {
        let floor = self.min_active_timestamp();
        let mut entries = self.entries.wl();
        entries.retain(|_, e| match e.state() {
            VersionState::Active => true,
            VersionState::Committed(tc) => tc >= floor,
            // aborted entries stay until no reader could hold their handle
            VersionState::Aborted => e.start_ts >= floor,
        });
    }

    pub fn active_count(&self) -> usize {
        self.entries
            .rl()
            .values()
            .filter(|e| e.state() == VersionState::Active)
            .count()
    }

    pub fn clear(&self) {
        self.entries.wl().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_packing() {
        let vh = tss2vh(1234, 7);
        assert_eq!(vh2ts(vh), 1234);
        assert_eq!(vh2step(vh), 7);
    }

    #[test]
    fn test_commit_status_visibility() {
        let index = TransactionIndex::new();
        index.register(100);
        // an active reader that started before the commit keeps the
        // entry from being retired
        index.register(120);
        index.commit(100, 150);

        let vh = tss2vh(100, 1);
        // reader that started after the commit sees it
        assert_eq!(index.commit_status(vh, 200, 0), 150);
        // reader that started before the commit does not
        assert_eq!(index.commit_status(vh, 120, 0), TS_UNCOMMITTED);
    }

    #[test]
    fn test_own_writes_visible_up_to_step() {
        let index = TransactionIndex::new();
        index.register(100);

        let vh = tss2vh(100, 2);
        assert_eq!(index.commit_status(vh, 100, 2), 100);
        assert_eq!(index.commit_status(vh, 100, 1), TS_UNCOMMITTED);
    }

    #[test]
    fn test_ww_dependency_outcomes() {
        let index = TransactionIndex::new();

        index.register(100);
        index.register(120);
        index.commit(100, 150);
        // rival committed after writer started: conflict
        assert_eq!(
            index.ww_dependency(tss2vh(100, 1), 120, Duration::from_millis(0)),
            150
        );

        index.register(200);
        index.register(300);
        // undecided rival with zero wait: timed out
        assert_eq!(
            index.ww_dependency(tss2vh(200, 1), 300, Duration::from_millis(0)),
            TS_TIMED_OUT
        );

        index.abort(200);
        assert_eq!(
            index.ww_dependency(tss2vh(200, 1), 300, Duration::from_millis(0)),
            TS_ABORTED
        );
    }
}
