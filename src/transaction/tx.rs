use core::fmt;

use crate::{database::Database, types::DbResult};

/// A transaction is identified by its start timestamp; outcome and step
/// tracking live in the TransactionIndex.
#[derive(Eq, Hash, PartialEq, Clone, Copy)]
pub struct Transaction {
    start_ts: u64,
}

impl Transaction {
    pub fn new() -> Self {
        let start_ts = Database::timestamps().update_timestamp();
        Database::transaction_index().register(start_ts);
        Self { start_ts }
    }

    pub fn start(&self) -> DbResult {
        Database::mut_log_manager().log_start(self)
    }

    pub fn commit(&self) -> DbResult {
        let commit_ts = Database::timestamps().update_timestamp();
        Database::transaction_index().commit(self.start_ts, commit_ts);
        Database::mut_log_manager().log_commit(self)
    }

    pub fn abort(&self) -> DbResult {
        Database::transaction_index().abort(self.start_ts);
        Database::mut_log_manager().log_abort(self)
    }

    pub fn start_ts(&self) -> u64 {
        self.start_ts
    }

    pub fn is_active(&self) -> bool {
        Database::transaction_index().is_active(self.start_ts)
    }

    /// Step of the next write within this transaction.
    pub fn next_step(&self) -> u16 {
        Database::transaction_index().next_step(self.start_ts)
    }

    pub fn current_step(&self) -> u16 {
        Database::transaction_index().current_step(self.start_ts)
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "tx_{}", self.start_ts)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        return write!(f, "{}", self);
    }
}
