use std::{error::Error, fmt, io};

use backtrace::Backtrace;

/// Error taxonomy of the tree core.
///
/// Retryable kinds (`Retry`, `WwRetry`, `VersionsOutOfOrder`) are consumed
/// inside the store/remove loops after all claims have been released;
/// everything else propagates to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A claim race or an invalidated traversal; release everything and
    /// try again.
    Retry,
    /// A write-write dependency on an undecided rival transaction. The
    /// conflicting version handle travels with the error.
    WwRetry,
    /// A concurrent pruning pass reordered the container under us.
    VersionsOutOfOrder,
    /// The transaction lost a write-write conflict and must abort.
    Rollback,
    Corrupt,
    InvalidKey,
    KeyTooLong,
    ReadOnly,
    TreeNotFound,
    VolumeClosed,
    WrongThread,
    Timeout,
    Interrupted,
    Io,
    Unsupported,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone)]
pub struct DbError {
    kind: ErrorKind,
    details: String,

    // set only for WwRetry
    conflict_handle: Option<u64>,
}

impl DbError {
    pub fn new(kind: ErrorKind, msg: &str) -> DbError {
        DbError {
            kind,
            details: msg.to_string(),
            conflict_handle: None,
        }
    }

    pub fn retry(msg: &str) -> DbError {
        Self::new(ErrorKind::Retry, msg)
    }

    pub fn corrupt(msg: &str) -> DbError {
        Self::new(ErrorKind::Corrupt, msg)
    }

    pub fn rollback(msg: &str) -> DbError {
        Self::new(ErrorKind::Rollback, msg)
    }

    pub fn ww_retry(version_handle: u64) -> DbError {
        DbError {
            kind: ErrorKind::WwRetry,
            details: format!(
                "write-write dependency on version handle {:#x}",
                version_handle
            ),
            conflict_handle: Some(version_handle),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// True for errors the calling loop may consume after releasing all
    /// claims.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Retry | ErrorKind::WwRetry | ErrorKind::VersionsOutOfOrder
        )
    }

    pub fn conflict_handle(&self) -> Option<u64> {
        self.conflict_handle
    }

    pub fn details(&self) -> &str {
        &self.details
    }

    pub fn show_backtrace(&self) {
        let bt = Backtrace::new();
        log::error!("{}\nbacktrace:\n{:?}", self, bt);
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.details)
    }
}

impl Error for DbError {}

impl From<io::Error> for DbError {
    fn from(e: io::Error) -> Self {
        DbError::new(ErrorKind::Io, &e.to_string())
    }
}
