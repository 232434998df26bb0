//! Error types for the sedge library.
//!
//! All failures are represented by the [`SedgeError`] enum. Failures are
//! scoped to the statement or transaction in progress; nothing here is fatal
//! to the host connection.

use std::io;

use thiserror::Error;

/// The main error type for sedge operations.
///
/// The variants keep the engine's error taxonomy distinct: a corrupt index
/// is never retried, a busy store means "no merge occurred this time", and
/// query errors are synchronous misuse reports with no partial state change.
#[derive(Error, Debug)]
pub enum SedgeError {
    /// I/O errors from the block store.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed on-disk node or doclist: bad varint, a doclist length that
    /// overruns its buffer, non-increasing terms.
    #[error("database disk image is malformed: {0}")]
    Corrupt(String),

    /// Query parsing or evaluation misuse (malformed MATCH syntax, bad
    /// admin-command argument).
    #[error("query error: {0}")]
    Query(String),

    /// Storage-level errors from the shadow tables.
    #[error("storage error: {0}")]
    Storage(String),

    /// The shadow tables could not be exclusively locked. Merge and flush
    /// paths treat this as "retry at the next opportunity".
    #[error("index is busy: {0}")]
    Busy(String),

    /// The host's statement-interrupt flag was set mid-query.
    #[error("interrupted")]
    Interrupted,

    /// Analysis (tokenization) errors.
    #[error("analysis error: {0}")]
    Analysis(String),

    /// Generic anyhow error.
    #[error("error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Result type alias for operations that may fail with [`SedgeError`].
pub type Result<T> = std::result::Result<T, SedgeError>;

impl SedgeError {
    /// Create a new corruption error.
    pub fn corrupt<S: Into<String>>(msg: S) -> Self {
        SedgeError::Corrupt(msg.into())
    }

    /// Create a new query error.
    pub fn query<S: Into<String>>(msg: S) -> Self {
        SedgeError::Query(msg.into())
    }

    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        SedgeError::Storage(msg.into())
    }

    /// Create a new busy error.
    pub fn busy<S: Into<String>>(msg: S) -> Self {
        SedgeError::Busy(msg.into())
    }

    /// Create a new analysis error.
    pub fn analysis<S: Into<String>>(msg: S) -> Self {
        SedgeError::Analysis(msg.into())
    }

    /// True if this error should be treated as "no merge occurred" rather
    /// than propagated from an opportunistic merge attempt.
    pub fn is_busy(&self) -> bool {
        matches!(self, SedgeError::Busy(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SedgeError::corrupt("doclist overruns node");
        assert_eq!(
            err.to_string(),
            "database disk image is malformed: doclist overruns node"
        );

        let err = SedgeError::query("malformed MATCH expression");
        assert_eq!(err.to_string(), "query error: malformed MATCH expression");
    }

    #[test]
    fn test_busy_classification() {
        assert!(SedgeError::busy("segdir locked").is_busy());
        assert!(!SedgeError::corrupt("bad varint").is_busy());
    }
}
