//! Portable error taxonomy shared by every subsystem.
//!
//! Backends translate their native errors into these kinds at their own
//! boundary; nothing above the repository or storage layer ever sees a
//! `sqlx::Error` or an OS error directly. The kinds map one-to-one onto
//! transport status codes in the API layer.

use thiserror::Error;

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Entity absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Id or name collision.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Malformed input (bad id length, missing required field).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation not legal in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Protected resource has an active lease.
    #[error("lease conflict: {0}")]
    LeaseConflict(String),

    /// Tier capacity exceeded.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Transient lock or backoff signal; safe to retry.
    #[error("busy: {0}")]
    Busy(String),

    /// Backend-level I/O fault.
    #[error("i/o error: {0}")]
    Io(String),

    /// Stored bytes or rows failed an integrity check.
    #[error("corruption: {0}")]
    Corruption(String),

    /// Backend cannot perform the requested operation.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Caller deadline elapsed or the wait was cancelled; no side effects.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Uncategorized.
    #[error("internal: {0}")]
    Internal(String),
}

/// Result type used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Stable lowercase name of the error kind, used in wire envelopes
    /// and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::AlreadyExists(_) => "already_exists",
            Error::InvalidArgument(_) => "invalid_argument",
            Error::InvalidState(_) => "invalid_state",
            Error::LeaseConflict(_) => "lease_conflict",
            Error::ResourceExhausted(_) => "resource_exhausted",
            Error::Busy(_) => "busy",
            Error::Io(_) => "io_error",
            Error::Corruption(_) => "corruption",
            Error::Unsupported(_) => "unsupported",
            Error::Cancelled(_) => "cancelled",
            Error::Internal(_) => "internal",
        }
    }

    /// Whether a bounded retry inside the same operation is reasonable.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Busy(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(e.to_string()),
            std::io::ErrorKind::AlreadyExists => Error::AlreadyExists(e.to_string()),
            std::io::ErrorKind::WouldBlock => Error::Busy(e.to_string()),
            _ => Error::Io(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidArgument(format!("json: {}", e))
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => Error::NotFound(e.to_string()),
            sqlx::Error::Database(db) => {
                let msg = db.message().to_lowercase();
                if msg.contains("unique") || msg.contains("duplicate key") {
                    Error::AlreadyExists(db.message().to_string())
                } else if msg.contains("locked") || msg.contains("busy") {
                    Error::Busy(db.message().to_string())
                } else {
                    Error::Io(db.message().to_string())
                }
            }
            sqlx::Error::PoolTimedOut => Error::Busy(e.to_string()),
            sqlx::Error::Io(_) => Error::Io(e.to_string()),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                Error::Corruption(e.to_string())
            }
            _ => Error::Internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_are_stable() {
        assert_eq!(Error::NotFound("x".into()).kind(), "not_found");
        assert_eq!(Error::LeaseConflict("x".into()).kind(), "lease_conflict");
        assert_eq!(Error::Unsupported("x".into()).kind(), "unsupported");
    }

    #[test]
    fn test_io_not_found_translates() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_only_busy_is_transient() {
        assert!(Error::Busy("lock".into()).is_transient());
        assert!(!Error::NotFound("x".into()).is_transient());
        assert!(!Error::Io("x".into()).is_transient());
    }
}
