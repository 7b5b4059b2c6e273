//! Error types for the capture engine
//!
//! One error enum for the whole crate, with a classification helper so the
//! watcher and saver can decide which failures are worth retrying.

use thiserror::Error;

/// Errors produced by the capture engine.
#[derive(Error, Debug)]
pub enum TrailError {
    /// Invalid or missing configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Source database operation failed.
    #[error("database error: {0}")]
    Db(#[from] tokio_postgres::Error),

    /// Connection pool failure.
    #[error("pool error: {0}")]
    Pool(String),

    /// Log store operation failed.
    #[error("store error: {0}")]
    Store(String),

    /// A database call exceeded its deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Policy-level failure: unknown table, duplicate registration,
    /// unknown field. Surfaced to the caller, never retried.
    #[error("policy error: {0}")]
    Policy(String),

    /// Object missing during removal. Swallowed by the trigger manager.
    #[error("not found: {0}")]
    NotFound(String),

    /// Shutdown requested. Not a failure.
    #[error("operation canceled")]
    Canceled,

    /// Invalid lifecycle transition (e.g. double start).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TrailError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a pool error.
    pub fn pool(msg: impl Into<String>) -> Self {
        Self::Pool(msg.into())
    }

    /// Create a store error.
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a timeout error.
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a policy error.
    pub fn policy(msg: impl Into<String>) -> Self {
        Self::Policy(msg.into())
    }

    /// Create a not-found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an invalid-state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Check whether this error is transient.
    ///
    /// Retriable errors are retried at the component boundary (watcher
    /// reconnect, saver write retry) and surfaced only after the retry
    /// budget is spent.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Db(e) => is_transient_pg_error(e),
            Self::Pool(_) => true,
            Self::Store(_) => true,
            Self::Timeout(_) => true,
            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                )
            }
            Self::Config(_)
            | Self::Policy(_)
            | Self::NotFound(_)
            | Self::Canceled
            | Self::InvalidState(_)
            | Self::Json(_) => false,
        }
    }
}

/// Check if a PostgreSQL error is transient.
fn is_transient_pg_error(e: &tokio_postgres::Error) -> bool {
    if let Some(db_error) = e.as_db_error() {
        let code = db_error.code().code();
        // Connection exception class (08xxx)
        if code.starts_with("08") {
            return true;
        }
        // Transaction rollback class (40xxx)
        if code.starts_with("40") {
            return true;
        }
        // Insufficient resources class (53xxx)
        if code.starts_with("53") {
            return true;
        }
        // Operator intervention class (57xxx) - except query_canceled
        if code.starts_with("57") && code != "57014" {
            return true;
        }
        return false;
    }

    // No SQLSTATE: the connection itself broke
    let msg = e.to_string().to_lowercase();
    msg.contains("connection") || msg.contains("closed") || msg.contains("timeout")
}

/// Result type for capture engine operations.
pub type Result<T> = std::result::Result<T, TrailError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TrailError::policy("notes not registered");
        assert!(err.to_string().contains("policy error"));
        assert!(err.to_string().contains("notes not registered"));
    }

    #[test]
    fn test_retriable_classification() {
        assert!(TrailError::store("batch failed").is_retriable());
        assert!(TrailError::pool("exhausted").is_retriable());
        assert!(TrailError::timeout("statement").is_retriable());
        assert!(TrailError::Io(std::io::Error::from(std::io::ErrorKind::TimedOut)).is_retriable());

        assert!(!TrailError::config("no dsn").is_retriable());
        assert!(!TrailError::policy("unknown field").is_retriable());
        assert!(!TrailError::not_found("trigger").is_retriable());
        assert!(!TrailError::Canceled.is_retriable());
    }

    #[test]
    fn test_constructors() {
        let _ = TrailError::config("missing dsn");
        let _ = TrailError::store("write failed");
        let _ = TrailError::not_found("ddl_end_log_trigger");
        let _ = TrailError::invalid_state("already started");
    }
}
