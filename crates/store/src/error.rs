//! Error types for state store operations
//!
//! Optimistic-concurrency conflicts are deliberately *not* errors: every
//! batch write reports the conflicting keys as data and leaves retry policy
//! to the caller. The variants here cover everything else, with backend
//! connectivity kept as its own class so it can never be mistaken for a
//! conflict.

use thiserror::Error;

/// State store error type.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The backend is unreachable or the connection pool is broken. This is
    /// unrecoverable for the calling batch and must propagate; it is never
    /// folded into a failed-key set.
    #[error("store connection failure: {details}")]
    Connection { details: String },

    /// A statement failed for a reason other than connectivity.
    #[error("store query failed: {details}")]
    Query { details: String },

    /// Metadata could not be encoded to or decoded from its document form.
    #[error("metadata serialization failed: {details}")]
    Serialization { details: String },

    /// The caller violated an input contract (e.g. duplicate keys in one
    /// create batch).
    #[error("invalid request: {details}")]
    InvalidRequest { details: String },

    /// A retry-coordinator transform was supplied for keys that do not exist.
    #[error("states not found for keys: {keys:?}")]
    MissingStates { keys: Vec<String> },

    /// The retry coordinator's wall-clock deadline elapsed with keys still
    /// unresolved.
    #[error("update retry deadline elapsed with unresolved keys: {keys:?}")]
    DeadlineExceeded { keys: Vec<String> },
}

/// Result alias for state store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization {
            details: err.to_string(),
        }
    }
}
