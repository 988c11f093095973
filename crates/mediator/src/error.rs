//! Error types for the event mediator
//!
//! The propagation policy follows the engine's three failure classes: fatal
//! errors halt the subscription and surface a down status to the supervisor,
//! intermittent transport errors cause the consumers and clients to be
//! rebuilt, and everything per-key (processor failures, optimistic
//! conflicts) is handled inside the batch without reaching this type.

use stateflow_store::StoreError;
use thiserror::Error;

/// Mediator error type.
#[derive(Error, Debug)]
pub enum MediatorError {
    /// A consumer or client could not be constructed. Always fatal.
    #[error("failed to construct {component} '{name}': {details}")]
    Construction {
        component: &'static str,
        name: String,
        details: String,
    },

    /// An output payload had no route. Silent drops are forbidden, so this is
    /// a configuration error and always fatal.
    #[error("no route defined for output payload of type {payload_type}")]
    UnroutableOutput { payload_type: String },

    /// A route named a client id that was never registered. Always fatal.
    #[error("no messaging client registered with id '{client_id}'")]
    MissingClient { client_id: String },

    /// State store failure. Connectivity failures are fatal; the rest abort
    /// the current batch.
    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    /// Payload encoding or decoding failed.
    #[error("serialization failed: {details}")]
    Serialization { details: String },

    /// A transport (feed or client) failed. Intermittent: the mediator
    /// rebuilds its transports and carries on.
    #[error("transport error on '{endpoint}': {details}")]
    Transport { endpoint: String, details: String },

    /// Invalid configuration detected at build time.
    #[error("invalid mediator configuration: {details}")]
    Configuration { details: String },

    /// A spawned task failed in a way that should never happen (panic or
    /// runtime teardown).
    #[error("internal mediator failure: {details}")]
    Internal { details: String },
}

impl MediatorError {
    /// Whether this error must halt the subscription rather than be retried.
    pub fn is_fatal(&self) -> bool {
        match self {
            MediatorError::Construction { .. }
            | MediatorError::UnroutableOutput { .. }
            | MediatorError::MissingClient { .. }
            | MediatorError::Configuration { .. }
            | MediatorError::Internal { .. } => true,
            MediatorError::Store(err) => matches!(err, StoreError::Connection { .. }),
            MediatorError::Serialization { .. } | MediatorError::Transport { .. } => false,
        }
    }
}

/// Result alias for mediator operations.
pub type MediatorResult<T> = std::result::Result<T, MediatorError>;
