//! Versioned key/value state store with optimistic concurrency control
//!
//! This crate is the single place mutable shared state is durably recorded.
//! Every write is a compare-and-swap on the state's version counter; racing
//! writers learn about conflicts through returned failed-key sets and retry,
//! never through locks or exceptions. The [`retry`] module layers a
//! deadline-bounded retry loop on top for callers that want transforms
//! applied until they stick.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod retry;
pub mod store;
pub mod types;

pub use error::{StoreError, StoreResult};
pub use memory::InMemoryStateStore;
pub use postgres::{PostgresStateStore, PostgresStoreConfig};
pub use retry::{RetryConfig, Transform, TransformOutcome, UpdateRetryCoordinator};
pub use store::StateStore;
pub use types::{
    metadata_keys, IntervalFilter, Metadata, MetadataFilter, MetadataValue, Operation, State,
    VERSION_INITIAL,
};
