//! State store trait definition
//!
//! All operations are batch-oriented and non-throwing on conflict: a write
//! that loses the optimistic version check reports the key in the returned
//! failed-key set and leaves the stored row untouched. Only backend-level
//! failures (connectivity, malformed requests) surface as [`StoreError`].

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;

use crate::error::{StoreError, StoreResult};
use crate::types::{IntervalFilter, MetadataFilter, State};

/// Versioned key/value store with optimistic concurrency control.
///
/// Implementations must guarantee that for any `(key, version)` pair at most
/// one concurrent writer observes success, and that the version advances by
/// exactly 1 as part of the same atomic write. Reads never block writes; the
/// compare-and-swap discipline is the sole coordination mechanism.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Insert each state at version 0.
    ///
    /// A key that already exists is reported in the returned set and left
    /// untouched, so a duplicate create is an idempotent no-op. Duplicate
    /// keys *within* one batch are an input contract violation.
    async fn create(&self, states: &[State]) -> StoreResult<HashSet<String>>;

    /// Fetch the given keys. Missing keys are simply absent from the result,
    /// not errors.
    async fn get(&self, keys: &[String]) -> StoreResult<HashMap<String, State>>;

    /// Conditionally update each state.
    ///
    /// Each input carries the version the caller last observed; a row is
    /// written only if the stored version still matches, in which case the
    /// version increments and `modified_time` refreshes. Keys that fail the
    /// check are returned and their rows are unchanged.
    async fn update(&self, states: &[State]) -> StoreResult<HashSet<String>>;

    /// Conditionally delete each state, with the same version check and
    /// failure-reporting contract as [`update`](Self::update).
    async fn delete(&self, states: &[State]) -> StoreResult<HashSet<String>>;

    /// States whose metadata satisfies *all* of the filters.
    async fn find_by_metadata_matching_all(
        &self,
        filters: &[MetadataFilter],
    ) -> StoreResult<HashMap<String, State>>;

    /// States whose metadata satisfies *any* of the filters.
    async fn find_by_metadata_matching_any(
        &self,
        filters: &[MetadataFilter],
    ) -> StoreResult<HashMap<String, State>>;

    /// States last modified within the interval (inclusive).
    async fn find_updated_between(
        &self,
        interval: IntervalFilter,
    ) -> StoreResult<HashMap<String, State>>;

    /// States last modified within the interval whose metadata also satisfies
    /// all of the filters.
    async fn find_updated_between_with_metadata_matching_all(
        &self,
        interval: IntervalFilter,
        filters: &[MetadataFilter],
    ) -> StoreResult<HashMap<String, State>>;

    /// Remove every state whose `expiry` metadata lies at or before the
    /// current time. Returns the number of removed states.
    async fn delete_expired(&self) -> StoreResult<usize>;
}

/// Reject create batches carrying the same key more than once.
pub(crate) fn reject_duplicate_keys(states: &[State]) -> StoreResult<()> {
    let mut seen = HashSet::with_capacity(states.len());
    let mut duplicates = Vec::new();
    for state in states {
        if !seen.insert(state.key.as_str()) {
            duplicates.push(state.key.clone());
        }
    }
    if duplicates.is_empty() {
        Ok(())
    } else {
        Err(StoreError::InvalidRequest {
            details: format!("duplicate keys in create batch: {duplicates:?}"),
        })
    }
}
