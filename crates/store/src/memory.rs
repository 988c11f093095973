//! In-memory state store
//!
//! DashMap-backed implementation of the same optimistic contract as the
//! Postgres backend. Per-key atomicity comes from the map's shard guards: a
//! version check and the subsequent write happen under one entry lock, so
//! racing writers observe the same all-or-nothing semantics as the
//! conditional SQL write. Intended for tests and local runs.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, trace};

use crate::error::StoreResult;
use crate::store::{reject_duplicate_keys, StateStore};
use crate::types::{metadata_keys, IntervalFilter, MetadataFilter, State, VERSION_INITIAL};

/// In-memory [`StateStore`] with the full optimistic-concurrency contract.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    states: DashMap<String, State>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored states.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn create(&self, states: &[State]) -> StoreResult<HashSet<String>> {
        if states.is_empty() {
            return Ok(HashSet::new());
        }
        reject_duplicate_keys(states)?;

        let mut failed = HashSet::new();
        for state in states {
            match self.states.entry(state.key.clone()) {
                dashmap::mapref::entry::Entry::Occupied(_) => {
                    failed.insert(state.key.clone());
                }
                dashmap::mapref::entry::Entry::Vacant(entry) => {
                    entry.insert(State {
                        key: state.key.clone(),
                        value: state.value.clone(),
                        version: VERSION_INITIAL,
                        metadata: state.metadata.clone(),
                        modified_time: Utc::now(),
                    });
                }
            }
        }
        Ok(failed)
    }

    async fn get(&self, keys: &[String]) -> StoreResult<HashMap<String, State>> {
        Ok(keys
            .iter()
            .filter_map(|key| self.states.get(key).map(|entry| entry.clone()))
            .map(|state| (state.key.clone(), state))
            .collect())
    }

    async fn update(&self, states: &[State]) -> StoreResult<HashSet<String>> {
        let mut failed = HashSet::new();
        for state in states {
            // The entry guard keeps the version check and the write atomic
            // with respect to other writers on the same key.
            match self.states.get_mut(&state.key) {
                Some(mut current) if current.version == state.version => {
                    trace!(key = %state.key, version = state.version, "updating state");
                    *current = State {
                        key: state.key.clone(),
                        value: state.value.clone(),
                        version: state.version + 1,
                        metadata: state.metadata.clone(),
                        modified_time: Utc::now(),
                    };
                }
                _ => {
                    failed.insert(state.key.clone());
                }
            }
        }
        Ok(failed)
    }

    async fn delete(&self, states: &[State]) -> StoreResult<HashSet<String>> {
        let mut failed = HashSet::new();
        for state in states {
            let removed = self
                .states
                .remove_if(&state.key, |_, current| current.version == state.version);
            if removed.is_none() {
                failed.insert(state.key.clone());
            }
        }
        Ok(failed)
    }

    async fn find_by_metadata_matching_all(
        &self,
        filters: &[MetadataFilter],
    ) -> StoreResult<HashMap<String, State>> {
        if filters.is_empty() {
            return Ok(HashMap::new());
        }
        Ok(self
            .states
            .iter()
            .filter(|entry| filters.iter().all(|f| f.matches(&entry.metadata)))
            .map(|entry| (entry.key.clone(), entry.clone()))
            .collect())
    }

    async fn find_by_metadata_matching_any(
        &self,
        filters: &[MetadataFilter],
    ) -> StoreResult<HashMap<String, State>> {
        if filters.is_empty() {
            return Ok(HashMap::new());
        }
        Ok(self
            .states
            .iter()
            .filter(|entry| filters.iter().any(|f| f.matches(&entry.metadata)))
            .map(|entry| (entry.key.clone(), entry.clone()))
            .collect())
    }

    async fn find_updated_between(
        &self,
        interval: IntervalFilter,
    ) -> StoreResult<HashMap<String, State>> {
        Ok(self
            .states
            .iter()
            .filter(|entry| interval.contains(entry.modified_time))
            .map(|entry| (entry.key.clone(), entry.clone()))
            .collect())
    }

    async fn find_updated_between_with_metadata_matching_all(
        &self,
        interval: IntervalFilter,
        filters: &[MetadataFilter],
    ) -> StoreResult<HashMap<String, State>> {
        Ok(self
            .states
            .iter()
            .filter(|entry| {
                interval.contains(entry.modified_time)
                    && filters.iter().all(|f| f.matches(&entry.metadata))
            })
            .map(|entry| (entry.key.clone(), entry.clone()))
            .collect())
    }

    async fn delete_expired(&self) -> StoreResult<usize> {
        let now = Utc::now().timestamp_millis();
        let expired: Vec<String> = self
            .states
            .iter()
            .filter(|entry| {
                entry
                    .metadata
                    .get_number(metadata_keys::EXPIRY)
                    .is_some_and(|expiry| expiry <= now)
            })
            .map(|entry| entry.key.clone())
            .collect();

        let mut removed = 0;
        for key in expired {
            if self.states.remove(&key).is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "expiry sweep removed states");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store::contract;

    #[tokio::test]
    async fn round_trip() {
        contract::create_then_get_round_trips(&InMemoryStateStore::new()).await;
    }

    #[tokio::test]
    async fn idempotent_create() {
        contract::duplicate_create_is_idempotent(&InMemoryStateStore::new()).await;
    }

    #[tokio::test]
    async fn stale_write_rejection() {
        contract::stale_writes_are_rejected(&InMemoryStateStore::new()).await;
    }

    #[tokio::test]
    async fn metadata_conjunction() {
        contract::metadata_conjunction_selects_exactly(&InMemoryStateStore::new()).await;
    }

    #[tokio::test]
    async fn expiry_sweep() {
        contract::expiry_sweep_removes_past_states(&InMemoryStateStore::new()).await;
    }

    #[tokio::test]
    async fn duplicate_keys_in_create_batch_are_rejected() {
        let store = InMemoryStateStore::new();
        let err = store
            .create(&[
                State::new("same", b"a".to_vec()),
                State::new("same", b"b".to_vec()),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, crate::StoreError::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn missing_keys_are_absent_not_errors() {
        let store = InMemoryStateStore::new();
        store
            .create(&[State::new("present", b"x".to_vec())])
            .await
            .unwrap();
        let fetched = store
            .get(&["present".to_string(), "absent".to_string()])
            .await
            .unwrap();
        assert_eq!(fetched.len(), 1);
        assert!(fetched.contains_key("present"));
    }

    #[tokio::test]
    async fn concurrent_updates_lose_no_writes() {
        let store = Arc::new(InMemoryStateStore::new());
        store
            .create(&[State::new("contended", b"0".to_vec())])
            .await
            .unwrap();
        let base = store.get(&["contended".to_string()]).await.unwrap()["contended"].clone();

        // Twenty writers race on the same stored version; exactly one may win.
        let mut handles = Vec::new();
        for writer in 0..20u8 {
            let store = Arc::clone(&store);
            let mut attempt = base.clone();
            handles.push(tokio::spawn(async move {
                attempt.value = vec![writer];
                store.update(&[attempt]).await.unwrap().is_empty()
            }));
        }

        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);

        let current = store.get(&["contended".to_string()]).await.unwrap()["contended"].clone();
        assert_eq!(current.version, base.version + 1);
    }

    #[tokio::test]
    async fn version_increases_by_one_per_success() {
        let store = InMemoryStateStore::new();
        store
            .create(&[State::new("versioned", b"v".to_vec())])
            .await
            .unwrap();

        for expected in 1..=5i64 {
            let current = store.get(&["versioned".to_string()]).await.unwrap()["versioned"].clone();
            assert!(store.update(&[current]).await.unwrap().is_empty());
            let next = store.get(&["versioned".to_string()]).await.unwrap()["versioned"].clone();
            assert_eq!(next.version, expected);
        }
    }

    #[tokio::test]
    async fn interval_query_scans_modified_time() {
        let store = InMemoryStateStore::new();
        let before = Utc::now() - chrono::Duration::seconds(1);
        store
            .create(&[State::new("recent", b"x".to_vec())])
            .await
            .unwrap();
        let after = Utc::now() + chrono::Duration::seconds(1);

        let found = store
            .find_updated_between(IntervalFilter::new(before, after))
            .await
            .unwrap();
        assert!(found.contains_key("recent"));

        let found = store
            .find_updated_between(IntervalFilter::new(
                before - chrono::Duration::seconds(10),
                before,
            ))
            .await
            .unwrap();
        assert!(found.is_empty());
    }
}
