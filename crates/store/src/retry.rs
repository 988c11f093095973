//! Optimistic update-retry coordinator
//!
//! Applies a per-key transform to a batch of states, resolving conflicts by
//! re-fetching and re-applying. Under batch contention the number of retry
//! rounds needed is unpredictable, so the loop is bounded by a wall-clock
//! deadline rather than an attempt count.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::store::StateStore;
use crate::types::State;

/// Result of applying a transform to the current state of a key.
pub enum TransformOutcome {
    /// Write this candidate in the current round.
    Updated(State),
    /// Skip this round; the key stays pending and the transform is re-applied
    /// against a fresh state next round. This is a retry signal, not an
    /// error, and nothing bounds how often a key may skip short of the
    /// overall deadline.
    Skip,
}

/// Pure transform from the current state of a key to its candidate successor.
pub type Transform = Box<dyn Fn(&State) -> TransformOutcome + Send + Sync>;

/// Tuning for [`UpdateRetryCoordinator`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Wall-clock bound on the whole batch.
    pub deadline: Duration,
    /// Pause between retry rounds.
    pub backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(10),
            backoff: Duration::from_millis(5),
        }
    }
}

/// Applies keyed transforms under optimistic retry.
pub struct UpdateRetryCoordinator {
    store: Arc<dyn StateStore>,
    config: RetryConfig,
}

impl UpdateRetryCoordinator {
    pub fn new(store: Arc<dyn StateStore>, config: RetryConfig) -> Self {
        Self { store, config }
    }

    /// Apply each key's transform to its current state and persist the whole
    /// batch, retrying conflicted keys against re-fetched states until every
    /// key has committed or the deadline elapses.
    ///
    /// Every key in `transforms` must exist in the store; a missing key is an
    /// input contract violation ([`StoreError::MissingStates`]). On deadline
    /// expiry the unresolved keys are named in
    /// [`StoreError::DeadlineExceeded`]. A key is never re-applied after its
    /// write has succeeded.
    ///
    /// Returns the committed states keyed by state key.
    pub async fn apply(
        &self,
        transforms: HashMap<String, Transform>,
    ) -> StoreResult<HashMap<String, State>> {
        if transforms.is_empty() {
            return Ok(HashMap::new());
        }

        let keys: Vec<String> = transforms.keys().cloned().collect();
        let mut current = self.store.get(&keys).await?;
        ensure_all_present(&keys, &current)?;

        let started = Instant::now();
        let mut pending: HashSet<String> = keys.into_iter().collect();
        let mut committed: HashMap<String, State> = HashMap::new();
        let mut round = 0u32;

        loop {
            round += 1;
            let mut candidates: Vec<State> = Vec::new();
            let mut skipped: HashSet<String> = HashSet::new();

            for key in &pending {
                let Some(transform) = transforms.get(key) else {
                    continue;
                };
                let Some(state) = current.get(key) else {
                    continue;
                };
                match transform(state) {
                    TransformOutcome::Updated(mut candidate) => {
                        // The candidate must compare against the version the
                        // coordinator actually observed, whatever the
                        // transform put there.
                        candidate.key = state.key.clone();
                        candidate.version = state.version;
                        candidates.push(candidate);
                    }
                    TransformOutcome::Skip => {
                        skipped.insert(key.clone());
                    }
                }
            }

            let failed = if candidates.is_empty() {
                HashSet::new()
            } else {
                self.store.update(&candidates).await?
            };

            for candidate in candidates {
                if !failed.contains(&candidate.key) {
                    pending.remove(&candidate.key);
                    committed.insert(
                        candidate.key.clone(),
                        State {
                            version: candidate.version + 1,
                            modified_time: chrono::Utc::now(),
                            ..candidate
                        },
                    );
                }
            }

            if pending.is_empty() {
                debug!(rounds = round, "retry batch converged");
                return Ok(committed);
            }

            if started.elapsed() >= self.config.deadline {
                let mut keys: Vec<String> = pending.into_iter().collect();
                keys.sort();
                warn!(rounds = round, ?keys, "retry deadline elapsed");
                return Err(StoreError::DeadlineExceeded { keys });
            }

            if !failed.is_empty() {
                debug!(conflicts = failed.len(), round, "re-fetching conflicted keys");
            }

            // Conflicted and skipped keys alike see a fresh state next round.
            let refresh: Vec<String> = failed.union(&skipped).cloned().collect();
            let fresh = self.store.get(&refresh).await?;
            ensure_all_present(&refresh, &fresh)?;
            current.extend(fresh);

            if !self.config.backoff.is_zero() {
                tokio::time::sleep(self.config.backoff).await;
            }
        }
    }
}

fn ensure_all_present(keys: &[String], found: &HashMap<String, State>) -> StoreResult<()> {
    let missing: Vec<String> = keys
        .iter()
        .filter(|key| !found.contains_key(*key))
        .cloned()
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(StoreError::MissingStates { keys: missing })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::memory::InMemoryStateStore;
    use crate::types::Metadata;

    fn transform_appending(byte: u8, applications: Arc<AtomicUsize>) -> Transform {
        Box::new(move |state: &State| {
            applications.fetch_add(1, Ordering::SeqCst);
            let mut value = state.value.clone();
            value.push(byte);
            TransformOutcome::Updated(State {
                value,
                ..state.clone()
            })
        })
    }

    async fn seeded_store(keys: &[&str]) -> Arc<InMemoryStateStore> {
        let store = Arc::new(InMemoryStateStore::new());
        let states: Vec<State> = keys.iter().map(|k| State::new(*k, vec![])).collect();
        store.create(&states).await.unwrap();
        store
    }

    #[tokio::test]
    async fn applies_transforms_to_all_keys() {
        let store = seeded_store(&["a", "b"]).await;
        let coordinator = UpdateRetryCoordinator::new(store.clone(), RetryConfig::default());

        let applications = Arc::new(AtomicUsize::new(0));
        let mut transforms: HashMap<String, Transform> = HashMap::new();
        transforms.insert("a".into(), transform_appending(1, applications.clone()));
        transforms.insert("b".into(), transform_appending(2, applications.clone()));

        let committed = coordinator.apply(transforms).await.unwrap();
        assert_eq!(committed.len(), 2);
        assert_eq!(applications.load(Ordering::SeqCst), 2);

        let stored = store.get(&["a".into(), "b".into()]).await.unwrap();
        assert_eq!(stored["a"].value, vec![1]);
        assert_eq!(stored["a"].version, 1);
        assert_eq!(stored["b"].value, vec![2]);
    }

    #[tokio::test]
    async fn missing_key_is_a_contract_violation() {
        let store = seeded_store(&["present"]).await;
        let coordinator = UpdateRetryCoordinator::new(store, RetryConfig::default());

        let mut transforms: HashMap<String, Transform> = HashMap::new();
        transforms.insert(
            "absent".into(),
            Box::new(|state: &State| TransformOutcome::Updated(state.clone())),
        );

        let err = coordinator.apply(transforms).await.unwrap_err();
        match err {
            StoreError::MissingStates { keys } => assert_eq!(keys, vec!["absent".to_string()]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn two_writers_converge_within_deadline() {
        let store = seeded_store(&["contended"]).await;

        let mut handles = Vec::new();
        for byte in [1u8, 2u8] {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let coordinator = UpdateRetryCoordinator::new(store, RetryConfig::default());
                let applications = Arc::new(AtomicUsize::new(0));
                let mut transforms: HashMap<String, Transform> = HashMap::new();
                transforms.insert("contended".into(), transform_appending(byte, applications));
                coordinator.apply(transforms).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // Both writers committed: two version bumps, both bytes present.
        let stored = store.get(&["contended".into()]).await.unwrap();
        assert_eq!(stored["contended"].version, 2);
        let mut bytes = stored["contended"].value.clone();
        bytes.sort_unstable();
        assert_eq!(bytes, vec![1, 2]);
    }

    #[tokio::test]
    async fn committed_keys_are_not_reapplied() {
        let store = seeded_store(&["done", "slow"]).await;
        let coordinator = UpdateRetryCoordinator::new(
            store.clone(),
            RetryConfig {
                deadline: Duration::from_secs(5),
                backoff: Duration::from_millis(1),
            },
        );

        // "slow" skips twice before writing; "done" must still be applied
        // exactly once.
        let done_applications = Arc::new(AtomicUsize::new(0));
        let slow_rounds = Arc::new(AtomicUsize::new(0));
        let mut transforms: HashMap<String, Transform> = HashMap::new();
        transforms.insert("done".into(), transform_appending(9, done_applications.clone()));
        let slow_counter = slow_rounds.clone();
        transforms.insert(
            "slow".into(),
            Box::new(move |state: &State| {
                if slow_counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    TransformOutcome::Skip
                } else {
                    TransformOutcome::Updated(State {
                        value: vec![7],
                        ..state.clone()
                    })
                }
            }),
        );

        let committed = coordinator.apply(transforms).await.unwrap();
        assert_eq!(committed.len(), 2);
        assert_eq!(done_applications.load(Ordering::SeqCst), 1);
        assert!(slow_rounds.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn starved_key_trips_deadline() {
        let store = seeded_store(&["starved"]).await;
        let coordinator = UpdateRetryCoordinator::new(
            store,
            RetryConfig {
                deadline: Duration::from_millis(50),
                backoff: Duration::from_millis(1),
            },
        );

        // A transform that always signals Skip is never written; nothing
        // bounds the skipping except the deadline.
        let mut transforms: HashMap<String, Transform> = HashMap::new();
        transforms.insert("starved".into(), Box::new(|_: &State| TransformOutcome::Skip));

        let err = coordinator.apply(transforms).await.unwrap_err();
        match err {
            StoreError::DeadlineExceeded { keys } => {
                assert_eq!(keys, vec!["starved".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn transform_version_tampering_is_ignored() {
        let store = seeded_store(&["tamper"]).await;
        let coordinator = UpdateRetryCoordinator::new(store.clone(), RetryConfig::default());

        let mut transforms: HashMap<String, Transform> = HashMap::new();
        transforms.insert(
            "tamper".into(),
            Box::new(|state: &State| {
                TransformOutcome::Updated(State {
                    version: 999,
                    metadata: Metadata::new().with("touched", true),
                    ..state.clone()
                })
            }),
        );

        coordinator.apply(transforms).await.unwrap();
        let stored = store.get(&["tamper".into()]).await.unwrap();
        assert_eq!(stored["tamper"].version, 1);
    }
}
