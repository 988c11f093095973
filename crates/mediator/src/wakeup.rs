//! Wake-up scheduler
//!
//! Keeps one in-memory timer per state entry that has asked to be woken up
//! (a `wake.at` metadata entry). When a timer fires it re-injects an event
//! for the key by publishing a wake-up record to the configured endpoint.
//! Scheduling a fresher wake time replaces (cancels) the prior timer for the
//! same key; losing a partition cancels every timer for keys owned by it;
//! regaining one reconstructs timers from the keys' persisted wake times.
//!
//! The key→timer map is the one structure mutated concurrently from mediator
//! callbacks and partition-lifecycle callbacks, hence the sharded map.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use stateflow_store::{metadata_keys, MetadataFilter, Operation, StateStore};

use crate::client::MessagingClient;
use crate::error::MediatorResult;
use crate::message::MediatorMessage;

/// Payload published when a wake-up timer fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WakeUpRecord {
    pub key: String,
    pub fired_at: DateTime<Utc>,
}

/// A key's pending wake-up, as reported by the mediator after a commit.
#[derive(Debug, Clone)]
pub struct WakeUpdate {
    pub key: String,
    /// Partition that currently owns the key, when known.
    pub partition: Option<i32>,
    /// `None` cancels any pending timer (state deleted or wake cleared).
    pub wake_at: Option<DateTime<Utc>>,
}

struct TimerEntry {
    handle: JoinHandle<()>,
    partition: Option<i32>,
}

/// One timer per key, publishing wake-up records when they fire.
pub struct WakeUpScheduler {
    store: Arc<dyn StateStore>,
    client: Arc<dyn MessagingClient>,
    endpoint: String,
    timers: Arc<DashMap<String, TimerEntry>>,
}

impl WakeUpScheduler {
    pub fn new(
        store: Arc<dyn StateStore>,
        client: Arc<dyn MessagingClient>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            store,
            client,
            endpoint: endpoint.into(),
            timers: Arc::new(DashMap::new()),
        }
    }

    /// Number of currently scheduled timers.
    pub fn scheduled(&self) -> usize {
        self.timers.len()
    }

    /// Apply the wake times of a batch of just-committed states.
    pub fn on_post_commit(&self, updates: impl IntoIterator<Item = WakeUpdate>) {
        for update in updates {
            match update.wake_at {
                Some(wake_at) => self.schedule(update.key, update.partition, wake_at),
                None => self.cancel(&update.key),
            }
        }
    }

    /// Cancel every timer for keys owned by the lost partitions.
    pub fn on_partition_lost(&self, partitions: &[i32]) {
        let affected: Vec<String> = self
            .timers
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .partition
                    .is_some_and(|p| partitions.contains(&p))
            })
            .map(|entry| entry.key().clone())
            .collect();
        for key in affected {
            self.cancel(&key);
        }
    }

    /// Rebuild timers for the keys persisted under the regained partitions,
    /// from their stored wake times. Returns the number of timers scheduled.
    pub async fn on_partition_synced(&self, partitions: &[i32]) -> MediatorResult<usize> {
        if partitions.is_empty() {
            return Ok(0);
        }
        let filters: Vec<MetadataFilter> = partitions
            .iter()
            .map(|p| MetadataFilter::new(metadata_keys::PARTITION, Operation::Equals, *p as i64))
            .collect();
        let states = self.store.find_by_metadata_matching_any(&filters).await?;

        let mut scheduled = 0;
        for state in states.into_values() {
            if let Some(wake_at) = state.wake_at() {
                let partition = state
                    .metadata
                    .get_number(metadata_keys::PARTITION)
                    .map(|p| p as i32);
                self.schedule(state.key, partition, wake_at);
                scheduled += 1;
            }
        }
        debug!(scheduled, ?partitions, "reconstructed wake-up timers");
        Ok(scheduled)
    }

    /// Schedule a wake-up for `key`, cancelling any prior timer for it.
    pub fn schedule(&self, key: String, partition: Option<i32>, wake_at: DateTime<Utc>) {
        let delay = (wake_at - Utc::now()).to_std().unwrap_or_default();

        let timers = Arc::clone(&self.timers);
        let client = Arc::clone(&self.client);
        let endpoint = self.endpoint.clone();
        let timer_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            timers.remove(&timer_key);

            let record = WakeUpRecord {
                key: timer_key.clone(),
                fired_at: Utc::now(),
            };
            let payload = match serde_json::to_vec(&record) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(key = %timer_key, %err, "failed to encode wake-up record");
                    return;
                }
            };
            if let Err(err) = client
                .send(MediatorMessage::new(endpoint, timer_key.clone(), payload))
                .await
            {
                warn!(key = %timer_key, %err, "failed to publish wake-up");
            }
        });

        if let Some(previous) = self.timers.insert(key, TimerEntry { handle, partition }) {
            previous.handle.abort();
        }
    }

    /// Cancel the timer for `key`, if any.
    pub fn cancel(&self, key: &str) {
        if let Some((_, entry)) = self.timers.remove(key) {
            entry.handle.abort();
        }
    }

    /// Cancel everything; used on shutdown.
    pub fn cancel_all(&self) {
        let keys: Vec<String> = self.timers.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.cancel(&key);
        }
    }
}

impl Drop for WakeUpScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::inmem::RecordingClient;
    use stateflow_store::{InMemoryStateStore, Metadata, State};

    fn scheduler(
        store: Arc<InMemoryStateStore>,
        client: Arc<RecordingClient>,
    ) -> WakeUpScheduler {
        WakeUpScheduler::new(store, client, "events.wakeup")
    }

    #[tokio::test]
    async fn firing_timer_publishes_and_unregisters() {
        let client = Arc::new(RecordingClient::new("bus"));
        let sched = scheduler(Arc::new(InMemoryStateStore::new()), client.clone());

        sched.schedule(
            "key-1".into(),
            Some(0),
            Utc::now() + chrono::Duration::milliseconds(20),
        );
        assert_eq!(sched.scheduled(), 1);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(sched.scheduled(), 0);

        let sent = client.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].endpoint, "events.wakeup");
        let record: WakeUpRecord = serde_json::from_slice(&sent[0].payload).unwrap();
        assert_eq!(record.key, "key-1");
    }

    #[tokio::test]
    async fn rescheduling_replaces_the_prior_timer() {
        let client = Arc::new(RecordingClient::new("bus"));
        let sched = scheduler(Arc::new(InMemoryStateStore::new()), client.clone());

        // The first timer would fire almost immediately; replacing it with a
        // far-future wake time must cancel it.
        sched.schedule(
            "key-1".into(),
            Some(0),
            Utc::now() + chrono::Duration::milliseconds(30),
        );
        sched.schedule(
            "key-1".into(),
            Some(0),
            Utc::now() + chrono::Duration::seconds(60),
        );

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(client.sent().is_empty());
        assert_eq!(sched.scheduled(), 1);
        sched.cancel_all();
    }

    #[tokio::test]
    async fn partition_loss_cancels_only_owned_keys() {
        let client = Arc::new(RecordingClient::new("bus"));
        let sched = scheduler(Arc::new(InMemoryStateStore::new()), client.clone());
        let far = Utc::now() + chrono::Duration::seconds(60);

        sched.schedule("lost-a".into(), Some(1), far);
        sched.schedule("lost-b".into(), Some(1), far);
        sched.schedule("kept".into(), Some(2), far);

        sched.on_partition_lost(&[1]);
        assert_eq!(sched.scheduled(), 1);
        sched.cancel_all();
    }

    #[tokio::test]
    async fn partition_sync_reconstructs_from_persisted_wake_times() {
        let store = Arc::new(InMemoryStateStore::new());
        let client = Arc::new(RecordingClient::new("bus"));

        let wake_at = (Utc::now() + chrono::Duration::seconds(60)).timestamp_millis();
        store
            .create(&[
                State::new("wakes", b"x".to_vec()).with_metadata(
                    Metadata::new()
                        .with(metadata_keys::PARTITION, 3i64)
                        .with(metadata_keys::WAKE_AT, wake_at),
                ),
                State::new("sleeps", b"x".to_vec())
                    .with_metadata(Metadata::new().with(metadata_keys::PARTITION, 3i64)),
                State::new("elsewhere", b"x".to_vec()).with_metadata(
                    Metadata::new()
                        .with(metadata_keys::PARTITION, 9i64)
                        .with(metadata_keys::WAKE_AT, wake_at),
                ),
            ])
            .await
            .unwrap();

        let sched = scheduler(store, client);
        let scheduled = sched.on_partition_synced(&[3]).await.unwrap();
        assert_eq!(scheduled, 1);
        assert_eq!(sched.scheduled(), 1);
        sched.cancel_all();
    }

    #[tokio::test]
    async fn post_commit_none_cancels() {
        let client = Arc::new(RecordingClient::new("bus"));
        let sched = scheduler(Arc::new(InMemoryStateStore::new()), client.clone());

        sched.schedule(
            "key-1".into(),
            Some(0),
            Utc::now() + chrono::Duration::seconds(60),
        );
        sched.on_post_commit([WakeUpdate {
            key: "key-1".into(),
            partition: Some(0),
            wake_at: None,
        }]);
        assert_eq!(sched.scheduled(), 0);
    }
}
