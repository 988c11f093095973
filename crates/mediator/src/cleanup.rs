//! Scheduled-cleanup processors
//!
//! Many unrelated periodic tasks share one trigger feed; each processor here
//! is bound to a single task name and acts only when a batch contains a
//! trigger with that name. Triggers for other tasks are ignored without
//! error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use stateflow_store::{IntervalFilter, MetadataFilter, StateStore};

use crate::client::MessagingClient;
use crate::consumer::FeedConsumer;
use crate::error::MediatorResult;
use crate::message::{EventRecord, MediatorMessage};

/// A record on the shared scheduled-trigger feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTaskTrigger {
    pub name: String,
    pub timestamp: DateTime<Utc>,
}

impl ScheduledTaskTrigger {
    pub fn now(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timestamp: Utc::now(),
        }
    }
}

/// A consumer of scheduled-trigger batches, bound to one task name.
#[async_trait]
pub trait TriggerProcessor: Send + Sync {
    fn task_name(&self) -> &str;

    async fn on_next(
        &self,
        triggers: &[EventRecord<ScheduledTaskTrigger>],
    ) -> MediatorResult<()>;
}

/// Invokes the state store's expiry sweep when its task fires.
pub struct ExpiryCleanupProcessor {
    task_name: String,
    store: Arc<dyn StateStore>,
}

impl ExpiryCleanupProcessor {
    pub fn new(task_name: impl Into<String>, store: Arc<dyn StateStore>) -> Self {
        Self {
            task_name: task_name.into(),
            store,
        }
    }

    /// Run the sweep if any trigger in the batch carries the bound name.
    /// Returns the number of removed states (0 when the batch was for other
    /// tasks).
    pub async fn process(
        &self,
        triggers: &[EventRecord<ScheduledTaskTrigger>],
    ) -> MediatorResult<usize> {
        if !triggers.iter().any(|t| t.payload.name == self.task_name) {
            return Ok(0);
        }
        let removed = self.store.delete_expired().await?;
        info!(task = %self.task_name, removed, "expiry cleanup ran");
        Ok(removed)
    }
}

#[async_trait]
impl TriggerProcessor for ExpiryCleanupProcessor {
    fn task_name(&self) -> &str {
        &self.task_name
    }

    async fn on_next(
        &self,
        triggers: &[EventRecord<ScheduledTaskTrigger>],
    ) -> MediatorResult<()> {
        self.process(triggers).await.map(|_| ())
    }
}

/// A batch of keys some downstream stage should delete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletionCandidateBatch {
    pub keys: Vec<String>,
    pub requested_at: DateTime<Utc>,
}

/// Queries states by a status metadata filter and emits batches of
/// deletion-candidate keys to a downstream cleanup endpoint, deferring the
/// actual delete to another stage for scale-out. Only states untouched for
/// the retention window are candidates, so recently replayed keys survive.
pub struct CandidateSweepProcessor {
    task_name: String,
    store: Arc<dyn StateStore>,
    client: Arc<dyn MessagingClient>,
    endpoint: String,
    status_filter: MetadataFilter,
    retention: Duration,
    batch_size: usize,
}

impl CandidateSweepProcessor {
    pub fn new(
        task_name: impl Into<String>,
        store: Arc<dyn StateStore>,
        client: Arc<dyn MessagingClient>,
        endpoint: impl Into<String>,
        status_filter: MetadataFilter,
        retention: Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            task_name: task_name.into(),
            store,
            client,
            endpoint: endpoint.into(),
            status_filter,
            retention,
            batch_size: batch_size.max(1),
        }
    }

    /// Emit candidate batches if the bound task fired. Returns the number of
    /// candidate keys emitted.
    pub async fn process(
        &self,
        triggers: &[EventRecord<ScheduledTaskTrigger>],
    ) -> MediatorResult<usize> {
        if !triggers.iter().any(|t| t.payload.name == self.task_name) {
            return Ok(0);
        }

        let finish = Utc::now() - chrono::Duration::from_std(self.retention).unwrap_or_default();
        let interval = IntervalFilter::new(DateTime::UNIX_EPOCH, finish);
        let matching = self
            .store
            .find_updated_between_with_metadata_matching_all(
                interval,
                std::slice::from_ref(&self.status_filter),
            )
            .await?;
        let mut keys: Vec<String> = matching.into_keys().collect();
        keys.sort();

        let total = keys.len();
        for chunk in keys.chunks(self.batch_size) {
            let batch = DeletionCandidateBatch {
                keys: chunk.to_vec(),
                requested_at: Utc::now(),
            };
            let payload =
                serde_json::to_vec(&batch).map_err(|e| crate::MediatorError::Serialization {
                    details: format!("candidate batch encode: {e}"),
                })?;
            self.client
                .send(MediatorMessage::new(
                    self.endpoint.clone(),
                    self.task_name.clone(),
                    payload,
                ))
                .await?;
        }
        debug!(task = %self.task_name, candidates = total, "candidate sweep emitted");
        Ok(total)
    }
}

#[async_trait]
impl TriggerProcessor for CandidateSweepProcessor {
    fn task_name(&self) -> &str {
        &self.task_name
    }

    async fn on_next(
        &self,
        triggers: &[EventRecord<ScheduledTaskTrigger>],
    ) -> MediatorResult<()> {
        self.process(triggers).await.map(|_| ())
    }
}

/// Drives one or more trigger processors from a shared trigger feed: poll,
/// hand the batch to every processor, commit.
pub struct TriggerSubscription {
    consumer: Box<dyn FeedConsumer<ScheduledTaskTrigger>>,
    processors: Vec<Arc<dyn TriggerProcessor>>,
    poll_timeout: Duration,
    shutdown: Arc<AtomicBool>,
}

impl TriggerSubscription {
    pub fn new(
        consumer: Box<dyn FeedConsumer<ScheduledTaskTrigger>>,
        processors: Vec<Arc<dyn TriggerProcessor>>,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            consumer,
            processors,
            poll_timeout,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle for requesting a stop from another task.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub async fn run(mut self) -> MediatorResult<()> {
        while !self.shutdown.load(Ordering::SeqCst) {
            let triggers = self.consumer.poll(self.poll_timeout).await?;
            if triggers.is_empty() {
                continue;
            }
            for processor in &self.processors {
                if let Err(err) = processor.on_next(&triggers).await {
                    warn!(task = processor.task_name(), %err, "trigger processor failed");
                }
            }
            self.consumer.commit().await?;
        }
        self.consumer.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::inmem::{InMemoryFeed, RecordingClient};
    use stateflow_store::{
        metadata_keys, InMemoryStateStore, Metadata, Operation, State, StoreResult,
    };

    fn trigger(name: &str, offset: i64) -> EventRecord<ScheduledTaskTrigger> {
        EventRecord::new("task.triggers", 0, offset, name, ScheduledTaskTrigger::now(name))
    }

    /// Counts expiry sweeps so trigger filtering is observable.
    struct CountingStore {
        inner: InMemoryStateStore,
        sweeps: AtomicUsize,
    }

    #[async_trait]
    impl StateStore for CountingStore {
        async fn create(&self, states: &[State]) -> StoreResult<HashSet<String>> {
            self.inner.create(states).await
        }
        async fn get(
            &self,
            keys: &[String],
        ) -> StoreResult<std::collections::HashMap<String, State>> {
            self.inner.get(keys).await
        }
        async fn update(&self, states: &[State]) -> StoreResult<HashSet<String>> {
            self.inner.update(states).await
        }
        async fn delete(&self, states: &[State]) -> StoreResult<HashSet<String>> {
            self.inner.delete(states).await
        }
        async fn find_by_metadata_matching_all(
            &self,
            filters: &[MetadataFilter],
        ) -> StoreResult<std::collections::HashMap<String, State>> {
            self.inner.find_by_metadata_matching_all(filters).await
        }
        async fn find_by_metadata_matching_any(
            &self,
            filters: &[MetadataFilter],
        ) -> StoreResult<std::collections::HashMap<String, State>> {
            self.inner.find_by_metadata_matching_any(filters).await
        }
        async fn find_updated_between(
            &self,
            interval: stateflow_store::IntervalFilter,
        ) -> StoreResult<std::collections::HashMap<String, State>> {
            self.inner.find_updated_between(interval).await
        }
        async fn find_updated_between_with_metadata_matching_all(
            &self,
            interval: stateflow_store::IntervalFilter,
            filters: &[MetadataFilter],
        ) -> StoreResult<std::collections::HashMap<String, State>> {
            self.inner
                .find_updated_between_with_metadata_matching_all(interval, filters)
                .await
        }
        async fn delete_expired(&self) -> StoreResult<usize> {
            self.sweeps.fetch_add(1, Ordering::SeqCst);
            self.inner.delete_expired().await
        }
    }

    #[tokio::test]
    async fn bound_name_triggers_cleanup_exactly_once() {
        let store = Arc::new(CountingStore {
            inner: InMemoryStateStore::new(),
            sweeps: AtomicUsize::new(0),
        });
        let processor = ExpiryCleanupProcessor::new("X", store.clone());

        // A batch mentioning X among unrelated tasks sweeps once.
        processor
            .process(&[trigger("X", 0), trigger("Y", 1), trigger("Z", 2)])
            .await
            .unwrap();
        assert_eq!(store.sweeps.load(Ordering::SeqCst), 1);

        // A batch of only foreign tasks is ignored without error.
        processor
            .process(&[trigger("Y", 3), trigger("Z", 4)])
            .await
            .unwrap();
        assert_eq!(store.sweeps.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expiry_cleanup_removes_expired_states() {
        let store = Arc::new(InMemoryStateStore::new());
        let past = Utc::now().timestamp_millis() - 1_000;
        store
            .create(&[
                State::new("old", b"x".to_vec())
                    .with_metadata(Metadata::new().with(metadata_keys::EXPIRY, past)),
                State::new("keep", b"x".to_vec()),
            ])
            .await
            .unwrap();

        let processor = ExpiryCleanupProcessor::new("sweep", store.clone());
        let removed = processor.process(&[trigger("sweep", 0)]).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn candidate_sweep_emits_batches_downstream() {
        let store = Arc::new(InMemoryStateStore::new());
        let states: Vec<State> = (0..5)
            .map(|i| {
                State::new(format!("done-{i}"), b"x".to_vec())
                    .with_metadata(Metadata::new().with("status", "terminated"))
            })
            .collect();
        store.create(&states).await.unwrap();
        store
            .create(&[State::new("running", b"x".to_vec())
                .with_metadata(Metadata::new().with("status", "active"))])
            .await
            .unwrap();

        let client = Arc::new(RecordingClient::new("bus"));
        let processor = CandidateSweepProcessor::new(
            "terminate",
            store,
            client.clone(),
            "cleanup.candidates",
            MetadataFilter::new("status", Operation::Equals, "terminated"),
            Duration::ZERO,
            2,
        );

        let emitted = processor.process(&[trigger("terminate", 0)]).await.unwrap();
        assert_eq!(emitted, 5);

        // 5 keys in chunks of 2 -> 3 messages, none mentioning the live key.
        let sent = client.sent();
        assert_eq!(sent.len(), 3);
        let keys: Vec<String> = sent
            .iter()
            .flat_map(|m| {
                serde_json::from_slice::<DeletionCandidateBatch>(&m.payload)
                    .unwrap()
                    .keys
            })
            .collect();
        assert_eq!(keys.len(), 5);
        assert!(!keys.contains(&"running".to_string()));
    }

    #[tokio::test]
    async fn subscription_polls_and_commits() {
        let store = Arc::new(CountingStore {
            inner: InMemoryStateStore::new(),
            sweeps: AtomicUsize::new(0),
        });
        let processor = Arc::new(ExpiryCleanupProcessor::new("X", store.clone()));

        let feed: InMemoryFeed<ScheduledTaskTrigger> = InMemoryFeed::new("task.triggers");
        feed.push("X", ScheduledTaskTrigger::now("X"));
        feed.push("Y", ScheduledTaskTrigger::now("Y"));

        let subscription = TriggerSubscription::new(
            Box::new(feed.consumer()),
            vec![processor as Arc<dyn TriggerProcessor>],
            Duration::from_millis(10),
        );
        let shutdown = subscription.shutdown_handle();
        let handle = tokio::spawn(subscription.run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.store(true, Ordering::SeqCst);
        handle.await.unwrap().unwrap();

        assert_eq!(store.sweeps.load(Ordering::SeqCst), 1);
        assert_eq!(feed.committed_events(), 2);
    }
}
