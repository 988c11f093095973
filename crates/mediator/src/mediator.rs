//! Multi-source event mediator
//!
//! Orchestrates the full cycle: poll N input feeds, group events by key,
//! invoke the injected business processor (per-key in order, cross-key
//! concurrent up to pool capacity), persist all resulting states in one
//! optimistic batch, resolve conflicts per key by re-fetching and
//! re-processing, route output records to their transports, and only then
//! commit input offsets.
//!
//! Store calls and synchronous sends run on the blocking-task pool so they
//! can never starve event processing of unrelated keys.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use stateflow_store::{metadata_keys, Metadata, State, StateStore};

use crate::client::MessagingClient;
use crate::codec::Codec;
use crate::config::{DeadLetterDestination, MediatorConfig, MediatorTuning};
use crate::consumer::{ConsumerFactory, FeedConsumer, PartitionEvent};
use crate::error::{MediatorError, MediatorResult};
use crate::message::{DeadLetterRecord, EventRecord, MediatorMessage, OutputRecord};
use crate::metrics::{MediatorMetrics, MetricsHandle};
use crate::pools::TaskPools;
use crate::processor::EventProcessor;
use crate::router::{MessageRouter, SendMode};
use crate::wakeup::{WakeUpScheduler, WakeUpdate};

/// Lifecycle state of a mediator instance, published on a watch channel so
/// the owning supervisor observes transitions without callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediatorStatus {
    Stopped,
    Starting,
    Polling,
    Processing,
    Persisting,
    Routing,
    /// Unrecoverable failure; terminal.
    Error(String),
}

/// What should happen to a key's state after its events were applied.
enum StatePlan {
    /// Nothing to persist (no prior state and nothing produced, or every
    /// event for the key was dead-lettered).
    Unchanged,
    /// Persist this value and metadata (create or update).
    Write { value: Vec<u8>, metadata: Metadata },
    /// Remove the state.
    Remove,
}

/// The result of applying one key's events.
struct KeyOutcome<E, O> {
    key: String,
    partition: i32,
    /// The key's events, retained so a conflicted key can be re-processed.
    events: Vec<EventRecord<E>>,
    /// State as fetched before processing (`None` for first-seen keys).
    original: Option<State>,
    plan: StatePlan,
    outputs: Vec<OutputRecord<O>>,
    dead_letters: Vec<DeadLetterRecord>,
}

/// The mediator engine. Construct with [`MediatorConfig::builder`], then
/// drive with [`run`](Self::run) from a spawned task; [`stop`](Self::stop)
/// requests a graceful halt.
pub struct MultiSourceEventMediator<S, E, O> {
    name: String,
    tuning: MediatorTuning,
    consumer_factories: Vec<Box<dyn ConsumerFactory<E>>>,
    client_factories: Vec<Box<dyn crate::client::ClientFactory>>,
    processor: Arc<dyn EventProcessor<S, E, O>>,
    router: Arc<dyn MessageRouter<O>>,
    store: Arc<dyn StateStore>,
    state_codec: Arc<dyn Codec<S>>,
    event_codec: Arc<dyn Codec<E>>,
    output_codec: Arc<dyn Codec<O>>,
    dead_letter: DeadLetterDestination,
    wakeup: Option<Arc<WakeUpScheduler>>,
    pools: TaskPools,
    status: watch::Sender<MediatorStatus>,
    shutdown: Arc<AtomicBool>,
    metrics: MetricsHandle,
}

impl<S, E, O> MultiSourceEventMediator<S, E, O>
where
    S: Clone + Send + 'static,
    E: Send + 'static,
    O: Send + 'static,
{
    pub fn new(config: MediatorConfig<S, E, O>) -> Self {
        let pools = TaskPools::new(
            &config.name,
            config.tuning.processing_threads,
            config.tuning.blocking_threads,
        );
        let (status, _) = watch::channel(MediatorStatus::Stopped);
        Self {
            name: config.name,
            tuning: config.tuning,
            consumer_factories: config.consumer_factories,
            client_factories: config.client_factories,
            processor: config.processor,
            router: config.router,
            store: config.store,
            state_codec: config.state_codec,
            event_codec: config.event_codec,
            output_codec: config.output_codec,
            dead_letter: config.dead_letter,
            wakeup: config.wakeup,
            pools,
            status,
            shutdown: Arc::new(AtomicBool::new(false)),
            metrics: MetricsHandle::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    pub fn status(&self) -> MediatorStatus {
        self.status.borrow().clone()
    }

    /// Watch lifecycle transitions; this is the supervisor's view.
    pub fn subscribe_status(&self) -> watch::Receiver<MediatorStatus> {
        self.status.subscribe()
    }

    pub async fn metrics(&self) -> MediatorMetrics {
        self.metrics.snapshot().await
    }

    /// Request a graceful stop after the in-flight batch.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Run the subscription until [`stop`](Self::stop) or a fatal error.
    pub async fn run(&self) -> MediatorResult<()> {
        self.publish(MediatorStatus::Starting);
        info!(name = %self.name, "starting mediator");

        let result = self.run_subscription().await;
        match &result {
            Ok(()) => {
                info!(name = %self.name, "mediator stopped");
                self.publish(MediatorStatus::Stopped);
            }
            Err(err) => {
                error!(name = %self.name, %err, "mediator failed");
                self.publish(MediatorStatus::Error(err.to_string()));
            }
        }
        result
    }

    async fn run_subscription(&self) -> MediatorResult<()> {
        let mut attempts = 0u32;
        while !self.is_shutdown() {
            attempts += 1;
            // Consumer/client construction failures are fatal and reported to
            // the supervisor as a down status by `run`.
            let (mut consumers, clients) = self.build_transports()?;

            let result = self.consume_loop(&mut consumers, &clients).await;
            for consumer in consumers.iter_mut() {
                consumer.close().await;
            }
            match result {
                Ok(()) => return Ok(()),
                Err(err) if !err.is_fatal() => {
                    warn!(
                        name = %self.name,
                        %err,
                        attempts,
                        "intermittent failure, recreating consumers and clients"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn build_transports(
        &self,
    ) -> MediatorResult<(
        Vec<Box<dyn FeedConsumer<E>>>,
        HashMap<String, Arc<dyn MessagingClient>>,
    )> {
        let mut consumers = Vec::new();
        for factory in &self.consumer_factories {
            let replicas = factory.replicas().max(1);
            for _ in 0..replicas {
                let consumer =
                    factory
                        .create()
                        .map_err(|err| MediatorError::Construction {
                            component: "consumer",
                            name: factory.source().to_string(),
                            details: err.to_string(),
                        })?;
                consumers.push(consumer);
            }
            debug!(source = factory.source(), replicas, "created feed consumers");
        }

        let mut clients: HashMap<String, Arc<dyn MessagingClient>> = HashMap::new();
        for factory in &self.client_factories {
            let client = factory
                .create()
                .map_err(|err| MediatorError::Construction {
                    component: "client",
                    name: factory.id().to_string(),
                    details: err.to_string(),
                })?;
            clients.insert(factory.id().to_string(), client);
        }

        if !clients.contains_key(&self.dead_letter.client_id) {
            return Err(MediatorError::Configuration {
                details: format!(
                    "dead-letter client '{}' is not registered",
                    self.dead_letter.client_id
                ),
            });
        }
        Ok((consumers, clients))
    }

    async fn consume_loop(
        &self,
        consumers: &mut [Box<dyn FeedConsumer<E>>],
        clients: &HashMap<String, Arc<dyn MessagingClient>>,
    ) -> MediatorResult<()> {
        let poll_timeout = self.tuning.poll_timeout();

        while !self.is_shutdown() {
            self.publish(MediatorStatus::Polling);
            let mut events = Vec::new();
            for consumer in consumers.iter_mut() {
                events.extend(consumer.poll(poll_timeout).await?);
            }
            self.dispatch_partition_events(consumers).await;

            if events.is_empty() {
                continue;
            }
            let batch_size = events.len();
            self.metrics
                .record(|m| {
                    m.polled += batch_size as u64;
                    m.last_batch_size = batch_size;
                })
                .await;

            self.publish(MediatorStatus::Processing);
            let mut outcomes = self.process_batch(events).await?;

            self.publish(MediatorStatus::Persisting);
            self.persist_batch(&mut outcomes).await?;

            self.publish(MediatorStatus::Routing);
            self.route_outputs(clients, &mut outcomes).await?;

            // Input offsets commit strictly after the batch's state writes
            // (and synchronous sends) have succeeded.
            for consumer in consumers.iter_mut() {
                consumer.commit().await?;
            }
            // Fire-and-forget sends flush after the commit: redelivery is
            // acceptable, silent loss is not.
            for client in clients.values() {
                client.flush().await?;
            }

            if let Some(wakeup) = &self.wakeup {
                wakeup.on_post_commit(wake_updates(&outcomes));
            }

            self.metrics
                .record(|m| {
                    m.batches += 1;
                    m.commits += 1;
                })
                .await;
            debug!(name = %self.name, batch_size, "batch complete");
        }
        Ok(())
    }

    async fn dispatch_partition_events(&self, consumers: &mut [Box<dyn FeedConsumer<E>>]) {
        for consumer in consumers.iter_mut() {
            for event in consumer.drain_partition_events() {
                let Some(wakeup) = &self.wakeup else { continue };
                match event {
                    PartitionEvent::Revoked { partitions, source } => {
                        debug!(%source, ?partitions, "partitions revoked");
                        wakeup.on_partition_lost(&partitions);
                    }
                    PartitionEvent::Assigned { partitions, source } => {
                        debug!(%source, ?partitions, "partitions assigned");
                        if let Err(err) = wakeup.on_partition_synced(&partitions).await {
                            warn!(%source, %err, "failed to reconstruct wake-up timers");
                        }
                    }
                }
            }
        }
    }

    /// Group polled events by key and run the processor over each key's
    /// events in arrival order, concurrently across keys.
    async fn process_batch(
        &self,
        events: Vec<EventRecord<E>>,
    ) -> MediatorResult<Vec<KeyOutcome<E, O>>> {
        let total = events.len();

        // Group by key, preserving per-key arrival order and first-seen key
        // order across the batch.
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<EventRecord<E>>> = HashMap::new();
        for event in events {
            if !groups.contains_key(&event.key) {
                order.push(event.key.clone());
            }
            groups.entry(event.key.clone()).or_default().push(event);
        }

        // Current states for the whole batch, fetched on the blocking pool.
        let keys = order.clone();
        let store = Arc::clone(&self.store);
        let mut current = self
            .pools
            .blocking
            .spawn(async move { store.get(&keys).await })
            .await
            .map_err(join_failure)??;

        // Pack key groups into task groups of at least `min_group_size`
        // events; each task group becomes one processing-pool task.
        let mut task_groups: Vec<Vec<(Option<State>, Vec<EventRecord<E>>)>> = Vec::new();
        let mut bucket: Vec<(Option<State>, Vec<EventRecord<E>>)> = Vec::new();
        let mut bucket_events = 0usize;
        for key in order {
            let Some(events) = groups.remove(&key) else {
                continue;
            };
            bucket_events += events.len();
            bucket.push((current.remove(&key), events));
            if bucket_events >= self.tuning.min_group_size {
                task_groups.push(std::mem::take(&mut bucket));
                bucket_events = 0;
            }
        }
        if !bucket.is_empty() {
            task_groups.push(bucket);
        }

        let mut handles = Vec::new();
        for group in task_groups {
            let processor = Arc::clone(&self.processor);
            let state_codec = Arc::clone(&self.state_codec);
            let event_codec = Arc::clone(&self.event_codec);
            handles.push(self.pools.processing.spawn(async move {
                group
                    .into_iter()
                    .map(|(state, events)| {
                        apply_events(&processor, &state_codec, &event_codec, state, events)
                    })
                    .collect::<Vec<_>>()
            }));
        }

        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.extend(handle.await.map_err(join_failure)?);
        }
        self.metrics.record(|m| m.processed += total as u64).await;
        Ok(outcomes)
    }

    /// Persist the whole batch's states in one optimistic round, then
    /// resolve conflicted keys individually.
    async fn persist_batch(&self, outcomes: &mut [KeyOutcome<E, O>]) -> MediatorResult<()> {
        let mut creates = Vec::new();
        let mut updates = Vec::new();
        let mut deletes = Vec::new();
        for outcome in outcomes.iter() {
            match (&outcome.plan, &outcome.original) {
                (StatePlan::Write { value, metadata }, None) => creates.push(
                    State::new(outcome.key.clone(), value.clone())
                        .with_metadata(metadata.clone()),
                ),
                (StatePlan::Write { value, metadata }, Some(original)) => updates.push(State {
                    key: outcome.key.clone(),
                    value: value.clone(),
                    version: original.version,
                    metadata: metadata.clone(),
                    modified_time: original.modified_time,
                }),
                (StatePlan::Remove, Some(original)) => deletes.push(original.clone()),
                _ => {}
            }
        }

        let store = Arc::clone(&self.store);
        let counts = (creates.len(), updates.len(), deletes.len());
        let conflicted: HashSet<String> = self
            .pools
            .blocking
            .spawn(async move {
                let mut conflicted = HashSet::new();
                conflicted.extend(store.create(&creates).await?);
                conflicted.extend(store.update(&updates).await?);
                conflicted.extend(store.delete(&deletes).await?);
                Ok::<_, MediatorError>(conflicted)
            })
            .await
            .map_err(join_failure)??;

        self.metrics
            .record(|m| {
                m.created += counts.0 as u64;
                m.updated += counts.1 as u64;
                m.deleted += counts.2 as u64;
                m.conflicts += conflicted.len() as u64;
            })
            .await;

        // Conflicts are not batch failures: each conflicted key is re-fetched
        // and re-processed on its own, without touching the rest of the batch.
        for outcome in outcomes.iter_mut() {
            if conflicted.contains(&outcome.key) {
                self.resolve_conflict(outcome).await?;
            }
        }
        Ok(())
    }

    /// Re-fetch, re-process and re-persist one conflicted key, bounded by the
    /// retry deadline. Deadline expiry is fatal for this key only: its events
    /// are diverted to the dead-letter output and the batch carries on.
    async fn resolve_conflict(&self, outcome: &mut KeyOutcome<E, O>) -> MediatorResult<()> {
        let deadline = Instant::now() + self.tuning.retry_deadline();

        loop {
            let key = outcome.key.clone();
            debug!(%key, "resolving persistence conflict");

            let store = Arc::clone(&self.store);
            let fetch_key = key.clone();
            let fresh: Option<State> = self
                .pools
                .blocking
                .spawn(async move {
                    store
                        .get(&[fetch_key.clone()])
                        .await
                        .map(|mut found| found.remove(&fetch_key))
                })
                .await
                .map_err(join_failure)??;

            let events = std::mem::take(&mut outcome.events);
            let processor = Arc::clone(&self.processor);
            let state_codec = Arc::clone(&self.state_codec);
            let event_codec = Arc::clone(&self.event_codec);
            *outcome = self
                .pools
                .processing
                .spawn(async move {
                    apply_events(&processor, &state_codec, &event_codec, fresh, events)
                })
                .await
                .map_err(join_failure)?;

            let attempt = match (&outcome.plan, &outcome.original) {
                (StatePlan::Write { value, metadata }, None) => Some((
                    State::new(outcome.key.clone(), value.clone())
                        .with_metadata(metadata.clone()),
                    WriteKind::Create,
                )),
                (StatePlan::Write { value, metadata }, Some(original)) => Some((
                    State {
                        key: outcome.key.clone(),
                        value: value.clone(),
                        version: original.version,
                        metadata: metadata.clone(),
                        modified_time: original.modified_time,
                    },
                    WriteKind::Update,
                )),
                (StatePlan::Remove, Some(original)) => {
                    Some((original.clone(), WriteKind::Delete))
                }
                _ => None,
            };

            let Some((state, kind)) = attempt else {
                return Ok(());
            };

            let store = Arc::clone(&self.store);
            let failed = self
                .pools
                .blocking
                .spawn(async move {
                    let states = [state];
                    match kind {
                        WriteKind::Create => store.create(&states).await,
                        WriteKind::Update => store.update(&states).await,
                        WriteKind::Delete => store.delete(&states).await,
                    }
                })
                .await
                .map_err(join_failure)??;

            if failed.is_empty() {
                debug!(%key, "conflict resolved");
                return Ok(());
            }

            if Instant::now() >= deadline {
                warn!(%key, "conflict resolution deadline exceeded, dead-lettering events");
                let state_bytes = outcome.original.as_ref().map(|s| s.value.clone());
                let dead: Vec<DeadLetterRecord> = outcome
                    .events
                    .iter()
                    .map(|event| {
                        DeadLetterRecord::new(
                            event.source.clone(),
                            event.key.clone(),
                            state_bytes.clone(),
                            self.event_codec.encode(&event.payload).ok(),
                            "persistence retry deadline exceeded",
                        )
                    })
                    .collect();
                outcome.dead_letters.extend(dead);
                outcome.outputs.clear();
                outcome.plan = StatePlan::Unchanged;
                return Ok(());
            }
        }
    }

    /// Route every output through the message router. Synchronous sends
    /// complete on the blocking pool before the batch is considered done;
    /// asynchronous sends are accepted for delivery and flushed post-commit.
    /// Dead letters go to the configured dead-letter destination.
    async fn route_outputs(
        &self,
        clients: &HashMap<String, Arc<dyn MessagingClient>>,
        outcomes: &mut [KeyOutcome<E, O>],
    ) -> MediatorResult<()> {
        let mut routed = 0u64;
        let mut dead_lettered = 0u64;

        for outcome in outcomes.iter_mut() {
            for output in outcome.outputs.drain(..) {
                let destination = self.router.route(&output.payload).ok_or_else(|| {
                    MediatorError::UnroutableOutput {
                        payload_type: std::any::type_name::<O>().to_string(),
                    }
                })?;
                let client = clients
                    .get(&destination.client_id)
                    .cloned()
                    .ok_or_else(|| MediatorError::MissingClient {
                        client_id: destination.client_id.clone(),
                    })?;

                let payload = self.output_codec.encode(&output.payload)?;
                let message = MediatorMessage::new(destination.endpoint, output.key, payload);

                match destination.mode {
                    SendMode::Synchronous => {
                        let reply = self
                            .pools
                            .blocking
                            .spawn(async move { client.send(message).await })
                            .await
                            .map_err(join_failure)??;
                        if reply.is_some() {
                            debug!(client = %destination.client_id, "synchronous send replied");
                        }
                    }
                    SendMode::Asynchronous => {
                        client.send(message).await?;
                    }
                }
                routed += 1;
            }

            if outcome.dead_letters.is_empty() {
                continue;
            }
            let dlq_client = clients
                .get(&self.dead_letter.client_id)
                .cloned()
                .ok_or_else(|| MediatorError::MissingClient {
                    client_id: self.dead_letter.client_id.clone(),
                })?;
            for record in outcome.dead_letters.drain(..) {
                let payload =
                    serde_json::to_vec(&record).map_err(|e| MediatorError::Serialization {
                        details: format!("dead-letter encode: {e}"),
                    })?;
                dlq_client
                    .send(MediatorMessage::new(
                        self.dead_letter.endpoint.clone(),
                        record.key.clone(),
                        payload,
                    ))
                    .await?;
                dead_lettered += 1;
            }
        }

        if routed > 0 || dead_lettered > 0 {
            self.metrics
                .record(|m| {
                    m.routed += routed;
                    m.dead_lettered += dead_lettered;
                })
                .await;
        }
        Ok(())
    }

    fn publish(&self, status: MediatorStatus) {
        self.status.send_replace(status);
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

enum WriteKind {
    Create,
    Update,
    Delete,
}

/// Apply one key's events in arrival order against the given persisted
/// state. A processor failure dead-letters that event and the remaining
/// events continue from the last good state.
fn apply_events<S, E, O>(
    processor: &Arc<dyn EventProcessor<S, E, O>>,
    state_codec: &Arc<dyn Codec<S>>,
    event_codec: &Arc<dyn Codec<E>>,
    current: Option<State>,
    events: Vec<EventRecord<E>>,
) -> KeyOutcome<E, O>
where
    S: Clone,
{
    let key = events
        .first()
        .map(|e| e.key.clone())
        .unwrap_or_default();
    let partition = events.first().map(|e| e.partition).unwrap_or_default();

    let mut outputs = Vec::new();
    let mut dead_letters = Vec::new();

    // Decode the persisted state; an unreadable state dead-letters the whole
    // key rather than feeding the processor garbage.
    let mut typed: Option<S> = None;
    let mut metadata = Metadata::new();
    if let Some(state) = &current {
        match state_codec.decode(&state.value) {
            Ok(value) => {
                typed = Some(value);
                metadata = state.metadata.clone();
            }
            Err(err) => {
                for event in &events {
                    dead_letters.push(DeadLetterRecord::new(
                        event.source.clone(),
                        event.key.clone(),
                        Some(state.value.clone()),
                        event_codec.encode(&event.payload).ok(),
                        format!("persisted state could not be decoded: {err}"),
                    ));
                }
                return KeyOutcome {
                    key,
                    partition,
                    events,
                    original: current,
                    plan: StatePlan::Unchanged,
                    outputs,
                    dead_letters,
                };
            }
        }
    }

    let mut any_applied = false;
    for event in &events {
        match processor.on_next(typed.clone(), event) {
            Ok(response) => {
                any_applied = true;
                outputs.extend(response.outputs);
                match response.updated_state {
                    Some(update) => {
                        typed = Some(update.value);
                        metadata = update.metadata;
                    }
                    None => {
                        typed = None;
                        metadata = Metadata::new();
                    }
                }
            }
            Err(err) => {
                warn!(key = %event.key, source = %event.source, error = %err, "processor failed, dead-lettering event");
                let state_bytes = typed
                    .as_ref()
                    .and_then(|value| state_codec.encode(value).ok())
                    .or_else(|| current.as_ref().map(|s| s.value.clone()));
                dead_letters.push(DeadLetterRecord::new(
                    event.source.clone(),
                    event.key.clone(),
                    state_bytes,
                    event_codec.encode(&event.payload).ok(),
                    format!("{err:#}"),
                ));
            }
        }
    }

    let plan = match typed {
        Some(value) => match state_codec.encode(&value) {
            Ok(bytes) => {
                // Stamp the owning partition so ownership changes can be
                // resolved back to keys from the metadata index.
                metadata.insert(metadata_keys::PARTITION, partition as i64);
                StatePlan::Write {
                    value: bytes,
                    metadata,
                }
            }
            Err(err) => {
                for event in &events {
                    dead_letters.push(DeadLetterRecord::new(
                        event.source.clone(),
                        event.key.clone(),
                        current.as_ref().map(|s| s.value.clone()),
                        event_codec.encode(&event.payload).ok(),
                        format!("new state could not be encoded: {err}"),
                    ));
                }
                StatePlan::Unchanged
            }
        },
        None if current.is_some() && any_applied => StatePlan::Remove,
        None => StatePlan::Unchanged,
    };

    KeyOutcome {
        key,
        partition,
        events,
        original: current,
        plan,
        outputs,
        dead_letters,
    }
}

fn wake_updates<E, O>(outcomes: &[KeyOutcome<E, O>]) -> Vec<WakeUpdate> {
    outcomes
        .iter()
        .filter_map(|outcome| match &outcome.plan {
            StatePlan::Write { metadata, .. } => Some(WakeUpdate {
                key: outcome.key.clone(),
                partition: Some(outcome.partition),
                wake_at: metadata
                    .get_number(metadata_keys::WAKE_AT)
                    .and_then(chrono::DateTime::from_timestamp_millis),
            }),
            StatePlan::Remove => Some(WakeUpdate {
                key: outcome.key.clone(),
                partition: Some(outcome.partition),
                wake_at: None,
            }),
            StatePlan::Unchanged => None,
        })
        .collect()
}

fn join_failure(err: tokio::task::JoinError) -> MediatorError {
    MediatorError::Internal {
        details: format!("worker task failed: {err}"),
    }
}
