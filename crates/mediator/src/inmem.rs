//! In-memory transports
//!
//! Queue-backed twins of the Kafka consumer and producer clients, used by
//! tests and local wiring. The feed records how many events have been
//! committed and when, so commit-after-persist ordering is observable from
//! the outside.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::client::{ClientFactory, MessagingClient};
use crate::consumer::{ConsumerFactory, FeedConsumer, PartitionEvent};
use crate::error::{MediatorError, MediatorResult};
use crate::message::{EventRecord, MediatorMessage};

struct FeedState<E> {
    pending: VecDeque<EventRecord<E>>,
    next_offset: i64,
    in_flight: usize,
    committed_events: usize,
    partition_events: Vec<PartitionEvent>,
}

/// A shared in-memory input feed. Cloning shares the queue, so several
/// consumer replicas drain the same feed.
pub struct InMemoryFeed<E> {
    source: String,
    state: Arc<Mutex<FeedState<E>>>,
    commits: Arc<AtomicU64>,
}

impl<E> Clone for InMemoryFeed<E> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            state: Arc::clone(&self.state),
            commits: Arc::clone(&self.commits),
        }
    }
}

impl<E> InMemoryFeed<E> {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            state: Arc::new(Mutex::new(FeedState {
                pending: VecDeque::new(),
                next_offset: 0,
                in_flight: 0,
                committed_events: 0,
                partition_events: Vec::new(),
            })),
            commits: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Append an event on partition 0.
    pub fn push(&self, key: impl Into<String>, payload: E) {
        self.push_to_partition(0, key, payload);
    }

    pub fn push_to_partition(&self, partition: i32, key: impl Into<String>, payload: E) {
        let mut state = self.state.lock().expect("feed mutex poisoned");
        let offset = state.next_offset;
        state.next_offset += 1;
        let record = EventRecord::new(self.source.clone(), partition, offset, key, payload);
        state.pending.push_back(record);
    }

    /// Inject a partition ownership notification for the next poll.
    pub fn notify_partitions(&self, event: PartitionEvent) {
        self.state
            .lock()
            .expect("feed mutex poisoned")
            .partition_events
            .push(event);
    }

    /// Events whose offsets have been committed.
    pub fn committed_events(&self) -> usize {
        self.state.lock().expect("feed mutex poisoned").committed_events
    }

    /// Number of commit calls issued by consumers of this feed.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().expect("feed mutex poisoned").pending.len()
    }

    pub fn consumer(&self) -> InMemoryFeedConsumer<E> {
        InMemoryFeedConsumer { feed: self.clone() }
    }

    fn drain(&self) -> Vec<EventRecord<E>> {
        let mut state = self.state.lock().expect("feed mutex poisoned");
        let drained: Vec<EventRecord<E>> = state.pending.drain(..).collect();
        state.in_flight += drained.len();
        drained
    }

    fn commit(&self) {
        let mut state = self.state.lock().expect("feed mutex poisoned");
        state.committed_events += state.in_flight;
        state.in_flight = 0;
        self.commits.fetch_add(1, Ordering::SeqCst);
    }

    fn drain_partition_events(&self) -> Vec<PartitionEvent> {
        std::mem::take(
            &mut self
                .state
                .lock()
                .expect("feed mutex poisoned")
                .partition_events,
        )
    }
}

/// Consumer over an [`InMemoryFeed`].
pub struct InMemoryFeedConsumer<E> {
    feed: InMemoryFeed<E>,
}

#[async_trait]
impl<E> FeedConsumer<E> for InMemoryFeedConsumer<E>
where
    E: Send + 'static,
{
    fn source(&self) -> &str {
        self.feed.source()
    }

    async fn poll(&mut self, timeout: Duration) -> MediatorResult<Vec<EventRecord<E>>> {
        let drained = self.feed.drain();
        if !drained.is_empty() {
            return Ok(drained);
        }
        tokio::time::sleep(timeout).await;
        Ok(self.feed.drain())
    }

    async fn commit(&mut self) -> MediatorResult<()> {
        self.feed.commit();
        Ok(())
    }

    fn drain_partition_events(&mut self) -> Vec<PartitionEvent> {
        self.feed.drain_partition_events()
    }
}

/// Factory handing out consumers that share one in-memory feed.
pub struct InMemoryConsumerFactory<E> {
    feed: InMemoryFeed<E>,
    replicas: usize,
}

impl<E> InMemoryConsumerFactory<E> {
    pub fn new(feed: InMemoryFeed<E>) -> Self {
        Self { feed, replicas: 1 }
    }

    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas;
        self
    }
}

impl<E> ConsumerFactory<E> for InMemoryConsumerFactory<E>
where
    E: Send + 'static,
{
    fn source(&self) -> &str {
        self.feed.source()
    }

    fn replicas(&self) -> usize {
        self.replicas
    }

    fn create(&self) -> MediatorResult<Box<dyn FeedConsumer<E>>> {
        Ok(Box::new(self.feed.consumer()))
    }
}

/// A messaging client that records everything it is asked to send.
pub struct RecordingClient {
    id: String,
    sent: Mutex<Vec<MediatorMessage>>,
    reply: Option<Vec<u8>>,
    flushes: AtomicU64,
}

impl RecordingClient {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            sent: Mutex::new(Vec::new()),
            reply: None,
            flushes: AtomicU64::new(0),
        }
    }

    /// Reply with the given bytes on every send, like an RPC transport.
    pub fn with_reply(id: impl Into<String>, reply: Vec<u8>) -> Self {
        Self {
            reply: Some(reply),
            ..Self::new(id)
        }
    }

    pub fn sent(&self) -> Vec<MediatorMessage> {
        self.sent.lock().expect("client mutex poisoned").clone()
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessagingClient for RecordingClient {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, message: MediatorMessage) -> MediatorResult<Option<MediatorMessage>> {
        let endpoint = message.endpoint.clone();
        let key = message.key.clone();
        self.sent
            .lock()
            .map_err(|_| MediatorError::Internal {
                details: "recording client mutex poisoned".to_string(),
            })?
            .push(message);
        Ok(self
            .reply
            .as_ref()
            .map(|bytes| MediatorMessage::new(endpoint, key, bytes.clone())))
    }

    async fn flush(&self) -> MediatorResult<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory wrapping a shared [`RecordingClient`].
pub struct RecordingClientFactory(pub Arc<RecordingClient>);

impl ClientFactory for RecordingClientFactory {
    fn id(&self) -> &str {
        self.0.id()
    }

    fn create(&self) -> MediatorResult<Arc<dyn MessagingClient>> {
        Ok(Arc::clone(&self.0) as Arc<dyn MessagingClient>)
    }
}
