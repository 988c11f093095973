//! Input feed seam
//!
//! Each input source is configured with its own factory and replica count;
//! the mediator creates `replicas()` consumers per factory at start-up and
//! owns them for the life of the subscription. Offsets commit only when the
//! mediator says so — strictly after the batch's state writes have
//! succeeded.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::MediatorResult;
use crate::message::EventRecord;

/// Notification that partition ownership changed for a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionEvent {
    /// Partitions this consumer now owns.
    Assigned { source: String, partitions: Vec<i32> },
    /// Partitions this consumer no longer owns.
    Revoked { source: String, partitions: Vec<i32> },
}

/// A consumer over one input feed.
#[async_trait]
pub trait FeedConsumer<E>: Send {
    /// Topic/stream identifier this consumer reads.
    fn source(&self) -> &str;

    /// Poll for the next batch of events, waiting at most `timeout`.
    async fn poll(&mut self, timeout: Duration) -> MediatorResult<Vec<EventRecord<E>>>;

    /// Commit the offsets of everything polled so far. Called only after the
    /// corresponding state writes are durable.
    async fn commit(&mut self) -> MediatorResult<()>;

    /// Partition ownership changes observed since the last call, if the
    /// transport reports them.
    fn drain_partition_events(&mut self) -> Vec<PartitionEvent> {
        Vec::new()
    }

    /// Release transport resources.
    async fn close(&mut self) {}
}

/// Builds consumers for one configured input source.
pub trait ConsumerFactory<E>: Send + Sync {
    /// Topic/stream identifier of the source.
    fn source(&self) -> &str;

    /// Number of consumer replicas to run for this source.
    fn replicas(&self) -> usize {
        1
    }

    fn create(&self) -> MediatorResult<Box<dyn FeedConsumer<E>>>;
}
