//! Message envelopes flowing through the mediator

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An event polled from an input feed: a keyed payload tagged with its
/// position in the feed. Events for a given key arrive, and must be applied,
/// in feed order.
#[derive(Debug, Clone)]
pub struct EventRecord<E> {
    /// Topic/stream identifier of the feed that produced the event.
    pub source: String,
    /// Partition within the feed.
    pub partition: i32,
    /// Offset within the partition.
    pub offset: i64,
    /// Grouping key; also the state key the event applies to.
    pub key: String,
    /// Decoded event payload.
    pub payload: E,
    /// Feed timestamp, or receipt time when the feed carries none.
    pub timestamp: DateTime<Utc>,
}

impl<E> EventRecord<E> {
    pub fn new(
        source: impl Into<String>,
        partition: i32,
        offset: i64,
        key: impl Into<String>,
        payload: E,
    ) -> Self {
        Self {
            source: source.into(),
            partition,
            offset,
            key: key.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// An output produced by the business processor. The payload's type drives
/// routing; the key becomes the message key on the chosen transport.
#[derive(Debug, Clone)]
pub struct OutputRecord<O> {
    pub key: String,
    pub payload: O,
}

impl<O> OutputRecord<O> {
    pub fn new(key: impl Into<String>, payload: O) -> Self {
        Self {
            key: key.into(),
            payload,
        }
    }
}

/// The wire-level message handed to a messaging client after routing.
#[derive(Debug, Clone)]
pub struct MediatorMessage {
    /// Destination endpoint (topic name, URL path, …) on the client.
    pub endpoint: String,
    /// Message key.
    pub key: String,
    /// Serialized payload.
    pub payload: Vec<u8>,
    /// Transport headers.
    pub properties: HashMap<String, String>,
}

impl MediatorMessage {
    pub fn new(endpoint: impl Into<String>, key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            endpoint: endpoint.into(),
            key: key.into(),
            payload,
            properties: HashMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// An event that could not be processed, preserved for inspection instead of
/// blocking the batch. The state and event bytes are captured as they were at
/// failure time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: Uuid,
    pub occurred_at: DateTime<Utc>,
    /// Feed the event came from.
    pub source: String,
    /// State/event key.
    pub key: String,
    /// Serialized state at failure time, if one existed.
    pub state: Option<Vec<u8>>,
    /// Serialized event payload, when it could be captured.
    pub event: Option<Vec<u8>>,
    /// Human-readable failure reason.
    pub reason: String,
}

impl DeadLetterRecord {
    pub fn new(
        source: impl Into<String>,
        key: impl Into<String>,
        state: Option<Vec<u8>>,
        event: Option<Vec<u8>>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            source: source.into(),
            key: key.into(),
            state,
            event,
            reason: reason.into(),
        }
    }
}
