//! Core data model for the state store
//!
//! A [`State`] is the durable unit of truth: an opaque value with a strictly
//! increasing version counter and a queryable bag of typed metadata. The store
//! never interprets the value bytes; everything it can reason about lives in
//! the metadata.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Version assigned to a state on creation.
pub const VERSION_INITIAL: i64 = 0;

/// Well-known metadata keys interpreted by the engine itself.
pub mod metadata_keys {
    /// Epoch-millisecond timestamp after which a state is eligible for the
    /// expiry sweep ([`crate::store::StateStore::delete_expired`]).
    pub const EXPIRY: &str = "expiry";

    /// Epoch-millisecond timestamp at which the owning key should be woken up
    /// for re-processing.
    pub const WAKE_AT: &str = "wake.at";

    /// Input-feed partition that last produced an event for this key. Stamped
    /// by the mediator on every persisted state so partition ownership changes
    /// can be resolved back to keys.
    pub const PARTITION: &str = "partition";
}

/// A typed scalar stored under a metadata key.
///
/// Serializes untagged, so metadata round-trips through JSONB as plain JSON
/// scalars (`"a"`, `42`, `true`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    String(String),
    Number(i64),
    Bool(bool),
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::String(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::String(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        MetadataValue::Number(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        MetadataValue::Bool(value)
    }
}

impl MetadataValue {
    /// Compare two values of the same variant. Mixed variants do not compare.
    fn partial_cmp_same_type(&self, other: &MetadataValue) -> Option<Ordering> {
        match (self, other) {
            (MetadataValue::String(a), MetadataValue::String(b)) => Some(a.cmp(b)),
            (MetadataValue::Number(a), MetadataValue::Number(b)) => Some(a.cmp(b)),
            (MetadataValue::Bool(a), MetadataValue::Bool(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

/// Queryable key/value tags attached to a state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata(BTreeMap<String, MetadataValue>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a tag, replacing any previous value for the key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<MetadataValue>) {
        self.0.insert(key.into(), value.into());
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.0.get(key)
    }

    /// Numeric tag lookup; `None` if absent or not a number.
    pub fn get_number(&self, key: &str) -> Option<i64> {
        match self.0.get(key) {
            Some(MetadataValue::Number(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<MetadataValue> {
        self.0.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MetadataValue)> {
        self.0.iter()
    }
}

/// The durable unit of truth.
///
/// Two successful updates can never commit against the same `(key, version)`
/// pair: a write succeeds if and only if the stored version equals the version
/// supplied by the caller, and the backend advances the version atomically as
/// part of that same write.
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    /// Unique identifier for this state.
    pub key: String,
    /// Opaque business payload; never interpreted by this layer.
    pub value: Vec<u8>,
    /// Optimistic concurrency counter. Starts at [`VERSION_INITIAL`] and
    /// increases by exactly 1 on every successful update.
    pub version: i64,
    /// Queryable tags.
    pub metadata: Metadata,
    /// Timestamp of the last successful write.
    pub modified_time: DateTime<Utc>,
}

impl State {
    /// A fresh, never-persisted state at the initial version.
    pub fn new(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            value,
            version: VERSION_INITIAL,
            metadata: Metadata::new(),
            modified_time: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Wake-up time recorded in metadata, if any.
    pub fn wake_at(&self) -> Option<DateTime<Utc>> {
        self.metadata
            .get_number(metadata_keys::WAKE_AT)
            .and_then(DateTime::from_timestamp_millis)
    }
}

/// Comparison operator usable in a [`MetadataFilter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Equals,
    NotEquals,
    LesserThan,
    GreaterThan,
}

/// A typed comparison predicate over a single metadata key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataFilter {
    pub key: String,
    pub operation: Operation,
    pub value: MetadataValue,
}

impl MetadataFilter {
    pub fn new(
        key: impl Into<String>,
        operation: Operation,
        value: impl Into<MetadataValue>,
    ) -> Self {
        Self {
            key: key.into(),
            operation,
            value: value.into(),
        }
    }

    /// Evaluate this filter against a metadata bag.
    ///
    /// A missing key or a type mismatch fails the filter for every operator,
    /// matching the backend behavior where the native cast has nothing to
    /// compare.
    pub fn matches(&self, metadata: &Metadata) -> bool {
        let Some(actual) = metadata.get(&self.key) else {
            return false;
        };
        let Some(ordering) = actual.partial_cmp_same_type(&self.value) else {
            return false;
        };
        match self.operation {
            Operation::Equals => ordering == Ordering::Equal,
            Operation::NotEquals => ordering != Ordering::Equal,
            Operation::LesserThan => ordering == Ordering::Less,
            Operation::GreaterThan => ordering == Ordering::Greater,
        }
    }
}

/// Lower and upper bounds (inclusive) over `modified_time`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntervalFilter {
    pub start: DateTime<Utc>,
    pub finish: DateTime<Utc>,
}

impl IntervalFilter {
    pub fn new(start: DateTime<Utc>, finish: DateTime<Utc>) -> Self {
        Self { start, finish }
    }

    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        time >= self.start && time <= self.finish
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_serializes_as_plain_scalars() {
        let metadata = Metadata::new()
            .with("string", "random_6")
            .with("number", 6i64)
            .with("boolean", true);

        let json = serde_json::to_value(&metadata).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"boolean": true, "number": 6, "string": "random_6"})
        );

        let back: Metadata = serde_json::from_value(json).unwrap();
        assert_eq!(back, metadata);
    }

    #[test]
    fn filter_matches_same_type_only() {
        let metadata = Metadata::new().with("number", 6i64).with("boolean", true);

        assert!(MetadataFilter::new("number", Operation::GreaterThan, 5i64).matches(&metadata));
        assert!(MetadataFilter::new("number", Operation::LesserThan, 7i64).matches(&metadata));
        assert!(MetadataFilter::new("boolean", Operation::Equals, true).matches(&metadata));

        // Missing key and mismatched type both fail.
        assert!(!MetadataFilter::new("absent", Operation::Equals, 1i64).matches(&metadata));
        assert!(!MetadataFilter::new("number", Operation::Equals, "6").matches(&metadata));
    }

    #[test]
    fn new_state_starts_at_initial_version() {
        let state = State::new("key-1", b"payload".to_vec());
        assert_eq!(state.version, VERSION_INITIAL);
        assert!(state.metadata.is_empty());
    }

    #[test]
    fn wake_at_reads_metadata() {
        let at = Utc::now() + chrono::Duration::seconds(30);
        let state = State::new("key-1", vec![]).with_metadata(
            Metadata::new().with(metadata_keys::WAKE_AT, at.timestamp_millis()),
        );
        assert_eq!(
            state.wake_at().map(|t| t.timestamp_millis()),
            Some(at.timestamp_millis())
        );
    }
}
