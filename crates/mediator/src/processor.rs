//! Business processor seam
//!
//! The mediator drives an injected processor with the key's current persisted
//! state (possibly absent) and one event at a time, in feed order. The
//! processor answers with the state that should be persisted afterwards plus
//! any output records to route downstream. Its failures are opaque to the
//! engine and isolated per key: a failing event is diverted to the
//! dead-letter output and the rest of the batch proceeds.

use stateflow_store::Metadata;

use crate::message::{EventRecord, OutputRecord};

/// The state a processor wants persisted after handling an event.
#[derive(Debug, Clone)]
pub struct StateUpdate<S> {
    pub value: S,
    /// Metadata persisted alongside the value; queryable by cleanup sweeps
    /// and the wake-up scheduler.
    pub metadata: Metadata,
}

impl<S> StateUpdate<S> {
    pub fn new(value: S) -> Self {
        Self {
            value,
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Result of processing one event for one key.
#[derive(Debug, Clone)]
pub struct ProcessorResponse<S, O> {
    /// `Some` persists (creating or updating); `None` removes the state.
    pub updated_state: Option<StateUpdate<S>>,
    pub outputs: Vec<OutputRecord<O>>,
}

impl<S, O> ProcessorResponse<S, O> {
    /// Persist `value` and emit nothing.
    pub fn update(value: S) -> Self {
        Self {
            updated_state: Some(StateUpdate::new(value)),
            outputs: Vec::new(),
        }
    }

    /// Remove the state and emit nothing.
    pub fn remove() -> Self {
        Self {
            updated_state: None,
            outputs: Vec::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        if let Some(update) = self.updated_state.as_mut() {
            update.metadata = metadata;
        }
        self
    }

    pub fn with_output(mut self, output: OutputRecord<O>) -> Self {
        self.outputs.push(output);
        self
    }
}

/// Injected business logic invoked by the mediator.
///
/// Implementations must be pure with respect to the engine: all durable
/// effects go through the returned state and outputs. Blocking I/O does not
/// belong here — it would occupy a processing-pool slot.
pub trait EventProcessor<S, E, O>: Send + Sync {
    fn on_next(
        &self,
        state: Option<S>,
        event: &EventRecord<E>,
    ) -> anyhow::Result<ProcessorResponse<S, O>>;
}
