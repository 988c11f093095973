//! Multi-source event mediator over the versioned state store
//!
//! This crate orchestrates event-sourced, stateful workloads: it polls
//! events from several independently configured input feeds, batches them by
//! key, invokes an injected business processor against persisted state,
//! writes the resulting states through the optimistic state store, and
//! routes output messages to synchronous or asynchronous transports. Input
//! offsets commit only after the corresponding state writes have durably
//! succeeded.
//!
//! Around the core loop live the supporting pieces: semaphore-bounded worker
//! pools separating event processing from blocking tasks, a wake-up
//! scheduler re-injecting events for states with future wake times, and
//! scheduled-cleanup processors driven by a shared trigger feed.

pub mod cleanup;
pub mod client;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod error;
pub mod http;
pub mod inmem;
pub mod kafka;
pub mod mediator;
pub mod message;
pub mod metrics;
pub mod pools;
pub mod processor;
pub mod router;
pub mod wakeup;

pub use cleanup::{
    CandidateSweepProcessor, DeletionCandidateBatch, ExpiryCleanupProcessor, ScheduledTaskTrigger,
    TriggerProcessor, TriggerSubscription,
};
pub use client::{ClientFactory, MessagingClient};
pub use codec::{BincodeCodec, Codec, JsonCodec};
pub use config::{DeadLetterDestination, MediatorConfig, MediatorConfigBuilder, MediatorTuning};
pub use consumer::{ConsumerFactory, FeedConsumer, PartitionEvent};
pub use error::{MediatorError, MediatorResult};
pub use http::{HttpRpcClient, HttpRpcConfig, HttpRpcFactory};
pub use kafka::{
    KafkaConsumerConfig, KafkaConsumerFactory, KafkaFeedConsumer, KafkaProducerClient,
    KafkaProducerConfig, KafkaProducerFactory,
};
pub use mediator::{MediatorStatus, MultiSourceEventMediator};
pub use message::{DeadLetterRecord, EventRecord, MediatorMessage, OutputRecord};
pub use metrics::{MediatorMetrics, MetricsHandle};
pub use pools::{TaskPools, WorkerPool};
pub use processor::{EventProcessor, ProcessorResponse, StateUpdate};
pub use router::{MessageRouter, RoutingDestination, SendMode};
pub use wakeup::{WakeUpRecord, WakeUpScheduler, WakeUpdate};
