//! Kafka transports
//!
//! Feed consumers over `rdkafka`'s `StreamConsumer` and a producer-backed
//! messaging client. Partition rebalances are forwarded to the mediator
//! through the consumer's partition-event queue.

pub mod consumer;
pub mod producer;

pub use consumer::{KafkaConsumerConfig, KafkaConsumerFactory, KafkaFeedConsumer};
pub use producer::{KafkaProducerClient, KafkaProducerConfig, KafkaProducerFactory};
