//! Kafka feed consumer

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::{ClientContext, Message, TopicPartitionList};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::codec::Codec;
use crate::consumer::{ConsumerFactory, FeedConsumer, PartitionEvent};
use crate::error::{MediatorError, MediatorResult};
use crate::message::EventRecord;

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}
fn default_max_batch() -> usize {
    500
}

/// Configuration for one Kafka input source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConsumerConfig {
    /// Comma-separated broker list.
    pub brokers: String,
    /// Consumer group id.
    pub group_id: String,
    /// Topic to subscribe to.
    pub topic: String,
    /// Where to start when the group has no committed offset.
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    /// Upper bound on events returned by one poll.
    #[serde(default = "default_max_batch")]
    pub max_batch_size: usize,
    /// Additional raw consumer properties.
    #[serde(default)]
    pub extra_config: HashMap<String, String>,
}

impl KafkaConsumerConfig {
    pub fn new(
        brokers: impl Into<String>,
        group_id: impl Into<String>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            brokers: brokers.into(),
            group_id: group_id.into(),
            topic: topic.into(),
            auto_offset_reset: default_auto_offset_reset(),
            max_batch_size: default_max_batch(),
            extra_config: HashMap::new(),
        }
    }
}

/// Forwards rebalance callbacks out of rdkafka's callback thread into a
/// queue the mediator drains between polls.
struct FeedConsumerContext {
    source: String,
    partition_tx: mpsc::Sender<PartitionEvent>,
}

impl ClientContext for FeedConsumerContext {}

impl ConsumerContext for FeedConsumerContext {
    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(list) => {
                let partitions = partitions_of(list);
                info!(source = %self.source, ?partitions, "partitions assigned");
                let _ = self.partition_tx.send(PartitionEvent::Assigned {
                    source: self.source.clone(),
                    partitions,
                });
            }
            Rebalance::Revoke(list) => {
                let partitions = partitions_of(list);
                info!(source = %self.source, ?partitions, "partitions revoked");
                let _ = self.partition_tx.send(PartitionEvent::Revoked {
                    source: self.source.clone(),
                    partitions,
                });
            }
            Rebalance::Error(err) => {
                warn!(source = %self.source, %err, "rebalance error");
            }
        }
    }
}

fn partitions_of(list: &TopicPartitionList) -> Vec<i32> {
    list.elements().iter().map(|e| e.partition()).collect()
}

/// A [`FeedConsumer`] over one Kafka topic.
pub struct KafkaFeedConsumer<E> {
    source: String,
    consumer: StreamConsumer<FeedConsumerContext>,
    codec: Arc<dyn Codec<E>>,
    max_batch_size: usize,
    partition_rx: Mutex<mpsc::Receiver<PartitionEvent>>,
}

impl<E> KafkaFeedConsumer<E> {
    pub fn new(config: &KafkaConsumerConfig, codec: Arc<dyn Codec<E>>) -> MediatorResult<Self> {
        let (partition_tx, partition_rx) = mpsc::channel();
        let context = FeedConsumerContext {
            source: config.topic.clone(),
            partition_tx,
        };

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", &config.auto_offset_reset);
        for (key, value) in &config.extra_config {
            client_config.set(key, value);
        }

        let consumer: StreamConsumer<FeedConsumerContext> = client_config
            .create_with_context(context)
            .map_err(|e| MediatorError::Construction {
                component: "consumer",
                name: config.topic.clone(),
                details: e.to_string(),
            })?;
        consumer
            .subscribe(&[&config.topic])
            .map_err(|e| MediatorError::Construction {
                component: "consumer",
                name: config.topic.clone(),
                details: e.to_string(),
            })?;

        debug!(topic = %config.topic, group = %config.group_id, "kafka consumer subscribed");
        Ok(Self {
            source: config.topic.clone(),
            consumer,
            codec,
            max_batch_size: config.max_batch_size,
            partition_rx: Mutex::new(partition_rx),
        })
    }
}

#[async_trait]
impl<E> FeedConsumer<E> for KafkaFeedConsumer<E>
where
    E: Send + 'static,
{
    fn source(&self) -> &str {
        &self.source
    }

    async fn poll(&mut self, timeout: Duration) -> MediatorResult<Vec<EventRecord<E>>> {
        let mut events = Vec::new();
        let deadline = tokio::time::Instant::now() + timeout;

        while events.len() < self.max_batch_size {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            let message = match tokio::time::timeout(remaining, self.consumer.recv()).await {
                Ok(Ok(message)) => message,
                Ok(Err(err)) => {
                    return Err(MediatorError::Transport {
                        endpoint: self.source.clone(),
                        details: err.to_string(),
                    })
                }
                Err(_) => break, // poll window elapsed
            };

            let Some(key) = message
                .key()
                .and_then(|bytes| std::str::from_utf8(bytes).ok())
            else {
                warn!(source = %self.source, offset = message.offset(), "skipping record without utf-8 key");
                continue;
            };
            let Some(payload) = message.payload() else {
                warn!(source = %self.source, offset = message.offset(), "skipping record without payload");
                continue;
            };
            let payload = match self.codec.decode(payload) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(source = %self.source, offset = message.offset(), %err, "skipping undecodable record");
                    continue;
                }
            };

            let timestamp = message
                .timestamp()
                .to_millis()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .unwrap_or_else(Utc::now);

            events.push(EventRecord {
                source: self.source.clone(),
                partition: message.partition(),
                offset: message.offset(),
                key: key.to_string(),
                payload,
                timestamp,
            });
        }
        Ok(events)
    }

    async fn commit(&mut self) -> MediatorResult<()> {
        self.consumer
            .commit_consumer_state(rdkafka::consumer::CommitMode::Sync)
            .map_err(|e| MediatorError::Transport {
                endpoint: self.source.clone(),
                details: format!("offset commit failed: {e}"),
            })
    }

    fn drain_partition_events(&mut self) -> Vec<PartitionEvent> {
        let Ok(rx) = self.partition_rx.lock() else {
            return Vec::new();
        };
        rx.try_iter().collect()
    }

    async fn close(&mut self) {
        self.consumer.unsubscribe();
    }
}

/// Factory for one Kafka input source, with an independently tunable replica
/// count.
pub struct KafkaConsumerFactory<E> {
    config: KafkaConsumerConfig,
    codec: Arc<dyn Codec<E>>,
    replicas: usize,
}

impl<E> KafkaConsumerFactory<E> {
    pub fn new(config: KafkaConsumerConfig, codec: Arc<dyn Codec<E>>) -> Self {
        Self {
            config,
            codec,
            replicas: 1,
        }
    }

    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas.max(1);
        self
    }
}

impl<E> ConsumerFactory<E> for KafkaConsumerFactory<E>
where
    E: Send + 'static,
{
    fn source(&self) -> &str {
        &self.config.topic
    }

    fn replicas(&self) -> usize {
        self.replicas
    }

    fn create(&self) -> MediatorResult<Box<dyn FeedConsumer<E>>> {
        Ok(Box::new(KafkaFeedConsumer::new(
            &self.config,
            Arc::clone(&self.codec),
        )?))
    }
}
