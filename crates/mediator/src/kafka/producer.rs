//! Kafka producer client

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::client::{ClientFactory, MessagingClient};
use crate::error::{MediatorError, MediatorResult};
use crate::message::MediatorMessage;

fn default_acks() -> String {
    "all".to_string()
}
fn default_true() -> bool {
    true
}
fn default_send_timeout_ms() -> u64 {
    30_000
}
fn default_compression() -> String {
    "snappy".to_string()
}

/// Configuration for a Kafka producer client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaProducerConfig {
    /// Logical client id the router addresses this client by.
    pub client_id: String,
    /// Comma-separated broker list.
    pub brokers: String,
    /// Acknowledgment level.
    #[serde(default = "default_acks")]
    pub acks: String,
    /// Idempotent producer guard against broker-side duplicates.
    #[serde(default = "default_true")]
    pub enable_idempotence: bool,
    /// Per-send delivery timeout.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// Compression codec.
    #[serde(default = "default_compression")]
    pub compression: String,
    /// Additional raw producer properties.
    #[serde(default)]
    pub extra_config: HashMap<String, String>,
}

impl KafkaProducerConfig {
    pub fn new(client_id: impl Into<String>, brokers: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            brokers: brokers.into(),
            acks: default_acks(),
            enable_idempotence: default_true(),
            send_timeout_ms: default_send_timeout_ms(),
            compression: default_compression(),
            extra_config: HashMap::new(),
        }
    }

    fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// A fire-and-forget [`MessagingClient`] over a Kafka producer. `send`
/// resolves when the broker acknowledges delivery; there is never a reply.
pub struct KafkaProducerClient {
    id: String,
    producer: FutureProducer,
    send_timeout: Duration,
}

impl KafkaProducerClient {
    pub fn new(config: &KafkaProducerConfig) -> MediatorResult<Self> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.brokers)
            .set("acks", &config.acks)
            .set(
                "enable.idempotence",
                if config.enable_idempotence {
                    "true"
                } else {
                    "false"
                },
            )
            .set("compression.type", &config.compression);
        for (key, value) in &config.extra_config {
            client_config.set(key, value);
        }

        let producer: FutureProducer =
            client_config
                .create()
                .map_err(|e| MediatorError::Construction {
                    component: "client",
                    name: config.client_id.clone(),
                    details: e.to_string(),
                })?;

        debug!(client = %config.client_id, brokers = %config.brokers, "kafka producer created");
        Ok(Self {
            id: config.client_id.clone(),
            producer,
            send_timeout: config.send_timeout(),
        })
    }
}

#[async_trait]
impl MessagingClient for KafkaProducerClient {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, message: MediatorMessage) -> MediatorResult<Option<MediatorMessage>> {
        let mut headers = OwnedHeaders::new();
        for (key, value) in &message.properties {
            headers = headers.insert(Header {
                key,
                value: Some(value.as_str()),
            });
        }

        let record = FutureRecord::to(&message.endpoint)
            .key(&message.key)
            .payload(&message.payload)
            .headers(headers);

        match self
            .producer
            .send(record, Timeout::After(self.send_timeout))
            .await
        {
            Ok((partition, offset)) => {
                trace!(
                    endpoint = %message.endpoint,
                    partition,
                    offset,
                    "publish acknowledged"
                );
                Ok(None)
            }
            Err((err, _)) => Err(MediatorError::Transport {
                endpoint: message.endpoint.clone(),
                details: err.to_string(),
            }),
        }
    }

    async fn flush(&self) -> MediatorResult<()> {
        self.producer
            .flush(Timeout::After(self.send_timeout))
            .map_err(|e| MediatorError::Transport {
                endpoint: self.id.clone(),
                details: format!("flush failed: {e}"),
            })
    }
}

/// Factory registering a Kafka producer under its logical id.
pub struct KafkaProducerFactory {
    config: KafkaProducerConfig,
}

impl KafkaProducerFactory {
    pub fn new(config: KafkaProducerConfig) -> Self {
        Self { config }
    }
}

impl ClientFactory for KafkaProducerFactory {
    fn id(&self) -> &str {
        &self.config.client_id
    }

    fn create(&self) -> MediatorResult<Arc<dyn MessagingClient>> {
        Ok(Arc::new(KafkaProducerClient::new(&self.config)?))
    }
}
