//! HTTP RPC client
//!
//! The synchronous transport: a send POSTs the payload and hands the
//! response body back as the reply. Transient failures retry with a doubling
//! backoff up to a bounded attempt count; the caller sees a transport error
//! only after the attempts are exhausted.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::client::{ClientFactory, MessagingClient};
use crate::error::{MediatorError, MediatorResult};
use crate::message::MediatorMessage;

fn default_request_timeout_ms() -> u64 {
    10_000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    100
}

/// Configuration for an HTTP RPC client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRpcConfig {
    /// Logical client id the router addresses this client by.
    pub client_id: String,
    /// Base URL; the message endpoint is appended as a path.
    pub base_url: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Total attempts per send (first try included).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles per retry.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
}

impl HttpRpcConfig {
    pub fn new(client_id: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            base_url: base_url.into(),
            request_timeout_ms: default_request_timeout_ms(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
        }
    }
}

/// RPC-style [`MessagingClient`] over HTTP POST.
pub struct HttpRpcClient {
    id: String,
    base_url: String,
    client: reqwest::Client,
    max_attempts: u32,
    initial_backoff: Duration,
}

impl HttpRpcClient {
    pub fn new(config: &HttpRpcConfig) -> MediatorResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| MediatorError::Construction {
                component: "client",
                name: config.client_id.clone(),
                details: e.to_string(),
            })?;
        Ok(Self {
            id: config.client_id.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
        })
    }

    fn url_for(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }
}

#[async_trait]
impl MessagingClient for HttpRpcClient {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, message: MediatorMessage) -> MediatorResult<Option<MediatorMessage>> {
        let url = self.url_for(&message.endpoint);
        let mut backoff = self.initial_backoff;
        let mut last_error = String::new();

        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }

            let mut request = self
                .client
                .post(&url)
                .header("x-message-key", &message.key)
                .body(message.payload.clone());
            for (key, value) in &message.properties {
                request = request.header(key.as_str(), value.as_str());
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    let bytes = response.bytes().await.map_err(|e| {
                        MediatorError::Transport {
                            endpoint: message.endpoint.clone(),
                            details: format!("reading reply body: {e}"),
                        }
                    })?;
                    debug!(%url, attempt, "rpc send succeeded");
                    return Ok(Some(MediatorMessage::new(
                        message.endpoint.clone(),
                        message.key.clone(),
                        bytes.to_vec(),
                    )));
                }
                Ok(response) if response.status().is_server_error() => {
                    last_error = format!("server returned {}", response.status());
                    warn!(%url, attempt, %last_error, "rpc send failed, retrying");
                }
                Ok(response) => {
                    // Client errors will not get better on retry.
                    return Err(MediatorError::Transport {
                        endpoint: message.endpoint.clone(),
                        details: format!("server returned {}", response.status()),
                    });
                }
                Err(err) => {
                    last_error = err.to_string();
                    warn!(%url, attempt, %last_error, "rpc send failed, retrying");
                }
            }
        }

        Err(MediatorError::Transport {
            endpoint: message.endpoint,
            details: format!(
                "send failed after {} attempts: {last_error}",
                self.max_attempts
            ),
        })
    }
}

/// Factory registering an HTTP RPC client under its logical id.
pub struct HttpRpcFactory {
    config: HttpRpcConfig,
}

impl HttpRpcFactory {
    pub fn new(config: HttpRpcConfig) -> Self {
        Self { config }
    }
}

impl ClientFactory for HttpRpcFactory {
    fn id(&self) -> &str {
        &self.config.client_id
    }

    fn create(&self) -> MediatorResult<Arc<dyn MessagingClient>> {
        Ok(Arc::new(HttpRpcClient::new(&self.config)?))
    }
}
