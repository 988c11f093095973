//! Mediator configuration
//!
//! Scalar tuning ([`MediatorTuning`]) is plain data, loadable from a YAML
//! file merged with `STATEFLOW_`-prefixed environment variables. The full
//! [`MediatorConfig`] additionally carries the injected components and is
//! assembled with a builder so nothing can be forgotten at wiring time.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use stateflow_store::StateStore;

use crate::client::ClientFactory;
use crate::codec::Codec;
use crate::consumer::ConsumerFactory;
use crate::error::{MediatorError, MediatorResult};
use crate::processor::EventProcessor;
use crate::router::MessageRouter;
use crate::wakeup::WakeUpScheduler;

fn default_processing_threads() -> usize {
    6
}
fn default_blocking_threads() -> usize {
    5
}
fn default_min_group_size() -> usize {
    20
}
fn default_poll_timeout_ms() -> u64 {
    50
}
fn default_retry_deadline_ms() -> u64 {
    10_000
}

/// Scalar tuning for one mediator instance.
///
/// Every value here was a hardcoded placeholder somewhere once; all of them
/// are configuration now.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediatorTuning {
    /// Size of the event-processing pool.
    #[serde(default = "default_processing_threads")]
    pub processing_threads: usize,

    /// Size of the blocking-task pool (store calls, synchronous sends).
    #[serde(default = "default_blocking_threads")]
    pub blocking_threads: usize,

    /// Minimum number of events per processing task group.
    #[serde(default = "default_min_group_size")]
    pub min_group_size: usize,

    /// How long one consumer poll may wait for events.
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Wall-clock bound on per-key conflict resolution.
    #[serde(default = "default_retry_deadline_ms")]
    pub retry_deadline_ms: u64,
}

impl Default for MediatorTuning {
    fn default() -> Self {
        Self {
            processing_threads: default_processing_threads(),
            blocking_threads: default_blocking_threads(),
            min_group_size: default_min_group_size(),
            poll_timeout_ms: default_poll_timeout_ms(),
            retry_deadline_ms: default_retry_deadline_ms(),
        }
    }
}

impl MediatorTuning {
    /// Load tuning from an optional YAML file, overridden by environment
    /// variables prefixed `STATEFLOW_` (nested keys split on `__`).
    pub fn load(config_path: Option<PathBuf>) -> MediatorResult<Self> {
        let mut figment = Figment::new();
        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        }
        figment = figment.merge(Env::prefixed("STATEFLOW_").split("__"));

        let tuning: MediatorTuning =
            figment
                .extract()
                .map_err(|e| MediatorError::Configuration {
                    details: e.to_string(),
                })?;
        tuning.validate()?;
        Ok(tuning)
    }

    pub fn validate(&self) -> MediatorResult<()> {
        if self.processing_threads == 0 {
            return Err(MediatorError::Configuration {
                details: "processing_threads must be greater than 0".to_string(),
            });
        }
        if self.blocking_threads == 0 {
            return Err(MediatorError::Configuration {
                details: "blocking_threads must be greater than 0".to_string(),
            });
        }
        if self.min_group_size == 0 {
            return Err(MediatorError::Configuration {
                details: "min_group_size must be greater than 0".to_string(),
            });
        }
        Ok(())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn retry_deadline(&self) -> Duration {
        Duration::from_millis(self.retry_deadline_ms)
    }
}

/// Where events that cannot be processed are diverted.
#[derive(Debug, Clone)]
pub struct DeadLetterDestination {
    pub client_id: String,
    pub endpoint: String,
}

impl DeadLetterDestination {
    pub fn new(client_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            endpoint: endpoint.into(),
        }
    }
}

/// Everything one mediator instance needs, assembled via [`MediatorConfig::builder`].
pub struct MediatorConfig<S, E, O> {
    pub name: String,
    pub tuning: MediatorTuning,
    pub consumer_factories: Vec<Box<dyn ConsumerFactory<E>>>,
    pub client_factories: Vec<Box<dyn ClientFactory>>,
    pub processor: Arc<dyn EventProcessor<S, E, O>>,
    pub router: Arc<dyn MessageRouter<O>>,
    pub store: Arc<dyn StateStore>,
    pub state_codec: Arc<dyn Codec<S>>,
    pub event_codec: Arc<dyn Codec<E>>,
    pub output_codec: Arc<dyn Codec<O>>,
    pub dead_letter: DeadLetterDestination,
    pub wakeup: Option<Arc<WakeUpScheduler>>,
}

impl<S, E, O> MediatorConfig<S, E, O> {
    pub fn builder(name: impl Into<String>) -> MediatorConfigBuilder<S, E, O> {
        MediatorConfigBuilder::new(name)
    }
}

/// Builder for [`MediatorConfig`].
pub struct MediatorConfigBuilder<S, E, O> {
    name: String,
    tuning: MediatorTuning,
    consumer_factories: Vec<Box<dyn ConsumerFactory<E>>>,
    client_factories: Vec<Box<dyn ClientFactory>>,
    processor: Option<Arc<dyn EventProcessor<S, E, O>>>,
    router: Option<Arc<dyn MessageRouter<O>>>,
    store: Option<Arc<dyn StateStore>>,
    state_codec: Option<Arc<dyn Codec<S>>>,
    event_codec: Option<Arc<dyn Codec<E>>>,
    output_codec: Option<Arc<dyn Codec<O>>>,
    dead_letter: Option<DeadLetterDestination>,
    wakeup: Option<Arc<WakeUpScheduler>>,
}

impl<S, E, O> MediatorConfigBuilder<S, E, O> {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tuning: MediatorTuning::default(),
            consumer_factories: Vec::new(),
            client_factories: Vec::new(),
            processor: None,
            router: None,
            store: None,
            state_codec: None,
            event_codec: None,
            output_codec: None,
            dead_letter: None,
            wakeup: None,
        }
    }

    pub fn tuning(mut self, tuning: MediatorTuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn consumer_factory(mut self, factory: Box<dyn ConsumerFactory<E>>) -> Self {
        self.consumer_factories.push(factory);
        self
    }

    pub fn client_factory(mut self, factory: Box<dyn ClientFactory>) -> Self {
        self.client_factories.push(factory);
        self
    }

    pub fn processor(mut self, processor: Arc<dyn EventProcessor<S, E, O>>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn router(mut self, router: Arc<dyn MessageRouter<O>>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn state_codec(mut self, codec: Arc<dyn Codec<S>>) -> Self {
        self.state_codec = Some(codec);
        self
    }

    pub fn event_codec(mut self, codec: Arc<dyn Codec<E>>) -> Self {
        self.event_codec = Some(codec);
        self
    }

    pub fn output_codec(mut self, codec: Arc<dyn Codec<O>>) -> Self {
        self.output_codec = Some(codec);
        self
    }

    pub fn dead_letter(mut self, destination: DeadLetterDestination) -> Self {
        self.dead_letter = Some(destination);
        self
    }

    pub fn wakeup(mut self, scheduler: Arc<WakeUpScheduler>) -> Self {
        self.wakeup = Some(scheduler);
        self
    }

    pub fn build(self) -> MediatorResult<MediatorConfig<S, E, O>> {
        self.tuning.validate()?;
        if self.consumer_factories.is_empty() {
            return Err(missing("at least one consumer factory"));
        }
        if self.client_factories.is_empty() {
            return Err(missing("at least one client factory"));
        }
        Ok(MediatorConfig {
            name: self.name,
            tuning: self.tuning,
            consumer_factories: self.consumer_factories,
            client_factories: self.client_factories,
            processor: self.processor.ok_or_else(|| missing("a message processor"))?,
            router: self.router.ok_or_else(|| missing("a message router"))?,
            store: self.store.ok_or_else(|| missing("a state store"))?,
            state_codec: self.state_codec.ok_or_else(|| missing("a state codec"))?,
            event_codec: self.event_codec.ok_or_else(|| missing("an event codec"))?,
            output_codec: self.output_codec.ok_or_else(|| missing("an output codec"))?,
            dead_letter: self
                .dead_letter
                .ok_or_else(|| missing("a dead-letter destination"))?,
            wakeup: self.wakeup,
        })
    }
}

fn missing(what: &str) -> MediatorError {
    MediatorError::Configuration {
        details: format!("mediator requires {what}"),
    }
}
