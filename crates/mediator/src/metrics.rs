//! Mediator counters
//!
//! Lightweight snapshot counters for observability; a metrics exporter is an
//! external concern.

use std::sync::Arc;

use tokio::sync::RwLock;

/// Counters tracked by one mediator instance.
#[derive(Debug, Clone, Default)]
pub struct MediatorMetrics {
    /// Events polled from all feeds.
    pub polled: u64,
    /// Events handed to the business processor (including conflict re-runs).
    pub processed: u64,
    /// States created.
    pub created: u64,
    /// States updated.
    pub updated: u64,
    /// States deleted.
    pub deleted: u64,
    /// Optimistic conflicts resolved by re-fetch and re-process.
    pub conflicts: u64,
    /// Events diverted to the dead-letter output.
    pub dead_lettered: u64,
    /// Output records routed downstream.
    pub routed: u64,
    /// Completed poll/process/persist/route cycles.
    pub batches: u64,
    /// Offset commits issued.
    pub commits: u64,
    /// Size of the most recent non-empty batch.
    pub last_batch_size: usize,
}

/// Shared, snapshot-readable metrics handle.
#[derive(Debug, Clone, Default)]
pub struct MetricsHandle {
    inner: Arc<RwLock<MediatorMetrics>>,
}

impl MetricsHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> MediatorMetrics {
        self.inner.read().await.clone()
    }

    pub(crate) async fn record<F: FnOnce(&mut MediatorMetrics)>(&self, f: F) {
        let mut metrics = self.inner.write().await;
        f(&mut metrics);
    }
}
