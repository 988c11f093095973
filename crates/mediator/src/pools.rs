//! Bounded worker pools
//!
//! Each mediator runs two independently sized pools: one for event
//! processing and one for blocking tasks (state store calls, synchronous
//! sends). Capacity is enforced with a semaphore per pool, so a slow
//! blocking call can never starve concurrent processing of unrelated keys —
//! the two kinds of work draw from separate permit budgets.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// A named, fixed-capacity task pool.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    name: String,
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Currently unclaimed capacity.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Spawn a task that runs once a pool permit is available and holds the
    /// permit for its whole duration.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        tokio::spawn(async move {
            // The semaphore lives as long as the pool and is never closed.
            let _permit = permits
                .acquire_owned()
                .await
                .expect("worker pool semaphore closed");
            task.await
        })
    }

    /// Run a future on this pool and wait for its result.
    pub async fn run<F>(&self, task: F) -> F::Output
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        match self.spawn(task).await {
            Ok(output) => output,
            Err(err) => panic!("worker pool '{}' task failed: {err}", self.name),
        }
    }
}

/// The two pools owned by one mediator instance.
#[derive(Debug, Clone)]
pub struct TaskPools {
    /// Event-processing pool.
    pub processing: WorkerPool,
    /// Pool for store calls and synchronous transport sends.
    pub blocking: WorkerPool,
}

impl TaskPools {
    pub fn new(name: &str, processing_capacity: usize, blocking_capacity: usize) -> Self {
        Self {
            processing: WorkerPool::new(format!("{name}-processing"), processing_capacity),
            blocking: WorkerPool::new(format!("{name}-blocking"), blocking_capacity),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn pool_limits_concurrency() {
        let pool = WorkerPool::new("test", 2);
        let gate = Arc::new(Semaphore::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let gate = gate.clone();
            handles.push(pool.spawn(async move {
                let _g = gate.acquire().await.unwrap();
            }));
        }

        // Two tasks hold permits, two wait for capacity.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.available(), 0);

        gate.add_permits(4);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn saturated_blocking_pool_leaves_processing_untouched() {
        let pools = TaskPools::new("m", 2, 1);

        // Occupy the only blocking slot with a long sleep.
        let blocked = pools.blocking.spawn(async {
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        // Processing work still runs immediately.
        let answer = pools.processing.run(async { 41 + 1 }).await;
        assert_eq!(answer, 42);

        blocked.await.unwrap();
    }
}
