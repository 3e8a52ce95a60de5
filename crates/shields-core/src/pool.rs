//! Compile Pool - bounded execution for compile work
//!
//! Engine and rule-list compiles are CPU bound, so they run on the blocking
//! thread pool behind a semaphore. Fire-and-forget jobs are tracked so
//! callers (and tests) can wait for them to drain.

use crate::error::ShieldsError;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

/// Shared pool for compile jobs and background tasks
#[derive(Debug, Clone)]
pub struct CompilePool {
    /// Compile slots
    permits: Arc<Semaphore>,
    /// Background jobs spawned through this pool
    tracker: TaskTracker,
}

impl CompilePool {
    /// Create a pool that runs at most `max_concurrent` compiles at once
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            tracker: TaskTracker::new(),
        }
    }

    /// Run `job` on the blocking thread pool once a compile slot is free
    pub async fn run_blocking<T, F>(&self, job: F) -> Result<T, ShieldsError>
    where
        F: FnOnce() -> Result<T, ShieldsError> + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| ShieldsError::WorkerFailed(e.to_string()))?;

        tokio::task::spawn_blocking(job).await?
    }

    /// Spawn a background job that [`CompilePool::wait_idle`] waits for
    pub fn spawn<F>(&self, job: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(job)
    }

    /// Wait until every background job, including jobs spawned while
    /// waiting, has finished
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_blocking_respects_slot_limit() {
        let pool = CompilePool::new(1);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let jobs = (0..4).map(|_| {
            let pool = pool.clone();
            let running = running.clone();
            let peak = peak.clone();
            async move {
                pool.run_blocking(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }
        });

        for result in futures::future::join_all(jobs).await {
            assert!(result.is_ok());
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wait_idle_drains_nested_jobs() {
        let pool = CompilePool::new(2);
        let done = Arc::new(AtomicUsize::new(0));

        let inner_pool = pool.clone();
        let inner_done = done.clone();
        pool.spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            inner_pool.spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                inner_done.fetch_add(1, Ordering::SeqCst);
            });
        });

        pool.wait_idle().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
