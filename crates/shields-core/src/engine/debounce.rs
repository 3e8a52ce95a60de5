//! Debounced scheduling of compile jobs

use crate::pool::CompilePool;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;

/// Runs the most recently scheduled job once `delay` passes without another
/// call to [`Debouncer::schedule`]. Earlier jobs are dropped.
#[derive(Debug)]
pub struct Debouncer {
    delay: Duration,
    /// Bumped on every schedule, a sleeping job only runs if it is still current
    generation: Arc<AtomicU64>,
    pending: Mutex<Option<JoinHandle<()>>>,
    pool: CompilePool,
}

impl Debouncer {
    pub fn new(delay: Duration, pool: CompilePool) -> Self {
        Self {
            delay,
            generation: Arc::new(AtomicU64::new(0)),
            pending: Mutex::new(None),
            pool,
        }
    }

    /// Restart the timer with `job` as the job to run when it fires
    pub fn schedule<F, Fut>(&self, job: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let latest = Arc::clone(&self.generation);
        let delay = self.delay;

        let handle = self.pool.spawn(async move {
            tokio::time::sleep(delay).await;
            if latest.load(Ordering::SeqCst) != generation {
                return;
            }
            job().await;
        });

        *self.pending.lock() = Some(handle);
    }

    /// Whether a scheduled job has not finished yet
    #[cfg(test)]
    fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Wait for the most recently scheduled job
    pub async fn join(&self) {
        let handle = self.pending.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Debounced job failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_burst_runs_last_job_once() {
        let debouncer = Debouncer::new(Duration::from_millis(30), CompilePool::new(1));
        let runs = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(AtomicUsize::new(0));

        for i in 1..=5 {
            let runs = runs.clone();
            let last = last.clone();
            debouncer.schedule(move || async move {
                runs.fetch_add(1, Ordering::SeqCst);
                last.store(i, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(debouncer.is_pending());
        debouncer.join().await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(last.load(Ordering::SeqCst), 5);
        assert!(!debouncer.is_pending());
    }

    #[tokio::test]
    async fn test_spaced_calls_each_run() {
        let debouncer = Debouncer::new(Duration::from_millis(10), CompilePool::new(1));
        let runs = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let runs = runs.clone();
            debouncer.schedule(move || async move {
                runs.fetch_add(1, Ordering::SeqCst);
            });
            debouncer.join().await;
        }

        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
