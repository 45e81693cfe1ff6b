//! Bounded job executor.
//!
//! A permit is reserved by the firing loop before a trigger is fired and is
//! held by the job task until the run (and its completion bookkeeping) ends.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

#[derive(Debug)]
pub struct WorkerPool {
    size: usize,
    semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
    completed: Arc<AtomicU64>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            size,
            semaphore: Arc::new(Semaphore::new(size)),
            tracker: TaskTracker::new(),
            completed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Workers not reserved right now.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Runs finished since the pool was created.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Reserve a worker without waiting. `None` when all are busy or the
    /// pool is shut down.
    pub fn try_reserve(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore).try_acquire_owned().ok()
    }

    /// Run `job` on a reserved worker.
    pub fn spawn<F>(&self, permit: OwnedSemaphorePermit, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let completed = Arc::clone(&self.completed);
        self.tracker.spawn(async move {
            job.await;
            completed.fetch_add(1, Ordering::Relaxed);
            drop(permit);
        });
    }

    /// Resolves once at least one worker is free (or the pool is shut down).
    pub async fn wait_for_capacity(&self) {
        if let Ok(permit) = self.semaphore.acquire().await {
            drop(permit);
        }
    }

    /// Stop handing out workers; with `wait`, also drain the running jobs.
    pub async fn shutdown(&self, wait: bool) {
        self.semaphore.close();
        self.tracker.close();
        if wait && !self.tracker.is_empty() {
            info!(in_flight = self.tracker.len(), "waiting for running jobs");
            self.tracker.wait().await;
        }
        debug!(completed = self.completed(), "worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn reservation_is_bounded() {
        let pool = WorkerPool::new(2);
        let a = pool.try_reserve().unwrap();
        let _b = pool.try_reserve().unwrap();
        assert!(pool.try_reserve().is_none());
        assert_eq!(pool.available(), 0);
        drop(a);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn permit_is_held_until_job_ends() {
        let pool = WorkerPool::new(1);
        let (tx, rx) = oneshot::channel::<()>();
        let permit = pool.try_reserve().unwrap();
        pool.spawn(permit, async move {
            let _ = rx.await;
        });
        assert!(pool.try_reserve().is_none());
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), pool.wait_for_capacity())
            .await
            .unwrap();
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn shutdown_drains_jobs() {
        let pool = WorkerPool::new(3);
        for _ in 0..3 {
            let permit = pool.try_reserve().unwrap();
            pool.spawn(permit, async {
                tokio::time::sleep(Duration::from_millis(20)).await;
            });
        }
        pool.shutdown(true).await;
        assert_eq!(pool.completed(), 3);
        assert!(pool.try_reserve().is_none());
    }
}
