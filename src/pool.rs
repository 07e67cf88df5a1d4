//! Bounded worker pools
//!
//! Three long-lived pools serve the query path: one task per physical shard,
//! one task per series during range merges, and one task per fingerprint
//! batch. A fourth pool runs detached follow-up work whose failures are only
//! logged.
//!
//! Submission waits for a free slot instead of queueing unboundedly, and
//! fails immediately once the pool is closed.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, warn};

use crate::config::PoolConfig;
use crate::error::{Error, PoolError, Result};

/// Fixed-capacity task pool
#[derive(Debug, Clone)]
pub struct WorkerPool {
    name: &'static str,
    capacity: usize,
    semaphore: Arc<Semaphore>,
}

impl WorkerPool {
    /// Create a pool running at most `capacity` tasks at once
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name,
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
        }
    }

    /// Pool name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Maximum concurrent tasks
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free slots right now
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Reject every further submission
    pub fn close(&self) {
        self.semaphore.close();
        debug!(pool = self.name, "Worker pool closed");
    }

    /// Whether the pool has been closed
    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    /// Run `task` once a slot is free
    pub async fn submit<F, T>(&self, task: F) -> std::result::Result<JoinHandle<T>, PoolError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed(self.name))?;
        Ok(tokio::spawn(async move {
            let _permit = permit;
            task.await
        }))
    }

    /// Start a fan-out group on this pool
    pub fn group<T: Send + 'static>(&self, cancel_on_error: bool) -> TaskGroup<T> {
        TaskGroup {
            pool: self.clone(),
            set: JoinSet::new(),
            submitted: 0,
            cancel_on_error,
        }
    }
}

// ============================================================================
// Fan-out / fan-in
// ============================================================================

/// A batch of fallible tasks joined together
///
/// By default every task runs to completion and the first error is reported
/// after all of them finished. With `cancel_on_error` the remaining tasks
/// are aborted as soon as one fails.
pub struct TaskGroup<T> {
    pool: WorkerPool,
    set: JoinSet<Result<T>>,
    submitted: usize,
    cancel_on_error: bool,
}

impl<T: Send + 'static> TaskGroup<T> {
    /// Add a task, waiting for a free slot
    pub async fn spawn<F>(&mut self, task: F) -> Result<()>
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let permit = Arc::clone(&self.pool.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed(self.pool.name))?;
        self.set.spawn(async move {
            let _permit = permit;
            task.await
        });
        self.submitted += 1;
        Ok(())
    }

    /// Tasks submitted so far
    pub fn len(&self) -> usize {
        self.submitted
    }

    /// Whether no task was submitted
    pub fn is_empty(&self) -> bool {
        self.submitted == 0
    }

    /// Wait for every task, returning all outputs or the first error
    ///
    /// Outputs arrive in completion order.
    pub async fn join(mut self) -> Result<Vec<T>> {
        let mut results = Vec::with_capacity(self.submitted);
        let mut first_error: Option<Error> = None;

        while let Some(joined) = self.set.join_next().await {
            let failure = match joined {
                Ok(Ok(value)) => {
                    results.push(value);
                    continue;
                },
                Ok(Err(e)) => e,
                Err(e) if e.is_cancelled() => continue,
                Err(e) => Error::from(PoolError::TaskFailed {
                    pool: self.pool.name,
                    message: e.to_string(),
                }),
            };

            warn!(pool = self.pool.name, error = %failure, "Pool task failed");
            if first_error.is_none() {
                first_error = Some(failure);
                if self.cancel_on_error {
                    self.set.abort_all();
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(results),
        }
    }
}

// ============================================================================
// Detached executor
// ============================================================================

/// Runs follow-up work that must outlive the request that triggered it
///
/// Tasks are spawned immediately onto the runtime, so dropping the caller's
/// future never aborts them. Failures go to the error log.
#[derive(Debug, Clone)]
pub struct DetachedExecutor {
    pool: WorkerPool,
}

impl DetachedExecutor {
    /// Create an executor running at most `capacity` tasks at once
    pub fn new(capacity: usize) -> Self {
        Self {
            pool: WorkerPool::new("detached", capacity),
        }
    }

    /// Spawn `task`, logging its error if any
    pub fn spawn<F>(&self, label: &'static str, task: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::spawn(async move {
            let handle = match pool.submit(task).await {
                Ok(handle) => handle,
                Err(e) => {
                    error!(task = label, error = %e, "Detached task rejected");
                    return;
                },
            };
            match handle.await {
                Ok(Ok(())) => debug!(task = label, "Detached task completed"),
                Ok(Err(e)) => error!(task = label, error = %e, "Detached task failed"),
                Err(e) => error!(task = label, error = %e, "Detached task panicked"),
            }
        })
    }

    /// Stop accepting work
    pub fn close(&self) {
        self.pool.close();
    }
}

/// The process-wide pools used by the query path
#[derive(Debug, Clone)]
pub struct Pools {
    /// One task per physical shard request
    pub shard: WorkerPool,
    /// One task per series during range merges
    pub merge: WorkerPool,
    /// One task per fingerprint batch
    pub batch: WorkerPool,
    /// Detached follow-up work
    pub detached: DetachedExecutor,
}

impl Pools {
    /// Build pools from configuration
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            shard: WorkerPool::new("shard", config.shard_workers),
            merge: WorkerPool::new("merge", config.merge_workers),
            batch: WorkerPool::new("batch", config.batch_workers),
            detached: DetachedExecutor::new(config.detached_workers),
        }
    }

    /// Close every pool
    pub fn close(&self) {
        self.shard.close();
        self.merge.close();
        self.batch.close();
        self.detached.close();
    }
}

impl Default for Pools {
    fn default() -> Self {
        Self::new(&PoolConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_group_collects_all_results() {
        let pool = WorkerPool::new("test", 2);
        let mut group = pool.group(false);
        for i in 0..10u32 {
            group.spawn(async move { Ok(i) }).await.unwrap();
        }
        assert_eq!(group.len(), 10);
        let mut results = group.join().await.unwrap();
        results.sort();
        assert_eq!(results, (0..10).collect::<Vec<_>>());
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_group_concurrency_is_bounded() {
        let pool = WorkerPool::new("test", 3);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut group = pool.group(false);
        for _ in 0..12 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            group
                .spawn(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
                .unwrap();
        }
        group.join().await.unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_error_waits_for_siblings() {
        let pool = WorkerPool::new("test", 4);
        let finished = Arc::new(AtomicUsize::new(0));
        let mut group = pool.group(false);
        group.spawn(async { Err::<(), _>(Error::internal("shard 0 down")) }).await.unwrap();
        for _ in 0..3 {
            let finished = Arc::clone(&finished);
            group
                .spawn(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
                .unwrap();
        }
        let err = group.join().await.unwrap_err();
        assert!(err.to_string().contains("shard 0 down"));
        assert_eq!(finished.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancel_on_error_aborts_siblings() {
        let pool = WorkerPool::new("test", 4);
        let finished = Arc::new(AtomicUsize::new(0));
        let mut group = pool.group(true);
        for _ in 0..3 {
            let finished = Arc::clone(&finished);
            group
                .spawn(async move {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
                .unwrap();
        }
        group.spawn(async { Err::<(), _>(Error::internal("boom")) }).await.unwrap();
        assert!(group.join().await.is_err());
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects() {
        let pool = WorkerPool::new("merge", 1);
        pool.close();
        assert!(pool.is_closed());
        let err = pool.submit(async {}).await.unwrap_err();
        assert!(matches!(err, PoolError::Closed("merge")));

        let mut group = pool.group::<()>(false);
        let err = group.spawn(async { Ok(()) }).await.unwrap_err();
        assert_eq!(err.status_code(), 422);
    }

    #[tokio::test]
    async fn test_detached_task_runs_to_completion() {
        let executor = DetachedExecutor::new(1);
        let done = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&done);
        let handle = executor.spawn("test", async move {
            flag.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        handle.await.unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 1);

        // Failures are logged, not propagated
        executor
            .spawn("failing", async { Err(Error::internal("scheduler down")) })
            .await
            .unwrap();
    }
}
