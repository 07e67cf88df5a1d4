//! Model update registry
//!
//! Tracks when each model (or data view) last changed. The series identity
//! cache treats entries refreshed before that instant as stale. A change
//! also asks the downstream job scheduler to re-plan the model; that call
//! runs on the detached executor so it completes even if the request that
//! caused the change is dropped.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::backend::{Clock, JobScheduler};
use crate::pool::DetachedExecutor;

/// Last update instant per model
pub struct ModelRegistry {
    updates: DashMap<String, i64>,
    clock: Arc<dyn Clock>,
    scheduler: Option<Arc<dyn JobScheduler>>,
    executor: DetachedExecutor,
}

impl ModelRegistry {
    /// Create a registry without a downstream scheduler
    pub fn new(clock: Arc<dyn Clock>, executor: DetachedExecutor) -> Self {
        Self {
            updates: DashMap::new(),
            clock,
            scheduler: None,
            executor,
        }
    }

    /// Notify `scheduler` after every update
    pub fn with_scheduler(mut self, scheduler: Arc<dyn JobScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// When `model_id` last changed
    pub fn last_update(&self, model_id: &str) -> Option<i64> {
        self.updates.get(model_id).map(|t| *t)
    }

    /// Record a change of `model_id` now
    ///
    /// Returns the handle of the detached scheduler notification, if any.
    pub fn mark_updated(&self, model_id: &str) -> Option<JoinHandle<()>> {
        let now = self.clock.now_ms();
        self.updates
            .entry(model_id.to_string())
            .and_modify(|t| *t = (*t).max(now))
            .or_insert(now);
        debug!(model_id, updated_at = now, "Model marked updated");

        let scheduler = Arc::clone(self.scheduler.as_ref()?);
        let model_id = model_id.to_string();
        Some(self.executor.spawn("reschedule", async move {
            scheduler.reschedule(&model_id).await
        }))
    }
}
