//! StaleLockSweep - reclaims tasks whose executor stopped heartbeating.
//!
//! # Flow
//! 1. list RUNNING tasks
//! 2. stale = heartbeat absent or older than the threshold
//! 3. release lease/heartbeat/flag, fail task + latest execution
//!
//! One task failing to recover never stops the rest of the sweep. A failed
//! listing is reported as `success: false`, unlike an empty sweep.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::app::lock_manager::TaskLockManager;
use crate::app::synchronizer::StateSynchronizer;
use crate::domain::{Result, SpindleError, Task, TaskId, TaskStatus};
use crate::ports::TaskStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    pub success: bool,
    pub cleaned: usize,
    pub task_ids: Vec<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SweepReport {
    fn cleaned(task_ids: Vec<TaskId>) -> Self {
        Self {
            success: true,
            cleaned: task_ids.len(),
            task_ids,
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            success: false,
            cleaned: 0,
            task_ids: Vec::new(),
            error: Some(error),
        }
    }
}

pub struct StaleLockSweep {
    store: Arc<dyn TaskStore>,
    locks: Arc<TaskLockManager>,
    sync: Arc<StateSynchronizer>,
}

impl StaleLockSweep {
    pub fn new(
        store: Arc<dyn TaskStore>,
        locks: Arc<TaskLockManager>,
        sync: Arc<StateSynchronizer>,
    ) -> Self {
        Self { store, locks, sync }
    }

    pub async fn sweep(&self) -> SweepReport {
        let running = match self.store.tasks_with_status(TaskStatus::Running).await {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::error!(error = %e, "stale sweep could not list running tasks");
                return SweepReport::failed(e.to_string());
            }
        };

        let mut cleaned = Vec::new();
        for task in running {
            let task_id = task.id;
            match self.recover(task).await {
                Ok(true) => cleaned.push(task_id),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(%task_id, error = %e, "stale task recovery failed; continuing");
                }
            }
        }

        if !cleaned.is_empty() {
            tracing::info!(cleaned = cleaned.len(), "stale sweep reclaimed tasks");
        }
        SweepReport::cleaned(cleaned)
    }

    async fn recover(&self, mut task: Task) -> Result<bool> {
        if !self.locks.is_stale(task.kind, task.id).await? {
            return Ok(false);
        }
        let threshold = self.locks.stale_threshold().as_secs();
        tracing::warn!(task_id = %task.id, kind = %task.kind, threshold_secs = threshold, "stale lease detected");

        self.locks.release_lock(task.kind, task.id).await?;

        let mut execution = self
            .store
            .latest_execution(task.id)
            .await?
            .ok_or_else(|| {
                SpindleError::Execution(format!("running task {} has no execution", task.id))
            })?;
        let message = format!("stale lock: heartbeat not renewed within {threshold}s");
        self.sync
            .transition_to_failed(&mut task, &mut execution, message)
            .await?;
        Ok(true)
    }

    /// Sweep every `interval` until `shutdown` flips to true.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval_secs = interval.as_secs(), "stale sweep started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.sweep().await;
                    tracing::debug!(success = report.success, cleaned = report.cleaned, "stale sweep finished");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("stale sweep stopped");
    }
}
