//! TaskService - lifecycle commands.
//!
//! Every command is a precondition check plus a status write, then a queue
//! dispatch or a lock-store signal. Nothing here runs a task. A rejected
//! command leaves the task untouched.
//!
//! | command   | requires                    | writes              | then                         |
//! |-----------|-----------------------------|---------------------|------------------------------|
//! | start     | CREATED, valid config       | STARTING + job id   | push job                     |
//! | stop      | STARTING / RUNNING / PAUSED | STOPPING            | stop flag, or finalize       |
//! | pause     | RUNNING                     | PAUSED              | pause flag, or finalize      |
//! | cancel    | STARTING / RUNNING / PAUSED | STOPPED (sync)      | revoke job, abort local run  |
//! | restart   | terminal, retries left      | CREATED (reset)     | drop events/state, start     |
//! | resume    | PAUSED                      | CREATED (keep all)  | start                        |

use std::sync::Arc;

use crate::app::lock_manager::{CancelSignal, StopMode, TaskLockManager};
use crate::app::registry::StrategyRegistry;
use crate::app::status::{TaskCounts, TaskStatusView};
use crate::app::synchronizer::StateSynchronizer;
use crate::app::worker_loop::RunningJobs;
use crate::domain::{
    Execution, Result, SpindleError, StatusNotification, Task, TaskConfig, TaskId, TaskKind,
    TaskStatus, ValidationError,
};
use crate::ports::{Clock, IdGenerator, Job, JobQueue, NotificationSink, TaskStore};

const ACTIVE: &[TaskStatus] = &[TaskStatus::Starting, TaskStatus::Running, TaskStatus::Paused];
const TERMINAL: &[TaskStatus] = &[TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Stopped];

fn status_names(statuses: &[TaskStatus]) -> String {
    statuses
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join("/")
}

pub struct TaskService {
    store: Arc<dyn TaskStore>,
    queue: Arc<dyn JobQueue>,
    locks: Arc<TaskLockManager>,
    sync: Arc<StateSynchronizer>,
    strategies: Arc<StrategyRegistry>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn NotificationSink>,
    running: Arc<RunningJobs>,
    max_retries: u32,
}

impl TaskService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn TaskStore>,
        queue: Arc<dyn JobQueue>,
        locks: Arc<TaskLockManager>,
        sync: Arc<StateSynchronizer>,
        strategies: Arc<StrategyRegistry>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn NotificationSink>,
        running: Arc<RunningJobs>,
        max_retries: u32,
    ) -> Self {
        Self {
            store,
            queue,
            locks,
            sync,
            strategies,
            ids,
            clock,
            notifier,
            running,
            max_retries,
        }
    }

    pub async fn create_task(
        &self,
        name: impl Into<String>,
        kind: TaskKind,
        config: TaskConfig,
    ) -> Result<Task> {
        config.validate()?;
        let task = Task::new(
            self.ids.generate_task_id(),
            name,
            kind,
            config,
            self.max_retries,
            self.clock.now(),
        );
        self.store.insert_task(task.clone()).await?;
        tracing::info!(task_id = %task.id, %kind, name = %task.name, "task created");
        Ok(task)
    }

    pub async fn start_task(&self, task_id: TaskId) -> Result<Task> {
        let job_id = self.ids.generate_job_id();
        let task = self
            .write(task_id, &[TaskStatus::Created], |task| {
                task.config.validate()?;
                if !self.strategies.contains(&task.config.strategy) {
                    return Err(SpindleError::UnknownStrategy(task.config.strategy.clone()));
                }
                task.status = TaskStatus::Starting;
                task.queue_job_id = Some(job_id);
                Ok(())
            })
            .await?;

        // a flag left from an earlier run must not stop this one
        self.locks.clear_cancellation_flag(task.kind, task_id).await?;

        let job = Job {
            id: job_id,
            kind: task.kind,
            task_id,
        };
        if let Err(e) = self.queue.push(job).await {
            tracing::error!(%task_id, %job_id, error = %e, "dispatch failed; reverting to CREATED");
            let reverted = self
                .write(task_id, &[TaskStatus::Starting], |task| {
                    task.status = TaskStatus::Created;
                    task.queue_job_id = None;
                    Ok(())
                })
                .await;
            if let Err(revert) = reverted {
                tracing::error!(%task_id, error = %revert, "revert after failed dispatch also failed");
            }
            return Err(e.into());
        }

        self.notify(&task).await;
        tracing::info!(%task_id, %job_id, kind = %task.kind, "task dispatched");
        Ok(task)
    }

    /// Ask the executor to stop at its next batch boundary. With no live
    /// executor the task is stopped here.
    pub async fn stop_task(&self, task_id: TaskId, mode: StopMode) -> Result<Task> {
        let task = self
            .write(task_id, ACTIVE, |task| {
                task.status = TaskStatus::Stopping;
                Ok(())
            })
            .await?;
        self.notify(&task).await;

        if mode == StopMode::Immediate {
            self.revoke_job(&task).await;
        }
        if self.locks.is_locked(task.kind, task_id).await? {
            self.locks
                .request_cancellation(task.kind, task_id, CancelSignal::Stop(mode))
                .await?;
            return Ok(task);
        }

        tracing::info!(%task_id, "no live executor; stopping directly");
        self.revoke_job(&task).await;
        self.finalize_without_executor(task, TaskStatus::Stopped)
            .await
    }

    /// Record the pause and ask the executor to persist and exit.
    pub async fn pause_task(&self, task_id: TaskId) -> Result<Task> {
        let task = self
            .write(task_id, &[TaskStatus::Running], |task| {
                task.status = TaskStatus::Paused;
                Ok(())
            })
            .await?;
        self.notify(&task).await;

        if self.locks.is_locked(task.kind, task_id).await? {
            self.locks
                .request_cancellation(task.kind, task_id, CancelSignal::Pause)
                .await?;
            return Ok(task);
        }

        tracing::info!(%task_id, "no live executor; pausing directly");
        self.finalize_without_executor(task, TaskStatus::Paused)
            .await
    }

    /// Stop now: revoke the queued job, abort a run in this process and
    /// commit STOPPED without waiting for a batch boundary.
    pub async fn cancel_task(&self, task_id: TaskId) -> Result<Task> {
        let task = self.require(task_id, ACTIVE).await?;

        self.revoke_job(&task).await;
        let leased = self.locks.is_locked(task.kind, task_id).await?;

        let task = self
            .finalize_without_executor(task, TaskStatus::Stopped)
            .await?;
        if leased {
            // set after finalizing, which clears flags; an executor in another
            // process sees it at its next boundary and its release clears it
            self.locks
                .request_cancellation(task.kind, task_id, CancelSignal::Stop(StopMode::Immediate))
                .await?;
        }
        self.running.terminate(task_id);
        tracing::info!(%task_id, "task cancelled");
        Ok(task)
    }

    /// Fresh run of a finished task. Spends one retry; events, persisted
    /// state and execution logs of earlier runs are dropped.
    pub async fn restart_task(&self, task_id: TaskId) -> Result<Task> {
        let task = self.require(task_id, TERMINAL).await?;
        if !task.can_retry() {
            return Err(ValidationError::RetryLimitExceeded {
                retry_count: task.retry_count,
                max_retries: task.max_retries,
            }
            .into());
        }
        self.ensure_unleased(&task).await?;

        let now = self.clock.now();
        let task = self
            .write(task_id, TERMINAL, |task| {
                if !task.can_retry() {
                    return Err(ValidationError::RetryLimitExceeded {
                        retry_count: task.retry_count,
                        max_retries: task.max_retries,
                    }
                    .into());
                }
                task.reset_for_restart(now);
                Ok(())
            })
            .await?;

        let dropped = self.store.delete_events(task_id).await?;
        self.store.clear_execution_state(task_id).await?;
        self.store.clear_execution_logs(task_id).await?;
        tracing::info!(%task_id, retry = task.retry_count, dropped_events = dropped, "task reset for restart");
        self.notify(&task).await;

        self.start_task(task_id).await
    }

    /// Continue a paused task from its persisted state.
    pub async fn resume_task(&self, task_id: TaskId) -> Result<Task> {
        let task = self.require(task_id, &[TaskStatus::Paused]).await?;
        self.ensure_unleased(&task).await?;

        let now = self.clock.now();
        let task = self
            .write(task_id, &[TaskStatus::Paused], |task| {
                task.reset_for_resume(now);
                Ok(())
            })
            .await?;
        tracing::info!(%task_id, "task reset for resume");
        self.notify(&task).await;

        self.start_task(task_id).await
    }

    pub async fn counts(&self) -> Result<TaskCounts> {
        let mut counts = TaskCounts::default();
        for status in TaskStatus::ALL {
            counts.set(status, self.store.tasks_with_status(status).await?.len());
        }
        Ok(counts)
    }

    pub async fn status(&self, task_id: TaskId) -> Result<TaskStatusView> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(SpindleError::TaskNotFound(task_id))?;
        let latest_execution = self.store.latest_execution(task_id).await?;
        let consistency = self.sync.verify_state_consistency(task_id).await?;
        Ok(TaskStatusView {
            task,
            latest_execution,
            consistency,
        })
    }

    async fn require(&self, task_id: TaskId, expected: &[TaskStatus]) -> Result<Task> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(SpindleError::TaskNotFound(task_id))?;
        if !expected.contains(&task.status) {
            return Err(ValidationError::invalid_status(status_names(expected), task.status).into());
        }
        Ok(task)
    }

    async fn ensure_unleased(&self, task: &Task) -> Result<()> {
        if self.locks.is_locked(task.kind, task.id).await? {
            return Err(ValidationError::LeaseStillHeld(task.id).into());
        }
        Ok(())
    }

    /// Precondition-gated task write inside one store transaction.
    async fn write<F>(&self, task_id: TaskId, expected: &[TaskStatus], apply: F) -> Result<Task>
    where
        F: FnOnce(&mut Task) -> Result<()> + Send,
    {
        let mut tx = self.store.begin().await?;
        let mut task = tx
            .task(task_id)
            .await?
            .ok_or(SpindleError::TaskNotFound(task_id))?;
        if !expected.contains(&task.status) {
            return Err(ValidationError::invalid_status(status_names(expected), task.status).into());
        }

        let from = task.status;
        apply(&mut task)?;
        task.updated_at = self.clock.now();
        tx.put_task(task.clone()).await?;
        tx.commit().await?;

        tracing::info!(%task_id, kind = %task.kind, %from, to = %task.status, "task status written");
        Ok(task)
    }

    /// Commit `to` through the synchronizer on the latest open execution, or
    /// on a fresh one when the task never ran.
    async fn finalize_without_executor(&self, mut task: Task, to: TaskStatus) -> Result<Task> {
        let mut execution = self.open_execution(&task).await?;
        match to {
            TaskStatus::Paused => {
                self.sync
                    .transition_to_paused(&mut task, &mut execution)
                    .await?
            }
            _ => {
                self.sync
                    .transition_to_stopped(&mut task, &mut execution)
                    .await?
            }
        }
        self.locks.clear_cancellation_flag(task.kind, task.id).await?;
        Ok(task)
    }

    async fn open_execution(&self, task: &Task) -> Result<Execution> {
        let mut tx = self.store.begin().await?;
        let latest = tx.latest_execution(task.id).await?;
        if let Some(latest) = &latest
            && !latest.is_terminal()
        {
            return Ok(latest.clone());
        }
        let number = latest.map_or(1, |e| e.execution_number + 1);
        let execution = Execution::new(
            self.ids.generate_execution_id(),
            task.id,
            number,
            self.clock.now(),
        );
        tx.put_execution(execution.clone()).await?;
        tx.commit().await?;
        Ok(execution)
    }

    async fn revoke_job(&self, task: &Task) {
        let Some(job_id) = task.queue_job_id else {
            return;
        };
        match self.queue.revoke(job_id).await {
            Ok(true) => tracing::info!(task_id = %task.id, %job_id, "queued job revoked"),
            Ok(false) => tracing::debug!(task_id = %task.id, %job_id, "job no longer queued"),
            Err(e) => tracing::warn!(task_id = %task.id, %job_id, error = %e, "job revoke failed"),
        }
    }

    /// Best effort: the status write already stands.
    async fn notify(&self, task: &Task) {
        let notification = StatusNotification {
            task_id: task.id,
            task_name: task.name.clone(),
            task_kind: task.kind,
            status: task.status,
            execution_id: None,
            timestamp: self.clock.now(),
            error_message: None,
        };
        if let Err(e) = self.notifier.publish(&notification).await {
            tracing::warn!(task_id = %task.id, status = %task.status, error = %e, "status notification dropped");
        }
    }
}
