//! StateSynchronizer - the task state machine.
//!
//! Every transition is one unit of work:
//! 1. open a store transaction
//! 2. re-read task and execution, validate the move against both
//! 3. stage the new task and execution records
//! 4. publish the status notification
//! 5. commit
//!
//! A failed notification drops the transaction, so nothing is committed and
//! the caller's records are left as they were; the caller retries the whole
//! transition. Notification sinks must not call back into the store.

use std::sync::Arc;

use crate::domain::{
    Execution, LogEntry, Result, SpindleError, StatusNotification, Task, TaskId, TaskStatus,
    ValidationError,
};
use crate::ports::{Clock, NotificationSink, TaskStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsistencyReport {
    pub consistent: bool,
    pub message: String,
}

pub struct StateSynchronizer {
    store: Arc<dyn TaskStore>,
    notifier: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
}

impl StateSynchronizer {
    pub fn new(
        store: Arc<dyn TaskStore>,
        notifier: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            notifier,
            clock,
        }
    }

    /// STARTING -> RUNNING. Stamps `started_at` if unset, resets progress to 0.
    pub async fn transition_to_running(&self, task: &mut Task, execution: &mut Execution) -> Result<()> {
        self.transition(task, execution, TaskStatus::Running, None).await
    }

    /// STARTING/RUNNING/PAUSED/STOPPING -> STOPPED. Stamps `completed_at`.
    pub async fn transition_to_stopped(&self, task: &mut Task, execution: &mut Execution) -> Result<()> {
        self.transition(task, execution, TaskStatus::Stopped, None).await
    }

    /// RUNNING -> COMPLETED. Stamps `completed_at`, progress 100.
    pub async fn transition_to_completed(
        &self,
        task: &mut Task,
        execution: &mut Execution,
    ) -> Result<()> {
        self.transition(task, execution, TaskStatus::Completed, None).await
    }

    /// Any live status -> FAILED with `error_message`.
    pub async fn transition_to_failed(
        &self,
        task: &mut Task,
        execution: &mut Execution,
        error_message: impl Into<String>,
    ) -> Result<()> {
        self.transition(task, execution, TaskStatus::Failed, Some(error_message.into()))
            .await
    }

    /// RUNNING -> PAUSED, or acknowledge a pause the service already wrote on
    /// the task (task PAUSED, execution RUNNING).
    pub async fn transition_to_paused(&self, task: &mut Task, execution: &mut Execution) -> Result<()> {
        self.transition(task, execution, TaskStatus::Paused, None).await
    }

    async fn transition(
        &self,
        task: &mut Task,
        execution: &mut Execution,
        to: TaskStatus,
        error_message: Option<String>,
    ) -> Result<()> {
        let mut tx = self.store.begin().await?;

        let mut next_task = tx
            .task(task.id)
            .await?
            .ok_or(SpindleError::TaskNotFound(task.id))?;
        let mut next_exec = tx
            .execution(execution.id)
            .await?
            .ok_or(SpindleError::ExecutionNotFound(execution.id))?;

        if next_exec.task_id != next_task.id {
            return Err(SpindleError::Execution(format!(
                "execution {} does not belong to task {}",
                next_exec.id, next_task.id
            )));
        }
        if !next_task.status.can_transition_to(to) {
            return Err(ValidationError::InvalidTransition {
                from: next_task.status,
                to,
            }
            .into());
        }
        if next_exec.is_terminal() || !next_exec.status.can_transition_to(to) {
            return Err(ValidationError::InvalidTransition {
                from: next_exec.status,
                to,
            }
            .into());
        }

        let now = self.clock.now();
        next_task.status = to;
        next_task.updated_at = now;
        next_exec.status = to;

        match to {
            TaskStatus::Running => {
                next_task.started_at.get_or_insert(now);
                next_exec.started_at.get_or_insert(now);
                next_exec.progress = 0.0;
                next_exec.log(LogEntry::info(now, "execution running"));
            }
            TaskStatus::Completed => {
                next_task.completed_at = Some(now);
                next_exec.completed_at = Some(now);
                next_exec.progress = 100.0;
                next_exec.log(LogEntry::info(now, "execution completed"));
            }
            TaskStatus::Stopped => {
                next_task.completed_at = Some(now);
                next_exec.completed_at = Some(now);
                next_exec.log(LogEntry::info(now, "execution stopped"));
            }
            TaskStatus::Failed => {
                let message = error_message.unwrap_or_else(|| "unknown error".to_string());
                next_task.completed_at = Some(now);
                next_task.failed_at = Some(now);
                next_task.error_message = Some(message.clone());
                next_exec.completed_at = Some(now);
                next_exec.log(LogEntry::error(now, message.clone()));
                next_exec.error_message = Some(message);
            }
            TaskStatus::Paused => {
                next_exec.log(LogEntry::info(now, "execution paused"));
            }
            other => {
                return Err(SpindleError::Execution(format!(
                    "{other} is not a synchronizer transition"
                )));
            }
        }

        tx.put_task(next_task.clone()).await?;
        tx.put_execution(next_exec.clone()).await?;

        let notification = StatusNotification {
            task_id: next_task.id,
            task_name: next_task.name.clone(),
            task_kind: next_task.kind,
            status: to,
            execution_id: Some(next_exec.id),
            timestamp: now,
            error_message: next_exec.error_message.clone(),
        };
        if let Err(e) = self.notifier.publish(&notification).await {
            tracing::warn!(
                task_id = %next_task.id, status = %to, error = %e,
                "status notification failed; transition rolled back"
            );
            // dropping `tx` discards the staged records
            return Err(e.into());
        }

        tx.commit().await?;

        tracing::info!(
            task_id = %next_task.id,
            kind = %next_task.kind,
            execution_id = %next_exec.id,
            from = %task.status,
            to = %to,
            "task transitioned"
        );
        *task = next_task;
        *execution = next_exec;
        Ok(())
    }

    /// Compare a task with its latest execution. Mismatches are reported,
    /// never repaired.
    pub async fn verify_state_consistency(&self, task_id: TaskId) -> Result<ConsistencyReport> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(SpindleError::TaskNotFound(task_id))?;

        let report = match self.store.latest_execution(task_id).await? {
            None if task.status == TaskStatus::Created => ConsistencyReport {
                consistent: true,
                message: "task is CREATED with no executions".to_string(),
            },
            None => ConsistencyReport {
                consistent: false,
                message: format!("task is {} but has no executions", task.status),
            },
            Some(latest) if latest.status == task.status => ConsistencyReport {
                consistent: true,
                message: format!(
                    "task and execution #{} are both {}",
                    latest.execution_number, task.status
                ),
            },
            Some(latest) => ConsistencyReport {
                consistent: false,
                message: format!(
                    "task is {} but latest execution #{} ({}) is {}",
                    task.status, latest.execution_number, latest.id, latest.status
                ),
            },
        };
        if !report.consistent {
            tracing::warn!(%task_id, message = %report.message, "state inconsistency");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::IdGenerator;
    use crate::testing::Harness;

    #[tokio::test]
    async fn running_stamps_start_and_resets_progress() {
        let h = Harness::new();
        let mut task = h.seed_task(TaskStatus::Starting).await;
        let mut exec = h.seed_execution(&task, TaskStatus::Starting).await;
        h.store.update_progress(exec.id, 40.0).await.unwrap();
        exec.progress = 40.0;

        h.sync.transition_to_running(&mut task, &mut exec).await.unwrap();

        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(exec.status, TaskStatus::Running);
        assert_eq!(task.started_at, Some(h.clock.now()));
        assert_eq!(exec.progress, 0.0);

        let stored = h.store.latest_execution(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Running);
        assert_eq!(stored.progress, 0.0);

        let sent = h.sink.notifications();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].status, TaskStatus::Running);
        assert_eq!(sent[0].execution_id, Some(exec.id));
    }

    #[tokio::test]
    async fn running_keeps_existing_started_at() {
        let h = Harness::new();
        let mut task = h.seed_task(TaskStatus::Starting).await;
        let first_start = h.clock.now() - chrono::Duration::hours(1);
        task.started_at = Some(first_start);
        h.put_task(&task).await;
        let mut exec = h.seed_execution(&task, TaskStatus::Starting).await;

        h.sync.transition_to_running(&mut task, &mut exec).await.unwrap();

        assert_eq!(task.started_at, Some(first_start));
    }

    #[tokio::test]
    async fn completed_forces_full_progress() {
        let h = Harness::new();
        let mut task = h.seed_task(TaskStatus::Running).await;
        let mut exec = h.seed_execution(&task, TaskStatus::Running).await;

        h.sync.transition_to_completed(&mut task, &mut exec).await.unwrap();

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(exec.progress, 100.0);
        assert!(task.completed_at.is_some());
        assert!(exec.completed_at.is_some());
    }

    #[tokio::test]
    async fn failed_records_message_on_both() {
        let h = Harness::new();
        let mut task = h.seed_task(TaskStatus::Running).await;
        let mut exec = h.seed_execution(&task, TaskStatus::Running).await;

        h.sync
            .transition_to_failed(&mut task, &mut exec, "strategy exploded")
            .await
            .unwrap();

        assert_eq!(task.error_message.as_deref(), Some("strategy exploded"));
        assert_eq!(exec.error_message.as_deref(), Some("strategy exploded"));
        assert!(task.failed_at.is_some());
        let sent = h.sink.notifications();
        assert_eq!(sent[0].error_message.as_deref(), Some("strategy exploded"));
    }

    #[tokio::test]
    async fn stopped_from_stopping_task() {
        let h = Harness::new();
        let mut task = h.seed_task(TaskStatus::Stopping).await;
        let mut exec = h.seed_execution(&task, TaskStatus::Running).await;

        h.sync.transition_to_stopped(&mut task, &mut exec).await.unwrap();

        assert_eq!(task.status, TaskStatus::Stopped);
        assert_eq!(exec.status, TaskStatus::Stopped);
    }

    #[tokio::test]
    async fn pause_acknowledges_service_written_pause() {
        let h = Harness::new();
        let mut task = h.seed_task(TaskStatus::Paused).await;
        let mut exec = h.seed_execution(&task, TaskStatus::Running).await;

        h.sync.transition_to_paused(&mut task, &mut exec).await.unwrap();

        assert_eq!(exec.status, TaskStatus::Paused);
        assert!(exec.completed_at.is_none());
    }

    #[tokio::test]
    async fn invalid_transition_changes_nothing() {
        let h = Harness::new();
        let mut task = h.seed_task(TaskStatus::Completed).await;
        let mut exec = h.seed_execution(&task, TaskStatus::Completed).await;
        let before = (task.clone(), exec.clone());

        let err = h
            .sync
            .transition_to_running(&mut task, &mut exec)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SpindleError::Validation(ValidationError::InvalidTransition { .. })
        ));
        assert_eq!((task, exec), before);
        assert!(h.sink.notifications().is_empty());
    }

    #[tokio::test]
    async fn terminal_execution_cannot_move() {
        let h = Harness::new();
        let mut task = h.seed_task(TaskStatus::Running).await;
        let mut exec = h.seed_execution(&task, TaskStatus::Failed).await;

        assert!(
            h.sync
                .transition_to_completed(&mut task, &mut exec)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn failed_notification_rolls_back_whole_transition() {
        let h = Harness::new();
        let mut task = h.seed_task(TaskStatus::Starting).await;
        let mut exec = h.seed_execution(&task, TaskStatus::Starting).await;
        h.sink.fail_next(1);

        let err = h
            .sync
            .transition_to_running(&mut task, &mut exec)
            .await
            .unwrap_err();
        assert!(matches!(err, SpindleError::NotificationDelivery(_)));

        // nothing observable changed
        assert_eq!(task.status, TaskStatus::Starting);
        let stored = h.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Starting);
        assert!(stored.started_at.is_none());
        let stored_exec = h.store.latest_execution(task.id).await.unwrap().unwrap();
        assert_eq!(stored_exec.status, TaskStatus::Starting);

        // retrying the whole transition succeeds
        h.sync.transition_to_running(&mut task, &mut exec).await.unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(h.sink.notifications().len(), 1);
    }

    #[tokio::test]
    async fn consistency_report() {
        let h = Harness::new();

        let fresh = h.seed_task(TaskStatus::Created).await;
        let report = h.sync.verify_state_consistency(fresh.id).await.unwrap();
        assert!(report.consistent);

        let orphan = h.seed_task(TaskStatus::Running).await;
        let report = h.sync.verify_state_consistency(orphan.id).await.unwrap();
        assert!(!report.consistent);
        assert!(report.message.contains("no executions"));

        let mut task = h.seed_task(TaskStatus::Running).await;
        let mut exec = h.seed_execution(&task, TaskStatus::Running).await;
        assert!(h.sync.verify_state_consistency(task.id).await.unwrap().consistent);

        task.status = TaskStatus::Stopping;
        h.put_task(&task).await;
        let report = h.sync.verify_state_consistency(task.id).await.unwrap();
        assert!(!report.consistent);
        assert!(report.message.contains("STOPPING"));
        assert!(report.message.contains("RUNNING"));

        h.sync.transition_to_stopped(&mut task, &mut exec).await.unwrap();
        assert!(h.sync.verify_state_consistency(task.id).await.unwrap().consistent);
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let h = Harness::new();
        let id = h.ids.generate_task_id();
        assert!(matches!(
            h.sync.verify_state_consistency(id).await,
            Err(SpindleError::TaskNotFound(_))
        ));
    }
}
