//! Task record and its run configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::ValidationError;
use super::ids::{JobId, TaskId};
use super::kind::TaskKind;
use super::status::TaskStatus;

/// What to run: the strategy, the instrument whose ticks feed it, and the
/// opening balance. `parameters` is handed to the strategy untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub strategy: String,
    pub instrument: String,
    pub initial_balance: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub parameters: serde_json::Value,
}

impl TaskConfig {
    pub fn new(
        strategy: impl Into<String>,
        instrument: impl Into<String>,
        initial_balance: f64,
    ) -> Self {
        Self {
            strategy: strategy.into(),
            instrument: instrument.into(),
            initial_balance,
            start_time: None,
            end_time: None,
            parameters: serde_json::Value::Null,
        }
    }

    pub fn with_window(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self.end_time = Some(end);
        self
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.strategy.trim().is_empty() {
            return Err(ValidationError::InvalidConfig("strategy is required".into()));
        }
        if self.instrument.trim().is_empty() {
            return Err(ValidationError::InvalidConfig("instrument is required".into()));
        }
        if !self.initial_balance.is_finite() || self.initial_balance <= 0.0 {
            return Err(ValidationError::InvalidConfig(format!(
                "initial_balance must be positive, got {}",
                self.initial_balance
            )));
        }
        if let (Some(start), Some(end)) = (self.start_time, self.end_time)
            && start >= end
        {
            return Err(ValidationError::InvalidConfig(
                "start_time must be before end_time".into(),
            ));
        }
        Ok(())
    }
}

/// Durable task record.
///
/// Only `TaskService` (precondition-gated writes) and `StateSynchronizer`
/// (transitions) change `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub config: TaskConfig,

    /// Queue job currently dispatched for this task, if any.
    pub queue_job_id: Option<JobId>,

    pub retry_count: u32,
    pub max_retries: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub error_message: Option<String>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        id: TaskId,
        name: impl Into<String>,
        kind: TaskKind,
        config: TaskConfig,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            status: TaskStatus::Created,
            config,
            queue_job_id: None,
            retry_count: 0,
            max_retries,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            error_message: None,
            failed_at: None,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Back to CREATED for a fresh run: clears dispatch, timing and error
    /// fields and spends one retry.
    pub fn reset_for_restart(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Created;
        self.queue_job_id = None;
        self.started_at = None;
        self.completed_at = None;
        self.error_message = None;
        self.failed_at = None;
        self.retry_count += 1;
        self.updated_at = now;
    }

    /// Back to CREATED keeping history; only the dispatched job is forgotten.
    pub fn reset_for_resume(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Created;
        self.queue_job_id = None;
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use ulid::Ulid;

    fn sample_task() -> Task {
        let now = Utc::now();
        Task::new(
            TaskId::from_ulid(Ulid::new()),
            "eurusd-backtest",
            TaskKind::Backtest,
            TaskConfig::new("momentum", "EUR_USD", 10_000.0),
            3,
            now,
        )
    }

    #[test]
    fn new_task_is_created() {
        let task = sample_task();
        assert_eq!(task.status, TaskStatus::Created);
        assert_eq!(task.retry_count, 0);
        assert!(task.can_retry());
    }

    #[rstest]
    #[case::no_strategy(TaskConfig::new("", "EUR_USD", 1.0))]
    #[case::no_instrument(TaskConfig::new("momentum", " ", 1.0))]
    #[case::zero_balance(TaskConfig::new("momentum", "EUR_USD", 0.0))]
    #[case::nan_balance(TaskConfig::new("momentum", "EUR_USD", f64::NAN))]
    fn invalid_configs_are_rejected(#[case] config: TaskConfig) {
        assert!(matches!(
            config.validate(),
            Err(ValidationError::InvalidConfig(_))
        ));
    }

    #[test]
    fn inverted_window_is_rejected() {
        let start = Utc::now();
        let end = start - chrono::Duration::hours(1);
        let config = TaskConfig::new("momentum", "EUR_USD", 1.0).with_window(start, end);
        assert!(config.validate().is_err());
    }

    #[test]
    fn restart_clears_history_and_spends_a_retry() {
        let mut task = sample_task();
        task.status = TaskStatus::Failed;
        task.started_at = Some(Utc::now());
        task.completed_at = Some(Utc::now());
        task.error_message = Some("boom".into());

        task.reset_for_restart(Utc::now());

        assert_eq!(task.status, TaskStatus::Created);
        assert_eq!(task.retry_count, 1);
        assert!(task.started_at.is_none());
        assert!(task.completed_at.is_none());
        assert!(task.error_message.is_none());
    }

    #[test]
    fn resume_keeps_started_at() {
        let mut task = sample_task();
        let started = Utc::now();
        task.status = TaskStatus::Paused;
        task.started_at = Some(started);

        task.reset_for_resume(Utc::now());

        assert_eq!(task.status, TaskStatus::Created);
        assert_eq!(task.started_at, Some(started));
        assert_eq!(task.retry_count, 0);
    }
}
