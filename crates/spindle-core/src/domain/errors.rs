//! Error taxonomy.
//!
//! - `ValidationError`: a rejected command; surfaced to the caller, never retried.
//! - `SpindleError::Execution`: strategy or persistence failure inside a run.
//! - `SpindleError::NotificationDelivery`: aborts the enclosing transition.
//!
//! A denied lease is not an error (`ExecutionOutcome::AlreadyRunning`), and a
//! stale lease is a sweep result.

use thiserror::Error;

use super::ids::{ExecutionId, TaskId};
use super::kind::TaskKind;
use super::status::TaskStatus;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("task must be in {expected} status (current: {actual})")]
    InvalidStatus { expected: String, actual: TaskStatus },

    #[error("retry limit exceeded ({retry_count}/{max_retries})")]
    RetryLimitExceeded { retry_count: u32, max_retries: u32 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("task kind mismatch: expected {expected}, got {actual}")]
    KindMismatch { expected: TaskKind, actual: TaskKind },

    #[error("task {0} still holds a lease; wait for the running executor to exit")]
    LeaseStillHeld(TaskId),
}

impl ValidationError {
    pub fn invalid_status(expected: impl Into<String>, actual: TaskStatus) -> Self {
        ValidationError::InvalidStatus {
            expected: expected.into(),
            actual,
        }
    }
}

#[derive(Debug, Error)]
pub enum LockStoreError {
    #[error("lock store unavailable: {0}")]
    Unavailable(String),

    #[error("malformed lock store value at {key}: {reason}")]
    Malformed { key: String, reason: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task store unavailable: {0}")]
    Unavailable(String),

    #[error("task {0} already exists")]
    DuplicateTask(TaskId),

    #[error("record not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue operation failed: {0}")]
    OperationFailed(String),
}

#[derive(Debug, Error)]
pub enum TickSourceError {
    #[error("tick source unavailable: {0}")]
    Unavailable(String),

    #[error("tick data malformed: {0}")]
    Malformed(String),

    #[error("tick source already closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("strategy state invalid: {0}")]
    InvalidState(String),

    #[error("strategy failed: {0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("notification sink rejected message: {0}")]
    Rejected(String),

    #[error("notification sink unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum SpindleError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("status notification not delivered: {0}")]
    NotificationDelivery(String),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("execution not found: {0}")]
    ExecutionNotFound(ExecutionId),

    #[error(transparent)]
    LockStore(#[from] LockStoreError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    TickSource(#[from] TickSourceError),

    #[error(transparent)]
    Strategy(#[from] StrategyError),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("strategy not registered: {0}")]
    UnknownStrategy(String),

    #[error("duplicate strategy: {0}")]
    DuplicateStrategy(String),
}

impl SpindleError {
    pub fn is_validation(&self) -> bool {
        matches!(self, SpindleError::Validation(_))
    }
}

impl From<NotificationError> for SpindleError {
    fn from(err: NotificationError) -> Self {
        SpindleError::NotificationDelivery(err.to_string())
    }
}

pub type Result<T, E = SpindleError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_status_names_the_precondition() {
        let err = ValidationError::invalid_status("CREATED", TaskStatus::Running);
        assert_eq!(
            err.to_string(),
            "task must be in CREATED status (current: RUNNING)"
        );
    }

    #[test]
    fn retry_limit_message() {
        let err: SpindleError = ValidationError::RetryLimitExceeded {
            retry_count: 3,
            max_retries: 3,
        }
        .into();
        assert!(err.is_validation());
        assert!(err.to_string().starts_with("retry limit exceeded"));
    }

    #[test]
    fn notification_errors_become_delivery_failures() {
        let err: SpindleError = NotificationError::Unavailable("broker down".into()).into();
        assert!(matches!(err, SpindleError::NotificationDelivery(_)));
    }
}
