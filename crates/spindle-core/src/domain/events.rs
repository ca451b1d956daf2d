//! Strategy-emitted events and outbound status notifications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ExecutionId, TaskId};
use super::kind::TaskKind;
use super::status::TaskStatus;

/// Something a strategy reported while handling a hook (order intent, signal,
/// layer opened, ...). The engine stores it without interpreting `payload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyEvent {
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl StrategyEvent {
    pub fn new(kind: impl Into<String>, timestamp: DateTime<Utc>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            timestamp,
            payload,
        }
    }
}

/// A strategy event as persisted against a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub task_id: TaskId,
    pub execution_id: ExecutionId,
    /// Per-task, starts at 1.
    pub sequence: u64,
    pub event: StrategyEvent,
}

/// Status-change message handed to the notification sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusNotification {
    pub task_id: TaskId,
    pub task_name: String,
    pub task_kind: TaskKind,
    pub status: TaskStatus,
    pub execution_id: Option<ExecutionId>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}
