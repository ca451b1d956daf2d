//! Execution record: one run attempt of a task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ExecutionId, TaskId};
use super::status::TaskStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    pub fn info(timestamp: DateTime<Utc>, message: impl Into<String>) -> Self {
        Self {
            timestamp,
            level: LogLevel::Info,
            message: message.into(),
        }
    }

    pub fn warn(timestamp: DateTime<Utc>, message: impl Into<String>) -> Self {
        Self {
            timestamp,
            level: LogLevel::Warn,
            message: message.into(),
        }
    }

    pub fn error(timestamp: DateTime<Utc>, message: impl Into<String>) -> Self {
        Self {
            timestamp,
            level: LogLevel::Error,
            message: message.into(),
        }
    }
}

/// Invariant: at most one execution per task has a non-terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub task_id: TaskId,

    /// 1-based, strictly increasing per task.
    pub execution_number: u32,

    pub status: TaskStatus,

    /// 0..=100
    pub progress: f64,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,

    #[serde(default)]
    pub logs: Vec<LogEntry>,
}

impl Execution {
    pub fn new(
        id: ExecutionId,
        task_id: TaskId,
        execution_number: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            task_id,
            execution_number,
            status: TaskStatus::Starting,
            progress: 0.0,
            created_at: now,
            started_at: None,
            completed_at: None,
            error_message: None,
            logs: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn log(&mut self, entry: LogEntry) {
        self.logs.push(entry);
    }
}
