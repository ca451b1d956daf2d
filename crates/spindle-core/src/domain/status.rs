//! Task / execution status and the allowed transitions between them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status shared by tasks and their executions.
///
/// ```text
/// CREATED -> STARTING -> RUNNING -> COMPLETED
///                 |         |  \-> PAUSED -> (resume) CREATED
///                 |         \----> STOPPING -> STOPPED
///                 \--------------> STOPPED / FAILED
/// COMPLETED | FAILED | STOPPED -> (restart) CREATED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Created,
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
    Completed,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 8] = [
        TaskStatus::Created,
        TaskStatus::Starting,
        TaskStatus::Running,
        TaskStatus::Paused,
        TaskStatus::Stopping,
        TaskStatus::Stopped,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    /// No executor will touch the task again until it is restarted.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Stopped | TaskStatus::Completed | TaskStatus::Failed
        )
    }

    /// States in which a stop/cancel command is accepted.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            TaskStatus::Starting | TaskStatus::Running | TaskStatus::Paused
        )
    }

    /// Whether the state machine admits `self -> next`.
    ///
    /// PAUSED -> PAUSED is allowed: the service records the pause on the task
    /// first and the executor acknowledges it on the execution afterwards.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Created, Starting) => true,
            (Starting, Running | Stopping | Stopped | Failed) => true,
            (Running, Paused | Stopping | Stopped | Completed | Failed) => true,
            (Paused, Paused | Stopping | Stopped | Created | Failed) => true,
            (Stopping, Stopped | Failed) => true,
            (Stopped | Completed | Failed, Created) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Created => "CREATED",
            TaskStatus::Starting => "STARTING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Paused => "PAUSED",
            TaskStatus::Stopping => "STOPPING",
            TaskStatus::Stopped => "STOPPED",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
