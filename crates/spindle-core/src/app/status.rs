//! Status views over tasks.

use serde::{Deserialize, Serialize};

use crate::app::synchronizer::ConsistencyReport;
use crate::domain::{Execution, Task, TaskStatus};

/// Number of tasks in each status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub created: usize,
    pub starting: usize,
    pub running: usize,
    pub paused: usize,
    pub stopping: usize,
    pub stopped: usize,
    pub completed: usize,
    pub failed: usize,
}

impl TaskCounts {
    pub fn get(&self, status: TaskStatus) -> usize {
        match status {
            TaskStatus::Created => self.created,
            TaskStatus::Starting => self.starting,
            TaskStatus::Running => self.running,
            TaskStatus::Paused => self.paused,
            TaskStatus::Stopping => self.stopping,
            TaskStatus::Stopped => self.stopped,
            TaskStatus::Completed => self.completed,
            TaskStatus::Failed => self.failed,
        }
    }

    pub fn set(&mut self, status: TaskStatus, n: usize) {
        let slot = match status {
            TaskStatus::Created => &mut self.created,
            TaskStatus::Starting => &mut self.starting,
            TaskStatus::Running => &mut self.running,
            TaskStatus::Paused => &mut self.paused,
            TaskStatus::Stopping => &mut self.stopping,
            TaskStatus::Stopped => &mut self.stopped,
            TaskStatus::Completed => &mut self.completed,
            TaskStatus::Failed => &mut self.failed,
        };
        *slot = n;
    }

    pub fn total(&self) -> usize {
        TaskStatus::ALL.iter().map(|s| self.get(*s)).sum()
    }

    /// Tasks an executor may still be working on.
    pub fn in_flight(&self) -> usize {
        self.starting + self.running + self.stopping
    }
}

/// One task with its latest execution and whether the two agree.
#[derive(Debug, Clone)]
pub struct TaskStatusView {
    pub task: Task,
    pub latest_execution: Option<Execution>,
    pub consistency: ConsistencyReport,
}
