//! JobQueue port: carries "run this task" requests to the worker pool.
//!
//! A job holds ids only; everything else is read from the `TaskStore` when
//! the executor starts.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{JobId, QueueError, TaskId, TaskKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: TaskKind,
    pub task_id: TaskId,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn push(&self, job: Job) -> Result<(), QueueError>;

    /// Wait up to `timeout` for a job.
    async fn pop(&self, timeout: Duration) -> Result<Option<Job>, QueueError>;

    /// Remove a job that no worker has taken yet. Returns whether it was
    /// still queued.
    async fn revoke(&self, job_id: JobId) -> Result<bool, QueueError>;

    async fn len(&self) -> Result<usize, QueueError>;
}
