//! InMemoryJobQueue - development `JobQueue`.
//!
//! `tokio::sync::Mutex` guards the FIFO, `Notify` wakes a waiting `pop` on
//! `push`. The lock is never held across an await on `Notify`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::domain::{JobId, QueueError};
use crate::ports::{Job, JobQueue};

#[derive(Default)]
pub struct InMemoryJobQueue {
    ready: Mutex<VecDeque<Job>>,
    notify: Arc<Notify>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn push(&self, job: Job) -> Result<(), QueueError> {
        self.ready.lock().await.push_back(job);
        self.notify.notify_one();
        Ok(())
    }

    async fn pop(&self, timeout: Duration) -> Result<Option<Job>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before checking, so a push between the check
            // and the await is not lost.
            let notified = self.notify.notified();
            if let Some(job) = self.ready.lock().await.pop_front() {
                return Ok(Some(job));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn revoke(&self, job_id: JobId) -> Result<bool, QueueError> {
        let mut ready = self.ready.lock().await;
        let before = ready.len();
        ready.retain(|job| job.id != job_id);
        Ok(ready.len() != before)
    }

    async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.ready.lock().await.len())
    }
}
