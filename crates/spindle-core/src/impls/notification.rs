//! Notification sinks.
//!
//! - `TracingNotificationSink`: logs each notification
//! - `BroadcastNotificationSink`: in-process fan-out over `tokio::sync::broadcast`
//! - `RecordingNotificationSink`: keeps every notification; can be told to fail

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::domain::{NotificationError, StatusNotification};
use crate::ports::NotificationSink;

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotificationSink;

#[async_trait]
impl NotificationSink for TracingNotificationSink {
    async fn publish(&self, n: &StatusNotification) -> Result<(), NotificationError> {
        tracing::info!(
            task_id = %n.task_id,
            task_name = %n.task_name,
            kind = %n.task_kind,
            status = %n.status,
            execution_id = ?n.execution_id.map(|id| id.to_string()),
            error = ?n.error_message,
            "task status changed"
        );
        Ok(())
    }
}

pub struct BroadcastNotificationSink {
    tx: broadcast::Sender<StatusNotification>,
}

impl BroadcastNotificationSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusNotification> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl NotificationSink for BroadcastNotificationSink {
    async fn publish(&self, n: &StatusNotification) -> Result<(), NotificationError> {
        // No subscriber is not a delivery failure: nobody is listening.
        let _ = self.tx.send(n.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotificationSink {
    seen: Mutex<Vec<StatusNotification>>,
    fail_next: AtomicUsize,
}

impl RecordingNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `n` publishes.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn notifications(&self) -> Vec<StatusNotification> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<StatusNotification>> {
        self.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl NotificationSink for RecordingNotificationSink {
    async fn publish(&self, n: &StatusNotification) -> Result<(), NotificationError> {
        let should_fail = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(NotificationError::Unavailable("injected failure".into()));
        }
        self.lock().push(n.clone());
        Ok(())
    }
}
