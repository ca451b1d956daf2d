use async_trait::async_trait;

use crate::domain::{NotificationError, StatusNotification};

/// Receives every status change. For synchronizer transitions an `Err` aborts
/// the transition, so implementations should return only once delivery is
/// settled.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, notification: &StatusNotification) -> Result<(), NotificationError>;
}
