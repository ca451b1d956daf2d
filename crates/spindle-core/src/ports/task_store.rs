//! TaskStore port: the source of truth for tasks, executions, persisted
//! execution state and strategy events.
//!
//! # Write rules
//! - Task and execution *records* change only inside a `StoreTransaction`.
//!   A status transition and its outbound notification share one transaction,
//!   so a failed notification leaves nothing committed.
//! - Progress, log lines, events and the state blob are plain appends/upserts
//!   outside transactions; they never change a status.

use async_trait::async_trait;

use crate::domain::{
    Execution, ExecutionId, LogEntry, StoreError, StoredEvent, StrategyEvent, Task, TaskId,
    TaskStatus,
};

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert_task(&self, task: Task) -> Result<(), StoreError>;

    async fn get_task(&self, task_id: TaskId) -> Result<Option<Task>, StoreError>;

    async fn tasks_with_status(&self, status: TaskStatus) -> Result<Vec<Task>, StoreError>;

    /// Ordered by `execution_number`.
    async fn executions_for_task(&self, task_id: TaskId) -> Result<Vec<Execution>, StoreError>;

    async fn latest_execution(&self, task_id: TaskId) -> Result<Option<Execution>, StoreError>;

    async fn update_progress(
        &self,
        execution_id: ExecutionId,
        progress: f64,
    ) -> Result<(), StoreError>;

    async fn append_log(&self, execution_id: ExecutionId, entry: LogEntry)
    -> Result<(), StoreError>;

    /// Drop log lines of every execution of the task (records stay).
    async fn clear_execution_logs(&self, task_id: TaskId) -> Result<(), StoreError>;

    /// Returns the number of events stored.
    async fn append_events(
        &self,
        task_id: TaskId,
        execution_id: ExecutionId,
        events: Vec<StrategyEvent>,
    ) -> Result<usize, StoreError>;

    async fn events_for_task(&self, task_id: TaskId) -> Result<Vec<StoredEvent>, StoreError>;

    /// Returns the number of events removed.
    async fn delete_events(&self, task_id: TaskId) -> Result<usize, StoreError>;

    async fn save_execution_state(
        &self,
        task_id: TaskId,
        state: serde_json::Value,
    ) -> Result<(), StoreError>;

    async fn load_execution_state(
        &self,
        task_id: TaskId,
    ) -> Result<Option<serde_json::Value>, StoreError>;

    async fn clear_execution_state(&self, task_id: TaskId) -> Result<(), StoreError>;

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;
}

/// Unit of work over task and execution records.
///
/// Reads see the transaction's own staged writes. Dropping a transaction
/// without `commit` discards every staged write.
#[async_trait]
pub trait StoreTransaction: Send {
    async fn task(&mut self, task_id: TaskId) -> Result<Option<Task>, StoreError>;

    async fn execution(
        &mut self,
        execution_id: ExecutionId,
    ) -> Result<Option<Execution>, StoreError>;

    async fn latest_execution(&mut self, task_id: TaskId)
    -> Result<Option<Execution>, StoreError>;

    async fn put_task(&mut self, task: Task) -> Result<(), StoreError>;

    async fn put_execution(&mut self, execution: Execution) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}
