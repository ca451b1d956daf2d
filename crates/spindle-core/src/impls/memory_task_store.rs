//! InMemoryTaskStore - development `TaskStore`.
//!
//! # Transactions
//! `begin()` takes the store mutex as an `OwnedMutexGuard` and keeps it until
//! the transaction is committed or dropped, so transactions are serialized
//! with each other and with every other store call. Writes are staged in the
//! transaction and applied on `commit`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::domain::{
    Execution, ExecutionId, LogEntry, StoreError, StoredEvent, StrategyEvent, Task, TaskId,
    TaskStatus,
};
use crate::ports::{StoreTransaction, TaskStore};

#[derive(Default)]
struct StoreState {
    tasks: HashMap<TaskId, Task>,
    executions: HashMap<ExecutionId, Execution>,
    /// Insertion order per task.
    execution_ids: HashMap<TaskId, Vec<ExecutionId>>,
    events: HashMap<TaskId, Vec<StoredEvent>>,
    states: HashMap<TaskId, serde_json::Value>,
}

impl StoreState {
    fn executions_of(&self, task_id: TaskId) -> Vec<Execution> {
        let mut out: Vec<Execution> = self
            .execution_ids
            .get(&task_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.executions.get(id).cloned())
            .collect();
        out.sort_by_key(|e| e.execution_number);
        out
    }

    fn execution_mut(&mut self, execution_id: ExecutionId) -> Result<&mut Execution, StoreError> {
        self.executions
            .get_mut(&execution_id)
            .ok_or_else(|| StoreError::NotFound(execution_id.to_string()))
    }
}

#[derive(Default)]
pub struct InMemoryTaskStore {
    state: Arc<Mutex<StoreState>>,
    unavailable: AtomicBool,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `StoreError::Unavailable` (outage simulation).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert_task(&self, task: Task) -> Result<(), StoreError> {
        self.check()?;
        let mut state = self.state.lock().await;
        if state.tasks.contains_key(&task.id) {
            return Err(StoreError::DuplicateTask(task.id));
        }
        state.tasks.insert(task.id, task);
        Ok(())
    }

    async fn get_task(&self, task_id: TaskId) -> Result<Option<Task>, StoreError> {
        self.check()?;
        Ok(self.state.lock().await.tasks.get(&task_id).cloned())
    }

    async fn tasks_with_status(&self, status: TaskStatus) -> Result<Vec<Task>, StoreError> {
        self.check()?;
        let state = self.state.lock().await;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }

    async fn executions_for_task(&self, task_id: TaskId) -> Result<Vec<Execution>, StoreError> {
        self.check()?;
        Ok(self.state.lock().await.executions_of(task_id))
    }

    async fn latest_execution(&self, task_id: TaskId) -> Result<Option<Execution>, StoreError> {
        self.check()?;
        Ok(self.state.lock().await.executions_of(task_id).pop())
    }

    async fn update_progress(
        &self,
        execution_id: ExecutionId,
        progress: f64,
    ) -> Result<(), StoreError> {
        self.check()?;
        let mut state = self.state.lock().await;
        state.execution_mut(execution_id)?.progress = progress.clamp(0.0, 100.0);
        Ok(())
    }

    async fn append_log(
        &self,
        execution_id: ExecutionId,
        entry: LogEntry,
    ) -> Result<(), StoreError> {
        self.check()?;
        let mut state = self.state.lock().await;
        state.execution_mut(execution_id)?.log(entry);
        Ok(())
    }

    async fn clear_execution_logs(&self, task_id: TaskId) -> Result<(), StoreError> {
        self.check()?;
        let mut state = self.state.lock().await;
        let ids = state.execution_ids.get(&task_id).cloned().unwrap_or_default();
        for id in ids {
            if let Some(execution) = state.executions.get_mut(&id) {
                execution.logs.clear();
            }
        }
        Ok(())
    }

    async fn append_events(
        &self,
        task_id: TaskId,
        execution_id: ExecutionId,
        events: Vec<StrategyEvent>,
    ) -> Result<usize, StoreError> {
        self.check()?;
        let count = events.len();
        let mut state = self.state.lock().await;
        let stored = state.events.entry(task_id).or_default();
        let mut sequence = stored.last().map(|e| e.sequence).unwrap_or(0);
        for event in events {
            sequence += 1;
            stored.push(StoredEvent {
                task_id,
                execution_id,
                sequence,
                event,
            });
        }
        Ok(count)
    }

    async fn events_for_task(&self, task_id: TaskId) -> Result<Vec<StoredEvent>, StoreError> {
        self.check()?;
        let state = self.state.lock().await;
        Ok(state.events.get(&task_id).cloned().unwrap_or_default())
    }

    async fn delete_events(&self, task_id: TaskId) -> Result<usize, StoreError> {
        self.check()?;
        let mut state = self.state.lock().await;
        Ok(state.events.remove(&task_id).map(|v| v.len()).unwrap_or(0))
    }

    async fn save_execution_state(
        &self,
        task_id: TaskId,
        blob: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.check()?;
        self.state.lock().await.states.insert(task_id, blob);
        Ok(())
    }

    async fn load_execution_state(
        &self,
        task_id: TaskId,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        self.check()?;
        Ok(self.state.lock().await.states.get(&task_id).cloned())
    }

    async fn clear_execution_state(&self, task_id: TaskId) -> Result<(), StoreError> {
        self.check()?;
        self.state.lock().await.states.remove(&task_id);
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        self.check()?;
        let guard = Arc::clone(&self.state).lock_owned().await;
        Ok(Box::new(InMemoryTransaction {
            guard,
            staged_tasks: HashMap::new(),
            staged_executions: HashMap::new(),
        }))
    }
}

struct InMemoryTransaction {
    guard: OwnedMutexGuard<StoreState>,
    staged_tasks: HashMap<TaskId, Task>,
    staged_executions: HashMap<ExecutionId, Execution>,
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn task(&mut self, task_id: TaskId) -> Result<Option<Task>, StoreError> {
        Ok(self
            .staged_tasks
            .get(&task_id)
            .or_else(|| self.guard.tasks.get(&task_id))
            .cloned())
    }

    async fn execution(
        &mut self,
        execution_id: ExecutionId,
    ) -> Result<Option<Execution>, StoreError> {
        Ok(self
            .staged_executions
            .get(&execution_id)
            .or_else(|| self.guard.executions.get(&execution_id))
            .cloned())
    }

    async fn latest_execution(
        &mut self,
        task_id: TaskId,
    ) -> Result<Option<Execution>, StoreError> {
        let committed = self.guard.executions_of(task_id).into_iter().map(|e| {
            self.staged_executions
                .get(&e.id)
                .cloned()
                .unwrap_or(e)
        });
        let staged_new = self
            .staged_executions
            .values()
            .filter(|e| e.task_id == task_id && !self.guard.executions.contains_key(&e.id))
            .cloned();
        Ok(committed
            .chain(staged_new)
            .max_by_key(|e| e.execution_number))
    }

    async fn put_task(&mut self, task: Task) -> Result<(), StoreError> {
        self.staged_tasks.insert(task.id, task);
        Ok(())
    }

    async fn put_execution(&mut self, execution: Execution) -> Result<(), StoreError> {
        self.staged_executions.insert(execution.id, execution);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let InMemoryTransaction {
            mut guard,
            staged_tasks,
            staged_executions,
        } = *self;

        for (id, task) in staged_tasks {
            guard.tasks.insert(id, task);
        }
        for (id, execution) in staged_executions {
            if !guard.executions.contains_key(&id) {
                guard
                    .execution_ids
                    .entry(execution.task_id)
                    .or_default()
                    .push(id);
            }
            guard.executions.insert(id, execution);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskConfig, TaskKind};
    use chrono::Utc;
    use serde_json::json;
    use ulid::Ulid;

    fn task() -> Task {
        Task::new(
            TaskId::from_ulid(Ulid::new()),
            "bt",
            TaskKind::Backtest,
            TaskConfig::new("momentum", "EUR_USD", 1_000.0),
            3,
            Utc::now(),
        )
    }

    fn execution(task_id: TaskId, number: u32) -> Execution {
        Execution::new(ExecutionId::from_ulid(Ulid::new()), task_id, number, Utc::now())
    }

    #[tokio::test]
    async fn committed_transaction_is_visible() {
        let store = InMemoryTaskStore::new();
        let task = task();
        store.insert_task(task.clone()).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let mut updated = tx.task(task.id).await.unwrap().unwrap();
        updated.status = TaskStatus::Starting;
        tx.put_task(updated).await.unwrap();
        tx.put_execution(execution(task.id, 1)).await.unwrap();
        tx.commit().await.unwrap();

        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Starting);
        assert_eq!(store.executions_for_task(task.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let store = InMemoryTaskStore::new();
        let task = task();
        store.insert_task(task.clone()).await.unwrap();

        {
            let mut tx = store.begin().await.unwrap();
            let mut updated = task.clone();
            updated.status = TaskStatus::Starting;
            tx.put_task(updated).await.unwrap();
            tx.put_execution(execution(task.id, 1)).await.unwrap();
            // staged writes are visible inside the transaction
            assert_eq!(
                tx.task(task.id).await.unwrap().unwrap().status,
                TaskStatus::Starting
            );
        }

        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Created);
        assert!(store.latest_execution(task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn latest_execution_sees_staged_records() {
        let store = InMemoryTaskStore::new();
        let task = task();
        store.insert_task(task.clone()).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.put_execution(execution(task.id, 1)).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let second = execution(task.id, 2);
        tx.put_execution(second.clone()).await.unwrap();
        let latest = tx.latest_execution(task.id).await.unwrap().unwrap();
        assert_eq!(latest.id, second.id);
    }

    #[tokio::test]
    async fn events_are_sequenced_per_task() {
        let store = InMemoryTaskStore::new();
        let task = task();
        let exec = ExecutionId::from_ulid(Ulid::new());
        let ev = |k: &str| StrategyEvent::new(k, Utc::now(), json!(null));

        store
            .append_events(task.id, exec, vec![ev("a"), ev("b")])
            .await
            .unwrap();
        store.append_events(task.id, exec, vec![ev("c")]).await.unwrap();

        let events = store.events_for_task(task.id).await.unwrap();
        let seqs: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);

        assert_eq!(store.delete_events(task.id).await.unwrap(), 3);
        assert!(store.events_for_task(task.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn outage_fails_every_call() {
        let store = InMemoryTaskStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.tasks_with_status(TaskStatus::Running).await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_unavailable(false);
        assert!(store.tasks_with_status(TaskStatus::Running).await.is_ok());
    }
}
