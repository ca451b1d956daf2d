//! Shared fixtures for unit tests: a fully wired in-memory engine on a fixed
//! clock, plus two small strategies.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use tokio::sync::Semaphore;

use crate::app::{
    Engine, EngineBuilder, RunningJobs, StaleLockSweep, StateSynchronizer, TaskExecutor,
    TaskLockManager, TaskService, WorkerPool,
};
use crate::config::EngineConfig;
use crate::domain::{
    Execution, ExecutionState, StrategyError, Task, TaskConfig, TaskId, TaskKind, TaskStatus, Tick,
};
use crate::impls::{
    InMemoryJobQueue, InMemoryLockStore, InMemoryTaskStore, InMemoryTickFeed,
    RecordingNotificationSink, synthetic_ticks,
};
use crate::ports::{
    Clock, FixedClock, IdGenerator, Strategy, StrategyStep, TaskStore, UlidGenerator,
};

pub(crate) const INSTRUMENT: &str = "EUR_USD";

/// Ticks `ticks` and sets `stopped` in its stop hook.
pub(crate) struct CountingStrategy;

impl CountingStrategy {
    pub(crate) fn factory(_config: &TaskConfig) -> Result<Box<dyn Strategy>, StrategyError> {
        Ok(Box::new(CountingStrategy))
    }
}

impl Strategy for CountingStrategy {
    fn state_kind(&self) -> &'static str {
        "counting.v1"
    }

    fn initial_state(&self, _config: &TaskConfig) -> Result<serde_json::Value, StrategyError> {
        Ok(json!({ "ticks": 0, "stopped": false }))
    }

    fn on_tick(&mut self, _tick: &Tick, mut state: ExecutionState) -> Result<StrategyStep, StrategyError> {
        let ticks = state.strategy_state["ticks"].as_u64().unwrap_or(0) + 1;
        state.strategy_state["ticks"] = json!(ticks);
        Ok(StrategyStep::unchanged(state))
    }

    fn on_stop(&mut self, mut state: ExecutionState) -> Result<StrategyStep, StrategyError> {
        state.strategy_state["stopped"] = json!(true);
        Ok(StrategyStep::unchanged(state))
    }
}

/// Fails on tick `parameters.fail_at` (default 25), counted over the whole
/// task.
pub(crate) struct FailingStrategy {
    fail_at: u64,
}

impl FailingStrategy {
    pub(crate) fn factory(config: &TaskConfig) -> Result<Box<dyn Strategy>, StrategyError> {
        let fail_at = config.parameters["fail_at"].as_u64().unwrap_or(25);
        Ok(Box::new(FailingStrategy { fail_at }))
    }
}

impl Strategy for FailingStrategy {
    fn state_kind(&self) -> &'static str {
        "failing.v1"
    }

    fn initial_state(&self, _config: &TaskConfig) -> Result<serde_json::Value, StrategyError> {
        Ok(json!({}))
    }

    fn on_tick(&mut self, _tick: &Tick, state: ExecutionState) -> Result<StrategyStep, StrategyError> {
        let n = state.ticks_processed + 1;
        if n == self.fail_at {
            return Err(StrategyError::Failed(format!("boom at tick {n}")));
        }
        Ok(StrategyStep::unchanged(state))
    }
}

pub(crate) fn tick_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap()
}

pub(crate) struct HarnessBuilder {
    ticks: usize,
    batch_size: usize,
    gate: Option<Arc<Semaphore>>,
}

impl HarnessBuilder {
    pub(crate) fn ticks(mut self, n: usize) -> Self {
        self.ticks = n;
        self
    }

    pub(crate) fn batch_size(mut self, n: usize) -> Self {
        self.batch_size = n;
        self
    }

    /// Every batch waits for one permit.
    pub(crate) fn gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub(crate) fn build(self) -> Harness {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap(),
        ));
        let store = Arc::new(InMemoryTaskStore::new());
        let lock_store = Arc::new(InMemoryLockStore::new(clock.clone()));
        let queue = Arc::new(InMemoryJobQueue::new());
        let sink = Arc::new(RecordingNotificationSink::new());
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(clock.clone()));

        let mut feed = InMemoryTickFeed::new().with_ticks(synthetic_ticks(
            INSTRUMENT,
            tick_start(),
            self.ticks,
            chrono::Duration::seconds(1),
            7,
        ));
        if let Some(gate) = self.gate {
            feed = feed.with_gate(gate);
        }
        let feed = Arc::new(feed);

        let mut config = EngineConfig::default();
        config.executor.batch_size = self.batch_size;

        let engine = EngineBuilder::new()
            .config(config.clone())
            .clock(clock.clone())
            .lock_store(lock_store.clone())
            .task_store(store.clone())
            .job_queue(queue.clone())
            .tick_feed(feed.clone())
            .notifier(sink.clone())
            .id_generator(Arc::clone(&ids))
            .register_strategy("counting", CountingStrategy::factory)
            .unwrap()
            .register_strategy("failing", FailingStrategy::factory)
            .unwrap()
            .build()
            .unwrap();

        Harness {
            clock,
            store,
            lock_store,
            queue,
            sink,
            feed,
            ids,
            config,
            locks: Arc::clone(engine.locks()),
            sync: Arc::clone(engine.synchronizer()),
            executor: Arc::clone(engine.executor()),
            service: Arc::clone(engine.service()),
            sweep: Arc::clone(engine.sweep()),
            running: Arc::clone(engine.running_jobs()),
            engine,
        }
    }
}

pub(crate) struct Harness {
    pub clock: Arc<FixedClock>,
    pub store: Arc<InMemoryTaskStore>,
    pub lock_store: Arc<InMemoryLockStore>,
    pub queue: Arc<InMemoryJobQueue>,
    pub sink: Arc<RecordingNotificationSink>,
    pub feed: Arc<InMemoryTickFeed>,
    pub ids: Arc<dyn IdGenerator>,
    pub config: EngineConfig,
    pub locks: Arc<TaskLockManager>,
    pub sync: Arc<StateSynchronizer>,
    pub executor: Arc<TaskExecutor>,
    pub service: Arc<TaskService>,
    pub sweep: Arc<StaleLockSweep>,
    pub running: Arc<RunningJobs>,
    pub engine: Engine,
}

impl Harness {
    pub(crate) fn new() -> Self {
        Self::builder().build()
    }

    pub(crate) fn builder() -> HarnessBuilder {
        HarnessBuilder {
            ticks: 20,
            batch_size: 10,
            gate: None,
        }
    }

    pub(crate) async fn seed_task(&self, status: TaskStatus) -> Task {
        self.seed_task_with(status, "counting").await
    }

    pub(crate) async fn seed_task_with(&self, status: TaskStatus, strategy: &str) -> Task {
        let mut task = Task::new(
            self.ids.generate_task_id(),
            "test-task",
            TaskKind::Backtest,
            TaskConfig::new(strategy, INSTRUMENT, 10_000.0),
            self.config.tasks.max_retries,
            self.clock.now(),
        );
        task.status = status;
        self.store.insert_task(task.clone()).await.unwrap();
        task
    }

    pub(crate) async fn starting_task(&self, strategy: &str) -> Task {
        self.seed_task_with(TaskStatus::Starting, strategy).await
    }

    pub(crate) async fn create_task(&self, strategy: &str) -> Task {
        self.service
            .create_task(
                "test-task",
                TaskKind::Backtest,
                TaskConfig::new(strategy, INSTRUMENT, 10_000.0),
            )
            .await
            .unwrap()
    }

    pub(crate) async fn put_task(&self, task: &Task) {
        let mut tx = self.store.begin().await.unwrap();
        tx.put_task(task.clone()).await.unwrap();
        tx.commit().await.unwrap();
    }

    pub(crate) async fn set_status(&self, task_id: TaskId, status: TaskStatus) {
        let mut task = self.task(task_id).await;
        task.status = status;
        self.put_task(&task).await;
    }

    /// Next execution for `task` with the given status.
    pub(crate) async fn seed_execution(&self, task: &Task, status: TaskStatus) -> Execution {
        let mut tx = self.store.begin().await.unwrap();
        let number = tx
            .latest_execution(task.id)
            .await
            .unwrap()
            .map_or(1, |e| e.execution_number + 1);
        let now = self.clock.now();
        let mut execution = Execution::new(self.ids.generate_execution_id(), task.id, number, now);
        execution.status = status;
        if status != TaskStatus::Starting {
            execution.started_at = Some(now);
        }
        if status.is_terminal() {
            execution.completed_at = Some(now);
        }
        tx.put_execution(execution.clone()).await.unwrap();
        tx.commit().await.unwrap();
        execution
    }

    pub(crate) async fn task(&self, task_id: TaskId) -> Task {
        self.store.get_task(task_id).await.unwrap().unwrap()
    }

    pub(crate) async fn latest_execution(&self, task_id: TaskId) -> Execution {
        self.store.latest_execution(task_id).await.unwrap().unwrap()
    }

    pub(crate) async fn state(&self, task_id: TaskId) -> ExecutionState {
        let blob = self
            .store
            .load_execution_state(task_id)
            .await
            .unwrap()
            .unwrap();
        ExecutionState::from_json(blob).unwrap()
    }

    pub(crate) fn spawn_workers(&self) -> WorkerPool {
        self.engine.spawn_workers()
    }

    pub(crate) async fn wait_for_ticks(&self, task_id: TaskId, n: u64) {
        for _ in 0..2000 {
            if let Some(blob) = self.store.load_execution_state(task_id).await.unwrap()
                && ExecutionState::from_json(blob).unwrap().ticks_processed >= n
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task {task_id} never reached {n} ticks");
    }

    pub(crate) async fn wait_for_status(&self, task_id: TaskId, status: TaskStatus) {
        for _ in 0..2000 {
            if self.task(task_id).await.status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "task {task_id} never reached {status} (now {})",
            self.task(task_id).await.status
        );
    }

    pub(crate) async fn wait_for_unlocked(&self, task_id: TaskId) {
        for _ in 0..2000 {
            if !self.locks.is_locked(TaskKind::Backtest, task_id).await.unwrap() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task {task_id} still leased");
    }
}
