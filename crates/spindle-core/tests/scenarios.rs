//! End-to-end lifecycle scenarios through the public engine API.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::json;
use tokio::sync::Semaphore;

use spindle_core::app::{ExecutionOutcome, StopMode, WorkerSettings};
use spindle_core::domain::{
    Execution, ExecutionState, StrategyError, StrategyEvent, Task, TaskConfig, TaskId, TaskKind,
    TaskStatus, Tick,
};
use spindle_core::impls::{
    InMemoryTickFeed, RecordingNotificationSink, synthetic_ticks,
};
use spindle_core::ports::{
    Clock, FixedClock, IdGenerator, Strategy, StrategyStep, TaskStore, UlidGenerator,
};
use spindle_core::{Engine, EngineBuilder, EngineConfig, SpindleError};

const INSTRUMENT: &str = "GBP_USD";
const KIND: TaskKind = TaskKind::Backtest;

/// Counts ticks, emits an event every 10th, fails on `fail_at` if set.
struct Tally {
    fail_at: Option<u64>,
}

fn tally(config: &TaskConfig) -> Result<Box<dyn Strategy>, StrategyError> {
    Ok(Box::new(Tally {
        fail_at: config.parameters["fail_at"].as_u64(),
    }))
}

impl Strategy for Tally {
    fn state_kind(&self) -> &'static str {
        "tally.v1"
    }

    fn initial_state(&self, _config: &TaskConfig) -> Result<serde_json::Value, StrategyError> {
        Ok(json!({ "seen": 0, "stopped": false }))
    }

    fn on_tick(&mut self, tick: &Tick, mut state: ExecutionState) -> Result<StrategyStep, StrategyError> {
        let seen = state.strategy_state["seen"].as_u64().unwrap_or(0) + 1;
        if self.fail_at == Some(seen) {
            return Err(StrategyError::Failed(format!("tally broke at tick {seen}")));
        }
        state.strategy_state["seen"] = json!(seen);
        let mut events = Vec::new();
        if seen % 10 == 0 {
            events.push(StrategyEvent::new("checkpoint", tick.timestamp, json!({ "seen": seen })));
        }
        Ok(StrategyStep::with_events(state, events))
    }

    fn on_stop(&mut self, mut state: ExecutionState) -> Result<StrategyStep, StrategyError> {
        state.strategy_state["stopped"] = json!(true);
        Ok(StrategyStep::unchanged(state))
    }
}

struct World {
    engine: Engine,
    clock: Arc<FixedClock>,
    sink: Arc<RecordingNotificationSink>,
    ids: Arc<UlidGenerator<Arc<FixedClock>>>,
}

fn world(ticks: usize, batch_size: usize, gate: Option<Arc<Semaphore>>) -> World {
    let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap()));
    let sink = Arc::new(RecordingNotificationSink::new());
    let ids = Arc::new(UlidGenerator::new(clock.clone()));

    let mut feed = InMemoryTickFeed::new().with_ticks(synthetic_ticks(
        INSTRUMENT,
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
        ticks,
        chrono::Duration::seconds(5),
        11,
    ));
    if let Some(gate) = gate {
        feed = feed.with_gate(gate);
    }

    let mut config = EngineConfig::default();
    config.executor.batch_size = batch_size;
    config.workers.concurrency = 2;
    config.workers.poll_timeout_ms = 20;

    let engine = EngineBuilder::new()
        .config(config)
        .clock(clock.clone())
        .tick_feed(Arc::new(feed))
        .notifier(sink.clone())
        .id_generator(ids.clone())
        .register_strategy("tally", tally)
        .unwrap()
        .expect_strategies(&["tally"])
        .build()
        .unwrap();

    World {
        engine,
        clock,
        sink,
        ids,
    }
}

impl World {
    async fn create(&self, parameters: serde_json::Value) -> Task {
        self.engine
            .service()
            .create_task(
                "gbpusd-backtest",
                KIND,
                TaskConfig::new("tally", INSTRUMENT, 25_000.0).with_parameters(parameters),
            )
            .await
            .unwrap()
    }

    async fn task(&self, id: TaskId) -> Task {
        self.engine.store().get_task(id).await.unwrap().unwrap()
    }

    async fn latest(&self, id: TaskId) -> Execution {
        self.engine.store().latest_execution(id).await.unwrap().unwrap()
    }

    async fn state(&self, id: TaskId) -> ExecutionState {
        let blob = self
            .engine
            .store()
            .load_execution_state(id)
            .await
            .unwrap()
            .unwrap();
        ExecutionState::from_json(blob).unwrap()
    }

    async fn wait_for_status(&self, id: TaskId, status: TaskStatus) {
        for _ in 0..2000 {
            if self.task(id).await.status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task never reached {status}");
    }

    async fn wait_for_ticks(&self, id: TaskId, n: u64) {
        for _ in 0..2000 {
            if let Some(blob) = self.engine.store().load_execution_state(id).await.unwrap()
                && ExecutionState::from_json(blob).unwrap().ticks_processed >= n
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task never processed {n} ticks");
    }
}

#[tokio::test]
async fn stale_lease_is_swept_and_task_failed() {
    let w = world(10, 5, None);
    let service = w.engine.service();
    let mut task = w.create(json!({})).await;
    service.start_task(task.id).await.unwrap();
    task = w.task(task.id).await;

    // an executor takes the lease, reaches RUNNING, then goes silent
    let e1 = w.ids.generate_execution_id();
    assert!(w.engine.locks().acquire_lock(KIND, task.id, e1).await.unwrap());
    let mut exec = Execution::new(e1, task.id, 1, w.clock.now());
    let mut tx = w.engine.store().begin().await.unwrap();
    tx.put_execution(exec.clone()).await.unwrap();
    tx.commit().await.unwrap();
    w.engine
        .synchronizer()
        .transition_to_running(&mut task, &mut exec)
        .await
        .unwrap();

    let threshold = w.engine.locks().stale_threshold();
    w.clock
        .advance(chrono::Duration::from_std(threshold).unwrap() + chrono::Duration::seconds(1));
    let report = w.engine.sweep().sweep().await;

    assert!(report.success);
    assert_eq!(report.cleaned, 1);
    assert_eq!(report.task_ids, vec![task.id]);
    assert!(!w.engine.locks().is_locked(KIND, task.id).await.unwrap());

    let task = w.task(task.id).await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error_message.unwrap().contains("stale lock"));
    let exec = w.latest(task.id).await;
    assert_eq!(exec.status, TaskStatus::Failed);
    assert!(exec.error_message.unwrap().contains("stale lock"));

    // nothing left to sweep
    let again = w.engine.sweep().sweep().await;
    assert!(again.success);
    assert_eq!(again.cleaned, 0);
}

#[tokio::test]
async fn start_dispatches_and_worker_reaches_running() {
    let gate = Arc::new(Semaphore::new(0));
    let w = world(40, 10, Some(gate.clone()));
    let background = w.engine.start();

    let task = w.create(json!({})).await;
    let started = w.engine.service().start_task(task.id).await.unwrap();
    assert_eq!(started.status, TaskStatus::Starting);

    w.wait_for_status(task.id, TaskStatus::Running).await;
    let exec = w.latest(task.id).await;
    assert_eq!(exec.status, TaskStatus::Running);
    assert_eq!(exec.progress, 0.0);

    gate.add_permits(4);
    w.wait_for_status(task.id, TaskStatus::Completed).await;
    assert_eq!(w.latest(task.id).await.progress, 100.0);
    assert_eq!(w.state(task.id).await.ticks_processed, 40);
    assert_eq!(w.engine.store().events_for_task(task.id).await.unwrap().len(), 4);
    assert!(w.engine.synchronizer().verify_state_consistency(task.id).await.unwrap().consistent);

    let statuses: Vec<TaskStatus> = w
        .sink
        .notifications()
        .into_iter()
        .filter(|n| n.task_id == task.id)
        .map(|n| n.status)
        .collect();
    assert_eq!(
        statuses,
        vec![TaskStatus::Starting, TaskStatus::Running, TaskStatus::Completed]
    );

    background.shutdown().await;
}

#[tokio::test]
async fn failure_in_third_batch_keeps_two_batches_of_progress() {
    let w = world(30, 10, None);
    let task = w.create(json!({ "fail_at": 25 })).await;
    w.engine.service().start_task(task.id).await.unwrap();

    let err = w.engine.executor().execute(KIND, task.id).await.unwrap_err();

    assert!(matches!(err, SpindleError::Execution(ref m) if m.contains("tick 25")));
    let state = w.state(task.id).await;
    assert_eq!(state.ticks_processed, 20);
    assert_eq!(state.strategy_state["seen"], 20);
    assert_eq!(state.strategy_state["stopped"], false);
    assert_eq!(w.task(task.id).await.status, TaskStatus::Failed);
    assert!(!w.engine.locks().is_locked(KIND, task.id).await.unwrap());
}

#[tokio::test]
async fn crash_after_second_batch_keeps_two_batches_of_progress() {
    let gate = Arc::new(Semaphore::new(0));
    let w = world(30, 10, Some(gate.clone()));
    let task = w.create(json!({})).await;
    w.engine.service().start_task(task.id).await.unwrap();

    let executor = Arc::clone(w.engine.executor());
    let run = tokio::spawn(async move { executor.execute(KIND, task.id).await });
    gate.add_permits(2);
    w.wait_for_ticks(task.id, 20).await;

    // the process dies while waiting for batch 3
    run.abort();
    assert!(run.await.unwrap_err().is_cancelled());

    let state = w.state(task.id).await;
    assert_eq!(state.ticks_processed, 20);
    assert_eq!(state.strategy_state["stopped"], false);
    assert_eq!(w.task(task.id).await.status, TaskStatus::Running);
}

#[tokio::test]
async fn graceful_stop_ends_stopped_never_completed() {
    let gate = Arc::new(Semaphore::new(0));
    let w = world(60, 10, Some(gate.clone()));
    let background = w.engine.start();

    let task = w.create(json!({})).await;
    w.engine.service().start_task(task.id).await.unwrap();
    gate.add_permits(2);
    w.wait_for_ticks(task.id, 20).await;

    let stopping = w
        .engine
        .service()
        .stop_task(task.id, StopMode::Graceful)
        .await
        .unwrap();
    assert_eq!(stopping.status, TaskStatus::Stopping);

    gate.add_permits(10);
    w.wait_for_status(task.id, TaskStatus::Stopped).await;

    let state = w.state(task.id).await;
    assert!(state.ticks_processed < 60);
    assert_eq!(state.ticks_processed % 10, 0);
    assert_eq!(state.strategy_state["stopped"], true);
    assert!(
        w.sink
            .notifications()
            .iter()
            .all(|n| n.status != TaskStatus::Completed)
    );
    assert_eq!(w.latest(task.id).await.status, TaskStatus::Stopped);

    background.shutdown().await;
}

#[tokio::test]
async fn pause_then_resume_finishes_from_saved_state() {
    let gate = Arc::new(Semaphore::new(0));
    let w = world(30, 10, Some(gate.clone()));
    let background = w.engine.start();
    let service = w.engine.service();

    let task = w.create(json!({})).await;
    service.start_task(task.id).await.unwrap();
    gate.add_permits(1);
    w.wait_for_ticks(task.id, 10).await;

    service.pause_task(task.id).await.unwrap();
    gate.add_permits(1);
    for _ in 0..2000 {
        if w.latest(task.id).await.status == TaskStatus::Paused {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(w.latest(task.id).await.status, TaskStatus::Paused);
    let paused_at = w.state(task.id).await.ticks_processed;
    assert!(paused_at == 10 || paused_at == 20);
    for _ in 0..2000 {
        if !w.engine.locks().is_locked(KIND, task.id).await.unwrap() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let resumed = service.resume_task(task.id).await.unwrap();
    assert_eq!(resumed.status, TaskStatus::Starting);
    gate.add_permits(10);
    w.wait_for_status(task.id, TaskStatus::Completed).await;

    let state = w.state(task.id).await;
    assert_eq!(state.ticks_processed, 30);
    assert_eq!(state.strategy_state["seen"], 30);
    let executions = w.engine.store().executions_for_task(task.id).await.unwrap();
    assert_eq!(executions.len(), 2);
    assert_eq!(w.task(task.id).await.retry_count, 0);

    background.shutdown().await;
}

#[test]
fn configured_time_limits_are_exposed_unchanged() {
    let config = EngineConfig::from_toml_str(
        r#"
        [limits]
        time_limit_secs = 259200
        soft_time_limit_secs = 255600
        "#,
    )
    .unwrap();
    assert_eq!(config.time_limit(), Duration::from_secs(72 * 3600));
    assert_eq!(config.soft_time_limit(), Duration::from_secs(71 * 3600));

    let settings = WorkerSettings::from_config(&config);
    assert_eq!(settings.time_limit, Duration::from_secs(259_200));
    assert_eq!(settings.soft_time_limit, Duration::from_secs(255_600));

    let engine = EngineBuilder::new()
        .config(config)
        .tick_feed(Arc::new(InMemoryTickFeed::new()))
        .build()
        .unwrap();
    assert_eq!(engine.config().limits.time_limit_secs, 259_200);
    assert_eq!(engine.config().limits.soft_time_limit_secs, 255_600);
}

#[tokio::test]
async fn second_executor_for_same_task_is_turned_away() {
    let gate = Arc::new(Semaphore::new(0));
    let w = world(20, 10, Some(gate.clone()));
    let task = w.create(json!({})).await;
    w.engine.service().start_task(task.id).await.unwrap();

    let executor = Arc::clone(w.engine.executor());
    let first = tokio::spawn(async move { executor.execute(KIND, task.id).await });
    w.wait_for_status(task.id, TaskStatus::Running).await;

    let second = w.engine.executor().execute(KIND, task.id).await.unwrap();
    assert_eq!(second, ExecutionOutcome::AlreadyRunning);
    assert_eq!(
        w.engine.store().executions_for_task(task.id).await.unwrap().len(),
        1
    );

    gate.add_permits(2);
    assert_eq!(first.await.unwrap().unwrap(), ExecutionOutcome::Completed);
}
