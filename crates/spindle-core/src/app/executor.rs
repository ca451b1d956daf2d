//! TaskExecutor - the resumable execution loop.
//!
//! ```text
//! acquire lease ─ denied ─> AlreadyRunning (task untouched)
//!      │
//! admission: STARTING runs, STOPPING is finalized, anything else is skipped
//!      │
//! new Execution ─> RUNNING ─> load/fresh state ─> on_start ─> open source
//!      │
//! per batch: signal? ─> on_tick* ─> counters/equity ─> still leased? ─> persist ─> heartbeat
//!      │
//! on_stop (exhausted or graceful stop) ─> close source ─> terminal transition
//!      │
//! release lease (every path, also on drop)
//! ```
//!
//! The cancellation signal is read only between batches; a batch is never
//! interrupted. Any error after the execution record exists fails the run
//! through the synchronizer and is returned as `SpindleError::Execution`.
//!
//! An executor that finds its lease swept or taken over writes nothing more
//! and ends `Superseded`.

use std::sync::Arc;
use std::time::Duration;

use crate::app::lock_manager::{CancelSignal, LeaseGuard, StopMode, TaskLockManager};
use crate::app::registry::StrategyRegistry;
use crate::app::synchronizer::StateSynchronizer;
use crate::config::EngineConfig;
use crate::domain::{
    Execution, ExecutionId, ExecutionState, LogEntry, Result, SpindleError, StrategyEvent, Task,
    TaskId, TaskKind, TaskStatus, ValidationError,
};
use crate::ports::{
    Clock, IdGenerator, Strategy, StrategyStep, TaskStore, TickDataSource, TickFeed, TickRequest,
};

/// How a run ended, when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Another executor holds the lease.
    AlreadyRunning,
    /// The task was not STARTING; nothing was done.
    Skipped(TaskStatus),
    Completed,
    Stopped,
    Paused,
    /// The task reached a terminal status behind the executor's back
    /// (cancelled, swept), or the lease was lost; the executor committed
    /// nothing. Carries the task status seen at that point.
    Superseded(TaskStatus),
}

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub batch_size: usize,
    pub heartbeat_every_batches: u64,
    pub heartbeat_interval: Duration,
}

impl ExecutorSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            batch_size: config.executor.batch_size,
            heartbeat_every_batches: config.lock.heartbeat_every_batches.max(1),
            heartbeat_interval: config.heartbeat_interval(),
        }
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopEnd {
    Exhausted,
    Signal(CancelSignal),
    LeaseLost,
}

impl LoopEnd {
    /// Whether the strategy stop hook runs.
    fn drains(self) -> bool {
        matches!(
            self,
            LoopEnd::Exhausted | LoopEnd::Signal(CancelSignal::Stop(StopMode::Graceful))
        )
    }
}

pub struct TaskExecutor {
    store: Arc<dyn TaskStore>,
    locks: Arc<TaskLockManager>,
    sync: Arc<StateSynchronizer>,
    strategies: Arc<StrategyRegistry>,
    feed: Arc<dyn TickFeed>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    settings: ExecutorSettings,
}

impl TaskExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn TaskStore>,
        locks: Arc<TaskLockManager>,
        sync: Arc<StateSynchronizer>,
        strategies: Arc<StrategyRegistry>,
        feed: Arc<dyn TickFeed>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            store,
            locks,
            sync,
            strategies,
            feed,
            ids,
            clock,
            settings,
        }
    }

    pub async fn execute(&self, kind: TaskKind, task_id: TaskId) -> Result<ExecutionOutcome> {
        let execution_id = self.ids.generate_execution_id();
        let Some(guard) = self
            .locks
            .acquire_guard(kind, task_id, execution_id)
            .await?
        else {
            tracing::info!(%task_id, %kind, "task already running; executor exits");
            return Ok(ExecutionOutcome::AlreadyRunning);
        };

        let result = self.run_leased(kind, task_id, &guard).await;

        if let Err(e) = guard.release().await {
            tracing::warn!(%task_id, %kind, error = %e, "lease release failed; it will expire");
        }
        result
    }

    async fn run_leased(
        &self,
        kind: TaskKind,
        task_id: TaskId,
        guard: &LeaseGuard,
    ) -> Result<ExecutionOutcome> {
        let mut task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(SpindleError::TaskNotFound(task_id))?;
        if task.kind != kind {
            return Err(ValidationError::KindMismatch {
                expected: task.kind,
                actual: kind,
            }
            .into());
        }

        match task.status {
            TaskStatus::Starting => {}
            TaskStatus::Stopping => {
                // stopped before any executor picked it up
                let mut execution = self.open_execution(&task, guard.execution_id()).await?;
                self.sync
                    .transition_to_stopped(&mut task, &mut execution)
                    .await?;
                return Ok(ExecutionOutcome::Stopped);
            }
            other => {
                tracing::info!(%task_id, status = %other, "task not startable; skipping");
                return Ok(ExecutionOutcome::Skipped(other));
            }
        }

        let mut execution = self.open_execution(&task, guard.execution_id()).await?;

        let result = match self.sync.transition_to_running(&mut task, &mut execution).await {
            Ok(()) => match self.drive(&mut task, &mut execution, guard).await {
                Ok(end) => self.finalize(&mut task, &mut execution, end).await,
                Err(e) => Err(e),
            },
            Err(e) => self.refused_running(&mut task, &mut execution, e).await,
        };
        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                let message = match e {
                    SpindleError::Execution(message) => message,
                    other => other.to_string(),
                };
                self.fail(&mut task, &mut execution, guard, &message).await;
                Err(SpindleError::Execution(message))
            }
        }
    }

    /// RUNNING was refused after admission: a stop or cancel landed in
    /// between. A stop is honoured as STOPPED; anything else is an error.
    async fn refused_running(
        &self,
        task: &mut Task,
        execution: &mut Execution,
        error: SpindleError,
    ) -> Result<ExecutionOutcome> {
        let current = self
            .store
            .get_task(task.id)
            .await?
            .ok_or(SpindleError::TaskNotFound(task.id))?;
        match current.status {
            TaskStatus::Stopping => {
                tracing::info!(task_id = %task.id, "stop requested before RUNNING; stopping");
                *task = current;
                self.sync.transition_to_stopped(task, execution).await?;
                Ok(ExecutionOutcome::Stopped)
            }
            status if status.is_terminal() => {
                tracing::info!(task_id = %task.id, %status, "task finished before RUNNING; committing nothing");
                Ok(ExecutionOutcome::Superseded(status))
            }
            _ => Err(error),
        }
    }

    /// Insert the next execution record. A still-open predecessor (a paused
    /// run being resumed) is closed as STOPPED in the same transaction.
    async fn open_execution(&self, task: &Task, execution_id: ExecutionId) -> Result<Execution> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;

        let previous = tx.latest_execution(task.id).await?;
        let number = previous.as_ref().map_or(1, |e| e.execution_number + 1);
        if let Some(mut previous) = previous
            && !previous.is_terminal()
        {
            previous.status = TaskStatus::Stopped;
            previous.completed_at.get_or_insert(now);
            previous.log(LogEntry::info(
                now,
                format!("superseded by execution #{number}"),
            ));
            tx.put_execution(previous).await?;
        }

        let execution = Execution::new(execution_id, task.id, number, now);
        tx.put_execution(execution.clone()).await?;
        tx.commit().await?;

        tracing::debug!(task_id = %task.id, %execution_id, number, "execution opened");
        Ok(execution)
    }

    async fn drive(
        &self,
        task: &mut Task,
        execution: &mut Execution,
        guard: &LeaseGuard,
    ) -> Result<LoopEnd> {
        let mut strategy = self.strategies.create(&task.config)?;
        let state = self.load_state(task, execution, strategy.as_mut()).await?;

        let step = strategy.on_start(state)?;
        if !guard.is_held().await {
            return Ok(LoopEnd::LeaseLost);
        }
        let state = self.persist(task, execution, step, None).await?;

        let request = TickRequest {
            instrument: task.config.instrument.clone(),
            start: task.config.start_time,
            end: task.config.end_time,
            batch_size: self.settings.batch_size,
            resume_skip: state.ticks_processed,
        };
        let mut source = self.feed.open(&request).await?;

        let result = self
            .consume(task, execution, guard, strategy.as_mut(), state, source.as_mut())
            .await;

        if let Err(e) = source.close().await {
            tracing::warn!(task_id = %task.id, error = %e, "tick source close failed");
            let entry = LogEntry::warn(self.clock.now(), format!("tick source close failed: {e}"));
            let _ = self.store.append_log(execution.id, entry).await;
        }
        result
    }

    async fn load_state(
        &self,
        task: &Task,
        execution: &Execution,
        strategy: &mut dyn Strategy,
    ) -> Result<ExecutionState> {
        match self.store.load_execution_state(task.id).await? {
            Some(blob) => {
                let mut state = ExecutionState::from_json(blob)?;
                state.strategy_state = strategy.deserialize_state(state.strategy_state)?;
                tracing::info!(
                    task_id = %task.id,
                    state_kind = strategy.state_kind(),
                    ticks_processed = state.ticks_processed,
                    "resuming from persisted state"
                );
                let entry = LogEntry::info(
                    self.clock.now(),
                    format!("resumed after {} ticks", state.ticks_processed),
                );
                self.store.append_log(execution.id, entry).await?;
                Ok(state)
            }
            None => {
                let strategy_state = strategy.initial_state(&task.config)?;
                tracing::info!(
                    task_id = %task.id,
                    state_kind = strategy.state_kind(),
                    "starting from fresh state"
                );
                Ok(ExecutionState::fresh(task.config.initial_balance, strategy_state))
            }
        }
    }

    async fn consume(
        &self,
        task: &Task,
        execution: &Execution,
        guard: &LeaseGuard,
        strategy: &mut dyn Strategy,
        mut state: ExecutionState,
        source: &mut dyn TickDataSource,
    ) -> Result<LoopEnd> {
        let total = source.estimated_total();
        let mut batches: u64 = 0;
        let mut last_beat = self.clock.now();

        let end = loop {
            if let Some(signal) = guard.cancellation_signal().await {
                tracing::info!(task_id = %task.id, ?signal, batches, "signal observed at batch boundary");
                break LoopEnd::Signal(signal);
            }
            let Some(batch) = source.next_batch().await? else {
                break LoopEnd::Exhausted;
            };

            let mut events: Vec<StrategyEvent> = Vec::new();
            for tick in &batch.ticks {
                let step = strategy.on_tick(tick, state)?;
                state = step.state;
                events.extend(step.events);
                state.ticks_processed += 1;
                state.last_tick_timestamp = Some(tick.timestamp);
            }
            if let Some(ts) = batch.last_timestamp() {
                state.record_equity(ts);
            }
            if !guard.is_held().await {
                break LoopEnd::LeaseLost;
            }
            state = self
                .persist(task, execution, StrategyStep::with_events(state, events), total)
                .await?;
            batches += 1;
            tracing::debug!(
                task_id = %task.id,
                batch = batches,
                ticks_processed = state.ticks_processed,
                "batch persisted"
            );

            let now = self.clock.now();
            let interval_elapsed = (now - last_beat)
                .to_std()
                .is_ok_and(|age| age >= self.settings.heartbeat_interval);
            if batches % self.settings.heartbeat_every_batches == 0 || interval_elapsed {
                if !guard.heartbeat().await && !guard.is_held().await {
                    break LoopEnd::LeaseLost;
                }
                last_beat = now;
            }
        };

        if end == LoopEnd::LeaseLost {
            tracing::warn!(
                task_id = %task.id,
                execution_id = %execution.id,
                batches,
                "lease lost; abandoning run without writing"
            );
            return Ok(end);
        }
        if end.drains() {
            let step = strategy.on_stop(state)?;
            if !guard.is_held().await {
                return Ok(LoopEnd::LeaseLost);
            }
            self.persist(task, execution, step, total).await?;
        } else {
            let message = match end {
                LoopEnd::Signal(CancelSignal::Pause) => "pause requested; state kept for resume",
                _ => "immediate stop requested; stop hook skipped",
            };
            self.store
                .append_log(execution.id, LogEntry::info(self.clock.now(), message))
                .await?;
        }
        Ok(end)
    }

    /// Store events, state and progress. Returns the state for the next step.
    async fn persist(
        &self,
        task: &Task,
        execution: &Execution,
        step: StrategyStep,
        total: Option<u64>,
    ) -> Result<ExecutionState> {
        let StrategyStep { state, events } = step;
        if !events.is_empty() {
            self.store
                .append_events(task.id, execution.id, events)
                .await?;
        }
        self.store
            .save_execution_state(task.id, state.to_json()?)
            .await?;
        if let Some(total) = total
            && total > 0
        {
            let progress = (state.ticks_processed as f64 / total as f64 * 100.0).min(99.0);
            self.store.update_progress(execution.id, progress).await?;
        }
        Ok(state)
    }

    async fn finalize(
        &self,
        task: &mut Task,
        execution: &mut Execution,
        end: LoopEnd,
    ) -> Result<ExecutionOutcome> {
        let current = self
            .store
            .get_task(task.id)
            .await?
            .ok_or(SpindleError::TaskNotFound(task.id))?;
        if end == LoopEnd::LeaseLost {
            return Ok(ExecutionOutcome::Superseded(current.status));
        }
        if current.status.is_terminal() {
            tracing::info!(
                task_id = %task.id,
                status = %current.status,
                "task finished elsewhere; committing nothing"
            );
            return Ok(ExecutionOutcome::Superseded(current.status));
        }
        *task = current;

        let outcome = match (task.status, end) {
            (TaskStatus::Stopping, _) | (_, LoopEnd::Signal(CancelSignal::Stop(_))) => {
                self.sync.transition_to_stopped(task, execution).await?;
                ExecutionOutcome::Stopped
            }
            (TaskStatus::Paused, _) | (_, LoopEnd::Signal(CancelSignal::Pause)) => {
                self.sync.transition_to_paused(task, execution).await?;
                ExecutionOutcome::Paused
            }
            (_, LoopEnd::Exhausted) => {
                self.sync.transition_to_completed(task, execution).await?;
                ExecutionOutcome::Completed
            }
            (_, LoopEnd::LeaseLost) => ExecutionOutcome::Superseded(task.status),
        };
        Ok(outcome)
    }

    async fn fail(
        &self,
        task: &mut Task,
        execution: &mut Execution,
        guard: &LeaseGuard,
        message: &str,
    ) {
        tracing::error!(task_id = %task.id, execution_id = %execution.id, error = %message, "execution failed");

        if !guard.is_held().await {
            tracing::warn!(task_id = %task.id, "lease lost; failure not recorded on the task");
            return;
        }
        if let Ok(Some(current)) = self.store.get_task(task.id).await
            && current.status.is_terminal()
        {
            tracing::info!(task_id = %task.id, status = %current.status, "already terminal; failure not recorded");
            return;
        }
        if let Err(e) = self
            .sync
            .transition_to_failed(task, execution, message)
            .await
        {
            tracing::error!(task_id = %task.id, error = %e, "could not record failure");
        }
    }
}
