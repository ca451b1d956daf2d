//! EngineBuilder - wiring and start-up checks.
//!
//! Every port has an in-memory default except the tick feed, which must be
//! given. `expect_strategies` makes `build()` fail fast when a strategy the
//! deployment relies on was never registered.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::app::executor::{ExecutorSettings, TaskExecutor};
use crate::app::lock_manager::TaskLockManager;
use crate::app::registry::StrategyRegistry;
use crate::app::service::TaskService;
use crate::app::stale_sweep::StaleLockSweep;
use crate::app::synchronizer::StateSynchronizer;
use crate::app::worker_loop::{RunningJobs, WorkerPool, WorkerSettings};
use crate::config::EngineConfig;
use crate::domain::SpindleError;
use crate::impls::{InMemoryJobQueue, InMemoryLockStore, InMemoryTaskStore, TracingNotificationSink};
use crate::ports::{
    Clock, IdGenerator, JobQueue, LockStore, NotificationSink, StrategyFactory, SystemClock,
    TaskStore, TickFeed, UlidGenerator,
};

/// # Example
/// ```ignore
/// let engine = EngineBuilder::new()
///     .config(config)
///     .tick_feed(Arc::new(feed))
///     .register_strategy("momentum", momentum_factory)?
///     .expect_strategies(&["momentum"])
///     .build()?;
/// ```
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    strategies: StrategyRegistry,
    expected_strategies: Option<Vec<String>>,
    clock: Option<Arc<dyn Clock>>,
    lock_store: Option<Arc<dyn LockStore>>,
    task_store: Option<Arc<dyn TaskStore>>,
    job_queue: Option<Arc<dyn JobQueue>>,
    tick_feed: Option<Arc<dyn TickFeed>>,
    notifier: Option<Arc<dyn NotificationSink>>,
    ids: Option<Arc<dyn IdGenerator>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing strategies: {0:?}; they were expected but not registered")]
    MissingStrategies(Vec<String>),

    #[error("strategy registered twice: {0}")]
    DuplicateStrategy(String),

    #[error("no tick feed configured")]
    MissingTickFeed,

    #[error("invalid engine config: {0}")]
    InvalidConfig(String),
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn lock_store(mut self, store: Arc<dyn LockStore>) -> Self {
        self.lock_store = Some(store);
        self
    }

    pub fn task_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.task_store = Some(store);
        self
    }

    pub fn job_queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.job_queue = Some(queue);
        self
    }

    pub fn tick_feed(mut self, feed: Arc<dyn TickFeed>) -> Self {
        self.tick_feed = Some(feed);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn register_strategy<F>(mut self, name: &str, factory: F) -> Result<Self, BuildError>
    where
        F: StrategyFactory + 'static,
    {
        self.strategies
            .register(name, Arc::new(factory))
            .map_err(|_| BuildError::DuplicateStrategy(name.to_string()))?;
        Ok(self)
    }

    pub fn expect_strategies(mut self, names: &[&str]) -> Self {
        self.expected_strategies = Some(names.iter().map(|n| n.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<Engine, BuildError> {
        self.config
            .validate()
            .map_err(|e| match e {
                SpindleError::Config(msg) => BuildError::InvalidConfig(msg),
                other => BuildError::InvalidConfig(other.to_string()),
            })?;

        if let Some(expected) = &self.expected_strategies {
            let missing: Vec<String> = expected
                .iter()
                .filter(|name| !self.strategies.contains(name))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingStrategies(missing));
            }
        }
        let tick_feed = self.tick_feed.ok_or(BuildError::MissingTickFeed)?;

        let config = self.config;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let lock_store = self
            .lock_store
            .unwrap_or_else(|| Arc::new(InMemoryLockStore::new(Arc::clone(&clock))));
        let store = self
            .task_store
            .unwrap_or_else(|| Arc::new(InMemoryTaskStore::new()));
        let queue = self
            .job_queue
            .unwrap_or_else(|| Arc::new(InMemoryJobQueue::new()));
        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(TracingNotificationSink));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&clock))));
        let strategies = Arc::new(self.strategies);

        let locks = Arc::new(TaskLockManager::from_config(
            lock_store,
            Arc::clone(&clock),
            &config,
        ));
        let sync = Arc::new(StateSynchronizer::new(
            Arc::clone(&store),
            Arc::clone(&notifier),
            Arc::clone(&clock),
        ));
        let executor = Arc::new(TaskExecutor::new(
            Arc::clone(&store),
            Arc::clone(&locks),
            Arc::clone(&sync),
            Arc::clone(&strategies),
            tick_feed,
            Arc::clone(&ids),
            Arc::clone(&clock),
            ExecutorSettings::from_config(&config),
        ));
        let running = Arc::new(RunningJobs::new());
        let service = Arc::new(TaskService::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&locks),
            Arc::clone(&sync),
            Arc::clone(&strategies),
            ids,
            Arc::clone(&clock),
            notifier,
            Arc::clone(&running),
            config.tasks.max_retries,
        ));
        let sweep = Arc::new(StaleLockSweep::new(
            Arc::clone(&store),
            Arc::clone(&locks),
            Arc::clone(&sync),
        ));

        tracing::info!(strategies = ?strategies.names(), "engine built");
        Ok(Engine {
            config,
            clock,
            store,
            queue,
            locks,
            sync,
            strategies,
            executor,
            service,
            sweep,
            running,
        })
    }
}

/// A wired engine. Cheap handles to every component; nothing runs until
/// `start()` or `spawn_workers()`.
pub struct Engine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    store: Arc<dyn TaskStore>,
    queue: Arc<dyn JobQueue>,
    locks: Arc<TaskLockManager>,
    sync: Arc<StateSynchronizer>,
    strategies: Arc<StrategyRegistry>,
    executor: Arc<TaskExecutor>,
    service: Arc<TaskService>,
    sweep: Arc<StaleLockSweep>,
    running: Arc<RunningJobs>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    pub fn locks(&self) -> &Arc<TaskLockManager> {
        &self.locks
    }

    pub fn synchronizer(&self) -> &Arc<StateSynchronizer> {
        &self.sync
    }

    pub fn strategies(&self) -> &Arc<StrategyRegistry> {
        &self.strategies
    }

    pub fn executor(&self) -> &Arc<TaskExecutor> {
        &self.executor
    }

    pub fn service(&self) -> &Arc<TaskService> {
        &self.service
    }

    pub fn sweep(&self) -> &Arc<StaleLockSweep> {
        &self.sweep
    }

    pub fn running_jobs(&self) -> &Arc<RunningJobs> {
        &self.running
    }

    pub fn spawn_workers(&self) -> WorkerPool {
        WorkerPool::spawn(
            WorkerSettings::from_config(&self.config),
            Arc::clone(&self.queue),
            Arc::clone(&self.executor),
            Arc::clone(&self.locks),
            Arc::clone(&self.running),
        )
    }

    /// Start the worker pool and the periodic stale sweep.
    pub fn start(&self) -> BackgroundTasks {
        let workers = self.spawn_workers();
        let (sweep_tx, sweep_rx) = watch::channel(false);
        let sweep = Arc::clone(&self.sweep);
        let interval = self.config.sweep_interval();
        let sweep_join = tokio::spawn(async move { sweep.run(interval, sweep_rx).await });
        BackgroundTasks {
            workers,
            sweep_tx,
            sweep_join,
        }
    }
}

pub struct BackgroundTasks {
    workers: WorkerPool,
    sweep_tx: watch::Sender<bool>,
    sweep_join: JoinHandle<()>,
}

impl BackgroundTasks {
    pub async fn shutdown(self) {
        let _ = self.sweep_tx.send(true);
        self.workers.shutdown_and_join().await;
        if let Err(e) = self.sweep_join.await {
            tracing::error!(error = %e, "stale sweep exited abnormally");
        }
    }
}
