//! Application layer: the engine components built on the ports.
//!
//! - **TaskLockManager**: leases, heartbeats, cancellation flags
//! - **StateSynchronizer**: atomic task/execution transitions + notification
//! - **TaskExecutor**: the resumable batch loop
//! - **TaskService**: lifecycle commands
//! - **StaleLockSweep**: reclaims tasks whose heartbeat stopped
//! - **WorkerPool**: runs dispatched jobs under time limits
//! - **EngineBuilder**: wiring and start-up checks

pub mod builder;
pub mod executor;
pub mod lock_manager;
pub mod registry;
pub mod service;
pub mod stale_sweep;
pub mod status;
pub mod synchronizer;
pub mod worker_loop;

pub use self::builder::{BackgroundTasks, BuildError, Engine, EngineBuilder};
pub use self::executor::{ExecutionOutcome, ExecutorSettings, TaskExecutor};
pub use self::lock_manager::{CancelSignal, Heartbeat, Lease, LeaseGuard, StopMode, TaskLockManager};
pub use self::registry::StrategyRegistry;
pub use self::service::TaskService;
pub use self::stale_sweep::{StaleLockSweep, SweepReport};
pub use self::status::{TaskCounts, TaskStatusView};
pub use self::synchronizer::{ConsistencyReport, StateSynchronizer};
pub use self::worker_loop::{RunningJobs, WorkerPool, WorkerSettings};
