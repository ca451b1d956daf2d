//! Ports: the trait seams between the engine and its infrastructure.
//!
//! - `LockStore`: shared CAS + TTL store (leases, heartbeats, flags)
//! - `TaskStore`: source of truth for tasks/executions/state/events
//! - `JobQueue`: dispatch to workers
//! - `NotificationSink`: status-change fan-out
//! - `Strategy` / `TickFeed`: the pluggable computation and its input

pub mod clock;
pub mod id_generator;
pub mod job_queue;
pub mod lock_store;
pub mod notification;
pub mod strategy;
pub mod task_store;
pub mod tick_source;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::job_queue::{Job, JobQueue};
pub use self::lock_store::LockStore;
pub use self::notification::NotificationSink;
pub use self::strategy::{Strategy, StrategyFactory, StrategyStep};
pub use self::task_store::{StoreTransaction, TaskStore};
pub use self::tick_source::{TickDataSource, TickFeed, TickRequest};
