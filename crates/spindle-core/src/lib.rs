//! spindle-core
//!
//! Resumable task execution engine: long-running strategy tasks that consume
//! tick streams in batches, hold a heartbeat-renewed lease while running,
//! persist state after every batch and can be stopped, paused, resumed and
//! restarted.
//!
//! # Modules
//! - **domain**: ids, statuses, task/execution records, execution state, errors
//! - **ports**: trait seams (LockStore, TaskStore, JobQueue, Strategy, TickFeed, ...)
//! - **impls**: in-memory and CSV implementations of the ports
//! - **app**: lock manager, synchronizer, executor, service, sweep, workers
//! - **config**: `EngineConfig` from TOML

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;

#[cfg(test)]
pub(crate) mod testing;

pub use app::{Engine, EngineBuilder};
pub use config::EngineConfig;
pub use domain::{Result, SpindleError};
