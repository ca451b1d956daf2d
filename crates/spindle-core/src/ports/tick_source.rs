//! Tick data ports.
//!
//! A `TickDataSource` is a lazy, finite, non-restartable sequence of ordered
//! tick batches scoped to one executor run. The executor always calls `close`,
//! whatever happened before.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{TickBatch, TickSourceError};

#[derive(Debug, Clone, PartialEq)]
pub struct TickRequest {
    pub instrument: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub batch_size: usize,
    /// Ticks of the window already processed (resume point). The first
    /// `resume_skip` in-window ticks are not delivered again, so ticks that
    /// share a timestamp across a batch boundary are neither lost nor
    /// repeated.
    pub resume_skip: u64,
}

#[async_trait]
pub trait TickDataSource: Send {
    /// `Ok(None)` once the sequence is exhausted.
    async fn next_batch(&mut self) -> Result<Option<TickBatch>, TickSourceError>;

    /// Total ticks in the requested window, resume point ignored. Used for
    /// progress reporting only.
    fn estimated_total(&self) -> Option<u64>;

    async fn close(&mut self) -> Result<(), TickSourceError>;
}

#[async_trait]
pub trait TickFeed: Send + Sync {
    async fn open(&self, request: &TickRequest) -> Result<Box<dyn TickDataSource>, TickSourceError>;
}
