//! InMemoryTickFeed - tick feed over ticks held in memory.
//!
//! An optional gate (`Semaphore`) makes every `next_batch` wait for one
//! permit, which lets callers step an executor batch by batch.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Semaphore;

use crate::domain::{Tick, TickBatch, TickSourceError};
use crate::ports::{TickDataSource, TickFeed, TickRequest};

#[derive(Default)]
pub struct InMemoryTickFeed {
    ticks: HashMap<String, Vec<Tick>>,
    gate: Option<Arc<Semaphore>>,
    opened: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

impl InMemoryTickFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add ticks; they are kept sorted by timestamp per instrument.
    pub fn with_ticks(mut self, ticks: impl IntoIterator<Item = Tick>) -> Self {
        for tick in ticks {
            self.ticks.entry(tick.instrument.clone()).or_default().push(tick);
        }
        for series in self.ticks.values_mut() {
            series.sort_by_key(|t| t.timestamp);
        }
        self
    }

    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Sources opened so far.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Sources closed so far.
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TickFeed for InMemoryTickFeed {
    async fn open(&self, request: &TickRequest) -> Result<Box<dyn TickDataSource>, TickSourceError> {
        if request.batch_size == 0 {
            return Err(TickSourceError::Unavailable("batch_size must be > 0".into()));
        }
        let series = self
            .ticks
            .get(&request.instrument)
            .ok_or_else(|| {
                TickSourceError::Unavailable(format!("no ticks for {}", request.instrument))
            })?;

        let in_window: Vec<&Tick> = series
            .iter()
            .filter(|t| request.start.is_none_or(|s| t.timestamp >= s))
            .filter(|t| request.end.is_none_or(|e| t.timestamp < e))
            .collect();
        let total = in_window.len() as u64;
        let skip = usize::try_from(request.resume_skip).unwrap_or(usize::MAX);
        let pending: VecDeque<Tick> = in_window.into_iter().skip(skip).cloned().collect();

        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(InMemoryTickSource {
            pending,
            total,
            batch_size: request.batch_size,
            gate: self.gate.clone(),
            is_closed: false,
            closed: Arc::clone(&self.closed),
        }))
    }
}

struct InMemoryTickSource {
    pending: VecDeque<Tick>,
    total: u64,
    batch_size: usize,
    gate: Option<Arc<Semaphore>>,
    is_closed: bool,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl TickDataSource for InMemoryTickSource {
    async fn next_batch(&mut self) -> Result<Option<TickBatch>, TickSourceError> {
        if self.is_closed {
            return Err(TickSourceError::Closed);
        }
        if self.pending.is_empty() {
            return Ok(None);
        }
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_| TickSourceError::Unavailable("tick gate closed".into()))?
                .forget();
        }
        let n = self.batch_size.min(self.pending.len());
        Ok(Some(TickBatch::new(self.pending.drain(..n).collect())))
    }

    fn estimated_total(&self) -> Option<u64> {
        Some(self.total)
    }

    async fn close(&mut self) -> Result<(), TickSourceError> {
        if !self.is_closed {
            self.is_closed = true;
            self.pending.clear();
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Deterministic random-walk quotes, one per `step`.
pub fn synthetic_ticks(
    instrument: &str,
    start: DateTime<Utc>,
    count: usize,
    step: Duration,
    seed: u64,
) -> Vec<Tick> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut mid = 1.1000_f64;
    let mut timestamp = start;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        mid = (mid + rng.gen_range(-0.0005..0.0005)).max(0.0001);
        let half_spread = rng.gen_range(0.00002..0.0001);
        out.push(Tick {
            instrument: instrument.to_string(),
            timestamp,
            bid: mid - half_spread,
            ask: mid + half_spread,
            volume: rng.gen_range(1.0..100.0),
        });
        timestamp += step;
    }
    out
}
