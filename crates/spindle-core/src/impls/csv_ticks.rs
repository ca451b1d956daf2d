//! CsvTickFeed - reads `{dir}/{instrument}.csv`.
//!
//! Expected header: `timestamp,bid,ask,volume` (RFC 3339 timestamps, sorted
//! ascending). File I/O runs on the blocking pool; each `next_batch` reads
//! at most one batch, so the file is never loaded whole.

use std::fs::File;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::domain::{Tick, TickBatch, TickSourceError};
use crate::ports::{TickDataSource, TickFeed, TickRequest};

#[derive(Debug, Deserialize)]
struct Row {
    timestamp: DateTime<Utc>,
    bid: f64,
    ask: f64,
    #[serde(default)]
    volume: f64,
}

type Rows = csv::DeserializeRecordsIntoIter<File, Row>;

pub struct CsvTickFeed {
    dir: PathBuf,
}

impl CsvTickFeed {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, instrument: &str) -> PathBuf {
        self.dir.join(format!("{instrument}.csv"))
    }
}

#[derive(Debug, Clone)]
struct Window {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

impl Window {
    fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start.is_none_or(|s| ts >= s) && self.end.is_none_or(|e| ts < e)
    }
}

fn open_rows(path: &Path) -> Result<Rows, TickSourceError> {
    let reader = csv::Reader::from_path(path)
        .map_err(|e| TickSourceError::Unavailable(format!("{}: {e}", path.display())))?;
    Ok(reader.into_deserialize())
}

fn count_in_window(path: &Path, window: &Window) -> Result<u64, TickSourceError> {
    let mut total = 0;
    for row in open_rows(path)? {
        let row = row.map_err(|e| TickSourceError::Malformed(e.to_string()))?;
        if window.contains(row.timestamp) {
            total += 1;
        }
    }
    Ok(total)
}

#[async_trait]
impl TickFeed for CsvTickFeed {
    async fn open(&self, request: &TickRequest) -> Result<Box<dyn TickDataSource>, TickSourceError> {
        if request.batch_size == 0 {
            return Err(TickSourceError::Unavailable("batch_size must be > 0".into()));
        }
        let path = self.path_for(&request.instrument);
        let window = Window {
            start: request.start,
            end: request.end,
        };

        let (rows, total) = {
            let window = window.clone();
            tokio::task::spawn_blocking(move || {
                let total = count_in_window(&path, &window)?;
                Ok::<_, TickSourceError>((open_rows(&path)?, total))
            })
            .await
            .map_err(|e| TickSourceError::Unavailable(format!("open task failed: {e}")))??
        };

        Ok(Box::new(CsvTickSource {
            rows: Some(rows),
            instrument: request.instrument.clone(),
            window,
            batch_size: request.batch_size,
            to_skip: request.resume_skip,
            total,
            exhausted: false,
        }))
    }
}

struct CsvTickSource {
    /// `None` once closed.
    rows: Option<Rows>,
    instrument: String,
    window: Window,
    batch_size: usize,
    /// In-window rows still to pass over before delivering.
    to_skip: u64,
    total: u64,
    exhausted: bool,
}

fn read_batch(
    rows: &mut Rows,
    instrument: &str,
    window: &Window,
    batch_size: usize,
    to_skip: &mut u64,
) -> Result<(Vec<Tick>, bool), TickSourceError> {
    let mut ticks = Vec::with_capacity(batch_size);
    while ticks.len() < batch_size {
        let Some(row) = rows.next() else {
            return Ok((ticks, true));
        };
        let row = row.map_err(|e| TickSourceError::Malformed(e.to_string()))?;
        if window.end.is_some_and(|e| row.timestamp >= e) {
            return Ok((ticks, true));
        }
        if !window.contains(row.timestamp) {
            continue;
        }
        if *to_skip > 0 {
            *to_skip -= 1;
            continue;
        }
        ticks.push(Tick {
            instrument: instrument.to_string(),
            timestamp: row.timestamp,
            bid: row.bid,
            ask: row.ask,
            volume: row.volume,
        });
    }
    Ok((ticks, false))
}

#[async_trait]
impl TickDataSource for CsvTickSource {
    async fn next_batch(&mut self) -> Result<Option<TickBatch>, TickSourceError> {
        let mut rows = self.rows.take().ok_or(TickSourceError::Closed)?;
        if self.exhausted {
            self.rows = Some(rows);
            return Ok(None);
        }

        let instrument = self.instrument.clone();
        let window = self.window.clone();
        let batch_size = self.batch_size;
        let mut to_skip = self.to_skip;
        let (rows, to_skip, result) = tokio::task::spawn_blocking(move || {
            let result = read_batch(&mut rows, &instrument, &window, batch_size, &mut to_skip);
            (rows, to_skip, result)
        })
        .await
        .map_err(|e| TickSourceError::Unavailable(format!("read task failed: {e}")))?;
        self.rows = Some(rows);
        self.to_skip = to_skip;

        let (ticks, exhausted) = result?;
        self.exhausted = exhausted;
        if ticks.is_empty() {
            return Ok(None);
        }
        Ok(Some(TickBatch::new(ticks)))
    }

    fn estimated_total(&self) -> Option<u64> {
        Some(self.total)
    }

    async fn close(&mut self) -> Result<(), TickSourceError> {
        self.rows = None;
        Ok(())
    }
}
