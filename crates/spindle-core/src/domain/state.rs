//! Resumable execution payload, persisted after every tick batch.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub instrument: String,
    pub side: Side,
    pub units: f64,
    pub entry_price: f64,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        match self.side {
            Side::Long => (price - self.entry_price) * self.units,
            Side::Short => (self.entry_price - price) * self.units,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub balance: f64,
}

pub const METRIC_PEAK_BALANCE: &str = "peak_balance";
pub const METRIC_MAX_DRAWDOWN: &str = "max_drawdown";

/// Persisted layout:
/// `{strategy_state, current_balance, open_positions[], ticks_processed,
///   last_tick_timestamp, metrics, equity_curve[]}`.
///
/// `strategy_state` belongs to the strategy; the engine only stores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub strategy_state: serde_json::Value,
    pub current_balance: f64,
    #[serde(default)]
    pub open_positions: Vec<Position>,
    #[serde(default)]
    pub ticks_processed: u64,
    #[serde(default)]
    pub last_tick_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub equity_curve: Vec<EquityPoint>,
}

impl ExecutionState {
    pub fn fresh(initial_balance: f64, strategy_state: serde_json::Value) -> Self {
        Self {
            strategy_state,
            current_balance: initial_balance,
            open_positions: Vec::new(),
            ticks_processed: 0,
            last_tick_timestamp: None,
            metrics: BTreeMap::new(),
            equity_curve: Vec::new(),
        }
    }

    /// Append an equity point and update peak / drawdown metrics.
    pub fn record_equity(&mut self, timestamp: DateTime<Utc>) {
        let balance = self.current_balance;
        self.equity_curve.push(EquityPoint { timestamp, balance });

        let peak = self
            .metrics
            .get(METRIC_PEAK_BALANCE)
            .copied()
            .unwrap_or(balance)
            .max(balance);
        self.metrics.insert(METRIC_PEAK_BALANCE.to_string(), peak);

        if peak > 0.0 {
            let drawdown = (peak - balance) / peak;
            let max_drawdown = self
                .metrics
                .get(METRIC_MAX_DRAWDOWN)
                .copied()
                .unwrap_or(0.0)
                .max(drawdown);
            self.metrics
                .insert(METRIC_MAX_DRAWDOWN.to_string(), max_drawdown);
        }
    }

    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn from_json(blob: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(blob)
    }
}
