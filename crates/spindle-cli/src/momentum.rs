//! Demo momentum strategy used by `spindle run`.
//!
//! Goes long when the mid price breaks above its moving average by more than
//! `threshold`, exits when it falls back below the average. One position at a
//! time, sized at `allocation` of the current balance.

use serde::{Deserialize, Serialize};
use serde_json::json;
use spindle_core::domain::{
    ExecutionState, Position, Side, StrategyError, StrategyEvent, TaskConfig, Tick,
};
use spindle_core::ports::{Strategy, StrategyStep};

pub const NAME: &str = "momentum";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MomentumState {
    recent: Vec<f64>,
    last_mid: Option<f64>,
    trades: u64,
    wins: u64,
}

pub struct Momentum {
    window: usize,
    threshold: f64,
    allocation: f64,
}

pub fn factory(config: &TaskConfig) -> Result<Box<dyn Strategy>, StrategyError> {
    let params = &config.parameters;
    let window = params["window"].as_u64().unwrap_or(20) as usize;
    let threshold = params["threshold"].as_f64().unwrap_or(0.0002);
    let allocation = params["allocation"].as_f64().unwrap_or(0.1);
    if window < 2 {
        return Err(StrategyError::InvalidState(format!(
            "window must be at least 2 (got {window})"
        )));
    }
    if !(0.0..=1.0).contains(&allocation) {
        return Err(StrategyError::InvalidState(format!(
            "allocation must be within 0..=1 (got {allocation})"
        )));
    }
    Ok(Box::new(Momentum {
        window,
        threshold,
        allocation,
    }))
}

impl Momentum {
    fn read(state: &ExecutionState) -> Result<MomentumState, StrategyError> {
        serde_json::from_value(state.strategy_state.clone())
            .map_err(|e| StrategyError::InvalidState(e.to_string()))
    }

    fn write(state: &mut ExecutionState, inner: &MomentumState) -> Result<(), StrategyError> {
        state.strategy_state =
            serde_json::to_value(inner).map_err(|e| StrategyError::InvalidState(e.to_string()))?;
        Ok(())
    }

    fn close(
        state: &mut ExecutionState,
        inner: &mut MomentumState,
        price: f64,
        tick_time: chrono::DateTime<chrono::Utc>,
    ) -> Option<StrategyEvent> {
        let position = state.open_positions.pop()?;
        let pnl = position.unrealized_pnl(price);
        state.current_balance += pnl;
        inner.trades += 1;
        if pnl > 0.0 {
            inner.wins += 1;
        }
        Some(StrategyEvent::new(
            "position_closed",
            tick_time,
            json!({ "price": price, "units": position.units, "pnl": pnl }),
        ))
    }
}

impl Strategy for Momentum {
    fn state_kind(&self) -> &'static str {
        "momentum.v1"
    }

    fn initial_state(&self, _config: &TaskConfig) -> Result<serde_json::Value, StrategyError> {
        serde_json::to_value(MomentumState {
            recent: Vec::with_capacity(self.window),
            last_mid: None,
            trades: 0,
            wins: 0,
        })
        .map_err(|e| StrategyError::InvalidState(e.to_string()))
    }

    fn deserialize_state(
        &self,
        blob: serde_json::Value,
    ) -> Result<serde_json::Value, StrategyError> {
        let mut inner: MomentumState = serde_json::from_value(blob)
            .map_err(|e| StrategyError::InvalidState(e.to_string()))?;
        // window may have changed between runs
        if inner.recent.len() > self.window {
            inner.recent.drain(..inner.recent.len() - self.window);
        }
        serde_json::to_value(inner).map_err(|e| StrategyError::InvalidState(e.to_string()))
    }

    fn on_tick(
        &mut self,
        tick: &Tick,
        mut state: ExecutionState,
    ) -> Result<StrategyStep, StrategyError> {
        let mut inner = Self::read(&state)?;
        let mid = tick.mid();
        inner.recent.push(mid);
        if inner.recent.len() > self.window {
            inner.recent.remove(0);
        }
        inner.last_mid = Some(mid);

        let mut events = Vec::new();
        if inner.recent.len() == self.window {
            let average = inner.recent.iter().sum::<f64>() / self.window as f64;
            if state.open_positions.is_empty() {
                if mid > average * (1.0 + self.threshold) && tick.ask > 0.0 {
                    let units = (state.current_balance * self.allocation / tick.ask).floor();
                    if units > 0.0 {
                        state.open_positions.push(Position {
                            instrument: tick.instrument.clone(),
                            side: Side::Long,
                            units,
                            entry_price: tick.ask,
                            opened_at: tick.timestamp,
                        });
                        events.push(StrategyEvent::new(
                            "position_opened",
                            tick.timestamp,
                            json!({ "price": tick.ask, "units": units }),
                        ));
                    }
                }
            } else if mid < average
                && let Some(event) = Self::close(&mut state, &mut inner, tick.bid, tick.timestamp)
            {
                events.push(event);
            }
        }

        Self::write(&mut state, &inner)?;
        Ok(StrategyStep::with_events(state, events))
    }

    fn on_stop(&mut self, mut state: ExecutionState) -> Result<StrategyStep, StrategyError> {
        let mut inner = Self::read(&state)?;
        let mut events = Vec::new();
        if let (Some(price), Some(at)) = (inner.last_mid, state.last_tick_timestamp)
            && let Some(event) = Self::close(&mut state, &mut inner, price, at)
        {
            events.push(event);
        }
        Self::write(&mut state, &inner)?;
        Ok(StrategyStep::with_events(state, events))
    }
}

/// `(trades, wins)` from a persisted momentum state.
pub fn trade_stats(state: &ExecutionState) -> (u64, u64) {
    Momentum::read(state).map_or((0, 0), |s| (s.trades, s.wins))
}
