//! Strategy port.
//!
//! A strategy is a pure state machine over `ExecutionState`: each hook takes
//! the state by value and hands back the next state plus the events it wants
//! recorded. The engine never looks inside `strategy_state`.

use crate::domain::{ExecutionState, StrategyError, StrategyEvent, TaskConfig, Tick};

#[derive(Debug, Clone, PartialEq)]
pub struct StrategyStep {
    pub state: ExecutionState,
    pub events: Vec<StrategyEvent>,
}

impl StrategyStep {
    pub fn unchanged(state: ExecutionState) -> Self {
        Self {
            state,
            events: Vec::new(),
        }
    }

    pub fn with_events(state: ExecutionState, events: Vec<StrategyEvent>) -> Self {
        Self { state, events }
    }
}

pub trait Strategy: Send {
    /// Name of the strategy-internal state layout, recorded with the run.
    fn state_kind(&self) -> &'static str;

    /// `strategy_state` for a run that has nothing persisted.
    fn initial_state(&self, config: &TaskConfig) -> Result<serde_json::Value, StrategyError>;

    /// Validate (and migrate, if needed) a persisted `strategy_state`.
    fn deserialize_state(
        &self,
        blob: serde_json::Value,
    ) -> Result<serde_json::Value, StrategyError> {
        Ok(blob)
    }

    fn on_start(&mut self, state: ExecutionState) -> Result<StrategyStep, StrategyError> {
        Ok(StrategyStep::unchanged(state))
    }

    fn on_tick(&mut self, tick: &Tick, state: ExecutionState)
    -> Result<StrategyStep, StrategyError>;

    fn on_stop(&mut self, state: ExecutionState) -> Result<StrategyStep, StrategyError> {
        Ok(StrategyStep::unchanged(state))
    }
}

/// Builds one strategy instance per run.
pub trait StrategyFactory: Send + Sync {
    fn create(&self, config: &TaskConfig) -> Result<Box<dyn Strategy>, StrategyError>;
}

impl<F> StrategyFactory for F
where
    F: Fn(&TaskConfig) -> Result<Box<dyn Strategy>, StrategyError> + Send + Sync,
{
    fn create(&self, config: &TaskConfig) -> Result<Box<dyn Strategy>, StrategyError> {
        self(config)
    }
}
