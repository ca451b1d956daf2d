use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One market quote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub instrument: String,
    pub timestamp: DateTime<Utc>,
    pub bid: f64,
    pub ask: f64,
    #[serde(default)]
    pub volume: f64,
}

impl Tick {
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    pub fn spread(&self) -> f64 {
        self.ask - self.bid
    }
}

/// Ordered group of ticks pulled from a source in one loop iteration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickBatch {
    pub ticks: Vec<Tick>,
}

impl TickBatch {
    pub fn new(ticks: Vec<Tick>) -> Self {
        Self { ticks }
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.ticks.last().map(|t| t.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mid_and_spread() {
        let tick = Tick {
            instrument: "EUR_USD".into(),
            timestamp: Utc::now(),
            bid: 1.1000,
            ask: 1.1002,
            volume: 0.0,
        };
        assert!((tick.mid() - 1.1001).abs() < 1e-12);
        assert!((tick.spread() - 0.0002).abs() < 1e-12);
    }
}
