use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// What a task runs. Carried explicitly through every lock/store operation so
/// backtests and live sessions never share a lease namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Backtest,
    Trading,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Backtest => "backtest",
            TaskKind::Trading => "trading",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backtest" => Ok(TaskKind::Backtest),
            "trading" => Ok(TaskKind::Trading),
            other => Err(format!("unknown task kind: {other}")),
        }
    }
}
