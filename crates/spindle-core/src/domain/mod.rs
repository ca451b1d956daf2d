//! Domain model: ids, task/execution records, resumable state, errors.

pub mod errors;
pub mod events;
pub mod execution;
pub mod ids;
pub mod kind;
pub mod state;
pub mod status;
pub mod task;
pub mod tick;

pub use self::errors::{
    LockStoreError, NotificationError, QueueError, Result, SpindleError, StoreError,
    StrategyError, TickSourceError, ValidationError,
};
pub use self::events::{StatusNotification, StoredEvent, StrategyEvent};
pub use self::execution::{Execution, LogEntry, LogLevel};
pub use self::ids::{ExecutionId, JobId, TaskId};
pub use self::kind::TaskKind;
pub use self::state::{
    EquityPoint, ExecutionState, METRIC_MAX_DRAWDOWN, METRIC_PEAK_BALANCE, Position, Side,
};
pub use self::status::TaskStatus;
pub use self::task::{Task, TaskConfig};
pub use self::tick::{Tick, TickBatch};
