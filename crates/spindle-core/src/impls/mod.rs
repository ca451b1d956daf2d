//! Port implementations for development, tests and single-process runs.

pub mod csv_ticks;
pub mod memory_lock_store;
pub mod memory_queue;
pub mod memory_task_store;
pub mod memory_ticks;
pub mod notification;

pub use self::csv_ticks::CsvTickFeed;
pub use self::memory_lock_store::InMemoryLockStore;
pub use self::memory_queue::InMemoryJobQueue;
pub use self::memory_task_store::InMemoryTaskStore;
pub use self::memory_ticks::{InMemoryTickFeed, synthetic_ticks};
pub use self::notification::{
    BroadcastNotificationSink, RecordingNotificationSink, TracingNotificationSink,
};
