//! IdGenerator port.
//!
//! # ULID
//! - sortable by creation time
//! - generated on any worker without coordination
//! - 128-bit, UUID compatible

use crate::domain::ids::{ExecutionId, JobId, TaskId};
use crate::ports::Clock;
use ulid::Ulid;

pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;

    fn generate_execution_id(&self) -> ExecutionId;

    /// Fresh id for every dispatch of a task to the queue.
    fn generate_job_id(&self) -> JobId;
}

/// ULID generator whose timestamp part comes from a `Clock`.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_task_id(&self) -> TaskId {
        TaskId::from(self.next_ulid())
    }

    fn generate_execution_id(&self) -> ExecutionId {
        ExecutionId::from(self.next_ulid())
    }

    fn generate_job_id(&self) -> JobId {
        JobId::from(self.next_ulid())
    }
}
