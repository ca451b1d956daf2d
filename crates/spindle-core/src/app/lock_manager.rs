//! TaskLockManager - per-task leases, heartbeats and cancellation flags.
//!
//! # Keys (per kind and task)
//! - `task_lock:{kind}:{task_id}`: `Lease` JSON, TTL = lock timeout
//! - `task_heartbeat:{kind}:{task_id}`: `Heartbeat` JSON, TTL = lock timeout
//! - `task_cancel:{kind}:{task_id}`: `CancelSignal` JSON
//!
//! `acquire_lock` is the only admission control: a second executor for the
//! same task gets `false` and must leave task state alone. Staleness looks at
//! the heartbeat only, never at lease age.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::config::EngineConfig;
use crate::domain::{ExecutionId, LockStoreError, TaskId, TaskKind};
use crate::ports::{Clock, LockStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub execution_id: ExecutionId,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub last_beat: DateTime<Utc>,
    pub execution_id: ExecutionId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopMode {
    /// Drain: the strategy stop hook runs before STOPPED.
    Graceful,
    /// No drain; the queued job is also revoked.
    Immediate,
}

/// What the executor should do at its next batch boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelSignal {
    Stop(StopMode),
    Pause,
}

fn lock_key(kind: TaskKind, task_id: TaskId) -> String {
    format!("task_lock:{kind}:{task_id}")
}

fn heartbeat_key(kind: TaskKind, task_id: TaskId) -> String {
    format!("task_heartbeat:{kind}:{task_id}")
}

fn cancel_key(kind: TaskKind, task_id: TaskId) -> String {
    format!("task_cancel:{kind}:{task_id}")
}

fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> Result<T, LockStoreError> {
    serde_json::from_str(raw).map_err(|e| LockStoreError::Malformed {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn encode<T: Serialize>(key: &str, value: &T) -> Result<String, LockStoreError> {
    serde_json::to_string(value).map_err(|e| LockStoreError::Malformed {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

pub struct TaskLockManager {
    store: Arc<dyn LockStore>,
    clock: Arc<dyn Clock>,
    lock_timeout: Duration,
    stale_threshold: Duration,
}

impl TaskLockManager {
    pub fn new(
        store: Arc<dyn LockStore>,
        clock: Arc<dyn Clock>,
        lock_timeout: Duration,
        stale_threshold: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            lock_timeout,
            stale_threshold,
        }
    }

    pub fn from_config(
        store: Arc<dyn LockStore>,
        clock: Arc<dyn Clock>,
        config: &EngineConfig,
    ) -> Self {
        Self::new(store, clock, config.lock_timeout(), config.stale_threshold())
    }

    pub fn stale_threshold(&self) -> Duration {
        self.stale_threshold
    }

    /// Create the lease if none is live, then write the first heartbeat.
    /// `Ok(false)` means another executor holds the task.
    pub async fn acquire_lock(
        &self,
        kind: TaskKind,
        task_id: TaskId,
        execution_id: ExecutionId,
    ) -> Result<bool, LockStoreError> {
        let key = lock_key(kind, task_id);
        let lease = Lease {
            execution_id,
            acquired_at: self.clock.now(),
        };
        let raw = encode(&key, &lease)?;
        if !self
            .store
            .set_if_absent(&key, raw.clone(), self.lock_timeout)
            .await?
        {
            tracing::debug!(%task_id, %kind, "lease already held");
            return Ok(false);
        }

        if let Err(e) = self.write_heartbeat(kind, task_id, execution_id).await {
            // A lease without a heartbeat would be swept as stale at once.
            if let Err(rollback) = self.store.delete_if_equals(&key, &raw).await {
                tracing::warn!(
                    %task_id, %kind, %execution_id, error = %rollback,
                    "lease rollback failed; it will expire"
                );
            }
            return Err(e);
        }
        tracing::debug!(%task_id, %kind, %execution_id, "lease acquired");
        Ok(true)
    }

    /// Acquire and wrap the lease in a guard that releases on every exit path.
    pub async fn acquire_guard(
        self: &Arc<Self>,
        kind: TaskKind,
        task_id: TaskId,
        execution_id: ExecutionId,
    ) -> Result<Option<LeaseGuard>, LockStoreError> {
        if !self.acquire_lock(kind, task_id, execution_id).await? {
            return Ok(None);
        }
        Ok(Some(LeaseGuard {
            manager: Arc::clone(self),
            kind,
            task_id,
            execution_id,
            released: false,
        }))
    }

    /// Delete lease, heartbeat and cancellation flag, whoever holds them.
    /// Idempotent.
    pub async fn release_lock(&self, kind: TaskKind, task_id: TaskId) -> Result<(), LockStoreError> {
        self.store.delete(&cancel_key(kind, task_id)).await?;
        self.store.delete(&heartbeat_key(kind, task_id)).await?;
        self.store.delete(&lock_key(kind, task_id)).await?;
        tracing::debug!(%task_id, %kind, "lease released");
        Ok(())
    }

    /// Release only if `execution_id` still holds the lease. Returns whether
    /// anything was released.
    pub async fn release_owned_lock(
        &self,
        kind: TaskKind,
        task_id: TaskId,
        execution_id: ExecutionId,
    ) -> Result<bool, LockStoreError> {
        let key = lock_key(kind, task_id);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(false);
        };
        let lease: Lease = decode(&key, &raw)?;
        if lease.execution_id != execution_id {
            tracing::warn!(
                %task_id, %kind, %execution_id, holder = %lease.execution_id,
                "lease taken over; leaving it alone"
            );
            return Ok(false);
        }

        // Clear the satellites while the lease still blocks new holders.
        let hb_key = heartbeat_key(kind, task_id);
        if let Some(hb_raw) = self.store.get(&hb_key).await? {
            let hb: Heartbeat = decode(&hb_key, &hb_raw)?;
            if hb.execution_id == execution_id {
                self.store.delete_if_equals(&hb_key, &hb_raw).await?;
            }
        }
        self.store.delete(&cancel_key(kind, task_id)).await?;

        let released = self.store.delete_if_equals(&key, &raw).await?;
        tracing::debug!(%task_id, %kind, %execution_id, released, "owned lease released");
        Ok(released)
    }

    async fn write_heartbeat(
        &self,
        kind: TaskKind,
        task_id: TaskId,
        execution_id: ExecutionId,
    ) -> Result<(), LockStoreError> {
        let key = heartbeat_key(kind, task_id);
        let beat = Heartbeat {
            last_beat: self.clock.now(),
            execution_id,
        };
        self.store
            .set(&key, encode(&key, &beat)?, self.lock_timeout)
            .await
    }

    async fn renew(
        &self,
        kind: TaskKind,
        task_id: TaskId,
        execution_id: ExecutionId,
    ) -> Result<bool, LockStoreError> {
        // never beat for a lease swept away or taken by another executor
        if !self.holds_lock(kind, task_id, execution_id).await? {
            return Ok(false);
        }
        self.write_heartbeat(kind, task_id, execution_id).await?;
        self.store
            .expire(&lock_key(kind, task_id), self.lock_timeout)
            .await
    }

    /// Renew the heartbeat and the lease TTL. Never fails the caller: a failed
    /// write is logged and the next renewal tries again. `false` when nothing
    /// was renewed.
    pub async fn update_heartbeat(
        &self,
        kind: TaskKind,
        task_id: TaskId,
        execution_id: ExecutionId,
    ) -> bool {
        match self.renew(kind, task_id, execution_id).await {
            Ok(true) => {
                tracing::debug!(%task_id, %kind, %execution_id, "heartbeat");
                true
            }
            Ok(false) => {
                tracing::warn!(%task_id, %kind, %execution_id, "lease no longer held; heartbeat skipped");
                false
            }
            Err(e) => {
                tracing::warn!(%task_id, %kind, %execution_id, error = %e, "heartbeat failed");
                false
            }
        }
    }

    pub async fn lease(&self, kind: TaskKind, task_id: TaskId) -> Result<Option<Lease>, LockStoreError> {
        let key = lock_key(kind, task_id);
        match self.store.get(&key).await? {
            Some(raw) => decode(&key, &raw).map(Some),
            None => Ok(None),
        }
    }

    pub async fn is_locked(&self, kind: TaskKind, task_id: TaskId) -> Result<bool, LockStoreError> {
        Ok(self.lease(kind, task_id).await?.is_some())
    }

    /// Whether `execution_id` is the current lease holder.
    pub async fn holds_lock(
        &self,
        kind: TaskKind,
        task_id: TaskId,
        execution_id: ExecutionId,
    ) -> Result<bool, LockStoreError> {
        Ok(self
            .lease(kind, task_id)
            .await?
            .is_some_and(|lease| lease.execution_id == execution_id))
    }

    pub async fn heartbeat(
        &self,
        kind: TaskKind,
        task_id: TaskId,
    ) -> Result<Option<Heartbeat>, LockStoreError> {
        let key = heartbeat_key(kind, task_id);
        match self.store.get(&key).await? {
            Some(raw) => decode(&key, &raw).map(Some),
            None => Ok(None),
        }
    }

    /// Stale = heartbeat absent, or `now - last_beat >= stale_threshold`.
    pub async fn is_stale(&self, kind: TaskKind, task_id: TaskId) -> Result<bool, LockStoreError> {
        let Some(beat) = self.heartbeat(kind, task_id).await? else {
            return Ok(true);
        };
        let age = self.clock.now() - beat.last_beat;
        Ok(age.to_std().unwrap_or(Duration::ZERO) >= self.stale_threshold)
    }

    pub async fn request_cancellation(
        &self,
        kind: TaskKind,
        task_id: TaskId,
        signal: CancelSignal,
    ) -> Result<(), LockStoreError> {
        let key = cancel_key(kind, task_id);
        self.store
            .set(&key, encode(&key, &signal)?, self.lock_timeout)
            .await?;
        tracing::info!(%task_id, %kind, ?signal, "cancellation requested");
        Ok(())
    }

    /// Never fails the caller; an unreadable flag reads as "not set".
    pub async fn cancellation_signal(&self, kind: TaskKind, task_id: TaskId) -> Option<CancelSignal> {
        let key = cancel_key(kind, task_id);
        let raw = match self.store.get(&key).await {
            Ok(raw) => raw?,
            Err(e) => {
                tracing::warn!(%task_id, %kind, error = %e, "cancellation flag unreadable");
                return None;
            }
        };
        match decode(&key, &raw) {
            Ok(signal) => Some(signal),
            Err(e) => {
                tracing::warn!(%task_id, %kind, error = %e, "cancellation flag malformed");
                None
            }
        }
    }

    pub async fn check_cancellation_flag(&self, kind: TaskKind, task_id: TaskId) -> bool {
        self.cancellation_signal(kind, task_id).await.is_some()
    }

    pub async fn clear_cancellation_flag(
        &self,
        kind: TaskKind,
        task_id: TaskId,
    ) -> Result<(), LockStoreError> {
        self.store.delete(&cancel_key(kind, task_id)).await
    }
}

/// Held lease. `release()` is the normal path; if the guard is dropped
/// instead (panic, abort), `Drop` schedules an owned release on the current
/// runtime.
pub struct LeaseGuard {
    manager: Arc<TaskLockManager>,
    kind: TaskKind,
    task_id: TaskId,
    execution_id: ExecutionId,
    released: bool,
}

impl LeaseGuard {
    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    pub async fn heartbeat(&self) -> bool {
        self.manager
            .update_heartbeat(self.kind, self.task_id, self.execution_id)
            .await
    }

    pub async fn cancellation_signal(&self) -> Option<CancelSignal> {
        self.manager.cancellation_signal(self.kind, self.task_id).await
    }

    /// `false` only when the store positively shows the lease gone or held by
    /// someone else. An unreadable store counts as still held.
    pub async fn is_held(&self) -> bool {
        match self
            .manager
            .holds_lock(self.kind, self.task_id, self.execution_id)
            .await
        {
            Ok(held) => held,
            Err(e) => {
                tracing::warn!(
                    task_id = %self.task_id, kind = %self.kind, error = %e,
                    "lease check failed; assuming still held"
                );
                true
            }
        }
    }

    pub async fn release(mut self) -> Result<bool, LockStoreError> {
        self.released = true;
        self.manager
            .release_owned_lock(self.kind, self.task_id, self.execution_id)
            .await
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let (kind, task_id, execution_id) = (self.kind, self.task_id, self.execution_id);
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(%task_id, %kind, "lease guard dropped outside a runtime; lease left to expire");
            return;
        };
        let manager = Arc::clone(&self.manager);
        handle.spawn(async move {
            if let Err(e) = manager.release_owned_lock(kind, task_id, execution_id).await {
                tracing::warn!(%task_id, %kind, error = %e, "deferred lease release failed");
            }
        });
    }
}
