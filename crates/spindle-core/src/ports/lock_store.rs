//! LockStore port: the shared key-value substrate for leases, heartbeats and
//! cancellation flags.
//!
//! Correctness of the engine rests on two properties of an implementation:
//! `set_if_absent` and `delete_if_equals` are atomic across every process
//! sharing the store, and expired keys are invisible to every operation.

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::LockStoreError;

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Create `key` only if it is absent (or expired). Returns whether the
    /// write happened.
    async fn set_if_absent(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<bool, LockStoreError>;

    /// Unconditional write with a fresh TTL.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), LockStoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, LockStoreError>;

    /// Idempotent.
    async fn delete(&self, key: &str) -> Result<(), LockStoreError>;

    /// Compare-and-delete. Returns whether the key held `expected` and was
    /// removed.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, LockStoreError>;

    /// Refresh the TTL of a live key. Returns false if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, LockStoreError>;
}
