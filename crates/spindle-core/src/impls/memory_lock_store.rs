//! InMemoryLockStore - single-process `LockStore`.
//!
//! Expiry is evaluated against the injected `Clock` on every access, so tests
//! can age leases with `FixedClock::advance` instead of sleeping. Writes also
//! prune every expired entry, so keys never read again do not pile up.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::LockStoreError;
use crate::ports::{Clock, LockStore};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: DateTime<Utc>,
}

pub struct InMemoryLockStore {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryLockStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn expiry(&self, ttl: Duration) -> DateTime<Utc> {
        let ttl = chrono::Duration::milliseconds(ttl.as_millis().min(i64::MAX as u128) as i64);
        self.clock.now() + ttl
    }

    /// Number of live keys.
    pub async fn live_keys(&self) -> usize {
        let now = self.clock.now();
        let entries = self.entries.lock().await;
        entries.values().filter(|e| e.expires_at > now).count()
    }

    /// Entries held in memory, expired or not.
    pub async fn stored_keys(&self) -> usize {
        self.entries.lock().await.len()
    }
}

fn prune(entries: &mut HashMap<String, Entry>, now: DateTime<Utc>) {
    entries.retain(|_, e| e.expires_at > now);
}

/// Remove `key` if it has expired; return the live entry otherwise.
fn live<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
    now: DateTime<Utc>,
) -> Option<&'a mut Entry> {
    if entries.get(key).is_some_and(|e| e.expires_at <= now) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<bool, LockStoreError> {
        let now = self.clock.now();
        let expires_at = self.expiry(ttl);
        let mut entries = self.entries.lock().await;
        prune(&mut entries, now);
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), Entry { value, expires_at });
        Ok(true)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), LockStoreError> {
        let now = self.clock.now();
        let expires_at = self.expiry(ttl);
        let mut entries = self.entries.lock().await;
        prune(&mut entries, now);
        entries.insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, LockStoreError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        Ok(live(&mut entries, key, now).map(|e| e.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<(), LockStoreError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, LockStoreError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let held = live(&mut entries, key, now).is_some_and(|e| e.value == expected);
        if held {
            entries.remove(key);
        }
        Ok(held)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, LockStoreError> {
        let now = self.clock.now();
        let expires_at = self.expiry(ttl);
        let mut entries = self.entries.lock().await;
        match live(&mut entries, key, now) {
            Some(entry) => {
                entry.expires_at = expires_at;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
