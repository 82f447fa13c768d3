//! Counter store abstraction
//!
//! Expiring counters backing the rate limiter. The trait mirrors the
//! Redis commands the production backend uses (INCR, PEXPIRE, PTTL) so
//! the in-memory variant behaves the same way under test.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;

/// Errors surfaced by counter backends
#[derive(Error, Debug)]
pub enum CounterStoreError {
    #[error("Counter backend error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Counter backend unavailable: {0}")]
    Unavailable(String),
}

/// Expiring counter operations used by the rate limiter
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increments the counter, creating it at 1, and returns the new value
    async fn increment(&self, key: &str) -> Result<u64, CounterStoreError>;

    /// Sets the counter's time to live
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CounterStoreError>;

    /// Current value, or None if the counter is absent or expired
    async fn get(&self, key: &str) -> Result<Option<u64>, CounterStoreError>;

    /// Remaining time to live, or None if absent, expired, or unexpiring
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CounterStoreError>;

    /// Removes the counter
    async fn delete(&self, key: &str) -> Result<(), CounterStoreError>;
}

struct CounterEntry {
    value: u64,
    expires_at: Option<Instant>,
}

impl CounterEntry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory implementation of [`CounterStore`]
#[derive(Default)]
pub struct MemoryCounterStore {
    counters: Mutex<HashMap<String, CounterEntry>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, CounterEntry>>, CounterStoreError> {
        self.counters
            .lock()
            .map_err(|_| CounterStoreError::Unavailable("Counter lock poisoned".to_string()))
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str) -> Result<u64, CounterStoreError> {
        let mut counters = self.lock()?;
        let now = Instant::now();

        if counters.get(key).is_some_and(|e| e.expired(now)) {
            counters.remove(key);
        }

        let entry = counters.entry(key.to_string()).or_insert(CounterEntry {
            value: 0,
            expires_at: None,
        });
        entry.value += 1;
        Ok(entry.value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CounterStoreError> {
        let mut counters = self.lock()?;
        let now = Instant::now();

        if let Some(entry) = counters.get_mut(key) {
            if !entry.expired(now) {
                entry.expires_at = Some(now + ttl);
            }
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<u64>, CounterStoreError> {
        let counters = self.lock()?;
        let now = Instant::now();

        Ok(counters
            .get(key)
            .filter(|e| !e.expired(now))
            .map(|e| e.value))
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CounterStoreError> {
        let counters = self.lock()?;
        let now = Instant::now();

        Ok(counters
            .get(key)
            .filter(|e| !e.expired(now))
            .and_then(|e| e.expires_at)
            .map(|at| at - now))
    }

    async fn delete(&self, key: &str) -> Result<(), CounterStoreError> {
        self.lock()?.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_increment_starts_at_one() {
        let store = MemoryCounterStore::new();
        assert_eq!(store.increment("k").await.unwrap(), 1);
        assert_eq!(store.increment("k").await.unwrap(), 2);
        assert_eq!(store.increment("other").await.unwrap(), 1);
        assert_eq!(store.get("k").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_expired_counter_resets() {
        let store = MemoryCounterStore::new();
        store.increment("k").await.unwrap();
        store.expire("k", Duration::ZERO).await.unwrap();

        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.ttl("k").await.unwrap(), None);
        assert_eq!(store.increment("k").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ttl_reports_remaining_window() {
        let store = MemoryCounterStore::new();
        store.increment("k").await.unwrap();
        store.expire("k", Duration::from_secs(60)).await.unwrap();

        let remaining = store.ttl("k").await.unwrap().unwrap();
        assert!(remaining <= Duration::from_secs(60));
        assert!(remaining > Duration::from_secs(59));

        // No expiry was ever set for this key.
        store.increment("bare").await.unwrap();
        assert_eq!(store.ttl("bare").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_removes_counter() {
        let store = MemoryCounterStore::new();
        store.increment("k").await.unwrap();
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }
}
