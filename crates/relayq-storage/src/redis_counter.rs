//! Redis counter store
//!
//! Backs the rate limiter with Redis so windows are shared across
//! dispatcher instances. Commands match the in-memory semantics:
//! INCR, PEXPIRE, GET, PTTL, DEL.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Client;
use tracing::info;

use crate::counter::{CounterStore, CounterStoreError};

/// Redis implementation of [`CounterStore`]
pub struct RedisCounterStore {
    conn: MultiplexedConnection,
}

impl RedisCounterStore {
    /// Create a new RedisCounterStore and connect to Redis.
    pub async fn connect(url: &str) -> Result<Self, CounterStoreError> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!("Connected to Redis counter store");
        Ok(Self { conn })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str) -> Result<u64, CounterStoreError> {
        let value: u64 = redis::cmd("INCR")
            .arg(key)
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CounterStoreError> {
        let _: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl.as_millis() as i64)
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<u64>, CounterStoreError> {
        let value: Option<u64> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(value)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CounterStoreError> {
        // PTTL returns -2 for a missing key and -1 for a key with no expiry.
        let millis: i64 = redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut self.conn.clone())
            .await?;
        if millis < 0 {
            return Ok(None);
        }
        Ok(Some(Duration::from_millis(millis as u64)))
    }

    async fn delete(&self, key: &str) -> Result<(), CounterStoreError> {
        let _: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(())
    }
}
