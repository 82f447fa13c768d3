//! RelayQ Storage - Queue and counter storage abstraction
//!
//! This crate provides storage abstraction for RelayQ,
//! supporting PostgreSQL, Redis, and in-memory backends.

pub mod counter;
pub mod db;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod redis_counter;
pub mod store;

pub use counter::{CounterStore, CounterStoreError, MemoryCounterStore};
pub use db::DatabasePool;
pub use memory::MemoryQueueStore;
pub use models::*;
pub use postgres::PostgresQueueStore;
pub use redis_counter::RedisCounterStore;
pub use store::{BatchInsertOutcome, InsertOutcome, QueueStore};
