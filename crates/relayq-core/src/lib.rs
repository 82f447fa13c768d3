//! RelayQ Core - Delivery pipeline for outbound messages
//!
//! This crate provides the core pipeline for RelayQ: input validation,
//! idempotent enqueueing, the delivery state machine with retry and
//! dead-letter handling, per-tenant rate limiting, and the delivery
//! worker that drives providers.

pub mod dispatch;
pub mod queue;
pub mod ratelimit;
pub mod validate;

pub use dispatch::{
    DeliveryOutcome, DeliveryWorker, LogProvider, Provider, StaticTierDirectory, TierDirectory,
};
pub use queue::{MessageQueue, RetryPolicy};
pub use ratelimit::{RateLimitDecision, RateLimiter};
