//! Queue Module - Enqueueing, delivery state machine and retry handling

mod manager;
mod retry;

pub use manager::MessageQueue;
pub use retry::RetryPolicy;
