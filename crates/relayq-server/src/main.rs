//! RelayQ - Delivery server entry point

use std::sync::Arc;

use anyhow::Result;
use relayq_common::config::{Config, LoggingConfig};
use relayq_core::{DeliveryWorker, LogProvider, MessageQueue, RateLimiter, StaticTierDirectory};
use relayq_storage::{
    CounterStore, DatabasePool, MemoryCounterStore, MemoryQueueStore, PostgresQueueStore,
    QueueStore, RedisCounterStore,
};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration before logging so the log format is honored
    let config = Config::load()?;
    init_logging(&config.logging);

    info!("Starting RelayQ delivery server...");

    let store = build_queue_store(&config).await?;
    let counters = build_counter_store(&config).await?;

    let queue = Arc::new(MessageQueue::new(store, &config));
    let limiter = Arc::new(RateLimiter::new(counters, config.rate_limit.clone()));
    let tiers = Arc::new(StaticTierDirectory::from_config(&config));
    info!("Serving {} registered tenants", config.tenants.len());

    // Start delivery worker
    let worker = Arc::new(DeliveryWorker::new(
        queue.clone(),
        limiter.clone(),
        tiers,
        Arc::new(LogProvider),
        &config.dispatcher,
    ));
    let worker_handle = {
        let worker = worker.clone();
        tokio::spawn(async move {
            worker.run().await;
        })
    };

    info!("RelayQ server started successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    worker_handle.abort();

    info!("RelayQ server shutdown complete");

    Ok(())
}

/// Select the queue store backend from configuration
async fn build_queue_store(config: &Config) -> Result<Arc<dyn QueueStore>> {
    match config.database.backend.as_str() {
        "memory" => {
            info!("Using in-memory queue store");
            Ok(Arc::new(MemoryQueueStore::new()))
        }
        _ => {
            // The pool rejects unknown backends with a config error
            let pool = DatabasePool::new(&config.database).await?;
            pool.health_check().await?;
            info!("Database connection established");

            pool.migrate().await?;
            info!("Database migrations completed");

            Ok(Arc::new(PostgresQueueStore::new(pool)))
        }
    }
}

/// Select the rate limit counter backend from configuration
async fn build_counter_store(config: &Config) -> Result<Arc<dyn CounterStore>> {
    match &config.redis {
        Some(redis) => {
            let store = RedisCounterStore::connect(&redis.url).await?;
            Ok(Arc::new(store))
        }
        None => {
            info!("Using in-memory rate limit counters");
            Ok(Arc::new(MemoryCounterStore::new()))
        }
    }
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},relayq=debug", config.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
