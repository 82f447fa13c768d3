//! Delivery Dispatcher - Claims due messages and drives a provider

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use relayq_common::config::{Config, DispatcherConfig};
use relayq_common::types::{TenantId, TrustTier};
use relayq_storage::Message;
use tokio::sync::Semaphore;
use tokio::time::{interval, Duration as TokioDuration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::queue::MessageQueue;
use crate::ratelimit::RateLimiter;

/// Result of a provider delivery attempt
#[derive(Debug)]
pub enum DeliveryOutcome {
    /// Accepted by the provider
    Sent,
    /// Failed in a way worth retrying
    TemporaryFailure { error: String },
    /// Failed for good; retrying cannot help
    PermanentFailure { error: String },
}

/// Transport that hands one message to an external provider
#[async_trait]
pub trait Provider: Send + Sync {
    async fn deliver(&self, message: &Message) -> DeliveryOutcome;
}

/// Provider that only logs, for development and tests
#[derive(Debug, Default)]
pub struct LogProvider;

#[async_trait]
impl Provider for LogProvider {
    async fn deliver(&self, message: &Message) -> DeliveryOutcome {
        info!(
            "Would deliver {} message {} to {}",
            message.channel, message.id, message.recipient
        );
        DeliveryOutcome::Sent
    }
}

/// Source of each tenant's trust tier
pub trait TierDirectory: Send + Sync {
    fn tier_for(&self, tenant_id: TenantId) -> Option<TrustTier>;
}

/// Fixed tier assignments loaded from configuration
#[derive(Debug, Default)]
pub struct StaticTierDirectory {
    tiers: HashMap<TenantId, TrustTier>,
}

impl StaticTierDirectory {
    /// Build from the `[tenants]` config table, skipping entries whose
    /// key is not a tenant id
    pub fn from_config(config: &Config) -> Self {
        let mut tiers = HashMap::new();
        for (tenant, tier) in &config.tenants {
            match tenant.parse::<Uuid>() {
                Ok(tenant_id) => {
                    tiers.insert(tenant_id, TrustTier::from_name(Some(tier)));
                }
                Err(e) => {
                    warn!("Ignoring tenant entry {:?}: {}", tenant, e);
                }
            }
        }
        Self { tiers }
    }
}

impl TierDirectory for StaticTierDirectory {
    fn tier_for(&self, tenant_id: TenantId) -> Option<TrustTier> {
        self.tiers.get(&tenant_id).copied()
    }
}

/// Delivery worker.
///
/// Each tick claims due messages up to `max_per_tick`, checks the
/// tenant's rate limit, and hands allowed messages to the provider
/// under a concurrency cap. Denied messages go back to the queue held
/// until their window resets.
pub struct DeliveryWorker {
    queue: Arc<MessageQueue>,
    limiter: Arc<RateLimiter>,
    tiers: Arc<dyn TierDirectory>,
    provider: Arc<dyn Provider>,
    concurrency: usize,
    max_per_tick: usize,
    poll_interval_ms: u64,
}

impl DeliveryWorker {
    /// Create a new delivery worker
    pub fn new(
        queue: Arc<MessageQueue>,
        limiter: Arc<RateLimiter>,
        tiers: Arc<dyn TierDirectory>,
        provider: Arc<dyn Provider>,
        config: &DispatcherConfig,
    ) -> Self {
        Self {
            queue,
            limiter,
            tiers,
            provider,
            concurrency: config.concurrency,
            max_per_tick: config.max_per_tick,
            poll_interval_ms: config.poll_interval_ms,
        }
    }

    /// Set the concurrency cap
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the per-tick claim limit
    pub fn with_max_per_tick(mut self, max_per_tick: usize) -> Self {
        self.max_per_tick = max_per_tick;
        self
    }

    /// Set the poll interval
    pub fn with_poll_interval_ms(mut self, poll_interval_ms: u64) -> Self {
        self.poll_interval_ms = poll_interval_ms;
        self
    }

    /// Run the delivery worker
    pub async fn run(&self) {
        let mut ticker = interval(TokioDuration::from_millis(self.poll_interval_ms));
        let semaphore = Arc::new(Semaphore::new(self.concurrency));

        info!(
            "Delivery worker started (concurrency: {}, max per tick: {}, interval: {}ms)",
            self.concurrency, self.max_per_tick, self.poll_interval_ms
        );

        loop {
            ticker.tick().await;

            if let Err(e) = self.process_due(&semaphore).await {
                error!("Error processing due messages: {}", e);
            }
        }
    }

    /// Claim and dispatch due messages, up to the per-tick limit
    async fn process_due(&self, semaphore: &Arc<Semaphore>) -> Result<()> {
        let mut handles = Vec::new();

        for _ in 0..self.max_per_tick {
            let Some(message) = self.queue.process_next().await? else {
                break;
            };

            let tier = self.tier_for(&message);
            let decision = self.limiter.check(message.tenant_id, tier).await;
            if !decision.allowed {
                debug!(
                    "Rate limit hit for tenant {}, holding message {} until {}",
                    message.tenant_id, message.id, decision.reset_at
                );
                self.queue
                    .release(message.id, Some(decision.reset_at))
                    .await?;
                continue;
            }

            let permit = semaphore.clone().acquire_owned().await?;
            let queue = self.queue.clone();
            let provider = self.provider.clone();

            let handle = tokio::spawn(async move {
                let outcome = provider.deliver(&message).await;
                Self::handle_outcome(&queue, &message, outcome).await;
                drop(permit);
            });

            handles.push(handle);
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Delivery task error: {}", e);
            }
        }

        Ok(())
    }

    fn tier_for(&self, message: &Message) -> TrustTier {
        match self.tiers.tier_for(message.tenant_id) {
            Some(tier) => tier,
            None => {
                warn!(
                    "No trust tier registered for tenant {}, treating as {}",
                    message.tenant_id,
                    TrustTier::PrivacySafe
                );
                TrustTier::PrivacySafe
            }
        }
    }

    /// Apply the outcome of a delivery attempt to the queue
    async fn handle_outcome(queue: &MessageQueue, message: &Message, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Sent => {
                if let Err(e) = queue.mark_sent(message.id).await {
                    error!("Failed to mark message {} as sent: {}", message.id, e);
                }
            }
            DeliveryOutcome::TemporaryFailure { error } => {
                warn!("Message {} temporary failure: {}", message.id, error);
                if let Err(e) = queue.mark_failed(message.id, &error).await {
                    error!("Failed to record failure for message {}: {}", message.id, e);
                }
            }
            DeliveryOutcome::PermanentFailure { error } => {
                error!("Message {} permanent failure: {}", message.id, error);
                if let Err(e) = queue.mark_failed_permanent(message.id, &error).await {
                    error!("Failed to record failure for message {}: {}", message.id, e);
                }
            }
        }
    }
}
