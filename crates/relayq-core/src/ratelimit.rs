//! Rate Limiter - Per-tenant fixed-window send quotas

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use relayq_common::config::RateLimitConfig;
use relayq_common::types::{TenantId, TrustTier};
use relayq_storage::{CounterStore, CounterStoreError};
use tracing::{debug, error};

/// Outcome of a rate limit check
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Window capacity for the tenant's trust tier
    pub limit: u64,
    /// Sends left in the current window
    pub remaining: u64,
    /// When the current window closes
    pub reset_at: DateTime<Utc>,
    /// How long a denied caller should wait; `None` when allowed
    pub retry_after: Option<Duration>,
}

impl RateLimitDecision {
    /// Standard rate limit response headers. `Retry-After` appears only
    /// on denials, rounded up to whole seconds.
    pub fn headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit".to_string(), self.limit.to_string()),
            (
                "X-RateLimit-Remaining".to_string(),
                self.remaining.to_string(),
            ),
            (
                "X-RateLimit-Reset".to_string(),
                self.reset_at.timestamp().to_string(),
            ),
        ];
        if let Some(retry_after) = self.retry_after {
            let seconds = retry_after.as_millis().div_ceil(1000).max(1);
            headers.push(("Retry-After".to_string(), seconds.to_string()));
        }
        headers
    }
}

/// Fixed-window rate limiter keyed per tenant.
///
/// Counters live in a [`CounterStore`]. A store outage never blocks
/// sending: the limiter logs the failure and answers as if the tenant
/// had a full window.
pub struct RateLimiter {
    counters: Arc<dyn CounterStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// Create a new rate limiter
    pub fn new(counters: Arc<dyn CounterStore>, config: RateLimitConfig) -> Self {
        Self { counters, config }
    }

    /// Consume one unit of the tenant's quota.
    ///
    /// The first hit of a window arms its expiry, so window boundaries
    /// align to the first send rather than to wall-clock minutes.
    pub async fn check(&self, tenant_id: TenantId, tier: TrustTier) -> RateLimitDecision {
        let limit = self.config.tiers.limit_for(tier);
        let key = Self::key(tenant_id);

        let count = match self.counters.increment(&key).await {
            Ok(count) => count,
            Err(e) => {
                error!("Rate limit counter unavailable, failing open: {}", e);
                return self.open_decision(limit);
            }
        };

        if count == 1 {
            if let Err(e) = self.counters.expire(&key, self.window()).await {
                error!(
                    "Failed to arm rate limit window for tenant {}, failing open: {}",
                    tenant_id, e
                );
                return self.open_decision(limit);
            }
        }

        let allowed = count <= limit;

        // A failed TTL read only degrades the reset estimate; a
        // successful read with no expiry means the window never armed.
        let ttl = match self.counters.ttl(&key).await {
            Ok(ttl) => ttl,
            Err(e) => {
                error!(
                    "Failed to read rate limit window for tenant {}: {}",
                    tenant_id, e
                );
                Some(self.window())
            }
        };

        if !allowed && ttl.is_none() {
            // An unexpiring counter can only grow and would deny the
            // tenant forever. Clear it and let this send through as the
            // start of a fresh window.
            if let Err(e) = self.counters.delete(&key).await {
                error!("Failed to clear stuck rate limit counter {}: {}", key, e);
            }
            return self.open_decision(limit);
        }

        let reset_at = self.window_end(Utc::now(), ttl);
        if allowed {
            RateLimitDecision {
                allowed: true,
                limit,
                remaining: limit.saturating_sub(count),
                reset_at,
                retry_after: None,
            }
        } else {
            debug!(
                "Rate limit hit for tenant {}: {} > {}",
                tenant_id, count, limit
            );
            RateLimitDecision {
                allowed: false,
                limit,
                remaining: 0,
                reset_at,
                retry_after: Some(ttl.unwrap_or_else(|| self.window())),
            }
        }
    }

    /// Report the tenant's current window without consuming quota
    pub async fn status(&self, tenant_id: TenantId, tier: TrustTier) -> RateLimitDecision {
        let limit = self.config.tiers.limit_for(tier);
        let key = Self::key(tenant_id);

        let count = match self.counters.get(&key).await {
            Ok(count) => count.unwrap_or(0),
            Err(e) => {
                error!("Rate limit counter unavailable, failing open: {}", e);
                return self.open_decision(limit);
            }
        };

        let ttl = self.read_ttl(&key, tenant_id).await;
        let allowed = count < limit;
        RateLimitDecision {
            allowed,
            limit,
            remaining: limit.saturating_sub(count),
            reset_at: self.window_end(Utc::now(), ttl),
            retry_after: (!allowed).then(|| ttl.unwrap_or_else(|| self.window())),
        }
    }

    /// Drop the tenant's current window, restoring full quota
    pub async fn reset(&self, tenant_id: TenantId) -> Result<(), CounterStoreError> {
        self.counters.delete(&Self::key(tenant_id)).await
    }

    fn key(tenant_id: TenantId) -> String {
        format!("ratelimit:{}", tenant_id)
    }

    fn window(&self) -> Duration {
        Duration::from_millis(self.config.window_ms)
    }

    fn window_end(&self, now: DateTime<Utc>, ttl: Option<Duration>) -> DateTime<Utc> {
        let remaining = ttl.unwrap_or_else(|| self.window());
        now + chrono::Duration::milliseconds(remaining.as_millis() as i64)
    }

    async fn read_ttl(&self, key: &str, tenant_id: TenantId) -> Option<Duration> {
        match self.counters.ttl(key).await {
            Ok(ttl) => ttl,
            Err(e) => {
                error!(
                    "Failed to read rate limit window for tenant {}: {}",
                    tenant_id, e
                );
                None
            }
        }
    }

    /// The answer given when the counter backend cannot be trusted
    fn open_decision(&self, limit: u64) -> RateLimitDecision {
        RateLimitDecision {
            allowed: true,
            limit,
            remaining: limit,
            reset_at: self.window_end(Utc::now(), None),
            retry_after: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use relayq_common::config::TierLimits;
    use relayq_storage::MemoryCounterStore;
    use uuid::Uuid;

    /// Counter store whose backend is permanently down
    struct FailingCounterStore;

    #[async_trait]
    impl CounterStore for FailingCounterStore {
        async fn increment(&self, _key: &str) -> Result<u64, CounterStoreError> {
            Err(CounterStoreError::Unavailable("down".to_string()))
        }

        async fn expire(&self, _key: &str, _ttl: Duration) -> Result<(), CounterStoreError> {
            Err(CounterStoreError::Unavailable("down".to_string()))
        }

        async fn get(&self, _key: &str) -> Result<Option<u64>, CounterStoreError> {
            Err(CounterStoreError::Unavailable("down".to_string()))
        }

        async fn ttl(&self, _key: &str) -> Result<Option<Duration>, CounterStoreError> {
            Err(CounterStoreError::Unavailable("down".to_string()))
        }

        async fn delete(&self, _key: &str) -> Result<(), CounterStoreError> {
            Err(CounterStoreError::Unavailable("down".to_string()))
        }
    }

    fn config(window_ms: u64, privacy_safe: u64, selective: u64, full_access: u64) -> RateLimitConfig {
        RateLimitConfig {
            window_ms,
            tiers: TierLimits {
                privacy_safe,
                selective,
                full_access,
            },
        }
    }

    fn limiter(config: RateLimitConfig) -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryCounterStore::new()), config)
    }

    #[tokio::test]
    async fn test_counts_down_then_denies() {
        let limiter = limiter(config(60_000, 3, 5, 10));
        let tenant = Uuid::new_v4();

        for expected_remaining in [2, 1, 0] {
            let decision = limiter.check(tenant, TrustTier::PrivacySafe).await;
            assert!(decision.allowed);
            assert_eq!(decision.limit, 3);
            assert_eq!(decision.remaining, expected_remaining);
            assert!(decision.retry_after.is_none());
        }

        let denied = limiter.check(tenant, TrustTier::PrivacySafe).await;
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        let retry_after = denied.retry_after.unwrap();
        assert!(retry_after > Duration::ZERO);
        assert!(retry_after <= Duration::from_millis(60_000));
    }

    #[tokio::test]
    async fn test_tiers_share_one_counter_per_tenant() {
        let limiter = limiter(config(60_000, 1, 5, 10));
        let tenant = Uuid::new_v4();
        let other = Uuid::new_v4();

        assert!(limiter.check(tenant, TrustTier::PrivacySafe).await.allowed);
        assert!(!limiter.check(tenant, TrustTier::PrivacySafe).await.allowed);

        // A higher tier sees the same count against its own limit
        let decision = limiter.check(tenant, TrustTier::Selective).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 2);

        // Other tenants are unaffected
        assert!(limiter.check(other, TrustTier::PrivacySafe).await.allowed);
    }

    #[tokio::test]
    async fn test_window_expiry_restores_quota() {
        // A zero-length window expires before the next check
        let limiter = limiter(config(0, 1, 1, 1));
        let tenant = Uuid::new_v4();

        assert!(limiter.check(tenant, TrustTier::PrivacySafe).await.allowed);
        assert!(limiter.check(tenant, TrustTier::PrivacySafe).await.allowed);
    }

    #[tokio::test]
    async fn test_fails_open_when_backend_is_down() {
        let limiter = RateLimiter::new(Arc::new(FailingCounterStore), config(60_000, 5, 5, 5));
        let tenant = Uuid::new_v4();

        let decision = limiter.check(tenant, TrustTier::PrivacySafe).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 5);
        assert!(decision.retry_after.is_none());

        let status = limiter.status(tenant, TrustTier::PrivacySafe).await;
        assert!(status.allowed);
        assert_eq!(status.remaining, 5);
    }

    #[tokio::test]
    async fn test_status_does_not_consume_quota() {
        let limiter = limiter(config(60_000, 2, 2, 2));
        let tenant = Uuid::new_v4();

        limiter.check(tenant, TrustTier::PrivacySafe).await;
        let status = limiter.status(tenant, TrustTier::PrivacySafe).await;
        assert!(status.allowed);
        assert_eq!(status.remaining, 1);

        let again = limiter.status(tenant, TrustTier::PrivacySafe).await;
        assert_eq!(again.remaining, 1);
    }

    #[tokio::test]
    async fn test_reset_restores_quota() {
        let limiter = limiter(config(60_000, 1, 1, 1));
        let tenant = Uuid::new_v4();

        assert!(limiter.check(tenant, TrustTier::PrivacySafe).await.allowed);
        assert!(!limiter.check(tenant, TrustTier::PrivacySafe).await.allowed);

        limiter.reset(tenant).await.unwrap();
        assert!(limiter.check(tenant, TrustTier::PrivacySafe).await.allowed);
    }

    #[tokio::test]
    async fn test_stuck_counter_without_expiry_recovers() {
        let counters = Arc::new(MemoryCounterStore::new());
        let limiter = RateLimiter::new(counters.clone(), config(60_000, 2, 2, 2));
        let tenant = Uuid::new_v4();

        // Simulate a crash between INCR and PEXPIRE: the counter is
        // over the limit but no window was ever armed.
        let key = format!("ratelimit:{}", tenant);
        for _ in 0..3 {
            counters.increment(&key).await.unwrap();
        }

        let decision = limiter.check(tenant, TrustTier::PrivacySafe).await;
        assert!(decision.allowed);

        // The stuck counter is gone; the next window counts normally
        assert_eq!(counters.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_headers_expose_the_window() {
        let limiter = limiter(config(60_000, 1, 1, 1));
        let tenant = Uuid::new_v4();

        let decision = limiter.check(tenant, TrustTier::PrivacySafe).await;
        let headers = decision.headers();
        assert!(headers.iter().any(|(k, v)| k == "X-RateLimit-Limit" && v == "1"));
        assert!(headers.iter().any(|(k, v)| k == "X-RateLimit-Remaining" && v == "0"));
        assert!(headers.iter().any(|(k, _)| k == "X-RateLimit-Reset"));
        assert!(!headers.iter().any(|(k, _)| k == "Retry-After"));

        let denied = limiter.check(tenant, TrustTier::PrivacySafe).await;
        let headers = denied.headers();
        let retry_after = headers
            .iter()
            .find(|(k, _)| k == "Retry-After")
            .map(|(_, v)| v.clone())
            .unwrap();
        assert!(retry_after.parse::<u64>().unwrap() >= 1);
    }
}
