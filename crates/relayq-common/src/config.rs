//! Configuration for RelayQ

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::TrustTier;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Redis configuration for the rate-limit counter store.
    /// When absent, counters are kept in process memory.
    pub redis: Option<RedisConfig>,

    /// Queue configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// Retry configuration
    #[serde(default)]
    pub retry: RetryConfig,

    /// Rate limiter configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Channel pricing configuration
    #[serde(default)]
    pub pricing: PricingConfig,

    /// Dispatcher configuration
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Tenant id -> trust tier name, consulted before dispatch
    #[serde(default)]
    pub tenants: HashMap<String, String>,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database backend: "memory" or "postgres"
    #[serde(default = "default_db_backend")]
    pub backend: String,

    /// Database URL (for postgres)
    pub url: Option<String>,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: default_db_backend(),
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
        }
    }
}

fn default_db_backend() -> String {
    "memory".to_string()
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    5
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis URL
    pub url: String,
}

/// Queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum recipients per batch
    #[serde(default = "default_max_batch_recipients")]
    pub max_batch_recipients: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_batch_recipients: default_max_batch_recipients(),
        }
    }
}

fn default_max_batch_recipients() -> usize {
    10_000
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum automatic delivery attempts before dead-lettering
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,

    /// Base backoff delay in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff delay ceiling in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Uniform jitter factor applied to each delay (0.1 = up to 10%)
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

fn default_max_attempts() -> i32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_jitter() -> f64 {
    0.1
}

/// Rate limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Fixed window length in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Per-tier request thresholds
    #[serde(default)]
    pub tiers: TierLimits,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            tiers: TierLimits::default(),
        }
    }
}

fn default_window_ms() -> u64 {
    60_000
}

/// Requests allowed per window, by trust tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierLimits {
    #[serde(default = "default_privacy_safe_limit")]
    pub privacy_safe: u64,

    #[serde(default = "default_selective_limit")]
    pub selective: u64,

    #[serde(default = "default_full_access_limit")]
    pub full_access: u64,
}

impl TierLimits {
    /// Threshold applied for the given tier
    pub fn limit_for(&self, tier: TrustTier) -> u64 {
        match tier {
            TrustTier::PrivacySafe => self.privacy_safe,
            TrustTier::Selective => self.selective,
            TrustTier::FullAccess => self.full_access,
        }
    }
}

impl Default for TierLimits {
    fn default() -> Self {
        Self {
            privacy_safe: default_privacy_safe_limit(),
            selective: default_selective_limit(),
            full_access: default_full_access_limit(),
        }
    }
}

fn default_privacy_safe_limit() -> u64 {
    100
}

fn default_selective_limit() -> u64 {
    500
}

fn default_full_access_limit() -> u64 {
    1_000
}

/// Channel pricing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Unit price per email message
    #[serde(default = "default_email_unit_price")]
    pub email_unit_price: f64,

    /// Unit price per SMS segment
    #[serde(default = "default_sms_segment_price")]
    pub sms_segment_price: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            email_unit_price: default_email_unit_price(),
            sms_segment_price: default_sms_segment_price(),
        }
    }
}

fn default_email_unit_price() -> f64 {
    0.0004
}

fn default_sms_segment_price() -> f64 {
    0.0075
}

/// Dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Poll interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Maximum concurrent deliveries
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Maximum messages claimed per poll tick
    #[serde(default = "default_max_per_tick")]
    pub max_per_tick: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            concurrency: default_concurrency(),
            max_per_tick: default_max_per_tick(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_concurrency() -> usize {
    4
}

fn default_max_per_tick() -> usize {
    10
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Load configuration from environment and file.
    ///
    /// Checks `RELAYQ_CONFIG`, then default locations; falls back to
    /// built-in defaults (in-memory backends) when no file exists.
    pub fn load() -> crate::Result<Self> {
        if let Ok(path) = std::env::var("RELAYQ_CONFIG") {
            return Self::from_file(std::path::Path::new(&path));
        }

        let paths = [
            std::path::PathBuf::from("./config.toml"),
            std::path::PathBuf::from("/etc/relayq/config.toml"),
        ];

        for path in paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Ok(Self::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.database.backend, "memory");
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay_ms, 1_000);
        assert_eq!(config.rate_limit.window_ms, 60_000);
        assert_eq!(config.queue.max_batch_recipients, 10_000);
        assert!(config.redis.is_none());
    }

    #[test]
    fn test_tier_limits() {
        let limits = TierLimits::default();
        assert_eq!(limits.limit_for(TrustTier::PrivacySafe), 100);
        assert_eq!(limits.limit_for(TrustTier::Selective), 500);
        assert_eq!(limits.limit_for(TrustTier::FullAccess), 1_000);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[database]
backend = "postgres"
url = "postgres://localhost/relayq"

[redis]
url = "redis://127.0.0.1:6379"

[retry]
max_attempts = 5
base_delay_ms = 500

[rate_limit]
window_ms = 30000

[rate_limit.tiers]
privacy_safe = 50

[tenants]
"550e8400-e29b-41d4-a716-446655440000" = "FULL_ACCESS"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.database.backend, "postgres");
        assert_eq!(config.redis.unwrap().url, "redis://127.0.0.1:6379");
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.max_delay_ms, 60_000);
        assert_eq!(config.rate_limit.window_ms, 30_000);
        assert_eq!(config.rate_limit.tiers.privacy_safe, 50);
        assert_eq!(config.rate_limit.tiers.selective, 500);
        assert_eq!(
            config.tenants.get("550e8400-e29b-41d4-a716-446655440000"),
            Some(&"FULL_ACCESS".to_string())
        );
    }
}
