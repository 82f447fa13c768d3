//! Common types for RelayQ

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for tenants
pub type TenantId = Uuid;

/// Unique identifier for messages
pub type MessageId = Uuid;

/// Unique identifier for batches
pub type BatchId = Uuid;

/// Outbound delivery channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Channel {
    Email,
    Sms,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Email => write!(f, "EMAIL"),
            Channel::Sms => write!(f, "SMS"),
        }
    }
}

impl std::str::FromStr for Channel {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "EMAIL" => Ok(Channel::Email),
            "SMS" => Ok(Channel::Sms),
            _ => Err(crate::error::ValidationError::InvalidChannel(s.to_string()).into()),
        }
    }
}

/// Dispatch priority, ordered by precedence (High dispatches first)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::High => write!(f, "HIGH"),
            Priority::Normal => write!(f, "NORMAL"),
            Priority::Low => write!(f, "LOW"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "HIGH" => Ok(Priority::High),
            "NORMAL" => Ok(Priority::Normal),
            "LOW" => Ok(Priority::Low),
            _ => Err(format!("Invalid priority: {}", s)),
        }
    }
}

/// Per-tenant trust tier, determining the rate-limit threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrustTier {
    PrivacySafe,
    Selective,
    FullAccess,
}

impl Default for TrustTier {
    fn default() -> Self {
        TrustTier::PrivacySafe
    }
}

impl TrustTier {
    /// Resolve a raw tier name to a tier.
    ///
    /// This is the one boundary where tier names are normalized:
    /// matching is case-insensitive, and a missing or unknown name
    /// collapses to `PrivacySafe`.
    pub fn from_name(name: Option<&str>) -> Self {
        name.and_then(|s| s.parse().ok()).unwrap_or_default()
    }
}

impl std::fmt::Display for TrustTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrustTier::PrivacySafe => write!(f, "PRIVACY_SAFE"),
            TrustTier::Selective => write!(f, "SELECTIVE"),
            TrustTier::FullAccess => write!(f, "FULL_ACCESS"),
        }
    }
}

impl std::str::FromStr for TrustTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PRIVACY_SAFE" => Ok(TrustTier::PrivacySafe),
            "SELECTIVE" => Ok(TrustTier::Selective),
            "FULL_ACCESS" => Ok(TrustTier::FullAccess),
            _ => Err(format!("Invalid trust tier: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_roundtrip() {
        assert_eq!("EMAIL".parse::<Channel>().unwrap(), Channel::Email);
        assert_eq!("sms".parse::<Channel>().unwrap(), Channel::Sms);
        assert_eq!(Channel::Email.to_string(), "EMAIL");
        assert!("FAX".parse::<Channel>().is_err());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Normal < Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_tier_from_name() {
        assert_eq!(TrustTier::from_name(Some("FULL_ACCESS")), TrustTier::FullAccess);
        assert_eq!(TrustTier::from_name(Some("full_access")), TrustTier::FullAccess);
        assert_eq!(TrustTier::from_name(Some("Selective")), TrustTier::Selective);
        assert_eq!(TrustTier::from_name(Some("gold")), TrustTier::PrivacySafe);
        assert_eq!(TrustTier::from_name(None), TrustTier::PrivacySafe);
    }

    #[test]
    fn test_tier_display() {
        assert_eq!(TrustTier::PrivacySafe.to_string(), "PRIVACY_SAFE");
        assert_eq!(TrustTier::FullAccess.to_string(), "FULL_ACCESS");
    }
}
