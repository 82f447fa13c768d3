//! Data models for RelayQ

use chrono::{DateTime, Utc};
use relayq_common::types::{BatchId, Channel, MessageId, Priority, TenantId};
use serde::{Deserialize, Serialize};

/// Message status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Queued,
    Scheduled,
    Processing,
    Sent,
    Delivered,
    Failed,
}

impl MessageStatus {
    /// Whether the state machine admits a transition to `next`.
    ///
    /// `queued`/`scheduled` -> `processing` (claim), `processing` ->
    /// `sent`/`failed`/`queued` (outcome or claim release), `sent` ->
    /// `delivered`/`failed` (receipt), `failed` -> `queued` (retry).
    /// `delivered` admits nothing.
    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Scheduled, Processing)
                | (Processing, Sent)
                | (Processing, Failed)
                | (Processing, Queued)
                | (Sent, Delivered)
                | (Sent, Failed)
                | (Failed, Queued)
        )
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageStatus::Queued => write!(f, "queued"),
            MessageStatus::Scheduled => write!(f, "scheduled"),
            MessageStatus::Processing => write!(f, "processing"),
            MessageStatus::Sent => write!(f, "sent"),
            MessageStatus::Delivered => write!(f, "delivered"),
            MessageStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(MessageStatus::Queued),
            "scheduled" => Ok(MessageStatus::Scheduled),
            "processing" => Ok(MessageStatus::Processing),
            "sent" => Ok(MessageStatus::Sent),
            "delivered" => Ok(MessageStatus::Delivered),
            "failed" => Ok(MessageStatus::Failed),
            _ => Err(format!("Invalid message status: {}", s)),
        }
    }
}

/// Batch status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Queued,
    Scheduled,
    Processing,
    Completed,
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchStatus::Queued => write!(f, "queued"),
            BatchStatus::Scheduled => write!(f, "scheduled"),
            BatchStatus::Processing => write!(f, "processing"),
            BatchStatus::Completed => write!(f, "completed"),
        }
    }
}

impl std::str::FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(BatchStatus::Queued),
            "scheduled" => Ok(BatchStatus::Scheduled),
            "processing" => Ok(BatchStatus::Processing),
            "completed" => Ok(BatchStatus::Completed),
            _ => Err(format!("Invalid batch status: {}", s)),
        }
    }
}

/// Message model - a single outbound send request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub tenant_id: TenantId,
    pub batch_id: Option<BatchId>,
    pub idempotency_key: Option<String>,
    pub channel: Channel,
    /// Opaque recipient token, never a raw contact address
    pub recipient: String,
    pub recipient_category: String,
    pub subject: Option<String>,
    pub body: String,
    pub priority: Priority,
    pub status: MessageStatus,
    pub retry_count: i32,
    /// Present iff the message is at rest in `failed`
    pub failure_reason: Option<String>,
    /// Not-before time: future delivery or the next retry attempt
    pub scheduled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// First provider acceptance; also marks the sent-counter contribution
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Whether the message is eligible for claiming at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            MessageStatus::Queued | MessageStatus::Scheduled => {
                self.scheduled_at.map_or(true, |at| at <= now)
            }
            _ => false,
        }
    }

    /// Time the message becomes eligible, for dispatch ordering
    pub fn eligible_at(&self) -> DateTime<Utc> {
        self.scheduled_at.unwrap_or(self.created_at)
    }

    /// Dead letter: at rest in `failed` with the retry budget exhausted
    pub fn is_dead_letter(&self, max_attempts: i32) -> bool {
        self.status == MessageStatus::Failed && self.retry_count >= max_attempts
    }

    /// Terminal: delivered, or dead-lettered
    pub fn is_terminal(&self, max_attempts: i32) -> bool {
        self.status == MessageStatus::Delivered || self.is_dead_letter(max_attempts)
    }
}

/// Batch model - a fan-out of one send request to N recipients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub tenant_id: TenantId,
    pub idempotency_key: Option<String>,
    pub channel: Channel,
    pub status: BatchStatus,
    pub total_recipients: i32,
    pub sent_count: i32,
    pub delivered_count: i32,
    pub failed_count: i32,
    pub estimated_cost: f64,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Batch {
    /// Fraction of constituents that reached `sent` or came to rest in
    /// `failed`. Not capped: dead-letter reprocessing can push the sum
    /// past the recipient count, so display layers must clamp.
    pub fn progress(&self) -> f64 {
        if self.total_recipients == 0 {
            0.0
        } else {
            (self.sent_count + self.failed_count) as f64 / self.total_recipients as f64
        }
    }

    /// delivered / sent; 0 when nothing has been sent
    pub fn delivery_rate(&self) -> f64 {
        if self.sent_count == 0 {
            0.0
        } else {
            self.delivered_count as f64 / self.sent_count as f64
        }
    }

    /// Whether every constituent has been accounted for
    pub fn is_complete(&self) -> bool {
        self.sent_count + self.failed_count >= self.total_recipients
    }
}

/// Single-message enqueue input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueMessage {
    pub tenant_id: TenantId,
    pub channel: Channel,
    pub recipient: String,
    pub recipient_category: String,
    pub subject: Option<String>,
    pub body: String,
    #[serde(default)]
    pub priority: Priority,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
}

/// One recipient of a batch enqueue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRecipient {
    pub recipient: String,
    pub category: String,
}

/// Batch enqueue input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueBatch {
    pub tenant_id: TenantId,
    pub channel: Channel,
    pub recipients: Vec<BatchRecipient>,
    pub subject: Option<String>,
    pub body: String,
    #[serde(default)]
    pub priority: Priority,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
}

/// Result of a single-message enqueue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueReceipt {
    pub message: Message,
    /// True when an existing row for (tenant, key) was returned unchanged
    pub is_duplicate: bool,
}

/// Result of a batch enqueue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReceipt {
    pub batch: Batch,
    pub is_duplicate: bool,
}

/// Batch status projection with derived metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchStatusReport {
    #[serde(flatten)]
    pub batch: Batch,
    pub progress: f64,
    pub delivery_rate: f64,
}

impl From<Batch> for BatchStatusReport {
    fn from(batch: Batch) -> Self {
        let progress = batch.progress();
        let delivery_rate = batch.delivery_rate();
        Self {
            batch,
            progress,
            delivery_rate,
        }
    }
}

/// Per-status message counts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: i64,
    pub scheduled: i64,
    pub processing: i64,
    pub sent: i64,
    pub delivered: i64,
    pub failed: i64,
    /// Subset of `failed` whose retry budget is exhausted
    pub dead_letter: i64,
}
