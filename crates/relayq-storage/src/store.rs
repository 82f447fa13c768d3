//! Queue store trait - the narrow persistence interface for messages and batches

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relayq_common::types::{BatchId, MessageId, TenantId};
use relayq_common::Result;

use crate::models::{Batch, Message, MessageStatus, QueueStats};

/// Outcome of an idempotent message insert
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    /// A new row was created
    Created(Message),
    /// An existing row holds this (tenant, idempotency key) pair
    Duplicate(Message),
}

/// Outcome of an idempotent batch insert
#[derive(Debug, Clone)]
pub enum BatchInsertOutcome {
    Created(Batch),
    Duplicate(Batch),
}

/// Durable store for messages and batches.
///
/// Every method is a single atomic unit: conditional transitions apply
/// their batch-counter side effects (and batch status flips) together
/// with the message update, and concurrent callers racing on the same
/// row see exactly one winner. Transition methods return `Ok(None)` when
/// the row is missing or its current status fails the guard; callers
/// re-read to distinguish the two.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert a message. When it carries an idempotency key and a row
    /// for (tenant, key) already exists, no write happens and the
    /// existing row is returned instead.
    async fn insert_message(&self, message: Message) -> Result<InsertOutcome>;

    /// Insert a batch and all of its constituent messages in one atomic
    /// unit (all rows or none). Batch-level idempotency keys behave as
    /// in `insert_message`.
    async fn insert_batch(&self, batch: Batch, messages: Vec<Message>) -> Result<BatchInsertOutcome>;

    async fn get_message(&self, id: MessageId) -> Result<Option<Message>>;

    async fn get_batch(&self, id: BatchId) -> Result<Option<Batch>>;

    /// Claim the best eligible message: highest priority first, then
    /// earliest eligibility time, then earliest creation. The selected
    /// row transitions `queued`/`scheduled` -> `processing` in the same
    /// operation; two racing workers never claim the same row.
    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Message>>;

    /// `queued`/`scheduled` -> `processing` for one specific message,
    /// bypassing the claim ordering. Used for operator-driven status
    /// updates rather than dispatch.
    async fn mark_processing(&self, id: MessageId) -> Result<Option<Message>>;

    /// `processing` -> `sent`. The first arrival at `sent` stamps
    /// `sent_at` and increments the owning batch's sent counter.
    async fn mark_sent(&self, id: MessageId, now: DateTime<Utc>) -> Result<Option<Message>>;

    /// `sent` -> `delivered`, incrementing the owning batch's delivered
    /// counter.
    async fn mark_delivered(&self, id: MessageId, now: DateTime<Utc>) -> Result<Option<Message>>;

    /// Transition `expect` -> `failed` at rest, recording the reason and
    /// optionally overwriting the retry count. The owning batch's failed
    /// counter increments only when the message never reached `sent`.
    async fn record_failure(
        &self,
        id: MessageId,
        expect: MessageStatus,
        retry_count: Option<i32>,
        reason: &str,
    ) -> Result<Option<Message>>;

    /// `processing` -> `queued` after a transient failure: retry budget
    /// consumed, eligibility pushed to the computed next attempt time.
    async fn requeue_for_retry(
        &self,
        id: MessageId,
        retry_count: i32,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<Option<Message>>;

    /// `processing` -> `queued` without touching the retry budget:
    /// a released claim, optionally held back until `not_before`.
    async fn release_claim(
        &self,
        id: MessageId,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<Option<Message>>;

    /// `failed` -> `queued` with a caller-chosen retry count: manual
    /// retry (incremented) or dead-letter reprocessing (reset to 0).
    async fn requeue_failed(
        &self,
        id: MessageId,
        retry_count: i32,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<Option<Message>>;

    /// Replace a `failed` row in place with a fresh send carrying the
    /// same id and idempotency key. Fails the guard when the row has
    /// left `failed` in the meantime.
    async fn replace_failed(&self, id: MessageId, replacement: Message) -> Result<Option<Message>>;

    /// Message counts per status, optionally scoped to one tenant.
    /// `dead_letter_min` is the retry count at which `failed` rows are
    /// classified dead letters.
    async fn count_by_status(
        &self,
        tenant_id: Option<TenantId>,
        dead_letter_min: i32,
    ) -> Result<QueueStats>;

    /// All dead letters, oldest first
    async fn list_dead_letters(&self, dead_letter_min: i32) -> Result<Vec<Message>>;
}
