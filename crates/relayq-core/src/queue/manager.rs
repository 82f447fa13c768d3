//! Message queue - enqueue, delivery transitions, retry and dead letters

use std::sync::Arc;

use chrono::{DateTime, Utc};
use relayq_common::config::{Config, PricingConfig};
use relayq_common::types::{BatchId, Channel, MessageId, TenantId};
use relayq_common::{Error, Result};
use relayq_storage::{
    Batch, BatchInsertOutcome, BatchReceipt, BatchStatus, BatchStatusReport, EnqueueBatch,
    EnqueueMessage, EnqueueReceipt, InsertOutcome, Message, MessageStatus, QueueStats, QueueStore,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::queue::retry::RetryPolicy;
use crate::validate;

/// Tenant-facing queue operations over a [`QueueStore`] backend.
///
/// Validation, idempotency resolution, retry budgeting and dead-letter
/// classification live here; the store only applies guarded single-row
/// transitions.
pub struct MessageQueue {
    store: Arc<dyn QueueStore>,
    retry_policy: RetryPolicy,
    pricing: PricingConfig,
    max_batch_recipients: usize,
}

impl MessageQueue {
    /// Create a new message queue over the given store
    pub fn new(store: Arc<dyn QueueStore>, config: &Config) -> Self {
        Self {
            store,
            retry_policy: RetryPolicy::new(&config.retry),
            pricing: config.pricing.clone(),
            max_batch_recipients: config.queue.max_batch_recipients,
        }
    }

    /// Enqueue a single message.
    ///
    /// With an idempotency key, a replay returns the existing message
    /// unchanged. A replay against a message at rest in `failed` is a
    /// fresh send instead: the row is replaced in place with new content
    /// and a full retry budget.
    pub async fn enqueue_message(&self, input: EnqueueMessage) -> Result<EnqueueReceipt> {
        validate::validate_enqueue(&input)?;

        let now = Utc::now();
        let message = self.build_message(&input, now);

        match self.store.insert_message(message).await? {
            InsertOutcome::Created(message) => {
                info!(
                    "Enqueued message {} for tenant {}",
                    message.id, message.tenant_id
                );
                Ok(EnqueueReceipt {
                    message,
                    is_duplicate: false,
                })
            }
            InsertOutcome::Duplicate(existing) => self.resolve_duplicate(existing, &input).await,
        }
    }

    /// Enqueue one send request fanned out to a whole recipient list
    pub async fn enqueue_batch(&self, input: EnqueueBatch) -> Result<BatchReceipt> {
        validate::validate_batch(&input, self.max_batch_recipients)?;

        let now = Utc::now();
        let batch_id = Uuid::new_v4();
        let estimated_cost = self.estimate_cost(input.channel, &input.body, input.recipients.len());

        let batch = Batch {
            id: batch_id,
            tenant_id: input.tenant_id,
            idempotency_key: input.idempotency_key.clone(),
            channel: input.channel,
            status: initial_batch_status(input.scheduled_at, now),
            total_recipients: input.recipients.len() as i32,
            sent_count: 0,
            delivered_count: 0,
            failed_count: 0,
            estimated_cost,
            scheduled_at: input.scheduled_at,
            created_at: now,
            completed_at: None,
        };

        // Constituents carry no idempotency key of their own; the batch
        // row is the unit of replay.
        let status = initial_message_status(input.scheduled_at, now);
        let messages = input
            .recipients
            .iter()
            .map(|recipient| Message {
                id: Uuid::new_v4(),
                tenant_id: input.tenant_id,
                batch_id: Some(batch_id),
                idempotency_key: None,
                channel: input.channel,
                recipient: recipient.recipient.clone(),
                recipient_category: recipient.category.clone(),
                subject: input.subject.clone(),
                body: input.body.clone(),
                priority: input.priority,
                status,
                retry_count: 0,
                failure_reason: None,
                scheduled_at: input.scheduled_at,
                created_at: now,
                sent_at: None,
                delivered_at: None,
            })
            .collect();

        match self.store.insert_batch(batch, messages).await? {
            BatchInsertOutcome::Created(batch) => {
                info!(
                    "Enqueued batch {} with {} recipients for tenant {}",
                    batch.id, batch.total_recipients, batch.tenant_id
                );
                Ok(BatchReceipt {
                    batch,
                    is_duplicate: false,
                })
            }
            BatchInsertOutcome::Duplicate(existing) => {
                debug!("Idempotent replay of batch {}", existing.id);
                Ok(BatchReceipt {
                    batch: existing,
                    is_duplicate: true,
                })
            }
        }
    }

    /// Look up a single message
    pub async fn message_status(&self, id: MessageId) -> Result<Message> {
        self.require_message(id).await
    }

    /// Look up a batch with its derived progress metrics
    pub async fn batch_status(&self, id: BatchId) -> Result<BatchStatusReport> {
        let batch = self
            .store
            .get_batch(id)
            .await?
            .ok_or(Error::BatchNotFound(id))?;
        Ok(BatchStatusReport::from(batch))
    }

    /// Claim the next due message for delivery
    pub async fn process_next(&self) -> Result<Option<Message>> {
        let claimed = self.store.claim_next(Utc::now()).await?;
        if let Some(message) = &claimed {
            debug!("Claimed message {} for delivery", message.id);
        }
        Ok(claimed)
    }

    /// Apply an externally reported status transition, for example a
    /// provider receipt. Validates against the delivery state machine.
    /// Recording a failure leaves the retry budget untouched; requeueing
    /// a `failed` message is a manual retry under the same budget rules
    /// as `retry_failed`.
    pub async fn update_status(
        &self,
        id: MessageId,
        requested: MessageStatus,
        reason: Option<&str>,
    ) -> Result<Message> {
        let message = self.require_message(id).await?;
        if !message.status.can_transition_to(requested) {
            return Err(Error::InvalidStatusTransition {
                id,
                current: message.status.to_string(),
                requested: requested.to_string(),
            });
        }

        let now = Utc::now();
        let updated = match requested {
            MessageStatus::Processing => self.store.mark_processing(id).await?,
            MessageStatus::Sent => self.store.mark_sent(id, now).await?,
            MessageStatus::Delivered => self.store.mark_delivered(id, now).await?,
            MessageStatus::Failed => {
                let reason = reason.unwrap_or("Failure reported");
                self.store
                    .record_failure(id, message.status, None, reason)
                    .await?
            }
            MessageStatus::Queued => match message.status {
                MessageStatus::Processing => self.store.release_claim(id, None).await?,
                // The state machine only admits `queued` from
                // `processing` or `failed`; the failed path spends
                // retry budget and keeps dead letters quarantined.
                _ => return self.retry_failed(id).await,
            },
            // Messages are only ever scheduled at creation.
            MessageStatus::Scheduled => None,
        };

        match updated {
            Some(updated) => {
                info!("Message {} moved to {}", id, requested);
                Ok(updated)
            }
            None => Err(self.transition_conflict(id, requested).await),
        }
    }

    /// Record provider acceptance of a claimed message
    pub async fn mark_sent(&self, id: MessageId) -> Result<Message> {
        match self.store.mark_sent(id, Utc::now()).await? {
            Some(message) => {
                info!("Message {} accepted by provider", id);
                Ok(message)
            }
            None => Err(self.transition_conflict(id, MessageStatus::Sent).await),
        }
    }

    /// Record a delivery confirmation receipt for a sent message
    pub async fn mark_delivered(&self, id: MessageId) -> Result<Message> {
        match self.store.mark_delivered(id, Utc::now()).await? {
            Some(message) => {
                info!("Message {} delivered", id);
                Ok(message)
            }
            None => Err(self.transition_conflict(id, MessageStatus::Delivered).await),
        }
    }

    /// Record a delivery failure for a claimed message.
    ///
    /// Consumes one unit of retry budget: requeues with backoff while
    /// budget remains, dead-letters once it is exhausted.
    pub async fn mark_failed(&self, id: MessageId, reason: &str) -> Result<Message> {
        let message = self.require_message(id).await?;
        if message.status != MessageStatus::Processing {
            return Err(Error::InvalidStatusTransition {
                id,
                current: message.status.to_string(),
                requested: MessageStatus::Failed.to_string(),
            });
        }

        let attempts = message.retry_count + 1;
        if self.retry_policy.allows_retry(attempts) {
            let next_attempt_at = self.retry_policy.next_attempt_at(Utc::now(), attempts);
            match self
                .store
                .requeue_for_retry(id, attempts, next_attempt_at)
                .await?
            {
                Some(updated) => {
                    warn!(
                        "Message {} failed (attempt {}), retrying at {}: {}",
                        id, attempts, next_attempt_at, reason
                    );
                    Ok(updated)
                }
                None => Err(self.transition_conflict(id, MessageStatus::Queued).await),
            }
        } else {
            match self
                .store
                .record_failure(id, MessageStatus::Processing, Some(attempts), reason)
                .await?
            {
                Some(updated) => {
                    error!(
                        "Message {} exhausted its retry budget after {} attempts: {}",
                        id, attempts, reason
                    );
                    Ok(updated)
                }
                None => Err(self.transition_conflict(id, MessageStatus::Failed).await),
            }
        }
    }

    /// Record a permanent failure: the message dead-letters immediately
    /// regardless of remaining retry budget.
    pub async fn mark_failed_permanent(&self, id: MessageId, reason: &str) -> Result<Message> {
        let message = self.require_message(id).await?;
        if message.status != MessageStatus::Processing {
            return Err(Error::InvalidStatusTransition {
                id,
                current: message.status.to_string(),
                requested: MessageStatus::Failed.to_string(),
            });
        }

        let exhausted = self.retry_policy.max_attempts().max(message.retry_count);
        match self
            .store
            .record_failure(id, MessageStatus::Processing, Some(exhausted), reason)
            .await?
        {
            Some(updated) => {
                error!("Message {} failed permanently: {}", id, reason);
                Ok(updated)
            }
            None => Err(self.transition_conflict(id, MessageStatus::Failed).await),
        }
    }

    /// Manually retry a failed message that still has retry budget
    pub async fn retry_failed(&self, id: MessageId) -> Result<Message> {
        let message = self.require_message(id).await?;
        if message.status != MessageStatus::Failed {
            return Err(Error::InvalidStatusTransition {
                id,
                current: message.status.to_string(),
                requested: MessageStatus::Queued.to_string(),
            });
        }
        if !self.retry_policy.allows_retry(message.retry_count) {
            return Err(Error::RetryExhausted {
                id,
                retry_count: message.retry_count,
            });
        }

        let attempts = message.retry_count + 1;
        let next_attempt_at = self.retry_policy.next_attempt_at(Utc::now(), attempts);
        match self
            .store
            .requeue_failed(id, attempts, Some(next_attempt_at))
            .await?
        {
            Some(updated) => {
                info!("Retrying message {} (attempt {})", id, attempts);
                Ok(updated)
            }
            None => Err(self.transition_conflict(id, MessageStatus::Queued).await),
        }
    }

    /// Requeue a dead letter with a fresh retry budget, making it
    /// immediately eligible for delivery
    pub async fn reprocess_dead_letter(&self, id: MessageId) -> Result<Message> {
        let message = self.require_message(id).await?;
        if !message.is_dead_letter(self.retry_policy.max_attempts()) {
            return Err(Error::NotDeadLetter(id));
        }

        match self.store.requeue_failed(id, 0, None).await? {
            Some(updated) => {
                info!("Reprocessing dead letter {}", id);
                Ok(updated)
            }
            None => Err(self.transition_conflict(id, MessageStatus::Queued).await),
        }
    }

    /// Return a claimed message to the queue without consuming retry
    /// budget, optionally holding it back until `not_before`
    pub async fn release(
        &self,
        id: MessageId,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<Message> {
        match self.store.release_claim(id, not_before).await? {
            Some(updated) => {
                debug!("Released message {} back to the queue", id);
                Ok(updated)
            }
            None => Err(self.transition_conflict(id, MessageStatus::Queued).await),
        }
    }

    /// Message counts per status, optionally scoped to one tenant
    pub async fn stats(&self, tenant_id: Option<TenantId>) -> Result<QueueStats> {
        self.store
            .count_by_status(tenant_id, self.retry_policy.max_attempts())
            .await
    }

    /// All messages whose retry budget is exhausted, oldest first
    pub async fn dead_letters(&self) -> Result<Vec<Message>> {
        self.store
            .list_dead_letters(self.retry_policy.max_attempts())
            .await
    }

    fn build_message(&self, input: &EnqueueMessage, now: DateTime<Utc>) -> Message {
        Message {
            id: Uuid::new_v4(),
            tenant_id: input.tenant_id,
            batch_id: None,
            idempotency_key: input.idempotency_key.clone(),
            channel: input.channel,
            recipient: input.recipient.clone(),
            recipient_category: input.recipient_category.clone(),
            subject: input.subject.clone(),
            body: input.body.clone(),
            priority: input.priority,
            status: initial_message_status(input.scheduled_at, now),
            retry_count: 0,
            failure_reason: None,
            scheduled_at: input.scheduled_at,
            created_at: now,
            sent_at: None,
            delivered_at: None,
        }
    }

    /// Estimated cost of a batch before any delivery happens
    fn estimate_cost(&self, channel: Channel, body: &str, recipients: usize) -> f64 {
        let per_recipient = match channel {
            Channel::Email => self.pricing.email_unit_price,
            Channel::Sms => self.pricing.sms_segment_price * validate::sms_segments(body) as f64,
        };
        per_recipient * recipients as f64
    }

    async fn resolve_duplicate(
        &self,
        existing: Message,
        input: &EnqueueMessage,
    ) -> Result<EnqueueReceipt> {
        if existing.status != MessageStatus::Failed {
            debug!("Idempotent replay of message {}", existing.id);
            return Ok(EnqueueReceipt {
                message: existing,
                is_duplicate: true,
            });
        }

        // The previous send failed for good; this enqueue is a fresh
        // attempt under the same key and id.
        let mut replacement = self.build_message(input, Utc::now());
        replacement.id = existing.id;

        match self.store.replace_failed(existing.id, replacement).await? {
            Some(message) => {
                info!("Re-enqueued failed message {} as a fresh send", message.id);
                Ok(EnqueueReceipt {
                    message,
                    is_duplicate: false,
                })
            }
            None => {
                // Lost a race against a retry or reprocess; whatever the
                // row holds now is the replay answer.
                let message = self.require_message(existing.id).await?;
                Ok(EnqueueReceipt {
                    message,
                    is_duplicate: true,
                })
            }
        }
    }

    async fn require_message(&self, id: MessageId) -> Result<Message> {
        self.store
            .get_message(id)
            .await?
            .ok_or(Error::MessageNotFound(id))
    }

    /// Build the error for a guarded transition that updated no row: the
    /// message either changed status underneath us or does not exist.
    async fn transition_conflict(&self, id: MessageId, requested: MessageStatus) -> Error {
        match self.store.get_message(id).await {
            Ok(Some(current)) => Error::InvalidStatusTransition {
                id,
                current: current.status.to_string(),
                requested: requested.to_string(),
            },
            Ok(None) => Error::MessageNotFound(id),
            Err(e) => e,
        }
    }
}

/// `scheduled` only when the requested time is still in the future
fn initial_message_status(scheduled_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> MessageStatus {
    match scheduled_at {
        Some(at) if at > now => MessageStatus::Scheduled,
        _ => MessageStatus::Queued,
    }
}

fn initial_batch_status(scheduled_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> BatchStatus {
    match scheduled_at {
        Some(at) if at > now => BatchStatus::Scheduled,
        _ => BatchStatus::Queued,
    }
}
