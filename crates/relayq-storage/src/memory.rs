//! In-memory queue store
//!
//! Mutex-guarded maps; every trait method runs under one lock
//! acquisition, which is what makes each of them atomic. Used by tests
//! and single-node runs.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relayq_common::types::{BatchId, MessageId, TenantId};
use relayq_common::{Error, Result};

use crate::models::{Batch, BatchStatus, Message, MessageStatus, QueueStats};
use crate::store::{BatchInsertOutcome, InsertOutcome, QueueStore};

#[derive(Default)]
struct Inner {
    messages: HashMap<MessageId, Message>,
    batches: HashMap<BatchId, Batch>,
    message_keys: HashMap<(TenantId, String), MessageId>,
    batch_keys: HashMap<(TenantId, String), BatchId>,
}

enum CounterEffect {
    Sent,
    Delivered,
    Failed,
}

/// In-memory implementation of [`QueueStore`]
#[derive(Default)]
pub struct MemoryQueueStore {
    inner: Mutex<Inner>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Storage("Queue store lock poisoned".to_string()))
    }
}

fn bump_batch(inner: &mut Inner, batch_id: BatchId, effect: CounterEffect, now: DateTime<Utc>) {
    let Some(batch) = inner.batches.get_mut(&batch_id) else {
        return;
    };

    match effect {
        CounterEffect::Sent => batch.sent_count += 1,
        CounterEffect::Delivered => batch.delivered_count += 1,
        CounterEffect::Failed => batch.failed_count += 1,
    }

    if matches!(batch.status, BatchStatus::Queued | BatchStatus::Scheduled) {
        batch.status = BatchStatus::Processing;
    }

    if batch.status != BatchStatus::Completed && batch.is_complete() {
        batch.status = BatchStatus::Completed;
        batch.completed_at = Some(now);
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn insert_message(&self, message: Message) -> Result<InsertOutcome> {
        let mut inner = self.lock()?;

        if let Some(key) = &message.idempotency_key {
            let index_key = (message.tenant_id, key.clone());
            if let Some(existing_id) = inner.message_keys.get(&index_key) {
                let existing = inner
                    .messages
                    .get(existing_id)
                    .cloned()
                    .ok_or_else(|| Error::Storage("Idempotency index out of sync".to_string()))?;
                return Ok(InsertOutcome::Duplicate(existing));
            }
            inner.message_keys.insert(index_key, message.id);
        }

        inner.messages.insert(message.id, message.clone());
        Ok(InsertOutcome::Created(message))
    }

    async fn insert_batch(&self, batch: Batch, messages: Vec<Message>) -> Result<BatchInsertOutcome> {
        let mut inner = self.lock()?;

        if let Some(key) = &batch.idempotency_key {
            let index_key = (batch.tenant_id, key.clone());
            if let Some(existing_id) = inner.batch_keys.get(&index_key) {
                let existing = inner
                    .batches
                    .get(existing_id)
                    .cloned()
                    .ok_or_else(|| Error::Storage("Idempotency index out of sync".to_string()))?;
                return Ok(BatchInsertOutcome::Duplicate(existing));
            }
            inner.batch_keys.insert(index_key, batch.id);
        }

        inner.batches.insert(batch.id, batch.clone());
        for message in messages {
            inner.messages.insert(message.id, message);
        }
        Ok(BatchInsertOutcome::Created(batch))
    }

    async fn get_message(&self, id: MessageId) -> Result<Option<Message>> {
        Ok(self.lock()?.messages.get(&id).cloned())
    }

    async fn get_batch(&self, id: BatchId) -> Result<Option<Batch>> {
        Ok(self.lock()?.batches.get(&id).cloned())
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Message>> {
        let mut inner = self.lock()?;

        let candidate = inner
            .messages
            .values()
            .filter(|m| m.is_due(now))
            .min_by_key(|m| (m.priority, m.eligible_at(), m.created_at, m.id))
            .map(|m| m.id);

        let Some(id) = candidate else {
            return Ok(None);
        };

        let message = inner
            .messages
            .get_mut(&id)
            .ok_or_else(|| Error::Storage("Claimed message vanished".to_string()))?;
        message.status = MessageStatus::Processing;
        Ok(Some(message.clone()))
    }

    async fn mark_processing(&self, id: MessageId) -> Result<Option<Message>> {
        let mut inner = self.lock()?;

        let Some(message) = inner.messages.get_mut(&id) else {
            return Ok(None);
        };
        if !matches!(
            message.status,
            MessageStatus::Queued | MessageStatus::Scheduled
        ) {
            return Ok(None);
        }
        message.status = MessageStatus::Processing;
        Ok(Some(message.clone()))
    }

    async fn mark_sent(&self, id: MessageId, now: DateTime<Utc>) -> Result<Option<Message>> {
        let mut inner = self.lock()?;

        let Some(message) = inner.messages.get_mut(&id) else {
            return Ok(None);
        };
        if message.status != MessageStatus::Processing {
            return Ok(None);
        }

        let first_send = message.sent_at.is_none();
        message.status = MessageStatus::Sent;
        if first_send {
            message.sent_at = Some(now);
        }
        let updated = message.clone();

        if first_send {
            if let Some(batch_id) = updated.batch_id {
                bump_batch(&mut inner, batch_id, CounterEffect::Sent, now);
            }
        }
        Ok(Some(updated))
    }

    async fn mark_delivered(&self, id: MessageId, now: DateTime<Utc>) -> Result<Option<Message>> {
        let mut inner = self.lock()?;

        let Some(message) = inner.messages.get_mut(&id) else {
            return Ok(None);
        };
        if message.status != MessageStatus::Sent {
            return Ok(None);
        }

        message.status = MessageStatus::Delivered;
        message.delivered_at = Some(now);
        let updated = message.clone();

        if let Some(batch_id) = updated.batch_id {
            bump_batch(&mut inner, batch_id, CounterEffect::Delivered, now);
        }
        Ok(Some(updated))
    }

    async fn record_failure(
        &self,
        id: MessageId,
        expect: MessageStatus,
        retry_count: Option<i32>,
        reason: &str,
    ) -> Result<Option<Message>> {
        let mut inner = self.lock()?;

        let Some(message) = inner.messages.get_mut(&id) else {
            return Ok(None);
        };
        if message.status != expect {
            return Ok(None);
        }

        message.status = MessageStatus::Failed;
        message.failure_reason = Some(reason.to_string());
        if let Some(count) = retry_count {
            message.retry_count = count;
        }
        let updated = message.clone();

        // A message that already counted as sent keeps that contribution.
        if updated.sent_at.is_none() {
            if let Some(batch_id) = updated.batch_id {
                bump_batch(&mut inner, batch_id, CounterEffect::Failed, Utc::now());
            }
        }
        Ok(Some(updated))
    }

    async fn requeue_for_retry(
        &self,
        id: MessageId,
        retry_count: i32,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<Option<Message>> {
        let mut inner = self.lock()?;

        let Some(message) = inner.messages.get_mut(&id) else {
            return Ok(None);
        };
        if message.status != MessageStatus::Processing {
            return Ok(None);
        }

        message.status = MessageStatus::Queued;
        message.retry_count = retry_count;
        message.scheduled_at = Some(next_attempt_at);
        message.failure_reason = None;
        Ok(Some(message.clone()))
    }

    async fn release_claim(
        &self,
        id: MessageId,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<Option<Message>> {
        let mut inner = self.lock()?;

        let Some(message) = inner.messages.get_mut(&id) else {
            return Ok(None);
        };
        if message.status != MessageStatus::Processing {
            return Ok(None);
        }

        message.status = MessageStatus::Queued;
        message.scheduled_at = not_before;
        Ok(Some(message.clone()))
    }

    async fn requeue_failed(
        &self,
        id: MessageId,
        retry_count: i32,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<Option<Message>> {
        let mut inner = self.lock()?;

        let Some(message) = inner.messages.get_mut(&id) else {
            return Ok(None);
        };
        if message.status != MessageStatus::Failed {
            return Ok(None);
        }

        message.status = MessageStatus::Queued;
        message.retry_count = retry_count;
        message.scheduled_at = next_attempt_at;
        message.failure_reason = None;
        Ok(Some(message.clone()))
    }

    async fn replace_failed(&self, id: MessageId, replacement: Message) -> Result<Option<Message>> {
        let mut inner = self.lock()?;

        let Some(message) = inner.messages.get_mut(&id) else {
            return Ok(None);
        };
        if message.status != MessageStatus::Failed {
            return Ok(None);
        }

        *message = replacement.clone();
        Ok(Some(replacement))
    }

    async fn count_by_status(
        &self,
        tenant_id: Option<TenantId>,
        dead_letter_min: i32,
    ) -> Result<QueueStats> {
        let inner = self.lock()?;

        let mut stats = QueueStats::default();
        for message in inner.messages.values() {
            if let Some(tenant) = tenant_id {
                if message.tenant_id != tenant {
                    continue;
                }
            }
            match message.status {
                MessageStatus::Queued => stats.queued += 1,
                MessageStatus::Scheduled => stats.scheduled += 1,
                MessageStatus::Processing => stats.processing += 1,
                MessageStatus::Sent => stats.sent += 1,
                MessageStatus::Delivered => stats.delivered += 1,
                MessageStatus::Failed => stats.failed += 1,
            }
            if message.is_dead_letter(dead_letter_min) {
                stats.dead_letter += 1;
            }
        }
        Ok(stats)
    }

    async fn list_dead_letters(&self, dead_letter_min: i32) -> Result<Vec<Message>> {
        let inner = self.lock()?;

        let mut dead: Vec<Message> = inner
            .messages
            .values()
            .filter(|m| m.is_dead_letter(dead_letter_min))
            .cloned()
            .collect();
        dead.sort_by_key(|m| m.created_at);
        Ok(dead)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relayq_common::types::{Channel, Priority};
    use std::sync::Arc;
    use uuid::Uuid;

    fn queued_message(tenant_id: TenantId, priority: Priority) -> Message {
        Message {
            id: Uuid::new_v4(),
            tenant_id,
            batch_id: None,
            idempotency_key: None,
            channel: Channel::Email,
            recipient: "rcpt_a1b2c3d4".to_string(),
            recipient_category: "guardian".to_string(),
            subject: Some("Subject".to_string()),
            body: "Body".to_string(),
            priority,
            status: MessageStatus::Queued,
            retry_count: 0,
            failure_reason: None,
            scheduled_at: None,
            created_at: Utc::now(),
            sent_at: None,
            delivered_at: None,
        }
    }

    fn batch_of(tenant_id: TenantId, n: i32) -> (Batch, Vec<Message>) {
        let batch = Batch {
            id: Uuid::new_v4(),
            tenant_id,
            idempotency_key: None,
            channel: Channel::Email,
            status: BatchStatus::Queued,
            total_recipients: n,
            sent_count: 0,
            delivered_count: 0,
            failed_count: 0,
            estimated_cost: 0.0,
            scheduled_at: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        let messages = (0..n)
            .map(|_| {
                let mut m = queued_message(tenant_id, Priority::Normal);
                m.batch_id = Some(batch.id);
                m
            })
            .collect();
        (batch, messages)
    }

    #[tokio::test]
    async fn test_idempotent_insert_returns_existing() {
        let store = MemoryQueueStore::new();
        let tenant = Uuid::new_v4();

        let mut first = queued_message(tenant, Priority::Normal);
        first.idempotency_key = Some("key-1".to_string());
        let mut second = queued_message(tenant, Priority::Normal);
        second.idempotency_key = Some("key-1".to_string());

        let created = store.insert_message(first.clone()).await.unwrap();
        assert!(matches!(created, InsertOutcome::Created(_)));

        match store.insert_message(second).await.unwrap() {
            InsertOutcome::Duplicate(existing) => assert_eq!(existing.id, first.id),
            InsertOutcome::Created(_) => panic!("duplicate key must not create a second row"),
        }
    }

    #[tokio::test]
    async fn test_concurrent_inserts_single_winner() {
        let store = Arc::new(MemoryQueueStore::new());
        let tenant = Uuid::new_v4();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = Arc::clone(&store);
            let mut message = queued_message(tenant, Priority::Normal);
            message.idempotency_key = Some("shared".to_string());
            handles.push(tokio::spawn(
                async move { store.insert_message(message).await },
            ));
        }

        let mut created = 0;
        let mut duplicates = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                InsertOutcome::Created(_) => created += 1,
                InsertOutcome::Duplicate(_) => duplicates += 1,
            }
        }
        assert_eq!(created, 1);
        assert_eq!(duplicates, 9);
    }

    #[tokio::test]
    async fn test_claim_prefers_high_priority() {
        let store = MemoryQueueStore::new();
        let tenant = Uuid::new_v4();

        let low = queued_message(tenant, Priority::Low);
        let high = queued_message(tenant, Priority::High);
        let normal = queued_message(tenant, Priority::Normal);
        store.insert_message(low.clone()).await.unwrap();
        store.insert_message(high.clone()).await.unwrap();
        store.insert_message(normal.clone()).await.unwrap();

        let first = store.claim_next(Utc::now()).await.unwrap().unwrap();
        assert_eq!(first.id, high.id);
        assert_eq!(first.status, MessageStatus::Processing);

        let second = store.claim_next(Utc::now()).await.unwrap().unwrap();
        assert_eq!(second.id, normal.id);

        let third = store.claim_next(Utc::now()).await.unwrap().unwrap();
        assert_eq!(third.id, low.id);

        assert!(store.claim_next(Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_skips_future_scheduled() {
        let store = MemoryQueueStore::new();
        let tenant = Uuid::new_v4();
        let now = Utc::now();

        let mut future = queued_message(tenant, Priority::High);
        future.status = MessageStatus::Scheduled;
        future.scheduled_at = Some(now + chrono::Duration::hours(1));
        store.insert_message(future).await.unwrap();

        let mut due = queued_message(tenant, Priority::Low);
        due.status = MessageStatus::Scheduled;
        due.scheduled_at = Some(now - chrono::Duration::minutes(1));
        store.insert_message(due.clone()).await.unwrap();

        let claimed = store.claim_next(now).await.unwrap().unwrap();
        assert_eq!(claimed.id, due.id);
        assert!(store.claim_next(now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_claims_are_exclusive() {
        let store = Arc::new(MemoryQueueStore::new());
        let tenant = Uuid::new_v4();

        for _ in 0..4 {
            store
                .insert_message(queued_message(tenant, Priority::Normal))
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move { store.claim_next(Utc::now()).await }));
        }

        let mut claimed_ids = Vec::new();
        for handle in handles {
            if let Some(message) = handle.await.unwrap().unwrap() {
                claimed_ids.push(message.id);
            }
        }
        claimed_ids.sort();
        claimed_ids.dedup();
        assert_eq!(claimed_ids.len(), 4);
    }

    #[tokio::test]
    async fn test_sent_counts_once_per_message() {
        let store = MemoryQueueStore::new();
        let tenant = Uuid::new_v4();
        let (batch, messages) = batch_of(tenant, 2);
        let target = messages[0].id;
        store.insert_batch(batch.clone(), messages).await.unwrap();

        // Claim both so the queue holds nothing else, then send one.
        store.claim_next(Utc::now()).await.unwrap().unwrap();
        store.claim_next(Utc::now()).await.unwrap().unwrap();
        store.mark_sent(target, Utc::now()).await.unwrap().unwrap();

        // Guard: a second mark on the same row is rejected.
        assert!(store.mark_sent(target, Utc::now()).await.unwrap().is_none());

        let stored = store.get_batch(batch.id).await.unwrap().unwrap();
        assert_eq!(stored.sent_count, 1);
        assert_eq!(stored.status, BatchStatus::Processing);

        // A resend after a post-acceptance failure does not recount.
        store
            .record_failure(target, MessageStatus::Sent, None, "bounced")
            .await
            .unwrap()
            .unwrap();
        store.requeue_failed(target, 1, None).await.unwrap().unwrap();
        let reclaimed = store.claim_next(Utc::now()).await.unwrap().unwrap();
        assert_eq!(reclaimed.id, target);
        store.mark_sent(target, Utc::now()).await.unwrap().unwrap();

        let stored = store.get_batch(batch.id).await.unwrap().unwrap();
        assert_eq!(stored.sent_count, 1);
    }

    #[tokio::test]
    async fn test_failure_counts_unsent_only() {
        let store = MemoryQueueStore::new();
        let tenant = Uuid::new_v4();
        let (batch, messages) = batch_of(tenant, 2);
        let ids: Vec<MessageId> = messages.iter().map(|m| m.id).collect();
        store.insert_batch(batch.clone(), messages).await.unwrap();

        // First constituent: accepted, then fails post-acceptance.
        store.claim_next(Utc::now()).await.unwrap().unwrap();
        store.claim_next(Utc::now()).await.unwrap().unwrap();
        store.mark_sent(ids[0], Utc::now()).await.unwrap().unwrap();
        store
            .record_failure(ids[0], MessageStatus::Sent, None, "bounced")
            .await
            .unwrap()
            .unwrap();

        // Second constituent: never sent, comes to rest failed.
        store
            .record_failure(ids[1], MessageStatus::Processing, Some(3), "timeout")
            .await
            .unwrap()
            .unwrap();

        let stored = store.get_batch(batch.id).await.unwrap().unwrap();
        assert_eq!(stored.sent_count, 1);
        assert_eq!(stored.failed_count, 1);
        assert_eq!(stored.status, BatchStatus::Completed);
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_batch_completes_when_all_sent() {
        let store = MemoryQueueStore::new();
        let tenant = Uuid::new_v4();
        let (batch, messages) = batch_of(tenant, 3);
        let ids: Vec<MessageId> = messages.iter().map(|m| m.id).collect();
        store.insert_batch(batch.clone(), messages).await.unwrap();

        for id in &ids {
            store.claim_next(Utc::now()).await.unwrap().unwrap();
            store.mark_sent(*id, Utc::now()).await.unwrap().unwrap();
        }

        let stored = store.get_batch(batch.id).await.unwrap().unwrap();
        assert_eq!(stored.sent_count, 3);
        assert_eq!(stored.status, BatchStatus::Completed);

        // Receipts arriving after completion still count deliveries.
        store.mark_delivered(ids[0], Utc::now()).await.unwrap().unwrap();
        store.mark_delivered(ids[1], Utc::now()).await.unwrap().unwrap();
        let stored = store.get_batch(batch.id).await.unwrap().unwrap();
        assert_eq!(stored.delivered_count, 2);
        assert_eq!(stored.status, BatchStatus::Completed);
    }

    #[tokio::test]
    async fn test_requeue_guards() {
        let store = MemoryQueueStore::new();
        let tenant = Uuid::new_v4();
        let message = queued_message(tenant, Priority::Normal);
        let id = message.id;
        store.insert_message(message).await.unwrap();

        // Not processing yet: both requeue paths refuse.
        assert!(store
            .requeue_for_retry(id, 1, Utc::now())
            .await
            .unwrap()
            .is_none());
        assert!(store.release_claim(id, None).await.unwrap().is_none());

        store.claim_next(Utc::now()).await.unwrap().unwrap();
        let next = Utc::now() + chrono::Duration::seconds(30);
        let requeued = store.requeue_for_retry(id, 1, next).await.unwrap().unwrap();
        assert_eq!(requeued.status, MessageStatus::Queued);
        assert_eq!(requeued.retry_count, 1);
        assert_eq!(requeued.scheduled_at, Some(next));
        assert!(requeued.failure_reason.is_none());
    }

    #[tokio::test]
    async fn test_stats_and_dead_letters() {
        let store = MemoryQueueStore::new();
        let tenant = Uuid::new_v4();
        let other = Uuid::new_v4();

        store
            .insert_message(queued_message(tenant, Priority::Normal))
            .await
            .unwrap();
        store
            .insert_message(queued_message(other, Priority::Normal))
            .await
            .unwrap();

        let mut dead = queued_message(tenant, Priority::Normal);
        dead.status = MessageStatus::Failed;
        dead.retry_count = 3;
        dead.failure_reason = Some("timeout".to_string());
        store.insert_message(dead.clone()).await.unwrap();

        let stats = store.count_by_status(None, 3).await.unwrap();
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.dead_letter, 1);

        let scoped = store.count_by_status(Some(tenant), 3).await.unwrap();
        assert_eq!(scoped.queued, 1);
        assert_eq!(scoped.dead_letter, 1);

        let dead_letters = store.list_dead_letters(3).await.unwrap();
        assert_eq!(dead_letters.len(), 1);
        assert_eq!(dead_letters[0].id, dead.id);
    }
}
