//! PostgreSQL queue store
//!
//! Conditional transitions are guarded UPDATEs (`WHERE id = $1 AND
//! status = ...` with `RETURNING *`), so a lost guard surfaces as zero
//! rows. Batch counters ride in the same transaction as the message
//! transition that causes them.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relayq_common::types::{BatchId, MessageId, TenantId};
use relayq_common::{Error, Result};
use sqlx::{FromRow, Postgres, Row, Transaction};

use crate::db::DatabasePool;
use crate::models::{Batch, Message, MessageStatus, QueueStats};
use crate::store::{BatchInsertOutcome, InsertOutcome, QueueStore};

/// Message row as stored, with enums as text
#[derive(FromRow)]
struct MessageRow {
    id: MessageId,
    tenant_id: TenantId,
    batch_id: Option<BatchId>,
    idempotency_key: Option<String>,
    channel: String,
    recipient: String,
    recipient_category: String,
    subject: Option<String>,
    body: String,
    priority: String,
    status: String,
    retry_count: i32,
    failure_reason: Option<String>,
    scheduled_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    sent_at: Option<DateTime<Utc>>,
    delivered_at: Option<DateTime<Utc>>,
}

#[derive(FromRow)]
struct BatchRow {
    id: BatchId,
    tenant_id: TenantId,
    idempotency_key: Option<String>,
    channel: String,
    status: String,
    total_recipients: i32,
    sent_count: i32,
    delivered_count: i32,
    failed_count: i32,
    estimated_cost: f64,
    scheduled_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

fn parse_column<T>(value: &str, column: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| Error::Storage(format!("Invalid {} in row: {}", column, e)))
}

impl MessageRow {
    fn into_model(self) -> Result<Message> {
        let channel = parse_column(&self.channel, "channel")?;
        let priority = parse_column(&self.priority, "priority")?;
        let status = parse_column(&self.status, "status")?;
        Ok(Message {
            id: self.id,
            tenant_id: self.tenant_id,
            batch_id: self.batch_id,
            idempotency_key: self.idempotency_key,
            channel,
            recipient: self.recipient,
            recipient_category: self.recipient_category,
            subject: self.subject,
            body: self.body,
            priority,
            status,
            retry_count: self.retry_count,
            failure_reason: self.failure_reason,
            scheduled_at: self.scheduled_at,
            created_at: self.created_at,
            sent_at: self.sent_at,
            delivered_at: self.delivered_at,
        })
    }
}

impl BatchRow {
    fn into_model(self) -> Result<Batch> {
        let channel = parse_column(&self.channel, "channel")?;
        let status = parse_column(&self.status, "status")?;
        Ok(Batch {
            id: self.id,
            tenant_id: self.tenant_id,
            idempotency_key: self.idempotency_key,
            channel,
            status,
            total_recipients: self.total_recipients,
            sent_count: self.sent_count,
            delivered_count: self.delivered_count,
            failed_count: self.failed_count,
            estimated_cost: self.estimated_cost,
            scheduled_at: self.scheduled_at,
            created_at: self.created_at,
            completed_at: self.completed_at,
        })
    }
}

/// PostgreSQL implementation of [`QueueStore`]
pub struct PostgresQueueStore {
    pool: DatabasePool,
}

impl PostgresQueueStore {
    /// Create a new store on an established pool
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn insert_message_row(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        message: &Message,
    ) -> Result<Option<MessageRow>> {
        sqlx::query_as::<_, MessageRow>(
            r#"
            INSERT INTO messages (
                id, tenant_id, batch_id, idempotency_key, channel, recipient,
                recipient_category, subject, body, priority, status, retry_count,
                failure_reason, scheduled_at, created_at, sent_at, delivered_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (tenant_id, idempotency_key) WHERE idempotency_key IS NOT NULL
            DO NOTHING
            RETURNING *
            "#,
        )
        .bind(message.id)
        .bind(message.tenant_id)
        .bind(message.batch_id)
        .bind(&message.idempotency_key)
        .bind(message.channel.to_string())
        .bind(&message.recipient)
        .bind(&message.recipient_category)
        .bind(&message.subject)
        .bind(&message.body)
        .bind(message.priority.to_string())
        .bind(message.status.to_string())
        .bind(message.retry_count)
        .bind(&message.failure_reason)
        .bind(message.scheduled_at)
        .bind(message.created_at)
        .bind(message.sent_at)
        .bind(message.delivered_at)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| Error::Storage(e.to_string()))
    }

    async fn find_message_by_key(
        &self,
        tenant_id: TenantId,
        key: &str,
    ) -> Result<Option<Message>> {
        let row = sqlx::query_as::<_, MessageRow>(
            "SELECT * FROM messages WHERE tenant_id = $1 AND idempotency_key = $2",
        )
        .bind(tenant_id)
        .bind(key)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;
        row.map(MessageRow::into_model).transpose()
    }

    async fn find_batch_by_key(&self, tenant_id: TenantId, key: &str) -> Result<Option<Batch>> {
        let row = sqlx::query_as::<_, BatchRow>(
            "SELECT * FROM batches WHERE tenant_id = $1 AND idempotency_key = $2",
        )
        .bind(tenant_id)
        .bind(key)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;
        row.map(BatchRow::into_model).transpose()
    }

    async fn bump_batch_sent(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        batch_id: BatchId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE batches SET
                sent_count = sent_count + 1,
                status = CASE
                    WHEN sent_count + 1 + failed_count >= total_recipients THEN 'completed'
                    WHEN status IN ('queued', 'scheduled') THEN 'processing'
                    ELSE status
                END,
                completed_at = CASE
                    WHEN completed_at IS NULL AND sent_count + 1 + failed_count >= total_recipients THEN $2
                    ELSE completed_at
                END
            WHERE id = $1
            "#,
        )
        .bind(batch_id)
        .bind(now)
        .execute(&mut **tx)
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }

    async fn bump_batch_delivered(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        batch_id: BatchId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE batches SET
                delivered_count = delivered_count + 1,
                status = CASE
                    WHEN sent_count + failed_count >= total_recipients THEN 'completed'
                    WHEN status IN ('queued', 'scheduled') THEN 'processing'
                    ELSE status
                END,
                completed_at = CASE
                    WHEN completed_at IS NULL AND sent_count + failed_count >= total_recipients THEN $2
                    ELSE completed_at
                END
            WHERE id = $1
            "#,
        )
        .bind(batch_id)
        .bind(now)
        .execute(&mut **tx)
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }

    async fn bump_batch_failed(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        batch_id: BatchId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE batches SET
                failed_count = failed_count + 1,
                status = CASE
                    WHEN sent_count + failed_count + 1 >= total_recipients THEN 'completed'
                    WHEN status IN ('queued', 'scheduled') THEN 'processing'
                    ELSE status
                END,
                completed_at = CASE
                    WHEN completed_at IS NULL AND sent_count + failed_count + 1 >= total_recipients THEN $2
                    ELSE completed_at
                END
            WHERE id = $1
            "#,
        )
        .bind(batch_id)
        .bind(now)
        .execute(&mut **tx)
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl QueueStore for PostgresQueueStore {
    async fn insert_message(&self, message: Message) -> Result<InsertOutcome> {
        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;

        let inserted = self.insert_message_row(&mut tx, &message).await?;
        tx.commit().await.map_err(|e| Error::Storage(e.to_string()))?;

        if let Some(row) = inserted {
            return Ok(InsertOutcome::Created(row.into_model()?));
        }

        // The insert lost to a concurrent writer; the winning row is
        // authoritative.
        let key = message
            .idempotency_key
            .as_deref()
            .ok_or_else(|| Error::Storage("Insert conflict without idempotency key".to_string()))?;
        let existing = self
            .find_message_by_key(message.tenant_id, key)
            .await?
            .ok_or_else(|| Error::Storage("Insert conflict without matching row".to_string()))?;
        Ok(InsertOutcome::Duplicate(existing))
    }

    async fn insert_batch(&self, batch: Batch, messages: Vec<Message>) -> Result<BatchInsertOutcome> {
        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;

        let inserted = sqlx::query_as::<_, BatchRow>(
            r#"
            INSERT INTO batches (
                id, tenant_id, idempotency_key, channel, status, total_recipients,
                sent_count, delivered_count, failed_count, estimated_cost,
                scheduled_at, created_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (tenant_id, idempotency_key) WHERE idempotency_key IS NOT NULL
            DO NOTHING
            RETURNING *
            "#,
        )
        .bind(batch.id)
        .bind(batch.tenant_id)
        .bind(&batch.idempotency_key)
        .bind(batch.channel.to_string())
        .bind(batch.status.to_string())
        .bind(batch.total_recipients)
        .bind(batch.sent_count)
        .bind(batch.delivered_count)
        .bind(batch.failed_count)
        .bind(batch.estimated_cost)
        .bind(batch.scheduled_at)
        .bind(batch.created_at)
        .bind(batch.completed_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;

        let Some(row) = inserted else {
            drop(tx);
            let key = batch.idempotency_key.as_deref().ok_or_else(|| {
                Error::Storage("Insert conflict without idempotency key".to_string())
            })?;
            let existing = self
                .find_batch_by_key(batch.tenant_id, key)
                .await?
                .ok_or_else(|| Error::Storage("Insert conflict without matching row".to_string()))?;
            return Ok(BatchInsertOutcome::Duplicate(existing));
        };

        for message in &messages {
            self.insert_message_row(&mut tx, message).await?;
        }

        tx.commit().await.map_err(|e| Error::Storage(e.to_string()))?;
        Ok(BatchInsertOutcome::Created(row.into_model()?))
    }

    async fn get_message(&self, id: MessageId) -> Result<Option<Message>> {
        let row = sqlx::query_as::<_, MessageRow>("SELECT * FROM messages WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        row.map(MessageRow::into_model).transpose()
    }

    async fn get_batch(&self, id: BatchId) -> Result<Option<Batch>> {
        let row = sqlx::query_as::<_, BatchRow>("SELECT * FROM batches WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        row.map(BatchRow::into_model).transpose()
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Message>> {
        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            UPDATE messages SET status = 'processing'
            WHERE id = (
                SELECT id FROM messages
                WHERE status IN ('queued', 'scheduled')
                  AND COALESCE(scheduled_at, created_at) <= $1
                ORDER BY
                    CASE priority WHEN 'HIGH' THEN 0 WHEN 'NORMAL' THEN 1 ELSE 2 END,
                    COALESCE(scheduled_at, created_at),
                    created_at,
                    id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(now)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;
        row.map(MessageRow::into_model).transpose()
    }

    async fn mark_processing(&self, id: MessageId) -> Result<Option<Message>> {
        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            UPDATE messages SET status = 'processing'
            WHERE id = $1 AND status IN ('queued', 'scheduled')
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;
        row.map(MessageRow::into_model).transpose()
    }

    async fn mark_sent(&self, id: MessageId, now: DateTime<Utc>) -> Result<Option<Message>> {
        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;

        // Lock the row first; whether this send is the first decides
        // the batch counter.
        let prior = sqlx::query(
            "SELECT sent_at FROM messages WHERE id = $1 AND status = 'processing' FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;

        let Some(prior) = prior else {
            return Ok(None);
        };
        let first_send = prior
            .get::<Option<DateTime<Utc>>, _>("sent_at")
            .is_none();

        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            UPDATE messages SET
                status = 'sent',
                sent_at = COALESCE(sent_at, $2)
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;

        let message = row.into_model()?;
        if first_send {
            if let Some(batch_id) = message.batch_id {
                self.bump_batch_sent(&mut tx, batch_id, now).await?;
            }
        }

        tx.commit().await.map_err(|e| Error::Storage(e.to_string()))?;
        Ok(Some(message))
    }

    async fn mark_delivered(&self, id: MessageId, now: DateTime<Utc>) -> Result<Option<Message>> {
        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;

        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            UPDATE messages SET
                status = 'delivered',
                delivered_at = $2
            WHERE id = $1 AND status = 'sent'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let message = row.into_model()?;
        if let Some(batch_id) = message.batch_id {
            self.bump_batch_delivered(&mut tx, batch_id, now).await?;
        }

        tx.commit().await.map_err(|e| Error::Storage(e.to_string()))?;
        Ok(Some(message))
    }

    async fn record_failure(
        &self,
        id: MessageId,
        expect: MessageStatus,
        retry_count: Option<i32>,
        reason: &str,
    ) -> Result<Option<Message>> {
        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;

        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            UPDATE messages SET
                status = 'failed',
                failure_reason = $3,
                retry_count = COALESCE($4, retry_count)
            WHERE id = $1 AND status = $2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(expect.to_string())
        .bind(reason)
        .bind(retry_count)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let message = row.into_model()?;
        // A message that already counted as sent keeps that contribution.
        if message.sent_at.is_none() {
            if let Some(batch_id) = message.batch_id {
                self.bump_batch_failed(&mut tx, batch_id, Utc::now()).await?;
            }
        }

        tx.commit().await.map_err(|e| Error::Storage(e.to_string()))?;
        Ok(Some(message))
    }

    async fn requeue_for_retry(
        &self,
        id: MessageId,
        retry_count: i32,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<Option<Message>> {
        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            UPDATE messages SET
                status = 'queued',
                retry_count = $2,
                scheduled_at = $3,
                failure_reason = NULL
            WHERE id = $1 AND status = 'processing'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(retry_count)
        .bind(next_attempt_at)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;
        row.map(MessageRow::into_model).transpose()
    }

    async fn release_claim(
        &self,
        id: MessageId,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<Option<Message>> {
        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            UPDATE messages SET
                status = 'queued',
                scheduled_at = $2
            WHERE id = $1 AND status = 'processing'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(not_before)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;
        row.map(MessageRow::into_model).transpose()
    }

    async fn requeue_failed(
        &self,
        id: MessageId,
        retry_count: i32,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<Option<Message>> {
        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            UPDATE messages SET
                status = 'queued',
                retry_count = $2,
                scheduled_at = $3,
                failure_reason = NULL
            WHERE id = $1 AND status = 'failed'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(retry_count)
        .bind(next_attempt_at)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;
        row.map(MessageRow::into_model).transpose()
    }

    async fn replace_failed(&self, id: MessageId, replacement: Message) -> Result<Option<Message>> {
        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            UPDATE messages SET
                tenant_id = $2,
                batch_id = $3,
                idempotency_key = $4,
                channel = $5,
                recipient = $6,
                recipient_category = $7,
                subject = $8,
                body = $9,
                priority = $10,
                status = $11,
                retry_count = $12,
                failure_reason = $13,
                scheduled_at = $14,
                created_at = $15,
                sent_at = $16,
                delivered_at = $17
            WHERE id = $1 AND status = 'failed'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(replacement.tenant_id)
        .bind(replacement.batch_id)
        .bind(&replacement.idempotency_key)
        .bind(replacement.channel.to_string())
        .bind(&replacement.recipient)
        .bind(&replacement.recipient_category)
        .bind(&replacement.subject)
        .bind(&replacement.body)
        .bind(replacement.priority.to_string())
        .bind(replacement.status.to_string())
        .bind(replacement.retry_count)
        .bind(&replacement.failure_reason)
        .bind(replacement.scheduled_at)
        .bind(replacement.created_at)
        .bind(replacement.sent_at)
        .bind(replacement.delivered_at)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;
        row.map(MessageRow::into_model).transpose()
    }

    async fn count_by_status(
        &self,
        tenant_id: Option<TenantId>,
        dead_letter_min: i32,
    ) -> Result<QueueStats> {
        let row = if let Some(tenant) = tenant_id {
            sqlx::query(
                r#"
                SELECT
                    COUNT(*) FILTER (WHERE status = 'queued') as queued,
                    COUNT(*) FILTER (WHERE status = 'scheduled') as scheduled,
                    COUNT(*) FILTER (WHERE status = 'processing') as processing,
                    COUNT(*) FILTER (WHERE status = 'sent') as sent,
                    COUNT(*) FILTER (WHERE status = 'delivered') as delivered,
                    COUNT(*) FILTER (WHERE status = 'failed') as failed,
                    COUNT(*) FILTER (WHERE status = 'failed' AND retry_count >= $2) as dead_letter
                FROM messages
                WHERE tenant_id = $1
                "#,
            )
            .bind(tenant)
            .bind(dead_letter_min)
            .fetch_one(self.pool.pool())
            .await
        } else {
            sqlx::query(
                r#"
                SELECT
                    COUNT(*) FILTER (WHERE status = 'queued') as queued,
                    COUNT(*) FILTER (WHERE status = 'scheduled') as scheduled,
                    COUNT(*) FILTER (WHERE status = 'processing') as processing,
                    COUNT(*) FILTER (WHERE status = 'sent') as sent,
                    COUNT(*) FILTER (WHERE status = 'delivered') as delivered,
                    COUNT(*) FILTER (WHERE status = 'failed') as failed,
                    COUNT(*) FILTER (WHERE status = 'failed' AND retry_count >= $1) as dead_letter
                FROM messages
                "#,
            )
            .bind(dead_letter_min)
            .fetch_one(self.pool.pool())
            .await
        }
        .map_err(|e| Error::Storage(e.to_string()))?;

        Ok(QueueStats {
            queued: row.get::<Option<i64>, _>("queued").unwrap_or(0),
            scheduled: row.get::<Option<i64>, _>("scheduled").unwrap_or(0),
            processing: row.get::<Option<i64>, _>("processing").unwrap_or(0),
            sent: row.get::<Option<i64>, _>("sent").unwrap_or(0),
            delivered: row.get::<Option<i64>, _>("delivered").unwrap_or(0),
            failed: row.get::<Option<i64>, _>("failed").unwrap_or(0),
            dead_letter: row.get::<Option<i64>, _>("dead_letter").unwrap_or(0),
        })
    }

    async fn list_dead_letters(&self, dead_letter_min: i32) -> Result<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT * FROM messages
            WHERE status = 'failed' AND retry_count >= $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(dead_letter_min)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;
        rows.into_iter().map(MessageRow::into_model).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relayq_common::types::{Channel, Priority};

    #[test]
    fn test_parse_column_maps_errors() {
        assert_eq!(
            parse_column::<Channel>("EMAIL", "channel").unwrap(),
            Channel::Email
        );
        assert_eq!(
            parse_column::<Priority>("LOW", "priority").unwrap(),
            Priority::Low
        );
        assert_eq!(
            parse_column::<MessageStatus>("queued", "status").unwrap(),
            MessageStatus::Queued
        );

        let err = parse_column::<MessageStatus>("bounced", "status").unwrap_err();
        assert!(err.to_string().contains("status"));
    }
}
