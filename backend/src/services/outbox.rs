//! Notification Outbox
//!
//! Durable delivery for safety notifications using the transactional outbox
//! pattern. Publishing inserts a pending row; the relay job claims rows with
//! FOR UPDATE SKIP LOCKED so several instances can relay concurrently,
//! forwards them to a downstream notifier, and retries with exponential
//! backoff until the row is dead-lettered.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use super::notifier::{NotificationChannel, Notifier, NotifyError, SafetyNotification};

/// Outbox service errors
#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Event not found: {0}")]
    EventNotFound(Uuid),

    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
}

/// Outbox row status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "outbox_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Processed,
    Dead,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::Dead => "dead",
        }
    }
}

/// Outbox entry
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEvent {
    pub outbox_id: Uuid,
    pub channel: String,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub attempts: i32,
    pub available_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Configuration for the outbox service
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Maximum number of delivery attempts before dead-lettering
    pub max_attempts: i32,
    /// Base delay for exponential backoff (in seconds)
    pub base_delay_secs: i64,
    /// Maximum delay for exponential backoff (in seconds)
    pub max_delay_secs: i64,
    /// Rows locked longer than this are considered abandoned
    pub lock_timeout_secs: i64,
    /// Batch size for claiming rows
    pub batch_size: i32,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_secs: 5,
            max_delay_secs: 3600,
            lock_timeout_secs: 300,
            batch_size: 50,
        }
    }
}

/// Result of one relay pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayReport {
    pub claimed: usize,
    pub delivered: usize,
    pub retried: usize,
    pub dead_lettered: usize,
}

/// Service for managing the notification outbox
#[derive(Debug, Clone)]
pub struct OutboxService {
    pool: PgPool,
    config: OutboxConfig,
}

impl OutboxService {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            config: OutboxConfig::default(),
        }
    }

    pub fn with_config(pool: PgPool, config: OutboxConfig) -> Self {
        Self { pool, config }
    }

    /// Insert a pending row for a notification
    pub async fn insert(&self, notification: &SafetyNotification) -> Result<OutboxEvent, OutboxError> {
        let now = Utc::now();
        let payload = serde_json::to_value(notification)?;

        sqlx::query(
            r#"
            INSERT INTO safety_outbox (outbox_id, channel, payload, status, attempts, available_at, created_at)
            VALUES ($1, $2, $3, 'pending', 0, $4, $4)
            ON CONFLICT (outbox_id) DO NOTHING
            "#,
        )
        .bind(notification.id)
        .bind(notification.channel.as_str())
        .bind(&payload)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(OutboxEvent {
            outbox_id: notification.id,
            channel: notification.channel.to_string(),
            payload,
            status: OutboxStatus::Pending,
            attempts: 0,
            available_at: now,
            locked_at: None,
            locked_by: None,
            last_error: None,
            created_at: now,
            processed_at: None,
        })
    }

    /// Claim deliverable rows using FOR UPDATE SKIP LOCKED
    ///
    /// Claims rows that are pending and available, or processing with an
    /// expired lock (abandoned by a crashed worker).
    pub async fn claim_events(
        &self,
        channel: Option<NotificationChannel>,
        worker_id: &str,
    ) -> Result<Vec<OutboxEvent>, OutboxError> {
        let now = Utc::now();
        let lock_timeout = now - Duration::seconds(self.config.lock_timeout_secs);

        let rows = sqlx::query_as::<_, OutboxEventRow>(
            r#"
            UPDATE safety_outbox
            SET status = 'processing',
                locked_at = $1,
                locked_by = $2,
                attempts = attempts + 1
            WHERE outbox_id IN (
                SELECT outbox_id FROM safety_outbox
                WHERE ($3::text IS NULL OR channel = $3)
                AND (
                    (status = 'pending' AND available_at <= $1)
                    OR (status = 'processing' AND locked_at < $4)
                )
                ORDER BY available_at ASC
                LIMIT $5
                FOR UPDATE SKIP LOCKED
            )
            RETURNING outbox_id, channel, payload, status, attempts, available_at,
                      locked_at, locked_by, last_error, created_at, processed_at
            "#,
        )
        .bind(now)
        .bind(worker_id)
        .bind(channel.map(|c| c.as_str()))
        .bind(lock_timeout)
        .bind(self.config.batch_size)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    /// Mark a row as delivered
    pub async fn mark_processed(&self, outbox_id: Uuid) -> Result<(), OutboxError> {
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            UPDATE safety_outbox
            SET status = 'processed',
                processed_at = $1,
                locked_at = NULL,
                locked_by = NULL
            WHERE outbox_id = $2
            "#,
        )
        .bind(now)
        .bind(outbox_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OutboxError::EventNotFound(outbox_id));
        }

        Ok(())
    }

    /// Mark a row as failed and schedule a retry with exponential backoff
    ///
    /// Moves the row to dead-letter status once max attempts are exhausted.
    pub async fn mark_failed(&self, outbox_id: Uuid, error: &str) -> Result<OutboxStatus, OutboxError> {
        let row = sqlx::query_as::<_, (i32,)>("SELECT attempts FROM safety_outbox WHERE outbox_id = $1")
            .bind(outbox_id)
            .fetch_optional(&self.pool)
            .await?;

        let attempts = match row {
            Some((a,)) => a,
            None => return Err(OutboxError::EventNotFound(outbox_id)),
        };

        let new_status = if attempts >= self.config.max_attempts {
            OutboxStatus::Dead
        } else {
            OutboxStatus::Pending
        };

        let delay_secs = backoff_delay_secs(&self.config, attempts);
        let next_available = Utc::now() + Duration::seconds(delay_secs);

        sqlx::query(
            r#"
            UPDATE safety_outbox
            SET status = $1,
                available_at = $2,
                last_error = $3,
                locked_at = NULL,
                locked_by = NULL
            WHERE outbox_id = $4
            "#,
        )
        .bind(new_status)
        .bind(next_available)
        .bind(error)
        .bind(outbox_id)
        .execute(&self.pool)
        .await?;

        Ok(new_status)
    }

    /// Claim a batch and forward it to `downstream`
    pub async fn relay(&self, worker_id: &str, downstream: &dyn Notifier) -> Result<RelayReport, OutboxError> {
        let events = self.claim_events(None, worker_id).await?;
        let mut report = RelayReport {
            claimed: events.len(),
            ..RelayReport::default()
        };

        for event in events {
            let delivery = match serde_json::from_value::<SafetyNotification>(event.payload.clone()) {
                Ok(notification) => downstream
                    .publish(notification)
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(format!("invalid payload: {e}")),
            };

            match delivery {
                Ok(()) => {
                    self.mark_processed(event.outbox_id).await?;
                    report.delivered += 1;
                }
                Err(error) => match self.mark_failed(event.outbox_id, &error).await? {
                    OutboxStatus::Dead => {
                        warn!(outbox_id = %event.outbox_id, channel = %event.channel, error = %error, "Notification dead-lettered");
                        report.dead_lettered += 1;
                    }
                    _ => {
                        debug!(outbox_id = %event.outbox_id, error = %error, "Notification delivery will be retried");
                        report.retried += 1;
                    }
                },
            }
        }

        Ok(report)
    }

    /// Dead-lettered rows for manual inspection
    pub async fn get_dead_letters(&self, limit: i64) -> Result<Vec<OutboxEvent>, OutboxError> {
        let rows = sqlx::query_as::<_, OutboxEventRow>(
            r#"
            SELECT outbox_id, channel, payload, status, attempts, available_at,
                   locked_at, locked_by, last_error, created_at, processed_at
            FROM safety_outbox
            WHERE status = 'dead'
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    /// Put a dead-lettered row back in the queue
    pub async fn retry_dead_letter(&self, outbox_id: Uuid) -> Result<(), OutboxError> {
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            UPDATE safety_outbox
            SET status = 'pending',
                attempts = 0,
                available_at = $1,
                last_error = NULL
            WHERE outbox_id = $2 AND status = 'dead'
            "#,
        )
        .bind(now)
        .bind(outbox_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OutboxError::EventNotFound(outbox_id));
        }

        Ok(())
    }

    pub async fn get_stats(&self) -> Result<OutboxStats, OutboxError> {
        let row = sqlx::query_as::<_, OutboxStatsRow>(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') as pending_count,
                COUNT(*) FILTER (WHERE status = 'processing') as processing_count,
                COUNT(*) FILTER (WHERE status = 'processed') as processed_count,
                COUNT(*) FILTER (WHERE status = 'dead') as dead_count
            FROM safety_outbox
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(OutboxStats {
            pending: row.pending_count.unwrap_or(0),
            processing: row.processing_count.unwrap_or(0),
            processed: row.processed_count.unwrap_or(0),
            dead: row.dead_count.unwrap_or(0),
        })
    }

    /// Delete delivered rows older than the given age
    pub async fn cleanup_processed(&self, older_than_days: i64) -> Result<u64, OutboxError> {
        let cutoff = Utc::now() - Duration::days(older_than_days);

        let result = sqlx::query(
            r#"
            DELETE FROM safety_outbox
            WHERE status = 'processed' AND processed_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

fn backoff_delay_secs(config: &OutboxConfig, attempts: i32) -> i64 {
    let exponent = attempts.clamp(0, 30) as u32;
    config
        .base_delay_secs
        .saturating_mul(2_i64.saturating_pow(exponent))
        .min(config.max_delay_secs)
}

/// Notifier that writes every notification to the outbox
#[derive(Clone)]
pub struct OutboxNotifier {
    outbox: Arc<OutboxService>,
}

impl OutboxNotifier {
    pub fn new(outbox: Arc<OutboxService>) -> Self {
        Self { outbox }
    }
}

#[async_trait]
impl Notifier for OutboxNotifier {
    async fn publish(&self, notification: SafetyNotification) -> Result<(), NotifyError> {
        self.outbox.insert(&notification).await?;
        Ok(())
    }
}

/// Outbox statistics
#[derive(Debug, Clone, Serialize)]
pub struct OutboxStats {
    pub pending: i64,
    pub processing: i64,
    pub processed: i64,
    pub dead: i64,
}

/// Internal row type for database queries
#[derive(Debug, sqlx::FromRow)]
struct OutboxEventRow {
    outbox_id: Uuid,
    channel: String,
    payload: serde_json::Value,
    status: OutboxStatus,
    attempts: i32,
    available_at: DateTime<Utc>,
    locked_at: Option<DateTime<Utc>>,
    locked_by: Option<String>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl From<OutboxEventRow> for OutboxEvent {
    fn from(row: OutboxEventRow) -> Self {
        Self {
            outbox_id: row.outbox_id,
            channel: row.channel,
            payload: row.payload,
            status: row.status,
            attempts: row.attempts,
            available_at: row.available_at,
            locked_at: row.locked_at,
            locked_by: row.locked_by,
            last_error: row.last_error,
            created_at: row.created_at,
            processed_at: row.processed_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OutboxStatsRow {
    pending_count: Option<i64>,
    processing_count: Option<i64>,
    processed_count: Option<i64>,
    dead_count: Option<i64>,
}
