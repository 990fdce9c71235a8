//! # Transactional Outbox Pattern Implementation
//!
//! This library implements the Transactional Outbox pattern so that a
//! relational-store write and its triggering queue event are published
//! exactly-once, even across process crashes.
//!
//! ## Protocol
//!
//! 1. Business logic and an `OutboxEvent` row are written in the same SQLite
//!    transaction.
//! 2. A single background [`OutboxProcessor`] polls
//!    `outbox WHERE status = 'pending' ORDER BY id LIMIT N` and enqueues each
//!    row onto its target queue via the Redis-backed [`queue_broker::QueueBroker`].
//! 3. On a successful enqueue the row is marked `published`; on failure it is
//!    left `pending` and retried on the next poll tick with exponential
//!    backoff.
//!
//! If the processor crashes after the broker ack but before the status
//! update, the row is redelivered on restart. Every downstream handler MUST
//! therefore be idempotent (see the `idempotent-consumer` crate).
//!
//! ## Usage
//!
//! ```rust,no_run
//! use outbox::{OutboxEvent, OutboxRepository, SqliteOutboxRepository};
//! use sqlx::SqlitePool;
//!
//! async fn record_file_discovered(
//!     pool: &SqlitePool,
//!     repo: &SqliteOutboxRepository,
//!     file_id: i64,
//! ) -> Result<(), Box<dyn std::error::Error>> {
//!     let mut tx = pool.begin().await?;
//!
//!     sqlx::query("UPDATE files SET status = 'analyzing' WHERE id = ?")
//!         .bind(file_id)
//!         .execute(&mut *tx)
//!         .await?;
//!
//!     let event = OutboxEvent::new(
//!         "file.batched",
//!         "file-analysis-queue",
//!         serde_json::json!({ "file_id": file_id }),
//!     );
//!     repo.insert(&mut tx, &event).await?;
//!
//!     tx.commit().await?;
//!     Ok(())
//! }
//! ```

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

mod error;
pub mod macros;
pub mod metrics;

pub use error::{OutboxError, OutboxResult};

/// Lifecycle of an outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Published,
    Failed,
}

impl OutboxStatus {
    fn as_str(self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Published => "published",
            OutboxStatus::Failed => "failed",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "published" => OutboxStatus::Published,
            "failed" => OutboxStatus::Failed,
            _ => OutboxStatus::Pending,
        }
    }
}

/// Represents an event stored in the outbox table (spec §3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    /// Assigned by the store on insert; `0` before insertion.
    pub id: i64,

    /// Fully qualified event type (e.g. "file.batched", "relationship.accepted").
    pub event_type: String,

    /// Target queue name this event is destined for.
    pub queue_name: String,

    /// Event payload, forwarded opaquely to the queue.
    pub payload: serde_json::Value,

    pub status: OutboxStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub last_error: Option<String>,
}

impl OutboxEvent {
    pub fn new(event_type: impl Into<String>, queue_name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: 0,
            event_type: event_type.into(),
            queue_name: queue_name.into(),
            payload,
            status: OutboxStatus::Pending,
            created_at: Utc::now(),
            processed_at: None,
            retry_count: 0,
            last_error: None,
        }
    }
}

/// Repository trait for managing outbox events in the relational store.
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Insert a new event within an active transaction (invariant 3: rows
    /// receive monotonically increasing ids per queue by insertion order).
    async fn insert(&self, tx: &mut Transaction<'_, Sqlite>, event: &OutboxEvent) -> OutboxResult<()>;

    /// Fetch pending events ordered by id ascending (oldest first).
    async fn get_pending(&self, limit: i64) -> OutboxResult<Vec<OutboxEvent>>;

    async fn mark_published(&self, event_id: i64) -> OutboxResult<()>;

    async fn mark_failed(&self, event_id: i64, error: &str) -> OutboxResult<()>;

    /// Pending count and oldest-pending age in seconds (0 if none pending).
    async fn pending_stats(&self) -> OutboxResult<(i64, i64)>;
}

/// SQLx-based implementation of [`OutboxRepository`] backed by SQLite.
pub struct SqliteOutboxRepository {
    pool: SqlitePool,
}

impl SqliteOutboxRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn pending_stats_impl(&self) -> OutboxResult<(i64, i64)> {
        let rec = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS pending,
                COALESCE(CAST(strftime('%s','now') AS INTEGER) - MIN(CAST(strftime('%s', created_at) AS INTEGER)), 0) AS age_seconds
            FROM outbox
            WHERE status = 'pending'
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("failed to compute pending stats")?;

        let pending: i64 = rec.try_get("pending").unwrap_or(0);
        let age: i64 = rec.try_get("age_seconds").unwrap_or(0);
        Ok((pending, age))
    }

    /// Replay previously-published events created since `ts`, for operational
    /// backfill / graph-rebuild (spec §8 round-trip property).
    pub async fn replay_since(&self, ts: DateTime<Utc>) -> OutboxResult<u64> {
        let res = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'pending', processed_at = NULL, retry_count = 0, last_error = NULL
            WHERE created_at >= ?
            "#,
        )
        .bind(ts)
        .execute(&self.pool)
        .await
        .context("failed to replay events since timestamp")?;

        Ok(res.rows_affected())
    }
}

#[async_trait]
impl OutboxRepository for SqliteOutboxRepository {
    async fn insert(&self, tx: &mut Transaction<'_, Sqlite>, event: &OutboxEvent) -> OutboxResult<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox (event_type, queue_name, payload, status, created_at, processed_at, retry_count, last_error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.event_type)
        .bind(&event.queue_name)
        .bind(&event.payload)
        .bind(event.status.as_str())
        .bind(event.created_at)
        .bind(event.processed_at)
        .bind(event.retry_count)
        .bind(&event.last_error)
        .execute(&mut **tx)
        .await
        .context("failed to insert event into outbox")?;

        debug!(event_type = %event.event_type, queue = %event.queue_name, "event inserted into outbox");
        Ok(())
    }

    async fn get_pending(&self, limit: i64) -> OutboxResult<Vec<OutboxEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, event_type, queue_name, payload, status, created_at, processed_at, retry_count, last_error
            FROM outbox
            WHERE status = 'pending'
            ORDER BY id ASC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch pending events")?;

        let events = rows
            .into_iter()
            .map(|row| {
                Ok(OutboxEvent {
                    id: row.try_get("id")?,
                    event_type: row.try_get("event_type")?,
                    queue_name: row.try_get("queue_name")?,
                    payload: row.try_get("payload")?,
                    status: OutboxStatus::from_str(row.try_get::<String, _>("status")?.as_str()),
                    created_at: row.try_get("created_at")?,
                    processed_at: row.try_get("processed_at")?,
                    retry_count: row.try_get("retry_count")?,
                    last_error: row.try_get("last_error")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .context("failed to parse outbox rows")?;

        debug!(count = events.len(), "fetched pending outbox events");
        Ok(events)
    }

    async fn mark_published(&self, event_id: i64) -> OutboxResult<()> {
        let result = sqlx::query(
            "UPDATE outbox SET status = 'published', processed_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(event_id)
        .execute(&self.pool)
        .await
        .context("failed to mark event as published")?;

        if result.rows_affected() == 0 {
            warn!(event_id, "event not found when marking as published");
            return Err(OutboxError::EventNotFound(event_id));
        }
        debug!(event_id, "event marked as published");
        Ok(())
    }

    async fn mark_failed(&self, event_id: i64, error: &str) -> OutboxResult<()> {
        let result = sqlx::query(
            "UPDATE outbox SET retry_count = retry_count + 1, last_error = ? WHERE id = ?",
        )
        .bind(error)
        .bind(event_id)
        .execute(&self.pool)
        .await
        .context("failed to mark event as failed")?;

        if result.rows_affected() == 0 {
            warn!(event_id, "event not found when marking as failed");
            return Err(OutboxError::EventNotFound(event_id));
        }
        warn!(event_id, error, "event marked as failed");
        Ok(())
    }

    async fn pending_stats(&self) -> OutboxResult<(i64, i64)> {
        self.pending_stats_impl().await
    }
}

/// Publisher trait for delivering an outbox event onto its target queue.
#[async_trait]
pub trait OutboxPublisher: Send + Sync {
    async fn publish(&self, event: &OutboxEvent) -> OutboxResult<()>;
}

/// [`OutboxPublisher`] backed by the Redis [`queue_broker::QueueBroker`].
pub struct QueueBrokerPublisher {
    broker: Arc<queue_broker::QueueBroker>,
}

impl QueueBrokerPublisher {
    pub fn new(broker: Arc<queue_broker::QueueBroker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl OutboxPublisher for QueueBrokerPublisher {
    async fn publish(&self, event: &OutboxEvent) -> OutboxResult<()> {
        self.broker
            .enqueue(&event.queue_name, event.payload.clone())
            .await
            .map_err(|e| OutboxError::PublishFailed(e.to_string()))?;

        info!(event_id = event.id, event_type = %event.event_type, queue = %event.queue_name, "event published");
        Ok(())
    }
}

/// Background processor that drains the outbox into the queue broker.
///
/// Only one instance should run per deployment; leadership is held via a
/// [`redis_utils::DistributedLease`] keyed `outbox-publisher-leader` by the
/// caller before starting this loop.
pub struct OutboxProcessor<R: OutboxRepository, P: OutboxPublisher> {
    repository: Arc<R>,
    publisher: Arc<P>,
    batch_size: i64,
    poll_interval: Duration,
    max_retries: i32,
    metrics: Option<crate::metrics::OutboxMetrics>,
}

impl<R: OutboxRepository, P: OutboxPublisher> OutboxProcessor<R, P> {
    pub fn new(
        repository: Arc<R>,
        publisher: Arc<P>,
        batch_size: i64,
        poll_interval: Duration,
        max_retries: i32,
    ) -> Self {
        Self {
            repository,
            publisher,
            batch_size,
            poll_interval,
            max_retries,
            metrics: None,
        }
    }

    pub fn new_with_metrics(
        repository: Arc<R>,
        publisher: Arc<P>,
        metrics: crate::metrics::OutboxMetrics,
        batch_size: i64,
        poll_interval: Duration,
        max_retries: i32,
    ) -> Self {
        Self {
            repository,
            publisher,
            batch_size,
            poll_interval,
            max_retries,
            metrics: Some(metrics),
        }
    }

    /// Runs indefinitely, polling for pending events and publishing them.
    pub async fn start(&self) -> anyhow::Result<()> {
        info!(
            batch_size = self.batch_size,
            poll_interval_secs = self.poll_interval.as_secs(),
            max_retries = self.max_retries,
            "outbox processor starting"
        );

        loop {
            match self.process_batch().await {
                Ok(count) if count > 0 => info!(published_count = count, "published events from outbox"),
                Ok(_) => debug!("no pending events"),
                Err(e) => error!(error = ?e, "outbox processor error"),
            }

            if let Some(metrics) = &self.metrics {
                if let Ok((pending, age)) = self.repository.pending_stats().await {
                    metrics.pending.set(pending);
                    metrics.oldest_pending_age_seconds.set(age);
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn process_batch(&self) -> OutboxResult<i32> {
        let events = self.repository.get_pending(self.batch_size).await?;
        let mut published_count = 0;

        for event in events {
            if event.retry_count >= self.max_retries {
                warn!(
                    event_id = event.id,
                    retry_count = event.retry_count,
                    max_retries = self.max_retries,
                    "event exceeded max retries, skipping (requires manual intervention)"
                );
                continue;
            }

            let backoff_delay = self.calculate_backoff(event.retry_count);
            if backoff_delay.as_secs() > 0 {
                tokio::time::sleep(backoff_delay).await;
            }

            match self.publisher.publish(&event).await {
                Ok(_) => {
                    if let Err(e) = self.repository.mark_published(event.id).await {
                        error!(event_id = event.id, error = ?e, "failed to mark event as published (it was already delivered)");
                    } else {
                        published_count += 1;
                        if let Some(metrics) = &self.metrics {
                            metrics.published.inc();
                        }
                    }
                }
                Err(e) => {
                    error!(event_id = event.id, error = ?e, "failed to publish event");
                    if let Err(mark_err) = self.repository.mark_failed(event.id, &e.to_string()).await {
                        error!(event_id = event.id, error = ?mark_err, "failed to mark event as failed");
                    }
                }
            }
        }

        Ok(published_count)
    }

    /// Strategy: 2^retry_count seconds, capped at 5 minutes.
    fn calculate_backoff(&self, retry_count: i32) -> Duration {
        const MAX_BACKOFF_SECS: u64 = 300;
        let backoff_secs = 2u64.saturating_pow(retry_count.max(0) as u32).min(MAX_BACKOFF_SECS);
        Duration::from_secs(backoff_secs)
    }
}
