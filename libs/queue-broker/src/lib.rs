//! Redis-backed durable FIFO queue broker (component C1).
//!
//! Queues are Redis lists. A consumer atomically moves a job from the queue
//! list to a per-consumer processing list (`RPOPLPUSH`) so that a crashed
//! consumer's in-flight jobs can be recovered by scanning processing lists
//! older than the visibility timeout. Failed jobs are requeued with
//! exponential backoff via a delayed sorted set, and jobs that exceed
//! `max_attempts` are moved to `failed-jobs`.

use async_trait::async_trait;
use pipeline_errors::PipelineError;
use redis_utils::SharedConnectionManager;
use resilience::{CircuitBreaker, CircuitBreakerConfig};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

pub const FAILED_JOBS_QUEUE: &str = "failed-jobs";

/// Envelope wrapping a job payload as it moves through the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub job_id: String,
    pub payload: serde_json::Value,
    pub attempt: u32,
    pub original_queue: String,
}

/// Outcome a handler returns for a consumed job.
pub enum JobOutcome {
    Success,
    Retry(String),
    Fail(String),
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, envelope: &JobEnvelope) -> JobOutcome;
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub max_attempts: u32,
    pub visibility_timeout: Duration,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            visibility_timeout: Duration::from_secs(300),
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Adapter over a Redis connection manager exposing named durable queues.
#[derive(Clone)]
pub struct QueueBroker {
    manager: SharedConnectionManager,
    config: BrokerConfig,
    circuit_breaker: CircuitBreaker,
}

impl QueueBroker {
    pub fn new(manager: SharedConnectionManager, config: BrokerConfig) -> Self {
        Self {
            manager,
            config,
            circuit_breaker: CircuitBreaker::new(CircuitBreakerConfig::default()),
        }
    }

    fn delayed_key(queue: &str) -> String {
        format!("{queue}:delayed")
    }

    fn processing_key(queue: &str, consumer_id: &str) -> String {
        format!("{queue}:processing:{consumer_id}")
    }

    /// Enqueue a new job with attempt=0.
    pub async fn enqueue(&self, queue: &str, payload: serde_json::Value) -> Result<(), PipelineError> {
        let envelope = JobEnvelope {
            job_id: uuid::Uuid::new_v4().to_string(),
            payload,
            attempt: 0,
            original_queue: queue.to_string(),
        };
        self.push_now(queue, &envelope).await
    }

    async fn push_now(&self, queue: &str, envelope: &JobEnvelope) -> Result<(), PipelineError> {
        let body = serde_json::to_string(envelope)
            .map_err(|e| PipelineError::DataInvariant(e.to_string()))?;
        let manager = self.manager.clone();
        let queue = queue.to_string();
        self.circuit_breaker
            .call(|| {
                let manager = manager.clone();
                let queue = queue.clone();
                let body = body.clone();
                async move {
                    let mut conn = manager.lock().await;
                    redis::cmd("LPUSH")
                        .arg(&queue)
                        .arg(&body)
                        .query_async::<_, i64>(&mut *conn)
                        .await
                        .map_err(|e| e.to_string())
                }
            })
            .await
            .map(|_| ())
            .map_err(|e| PipelineError::TransientInfra(e.to_string()))
    }

    /// Schedule a job to become visible after `delay`, used for backoff.
    async fn schedule_delayed(
        &self,
        queue: &str,
        envelope: &JobEnvelope,
        delay: Duration,
    ) -> Result<(), PipelineError> {
        let body = serde_json::to_string(envelope)
            .map_err(|e| PipelineError::DataInvariant(e.to_string()))?;
        let ready_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            + delay.as_secs();

        let mut conn = self.manager.lock().await;
        redis::cmd("ZADD")
            .arg(Self::delayed_key(queue))
            .arg(ready_at)
            .arg(&body)
            .query_async::<_, i64>(&mut *conn)
            .await
            .map_err(|e| PipelineError::TransientInfra(e.to_string()))?;
        Ok(())
    }

    /// Move any due delayed jobs back onto the live queue. Intended to be
    /// polled periodically by a background task per queue.
    pub async fn promote_due_delayed(&self, queue: &str) -> Result<u32, PipelineError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let mut conn = self.manager.lock().await;
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(Self::delayed_key(queue))
            .arg(0)
            .arg(now)
            .query_async(&mut *conn)
            .await
            .map_err(|e| PipelineError::TransientInfra(e.to_string()))?;

        let mut promoted = 0u32;
        for body in &due {
            let removed: i64 = redis::cmd("ZREM")
                .arg(Self::delayed_key(queue))
                .arg(body)
                .query_async(&mut *conn)
                .await
                .map_err(|e| PipelineError::TransientInfra(e.to_string()))?;
            if removed == 1 {
                redis::cmd("LPUSH")
                    .arg(queue)
                    .arg(body)
                    .query_async::<_, i64>(&mut *conn)
                    .await
                    .map_err(|e| PipelineError::TransientInfra(e.to_string()))?;
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    /// Number of jobs still waiting on `queue`: live list plus delayed
    /// (not-yet-due) backoff entries. Used by callers that need to know
    /// whether a queue has drained, e.g. to decide when a pipeline run has
    /// finished fanning out.
    pub async fn queue_depth(&self, queue: &str) -> Result<u64, PipelineError> {
        let mut conn = self.manager.lock().await;
        let live: u64 = redis::cmd("LLEN")
            .arg(queue)
            .query_async(&mut *conn)
            .await
            .map_err(|e| PipelineError::TransientInfra(e.to_string()))?;
        let delayed: u64 = redis::cmd("ZCARD")
            .arg(Self::delayed_key(queue))
            .query_async(&mut *conn)
            .await
            .map_err(|e| PipelineError::TransientInfra(e.to_string()))?;
        Ok(live + delayed)
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        backoff_with_jitter(&self.config, attempt)
    }

    /// Consume `queue` with `handler`, running up to `concurrency` jobs
    /// concurrently. Runs until the process is cancelled.
    pub async fn consume<H: JobHandler + 'static>(
        &self,
        queue: &str,
        consumer_id: &str,
        handler: Arc<H>,
        concurrency: usize,
    ) -> Result<(), PipelineError> {
        info!(queue, consumer_id, concurrency, "starting queue consumer");
        let semaphore = Arc::new(tokio::sync::Semaphore::new(concurrency));

        loop {
            let permit = semaphore.clone().acquire_owned().await.expect("semaphore closed");
            let envelope = match self.reserve_one(queue, consumer_id).await {
                Ok(Some(e)) => e,
                Ok(None) => {
                    drop(permit);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "queue reservation failed, backing off");
                    drop(permit);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let handler = handler.clone();
            let broker = self.clone();
            let queue_name = queue.to_string();
            let consumer_id = consumer_id.to_string();
            tokio::spawn(async move {
                let outcome = handler.handle(&envelope).await;
                broker
                    .finalize(&queue_name, &consumer_id, envelope, outcome)
                    .await;
                drop(permit);
            });
        }
    }

    async fn reserve_one(
        &self,
        queue: &str,
        consumer_id: &str,
    ) -> Result<Option<JobEnvelope>, PipelineError> {
        self.promote_due_delayed(queue).await.ok();
        let mut conn = self.manager.lock().await;
        let processing = Self::processing_key(queue, consumer_id);
        let body: Option<String> = redis::cmd("RPOPLPUSH")
            .arg(queue)
            .arg(&processing)
            .query_async(&mut *conn)
            .await
            .map_err(|e| PipelineError::TransientInfra(e.to_string()))?;

        match body {
            None => Ok(None),
            Some(body) => {
                let envelope: JobEnvelope = serde_json::from_str(&body)
                    .map_err(|e| PipelineError::DataInvariant(e.to_string()))?;
                Ok(Some(envelope))
            }
        }
    }

    async fn finalize(&self, queue: &str, consumer_id: &str, envelope: JobEnvelope, outcome: JobOutcome) {
        let processing = Self::processing_key(queue, consumer_id);
        let removed = {
            let mut conn = self.manager.lock().await;
            let body = serde_json::to_string(&envelope).unwrap_or_default();
            redis::cmd("LREM")
                .arg(&processing)
                .arg(1)
                .arg(&body)
                .query_async::<_, i64>(&mut *conn)
                .await
        };
        if let Err(e) = removed {
            error!(error = %e, job_id = %envelope.job_id, "failed to clear processing entry");
        }

        match outcome {
            JobOutcome::Success => {
                debug!(job_id = %envelope.job_id, queue, "job completed");
            }
            JobOutcome::Retry(reason) => {
                let next_attempt = envelope.attempt + 1;
                if next_attempt >= self.config.max_attempts {
                    warn!(job_id = %envelope.job_id, %reason, "max attempts exceeded, dead-lettering");
                    let mut dead = envelope.clone();
                    dead.attempt = next_attempt;
                    let _ = self.push_now(FAILED_JOBS_QUEUE, &dead).await;
                } else {
                    let mut retried = envelope.clone();
                    retried.attempt = next_attempt;
                    let delay = self.backoff_for(next_attempt);
                    if let Err(e) = self.schedule_delayed(queue, &retried, delay).await {
                        error!(error = %e, job_id = %envelope.job_id, "failed to schedule retry");
                    }
                }
            }
            JobOutcome::Fail(reason) => {
                warn!(job_id = %envelope.job_id, %reason, "job failed non-retryably, dead-lettering");
                let mut dead = envelope.clone();
                dead.attempt += 1;
                let _ = self.push_now(FAILED_JOBS_QUEUE, &dead).await;
            }
        }
    }

}

fn backoff_with_jitter(config: &BrokerConfig, attempt: u32) -> Duration {
    let exp = config.base_backoff.as_millis() as u64 * 2u64.saturating_pow(attempt);
    let capped = exp.min(config.max_backoff.as_millis() as u64);
    let jitter = rand::random::<f64>() * 0.3 - 0.15;
    let jittered = (capped as f64 * (1.0 + jitter)).max(0.0) as u64;
    Duration::from_millis(jittered)
}

pub use redis_utils::DistributedLease;
