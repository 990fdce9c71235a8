//! Oracle client: the opaque LLM request/response boundary (C4/C5/C6's
//! shared upstream dependency).
//!
//! Wraps a bounded-concurrency, retrying HTTP client around the Anthropic
//! Messages API. Retries on HTTP 5xx and transient connection errors; 4xx
//! responses fail non-retryably. A global semaphore enforces
//! `ORACLE_MAX_CONCURRENT` in-process, and a circuit breaker trips after
//! repeated call failures so a degraded oracle doesn't pin every worker in
//! its retry loop.

mod config;

pub use config::OracleConfig;

use pipeline_errors::PipelineError;
use resilience::{oracle_config, with_timeout_result, CircuitBreaker, CircuitBreakerError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// A single oracle call: a system prompt and a user payload (serialized file
/// batch, directory POI set, or global resolution context — opaque to this
/// crate).
#[derive(Debug, Clone, Serialize)]
pub struct OracleRequest {
    pub system: String,
    pub user: String,
}

/// Token accounting returned alongside the oracle's response body.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OracleUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Oracle response: an opaque body (the caller parses POIs/relationships out
/// of it) plus usage for cost accounting.
#[derive(Debug, Clone)]
pub struct OracleResponse {
    pub body: String,
    pub usage: OracleUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlock {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicMessage {
    #[serde(default)]
    content: Vec<AnthropicContentBlock>,
    #[serde(default)]
    usage: AnthropicUsage,
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Oracle client enforcing the pipeline's retry, timeout, and concurrency
/// contract around LLM calls.
pub struct OracleClient {
    http: reqwest::Client,
    config: OracleConfig,
    semaphore: Arc<Semaphore>,
    breaker: CircuitBreaker,
}

impl OracleClient {
    pub fn new(config: OracleConfig) -> Self {
        let http = reqwest::Client::builder()
            .build()
            .expect("failed to build oracle HTTP client");

        Self {
            http,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent as usize)),
            breaker: CircuitBreaker::new(oracle_config().circuit_breaker),
            config,
        }
    }

    /// Call the oracle, retrying retryable failures and failing fast once
    /// the circuit has tripped. Waits on the global concurrency permit
    /// first, per spec's FIFO-queue semantics (Semaphore's own waiter
    /// queue is FIFO).
    pub async fn call(&self, request: OracleRequest) -> Result<OracleResponse, PipelineError> {
        let _permit = self.semaphore.acquire().await.map_err(|_| {
            PipelineError::TransientInfra("oracle concurrency semaphore closed".to_string())
        })?;

        let last_retryable = Arc::new(AtomicBool::new(true));
        let flag = last_retryable.clone();

        let outcome = self
            .breaker
            .call(move || async move {
                match self.call_with_retry(&request).await {
                    Ok(response) => Ok(response),
                    Err(err) => {
                        flag.store(err.is_retryable(), Ordering::SeqCst);
                        Err(err)
                    }
                }
            })
            .await;

        match outcome {
            Ok(response) => Ok(response),
            Err(CircuitBreakerError::Open) => {
                warn!("oracle circuit breaker open, failing fast");
                Err(PipelineError::TransientInfra(
                    "oracle circuit breaker open".to_string(),
                ))
            }
            Err(CircuitBreakerError::CallFailed(msg)) => {
                if last_retryable.load(Ordering::SeqCst) {
                    Err(PipelineError::OracleRetryable(msg))
                } else {
                    Err(PipelineError::OracleNonRetryable(msg))
                }
            }
        }
    }

    async fn call_with_retry(
        &self,
        request: &OracleRequest,
    ) -> Result<OracleResponse, PipelineError> {
        let retry = oracle_config()
            .retry
            .expect("oracle_config always carries a retry policy");

        let mut attempt = 0u32;
        let mut backoff = retry.initial_backoff;

        loop {
            match self.send_once(request).await {
                Ok(response) => return Ok(response),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => {
                    attempt += 1;
                    if attempt > retry.max_retries {
                        return Err(err);
                    }

                    let delay = jittered(backoff, retry.jitter);
                    warn!(attempt, max = retry.max_retries, ?delay, "retrying oracle call");
                    tokio::time::sleep(delay).await;

                    backoff = std::time::Duration::from_millis(
                        ((backoff.as_millis() as f64 * retry.backoff_multiplier)
                            .min(retry.max_backoff.as_millis() as f64))
                            as u64,
                    );
                }
            }
        }
    }

    async fn send_once(&self, request: &OracleRequest) -> Result<OracleResponse, PipelineError> {
        let body = serde_json::json!({
            "model": self.config.model,
            "max_tokens": self.config.max_response_tokens,
            "system": request.system,
            "messages": [{"role": "user", "content": request.user}],
        });

        let timeout = self.config.timeout;
        let send = self
            .http
            .post(&self.config.base_url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send();

        let response = with_timeout_result(timeout, send)
            .await
            .map_err(|e| PipelineError::OracleRetryable(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(PipelineError::OracleRetryable(format!(
                "oracle returned server error: {status}"
            )));
        }
        if status.is_client_error() {
            let text = response.text().await.unwrap_or_default();
            return Err(PipelineError::OracleNonRetryable(format!(
                "oracle returned client error {status}: {text}"
            )));
        }

        let raw = with_timeout_result(timeout, response.bytes())
            .await
            .map_err(|e| PipelineError::OracleRetryable(e.to_string()))?;

        if raw.len() > self.config.max_response_bytes {
            return Err(PipelineError::OracleNonRetryable(format!(
                "oracle response of {} bytes exceeds ceiling of {} bytes",
                raw.len(),
                self.config.max_response_bytes
            )));
        }

        let parsed: AnthropicMessage = serde_json::from_slice(&raw).map_err(|e| {
            PipelineError::OracleNonRetryable(format!("oracle response schema invalid: {e}"))
        })?;

        let text = parsed
            .content
            .into_iter()
            .map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");

        debug!(bytes = raw.len(), "oracle call completed");

        Ok(OracleResponse {
            body: text,
            usage: OracleUsage {
                input_tokens: parsed.usage.input_tokens,
                output_tokens: parsed.usage.output_tokens,
            },
        })
    }
}

fn jittered(base: std::time::Duration, jitter: bool) -> std::time::Duration {
    if !jitter {
        return base;
    }
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let factor = 1.0 + rng.gen_range(-0.3..0.3);
    std::time::Duration::from_millis((base.as_millis() as f64 * factor) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oracle_response_default_usage() {
        let usage = OracleUsage::default();
        assert_eq!(usage.input_tokens, 0);
        assert_eq!(usage.output_tokens, 0);
    }

    #[test]
    fn test_jittered_without_jitter_is_identity() {
        let base = std::time::Duration::from_millis(500);
        assert_eq!(jittered(base, false), base);
    }

    #[test]
    fn test_jittered_with_jitter_stays_in_bounds() {
        let base = std::time::Duration::from_millis(1000);
        for _ in 0..20 {
            let d = jittered(base, true);
            assert!(d.as_millis() >= 700 && d.as_millis() <= 1300);
        }
    }
}
