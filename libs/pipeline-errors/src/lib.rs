//! Shared error taxonomy for the triangulation pipeline
//!
//! Every worker, the outbox publisher, and the CLI convert their failures into
//! a `PipelineError` so that retry policy and dead-letter routing can be
//! decided in one place instead of re-derived per call site.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured record attached to a `failed-jobs` entry or a pipeline run's `last_error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    pub details: Option<String>,
    pub timestamp: String,
}

/// Error kinds recognized across the pipeline (spec §7).
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("transient infrastructure error: {0}")]
    TransientInfra(String),

    #[error("oracle call failed, retryable: {0}")]
    OracleRetryable(String),

    #[error("oracle call failed, not retryable: {0}")]
    OracleNonRetryable(String),

    #[error("data invariant violated: {0}")]
    DataInvariant(String),

    #[error("distributed lease lost: {0}")]
    LeaseLost(String),

    #[error("database error: {0}")]
    Database(String),
}

impl PipelineError {
    /// Whether a retry policy should requeue the job that raised this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Config(_) => false,
            PipelineError::TransientInfra(_) => true,
            PipelineError::OracleRetryable(_) => true,
            PipelineError::OracleNonRetryable(_) => false,
            PipelineError::DataInvariant(_) => false,
            PipelineError::LeaseLost(_) => false,
            PipelineError::Database(_) => true,
        }
    }

    /// Stable identifier stored alongside dead-lettered jobs.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Config(_) => "CONFIG_ERROR",
            PipelineError::TransientInfra(_) => "TRANSIENT_INFRA",
            PipelineError::OracleRetryable(_) => "ORACLE_RETRYABLE",
            PipelineError::OracleNonRetryable(_) => "ORACLE_NON_RETRYABLE",
            PipelineError::DataInvariant(_) => "DATA_INVARIANT",
            PipelineError::LeaseLost(_) => "LEASE_LOST",
            PipelineError::Database(_) => "DATABASE_ERROR",
        }
    }

    pub fn to_report(&self) -> ErrorReport {
        ErrorReport {
            code: self.code().to_string(),
            message: self.to_string(),
            retryable: self.is_retryable(),
            details: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => {
                PipelineError::DataInvariant("row not found".to_string())
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                PipelineError::TransientInfra(err.to_string())
            }
            other => PipelineError::Database(other.to_string()),
        }
    }
}

impl From<redis::RedisError> for PipelineError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() || err.is_connection_dropped() || err.is_connection_refusal() {
            PipelineError::TransientInfra(err.to_string())
        } else {
            PipelineError::TransientInfra(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(PipelineError::TransientInfra("x".into()).is_retryable());
        assert!(PipelineError::OracleRetryable("x".into()).is_retryable());
        assert!(!PipelineError::Config("x".into()).is_retryable());
        assert!(!PipelineError::OracleNonRetryable("x".into()).is_retryable());
        assert!(!PipelineError::DataInvariant("x".into()).is_retryable());
        assert!(!PipelineError::LeaseLost("x".into()).is_retryable());
    }

    #[test]
    fn test_error_report_fields() {
        let err = PipelineError::DataInvariant("missing poi".to_string());
        let report = err.to_report();
        assert_eq!(report.code, "DATA_INVARIANT");
        assert!(!report.retryable);
    }

    #[test]
    fn test_sqlx_row_not_found_maps_to_data_invariant() {
        let err: PipelineError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.code(), "DATA_INVARIANT");
    }
}
