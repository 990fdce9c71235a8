use pipeline_errors::PipelineError;
use thiserror::Error;

/// Relational-store errors. `Conflict` and `InvariantViolation` are
/// distinguished from a bare database error so callers can tell a broken
/// business rule (spec §3 invariants) apart from transient infra failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0} not found")]
    NotFound(String),

    #[error("unique constraint violated: {0}")]
    Conflict(String),

    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}

impl StoreError {
    /// SQLite reports both UNIQUE and FOREIGN KEY violations as
    /// `SqliteError` with distinct extended codes; this distinguishes them
    /// so repositories can map each to the right `StoreError` variant.
    pub fn from_sqlite_constraint(err: sqlx::Error, context: impl Into<String>) -> Self {
        if let sqlx::Error::Database(ref db_err) = err {
            if db_err.is_unique_violation() {
                return StoreError::Conflict(context.into());
            }
            if db_err.message().contains("FOREIGN KEY") {
                return StoreError::InvariantViolation(context.into());
            }
        }
        StoreError::Database(err)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Database(e) => e.into(),
            StoreError::NotFound(msg) => PipelineError::DataInvariant(msg),
            StoreError::Conflict(msg) => PipelineError::DataInvariant(msg),
            StoreError::InvariantViolation(msg) => PipelineError::DataInvariant(msg),
        }
    }
}
