use thiserror::Error;

/// Errors surfaced by the graph store adapter.
#[derive(Debug, Error)]
pub enum GraphStoreError {
    #[error("failed to connect to graph store: {0}")]
    Connection(String),

    #[error("graph store query failed: {0}")]
    Query(String),
}

pub type GraphStoreResult<T> = Result<T, GraphStoreError>;
