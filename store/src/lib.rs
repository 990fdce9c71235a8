//! Relational store for the triangulation pipeline (spec §3).
//!
//! Backs the pipeline's authoritative state in SQLite: discovered files,
//! extracted Points-of-Interest, Candidate Evidence, Accepted Relationships,
//! directory summaries, the transactional outbox, and pipeline-run tracking.
//! The Neo4j graph store (see the `graph-store` crate) is a rebuildable
//! materialized view derived entirely from the `pois` and `relationships`
//! tables here; this crate is the source of truth.
//!
//! Migrations live in `store/migrations` and are applied via
//! `pipeline_db::migrate`.

mod directories;
mod error;
mod evidence;
mod files;
pub mod models;
mod pipeline_runs;
mod pois;
mod relationships;

pub use directories::{DirectorySummaryRepository, SqliteDirectorySummaryRepository};
pub use error::{StoreError, StoreResult};
pub use evidence::{EvidenceRepository, SqliteEvidenceRepository};
pub use files::{FileRepository, SqliteFileRepository};
pub use pipeline_runs::{PipelineRunRepository, SqlitePipelineRunRepository};
pub use pois::{PoiRepository, SqlitePoiRepository};
pub use relationships::{
    noisy_or_confidence, should_accept, ReconciliationWeights, RelationshipRepository,
    SqliteRelationshipRepository,
};

use sqlx::SqlitePool;
use std::sync::Arc;

/// Bundles every repository over one pool, so a caller only needs to wire up
/// the connection once (spec §10: one `SQLITE_DB_PATH` per pipeline run).
#[derive(Clone)]
pub struct Store {
    pub files: Arc<SqliteFileRepository>,
    pub pois: Arc<SqlitePoiRepository>,
    pub evidence: Arc<SqliteEvidenceRepository>,
    pub relationships: Arc<SqliteRelationshipRepository>,
    pub directory_summaries: Arc<SqliteDirectorySummaryRepository>,
    pub pipeline_runs: Arc<SqlitePipelineRunRepository>,
    pub pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            files: Arc::new(SqliteFileRepository::new(pool.clone())),
            pois: Arc::new(SqlitePoiRepository::new(pool.clone())),
            evidence: Arc::new(SqliteEvidenceRepository::new(pool.clone())),
            relationships: Arc::new(SqliteRelationshipRepository::new(pool.clone())),
            directory_summaries: Arc::new(SqliteDirectorySummaryRepository::new(pool.clone())),
            pipeline_runs: Arc::new(SqlitePipelineRunRepository::new(pool.clone())),
            pool,
        }
    }
}
