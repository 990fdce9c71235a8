use crate::error::{StoreError, StoreResult};
use crate::models::{EvidenceRecord, EvidenceSource, NewEvidence, RelationshipType};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

#[async_trait]
pub trait EvidenceRepository: Send + Sync {
    /// Append one item of Candidate Evidence. Rows are never updated or
    /// deleted afterward (invariant 4).
    async fn append(&self, evidence: &NewEvidence) -> StoreResult<EvidenceRecord>;

    /// All evidence recorded for a given POI pair, across every scope and
    /// relationship type, used by the reconciliation worker's noisy-OR
    /// combiner (spec §4.8).
    async fn for_pair(&self, from_poi_id: &str, to_poi_id: &str) -> StoreResult<Vec<EvidenceRecord>>;

    /// Distinct `(from_poi_id, to_poi_id)` pairs with evidence recorded
    /// since the given evidence row id, for incremental reconciliation runs.
    async fn pairs_since(&self, since_id: i64) -> StoreResult<Vec<(String, String)>>;

    async fn max_id(&self) -> StoreResult<i64>;
}

pub struct SqliteEvidenceRepository {
    pool: SqlitePool,
}

impl SqliteEvidenceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> StoreResult<EvidenceRecord> {
        let relationship_type_str: String = row.try_get("relationship_type")?;
        let evidence_source_str: String = row.try_get("evidence_source")?;
        let metadata_str: String = row.try_get("metadata")?;
        Ok(EvidenceRecord {
            id: row.try_get("id")?,
            from_poi_id: row.try_get("from_poi_id")?,
            to_poi_id: row.try_get("to_poi_id")?,
            relationship_type: RelationshipType::parse(&relationship_type_str).ok_or_else(|| {
                StoreError::InvariantViolation(format!("unknown relationship type: {relationship_type_str}"))
            })?,
            evidence_source: EvidenceSource::parse(&evidence_source_str).ok_or_else(|| {
                StoreError::InvariantViolation(format!("unknown evidence source: {evidence_source_str}"))
            })?,
            confidence: row.try_get("confidence")?,
            metadata: serde_json::from_str(&metadata_str)
                .map_err(|e| StoreError::InvariantViolation(format!("malformed evidence metadata: {e}")))?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl EvidenceRepository for SqliteEvidenceRepository {
    async fn append(&self, evidence: &NewEvidence) -> StoreResult<EvidenceRecord> {
        let result = sqlx::query(
            r#"
            INSERT INTO relationship_evidence
                (from_poi_id, to_poi_id, relationship_type, evidence_source, confidence, metadata)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&evidence.from_poi_id)
        .bind(&evidence.to_poi_id)
        .bind(evidence.relationship_type.as_str())
        .bind(evidence.evidence_source.as_str())
        .bind(evidence.confidence)
        .bind(evidence.metadata.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            StoreError::from_sqlite_constraint(
                e,
                format!("evidence {} -> {}", evidence.from_poi_id, evidence.to_poi_id),
            )
        })?;

        let id = result.last_insert_rowid();
        let row = sqlx::query(
            "SELECT id, from_poi_id, to_poi_id, relationship_type, evidence_source, confidence, metadata, created_at FROM relationship_evidence WHERE id = ?",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        Self::row_to_record(&row)
    }

    async fn for_pair(&self, from_poi_id: &str, to_poi_id: &str) -> StoreResult<Vec<EvidenceRecord>> {
        let rows = sqlx::query(
            "SELECT id, from_poi_id, to_poi_id, relationship_type, evidence_source, confidence, metadata, created_at FROM relationship_evidence WHERE from_poi_id = ? AND to_poi_id = ? ORDER BY id ASC",
        )
        .bind(from_poi_id)
        .bind(to_poi_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn pairs_since(&self, since_id: i64) -> StoreResult<Vec<(String, String)>> {
        let rows = sqlx::query(
            "SELECT DISTINCT from_poi_id, to_poi_id FROM relationship_evidence WHERE id > ? ORDER BY from_poi_id, to_poi_id",
        )
        .bind(since_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| Ok((row.try_get("from_poi_id")?, row.try_get("to_poi_id")?)))
            .collect()
    }

    async fn max_id(&self) -> StoreResult<i64> {
        let row = sqlx::query("SELECT COALESCE(MAX(id), 0) AS max_id FROM relationship_evidence")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("max_id")?)
    }
}
