use crate::error::{StoreError, StoreResult};
use crate::models::{EvidenceRecord, RelationshipRecord, RelationshipType};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

/// Per-scope weights for the noisy-OR evidence combiner (spec §4.8),
/// mirroring `pipeline_config::ReconciliationWeights` field-for-field so the
/// pipeline binary can pass its loaded config straight through without this
/// crate depending on configuration loading.
#[derive(Debug, Clone, Copy)]
pub struct ReconciliationWeights {
    pub deterministic: f64,
    pub intra_file: f64,
    pub intra_directory: f64,
    pub global: f64,
}

impl Default for ReconciliationWeights {
    fn default() -> Self {
        Self {
            deterministic: 1.0,
            intra_file: 0.7,
            intra_directory: 0.5,
            global: 0.4,
        }
    }
}

impl ReconciliationWeights {
    fn weight_for(&self, source: crate::models::EvidenceSource) -> f64 {
        use crate::models::EvidenceSource::*;
        match source {
            Deterministic => self.deterministic,
            IntraFile => self.intra_file,
            IntraDirectory => self.intra_directory,
            Global => self.global,
        }
    }
}

/// Combine per-scope evidence into one confidence score via noisy-OR:
/// `C = 1 - prod(1 - weight(source) * confidence)` (spec §4.8).
///
/// Evidence for distinct `relationship_type`s is combined independently;
/// callers are expected to have already filtered to one relationship type.
pub fn noisy_or_confidence(evidence: &[EvidenceRecord], weights: &ReconciliationWeights) -> f64 {
    let mut product_of_complements = 1.0;
    for item in evidence {
        let w = weights.weight_for(item.evidence_source);
        product_of_complements *= 1.0 - (w * item.confidence).clamp(0.0, 1.0);
    }
    1.0 - product_of_complements
}

/// Acceptance rule (spec §4.8): promote when at least two distinct sources
/// agree, OR any deterministic evidence exists, OR the combined confidence
/// reaches 0.85.
pub fn should_accept(evidence: &[EvidenceRecord], weights: &ReconciliationWeights) -> bool {
    use crate::models::EvidenceSource::Deterministic;

    let distinct_sources: std::collections::HashSet<_> =
        evidence.iter().map(|e| e.evidence_source).collect();

    distinct_sources.len() >= 2
        || evidence.iter().any(|e| e.evidence_source == Deterministic)
        || noisy_or_confidence(evidence, weights) >= 0.85
}

#[async_trait]
pub trait RelationshipRepository: Send + Sync {
    /// Upsert an Accepted Relationship. Fails with `InvariantViolation` if no
    /// Candidate Evidence exists for the pair (invariant 2).
    async fn upsert_accepted(
        &self,
        from_poi_id: &str,
        to_poi_id: &str,
        relationship_type: RelationshipType,
        confidence_score: f64,
        metadata: serde_json::Value,
    ) -> StoreResult<RelationshipRecord>;

    async fn get(
        &self,
        from_poi_id: &str,
        to_poi_id: &str,
        relationship_type: RelationshipType,
    ) -> StoreResult<Option<RelationshipRecord>>;

    async fn list_all(&self) -> StoreResult<Vec<RelationshipRecord>>;

    async fn count(&self) -> StoreResult<i64>;
}

pub struct SqliteRelationshipRepository {
    pool: SqlitePool,
}

impl SqliteRelationshipRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> StoreResult<RelationshipRecord> {
        let relationship_type_str: String = row.try_get("relationship_type")?;
        let metadata_str: String = row.try_get("metadata")?;
        Ok(RelationshipRecord {
            id: row.try_get("id")?,
            from_poi_id: row.try_get("from_poi_id")?,
            to_poi_id: row.try_get("to_poi_id")?,
            relationship_type: RelationshipType::parse(&relationship_type_str).ok_or_else(|| {
                StoreError::InvariantViolation(format!("unknown relationship type: {relationship_type_str}"))
            })?,
            confidence_score: row.try_get("confidence_score")?,
            metadata: serde_json::from_str(&metadata_str)
                .map_err(|e| StoreError::InvariantViolation(format!("malformed relationship metadata: {e}")))?,
            created_at: row.try_get("created_at")?,
        })
    }

    async fn has_evidence(
        &self,
        from_poi_id: &str,
        to_poi_id: &str,
        relationship_type: RelationshipType,
    ) -> StoreResult<bool> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM relationship_evidence WHERE from_poi_id = ? AND to_poi_id = ? AND relationship_type = ?) AS present",
        )
        .bind(from_poi_id)
        .bind(to_poi_id)
        .bind(relationship_type.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<bool, _>("present")?)
    }
}

#[async_trait]
impl RelationshipRepository for SqliteRelationshipRepository {
    async fn upsert_accepted(
        &self,
        from_poi_id: &str,
        to_poi_id: &str,
        relationship_type: RelationshipType,
        confidence_score: f64,
        metadata: serde_json::Value,
    ) -> StoreResult<RelationshipRecord> {
        if !self.has_evidence(from_poi_id, to_poi_id, relationship_type).await? {
            return Err(StoreError::InvariantViolation(format!(
                "no candidate evidence for {from_poi_id} -> {to_poi_id}, refusing to accept"
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO relationships (from_poi_id, to_poi_id, relationship_type, confidence_score, metadata)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (from_poi_id, to_poi_id, relationship_type) DO UPDATE SET
                confidence_score = excluded.confidence_score,
                metadata = excluded.metadata
            "#,
        )
        .bind(from_poi_id)
        .bind(to_poi_id)
        .bind(relationship_type.as_str())
        .bind(confidence_score)
        .bind(metadata.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlite_constraint(e, format!("relationship {from_poi_id} -> {to_poi_id}")))?;

        self.get(from_poi_id, to_poi_id, relationship_type)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("relationship {from_poi_id} -> {to_poi_id}")))
    }

    async fn get(
        &self,
        from_poi_id: &str,
        to_poi_id: &str,
        relationship_type: RelationshipType,
    ) -> StoreResult<Option<RelationshipRecord>> {
        let row = sqlx::query(
            "SELECT id, from_poi_id, to_poi_id, relationship_type, confidence_score, metadata, created_at FROM relationships WHERE from_poi_id = ? AND to_poi_id = ? AND relationship_type = ?",
        )
        .bind(from_poi_id)
        .bind(to_poi_id)
        .bind(relationship_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn list_all(&self) -> StoreResult<Vec<RelationshipRecord>> {
        let rows = sqlx::query(
            "SELECT id, from_poi_id, to_poi_id, relationship_type, confidence_score, metadata, created_at FROM relationships ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn count(&self) -> StoreResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM relationships")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("count")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EvidenceSource, NewEvidence};

    fn evidence(source: EvidenceSource, confidence: f64) -> EvidenceRecord {
        EvidenceRecord {
            id: 1,
            from_poi_id: "a".to_string(),
            to_poi_id: "b".to_string(),
            relationship_type: RelationshipType::Calls,
            evidence_source: source,
            confidence,
            metadata: serde_json::json!({}),
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_noisy_or_single_source() {
        let weights = ReconciliationWeights::default();
        let evidence = vec![evidence(EvidenceSource::IntraFile, 0.9)];
        let c = noisy_or_confidence(&evidence, &weights);
        assert!((c - 0.63).abs() < 1e-9);
    }

    #[test]
    fn test_noisy_or_combines_multiple_sources() {
        let weights = ReconciliationWeights::default();
        let evidence = vec![evidence(EvidenceSource::IntraFile, 0.9), evidence(EvidenceSource::Global, 0.5)];
        let c = noisy_or_confidence(&evidence, &weights);
        // 1 - (1 - 0.7*0.9)(1 - 0.4*0.5) = 1 - 0.37*0.8 = 0.704
        assert!((c - 0.704).abs() < 1e-9);
    }

    #[test]
    fn test_should_accept_deterministic_always_promotes() {
        let weights = ReconciliationWeights::default();
        let evidence = vec![evidence(EvidenceSource::Deterministic, 0.1)];
        assert!(should_accept(&evidence, &weights));
    }

    #[test]
    fn test_should_accept_two_distinct_sources_promotes() {
        let weights = ReconciliationWeights::default();
        let evidence = vec![evidence(EvidenceSource::IntraFile, 0.3), evidence(EvidenceSource::Global, 0.3)];
        assert!(should_accept(&evidence, &weights));
    }

    #[test]
    fn test_should_accept_rejects_weak_single_source() {
        let weights = ReconciliationWeights::default();
        let evidence = vec![evidence(EvidenceSource::Global, 0.3)];
        assert!(!should_accept(&evidence, &weights));
    }

    async fn memory_pool() -> SqlitePool {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        sqlx::query(
            r#"
            CREATE TABLE relationship_evidence (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                from_poi_id TEXT NOT NULL,
                to_poi_id TEXT NOT NULL,
                relationship_type TEXT NOT NULL,
                evidence_source TEXT NOT NULL,
                confidence REAL NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            r#"
            CREATE TABLE relationships (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                from_poi_id TEXT NOT NULL,
                to_poi_id TEXT NOT NULL,
                relationship_type TEXT NOT NULL,
                confidence_score REAL NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                UNIQUE (from_poi_id, to_poi_id, relationship_type)
            )
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();
        pool
    }

    #[tokio::test]
    async fn test_upsert_accepted_requires_evidence() {
        let repo = SqliteRelationshipRepository::new(memory_pool().await);
        let result = repo
            .upsert_accepted("a", "b", RelationshipType::Calls, 0.9, serde_json::json!({}))
            .await;
        assert!(matches!(result, Err(StoreError::InvariantViolation(_))));
    }

    #[tokio::test]
    async fn test_upsert_accepted_requires_evidence_of_the_matching_relationship_type() {
        let pool = memory_pool().await;
        sqlx::query("INSERT INTO relationship_evidence (from_poi_id, to_poi_id, relationship_type, evidence_source, confidence) VALUES ('a', 'b', 'imports', 'deterministic', 1.0)")
            .execute(&pool)
            .await
            .unwrap();

        let repo = SqliteRelationshipRepository::new(pool);
        let result = repo
            .upsert_accepted("a", "b", RelationshipType::Calls, 0.9, serde_json::json!({}))
            .await;
        assert!(matches!(result, Err(StoreError::InvariantViolation(_))));
    }

    #[tokio::test]
    async fn test_upsert_accepted_succeeds_with_evidence() {
        let pool = memory_pool().await;
        sqlx::query("INSERT INTO relationship_evidence (from_poi_id, to_poi_id, relationship_type, evidence_source, confidence) VALUES ('a', 'b', 'calls', 'deterministic', 1.0)")
            .execute(&pool)
            .await
            .unwrap();

        let repo = SqliteRelationshipRepository::new(pool);
        let record = repo
            .upsert_accepted("a", "b", RelationshipType::Calls, 0.95, serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(record.confidence_score, 0.95);
    }
}
