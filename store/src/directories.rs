use crate::error::{StoreError, StoreResult};
use crate::models::DirectorySummaryRecord;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

#[async_trait]
pub trait DirectorySummaryRepository: Send + Sync {
    async fn upsert(
        &self,
        directory_path: &str,
        summary: &str,
        metadata: serde_json::Value,
    ) -> StoreResult<DirectorySummaryRecord>;

    async fn get(&self, directory_path: &str) -> StoreResult<Option<DirectorySummaryRecord>>;
}

pub struct SqliteDirectorySummaryRepository {
    pool: SqlitePool,
}

impl SqliteDirectorySummaryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> StoreResult<DirectorySummaryRecord> {
        let metadata_str: String = row.try_get("metadata")?;
        Ok(DirectorySummaryRecord {
            id: row.try_get("id")?,
            directory_path: row.try_get("directory_path")?,
            summary: row.try_get("summary")?,
            metadata: serde_json::from_str(&metadata_str)
                .map_err(|e| StoreError::InvariantViolation(format!("malformed directory summary metadata: {e}")))?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl DirectorySummaryRepository for SqliteDirectorySummaryRepository {
    async fn upsert(
        &self,
        directory_path: &str,
        summary: &str,
        metadata: serde_json::Value,
    ) -> StoreResult<DirectorySummaryRecord> {
        sqlx::query(
            r#"
            INSERT INTO directory_summaries (directory_path, summary, metadata)
            VALUES (?, ?, ?)
            ON CONFLICT (directory_path) DO UPDATE SET
                summary = excluded.summary,
                metadata = excluded.metadata,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(directory_path)
        .bind(summary)
        .bind(metadata.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlite_constraint(e, format!("directory summary {directory_path}")))?;

        self.get(directory_path)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("directory summary {directory_path}")))
    }

    async fn get(&self, directory_path: &str) -> StoreResult<Option<DirectorySummaryRecord>> {
        let row = sqlx::query(
            "SELECT id, directory_path, summary, metadata, created_at, updated_at FROM directory_summaries WHERE directory_path = ?",
        )
        .bind(directory_path)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }
}
