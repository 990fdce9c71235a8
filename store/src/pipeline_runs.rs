use crate::error::{StoreError, StoreResult};
use crate::models::{PipelineRunRecord, PipelineRunStatus};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

/// Tracks a single invocation of the pipeline against a `target_directory`,
/// backing the `PipelineRegistry` actor (spec §10.5) and the CLI's `status`
/// subcommand (spec §6).
#[async_trait]
pub trait PipelineRunRepository: Send + Sync {
    async fn start(&self, pipeline_id: &str, target_directory: &str) -> StoreResult<PipelineRunRecord>;

    async fn get(&self, pipeline_id: &str) -> StoreResult<PipelineRunRecord>;

    async fn update_phase_counters(&self, pipeline_id: &str, phase_counters: serde_json::Value) -> StoreResult<()>;

    async fn finish(
        &self,
        pipeline_id: &str,
        status: PipelineRunStatus,
        last_error: Option<&str>,
    ) -> StoreResult<()>;

    async fn list_running(&self) -> StoreResult<Vec<PipelineRunRecord>>;
}

pub struct SqlitePipelineRunRepository {
    pool: SqlitePool,
}

impl SqlitePipelineRunRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> StoreResult<PipelineRunRecord> {
        let status_str: String = row.try_get("status")?;
        let phase_counters_str: String = row.try_get("phase_counters")?;
        Ok(PipelineRunRecord {
            id: row.try_get("id")?,
            pipeline_id: row.try_get("pipeline_id")?,
            target_directory: row.try_get("target_directory")?,
            status: PipelineRunStatus::parse(&status_str)
                .ok_or_else(|| StoreError::InvariantViolation(format!("unknown pipeline run status: {status_str}")))?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            phase_counters: serde_json::from_str(&phase_counters_str)
                .map_err(|e| StoreError::InvariantViolation(format!("malformed phase_counters: {e}")))?,
            last_error: row.try_get("last_error")?,
        })
    }
}

#[async_trait]
impl PipelineRunRepository for SqlitePipelineRunRepository {
    async fn start(&self, pipeline_id: &str, target_directory: &str) -> StoreResult<PipelineRunRecord> {
        sqlx::query(
            r#"
            INSERT INTO pipeline_runs (pipeline_id, target_directory, status)
            VALUES (?, ?, 'running')
            "#,
        )
        .bind(pipeline_id)
        .bind(target_directory)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlite_constraint(e, format!("pipeline run {pipeline_id}")))?;

        self.get(pipeline_id).await
    }

    async fn get(&self, pipeline_id: &str) -> StoreResult<PipelineRunRecord> {
        let row = sqlx::query(
            "SELECT id, pipeline_id, target_directory, status, started_at, finished_at, phase_counters, last_error FROM pipeline_runs WHERE pipeline_id = ?",
        )
        .bind(pipeline_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("pipeline run {pipeline_id}")))?;

        Self::row_to_record(&row)
    }

    async fn update_phase_counters(&self, pipeline_id: &str, phase_counters: serde_json::Value) -> StoreResult<()> {
        let result = sqlx::query("UPDATE pipeline_runs SET phase_counters = ? WHERE pipeline_id = ?")
            .bind(phase_counters.to_string())
            .bind(pipeline_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("pipeline run {pipeline_id}")));
        }
        Ok(())
    }

    async fn finish(
        &self,
        pipeline_id: &str,
        status: PipelineRunStatus,
        last_error: Option<&str>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE pipeline_runs SET status = ?, finished_at = CURRENT_TIMESTAMP, last_error = ? WHERE pipeline_id = ?",
        )
        .bind(status.as_str())
        .bind(last_error)
        .bind(pipeline_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("pipeline run {pipeline_id}")));
        }
        Ok(())
    }

    async fn list_running(&self) -> StoreResult<Vec<PipelineRunRecord>> {
        let rows = sqlx::query(
            "SELECT id, pipeline_id, target_directory, status, started_at, finished_at, phase_counters, last_error FROM pipeline_runs WHERE status = 'running' ORDER BY started_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_record).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_pool() -> SqlitePool {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        sqlx::query(
            r#"
            CREATE TABLE pipeline_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pipeline_id TEXT NOT NULL UNIQUE,
                target_directory TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'running',
                started_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                finished_at TEXT,
                phase_counters TEXT NOT NULL DEFAULT '{}',
                last_error TEXT
            )
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();
        pool
    }

    #[tokio::test]
    async fn test_start_and_finish_roundtrip() {
        let repo = SqlitePipelineRunRepository::new(memory_pool().await);
        let run = repo.start("run-1", "/repo").await.unwrap();
        assert_eq!(run.status, PipelineRunStatus::Running);

        repo.update_phase_counters("run-1", serde_json::json!({"files_discovered": 10}))
            .await
            .unwrap();

        repo.finish("run-1", PipelineRunStatus::Completed, None).await.unwrap();
        let finished = repo.get("run-1").await.unwrap();
        assert_eq!(finished.status, PipelineRunStatus::Completed);
        assert!(finished.finished_at.is_some());
        assert_eq!(finished.phase_counters["files_discovered"], 10);
    }

    #[tokio::test]
    async fn test_finish_unknown_run_errors() {
        let repo = SqlitePipelineRunRepository::new(memory_pool().await);
        let result = repo.finish("nope", PipelineRunStatus::Failed, Some("boom")).await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }
}
