use crate::error::{StoreError, StoreResult};
use crate::models::{FileRecord, FileStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

#[async_trait]
pub trait FileRepository: Send + Sync {
    /// Insert a newly discovered file, or return the existing row if its
    /// path is already known (re-discovery is idempotent).
    async fn discover(
        &self,
        path: &str,
        content_hash: &str,
        last_modified: DateTime<Utc>,
    ) -> StoreResult<FileRecord>;

    async fn get_by_path(&self, path: &str) -> StoreResult<Option<FileRecord>>;

    async fn get_by_id(&self, id: i64) -> StoreResult<FileRecord>;

    /// Advance `status`, enforcing invariant 5 (monotonic progression).
    async fn advance_status(&self, id: i64, next: FileStatus) -> StoreResult<()>;

    async fn list_by_status(&self, status: FileStatus) -> StoreResult<Vec<FileRecord>>;
}

pub struct SqliteFileRepository {
    pool: SqlitePool,
}

impl SqliteFileRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> StoreResult<FileRecord> {
        let status_str: String = row.try_get("status")?;
        Ok(FileRecord {
            id: row.try_get("id")?,
            path: row.try_get("path")?,
            content_hash: row.try_get("content_hash")?,
            last_modified: row.try_get("last_modified")?,
            status: FileStatus::parse(&status_str)
                .ok_or_else(|| StoreError::InvariantViolation(format!("unknown file status: {status_str}")))?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl FileRepository for SqliteFileRepository {
    async fn discover(
        &self,
        path: &str,
        content_hash: &str,
        last_modified: DateTime<Utc>,
    ) -> StoreResult<FileRecord> {
        if let Some(existing) = self.get_by_path(path).await? {
            return Ok(existing);
        }

        let result = sqlx::query(
            r#"
            INSERT INTO files (path, content_hash, last_modified, status)
            VALUES (?, ?, ?, 'discovered')
            ON CONFLICT (path) DO NOTHING
            "#,
        )
        .bind(path)
        .bind(content_hash)
        .bind(last_modified)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlite_constraint(e, format!("file {path}")))?;

        if result.rows_affected() == 0 {
            // Lost the race against a concurrent discoverer; read back.
            return self
                .get_by_path(path)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("file {path}")));
        }

        self.get_by_path(path)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("file {path}")))
    }

    async fn get_by_path(&self, path: &str) -> StoreResult<Option<FileRecord>> {
        let row = sqlx::query(
            "SELECT id, path, content_hash, last_modified, status, created_at, updated_at FROM files WHERE path = ?",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn get_by_id(&self, id: i64) -> StoreResult<FileRecord> {
        let row = sqlx::query(
            "SELECT id, path, content_hash, last_modified, status, created_at, updated_at FROM files WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("file id {id}")))?;

        Self::row_to_record(&row)
    }

    async fn advance_status(&self, id: i64, next: FileStatus) -> StoreResult<()> {
        let current = self.get_by_id(id).await?;
        if !current.status.can_advance_to(next) {
            return Err(StoreError::InvariantViolation(format!(
                "file {id} cannot advance from {:?} to {:?}",
                current.status, next
            )));
        }

        sqlx::query("UPDATE files SET status = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?")
            .bind(next.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn list_by_status(&self, status: FileStatus) -> StoreResult<Vec<FileRecord>> {
        let rows = sqlx::query(
            "SELECT id, path, content_hash, last_modified, status, created_at, updated_at FROM files WHERE status = ? ORDER BY id ASC",
        )
        .bind(status.as_str())
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
            CREATE TABLE files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT NOT NULL UNIQUE,
                content_hash TEXT NOT NULL,
                last_modified TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'discovered',
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();
        pool
    }

    #[tokio::test]
    async fn test_discover_is_idempotent() {
        let repo = SqliteFileRepository::new(memory_pool().await);
        let a = repo.discover("src/main.rs", "hash1", Utc::now()).await.unwrap();
        let b = repo.discover("src/main.rs", "hash1", Utc::now()).await.unwrap();
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn test_advance_status_rejects_skip() {
        let repo = SqliteFileRepository::new(memory_pool().await);
        let file = repo.discover("src/lib.rs", "hash1", Utc::now()).await.unwrap();

        let result = repo.advance_status(file.id, FileStatus::Analyzed).await;
        assert!(matches!(result, Err(StoreError::InvariantViolation(_))));
    }

    #[tokio::test]
    async fn test_advance_status_happy_path() {
        let repo = SqliteFileRepository::new(memory_pool().await);
        let file = repo.discover("src/lib.rs", "hash1", Utc::now()).await.unwrap();

        repo.advance_status(file.id, FileStatus::Analyzing).await.unwrap();
        repo.advance_status(file.id, FileStatus::Analyzed).await.unwrap();

        let updated = repo.get_by_id(file.id).await.unwrap();
        assert_eq!(updated.status, FileStatus::Analyzed);
    }
}
