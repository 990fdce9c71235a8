use crate::error::{StoreError, StoreResult};
use crate::models::{NewPoi, PoiKind, PoiRecord};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

#[async_trait]
pub trait PoiRepository: Send + Sync {
    /// Upsert by `poi_id` (file-analysis re-runs on an unchanged file must
    /// not create duplicate POIs).
    async fn upsert(&self, poi: &NewPoi) -> StoreResult<PoiRecord>;

    async fn upsert_many(&self, pois: &[NewPoi]) -> StoreResult<Vec<PoiRecord>>;

    async fn get(&self, poi_id: &str) -> StoreResult<PoiRecord>;

    async fn exists(&self, poi_id: &str) -> StoreResult<bool>;

    async fn list_by_file(&self, file_id: i64) -> StoreResult<Vec<PoiRecord>>;
}

pub struct SqlitePoiRepository {
    pool: SqlitePool,
}

impl SqlitePoiRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> StoreResult<PoiRecord> {
        let kind_str: String = row.try_get("kind")?;
        let metadata_str: String = row.try_get("metadata")?;
        Ok(PoiRecord {
            id: row.try_get("id")?,
            poi_id: row.try_get("poi_id")?,
            file_id: row.try_get("file_id")?,
            kind: PoiKind::parse(&kind_str)
                .ok_or_else(|| StoreError::InvariantViolation(format!("unknown poi kind: {kind_str}")))?,
            name: row.try_get("name")?,
            file_path: row.try_get("file_path")?,
            start_line: row.try_get("start_line")?,
            end_line: row.try_get("end_line")?,
            metadata: serde_json::from_str(&metadata_str)
                .map_err(|e| StoreError::InvariantViolation(format!("malformed poi metadata: {e}")))?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl PoiRepository for SqlitePoiRepository {
    async fn upsert(&self, poi: &NewPoi) -> StoreResult<PoiRecord> {
        sqlx::query(
            r#"
            INSERT INTO pois (poi_id, file_id, kind, name, file_path, start_line, end_line, metadata)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (poi_id) DO UPDATE SET
                name = excluded.name,
                file_path = excluded.file_path,
                start_line = excluded.start_line,
                end_line = excluded.end_line,
                metadata = excluded.metadata
            "#,
        )
        .bind(&poi.poi_id)
        .bind(poi.file_id)
        .bind(poi.kind.as_str())
        .bind(&poi.name)
        .bind(&poi.file_path)
        .bind(poi.start_line)
        .bind(poi.end_line)
        .bind(poi.metadata.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlite_constraint(e, format!("poi {}", poi.poi_id)))?;

        self.get(&poi.poi_id).await
    }

    async fn upsert_many(&self, pois: &[NewPoi]) -> StoreResult<Vec<PoiRecord>> {
        let mut records = Vec::with_capacity(pois.len());
        for poi in pois {
            records.push(self.upsert(poi).await?);
        }
        Ok(records)
    }

    async fn get(&self, poi_id: &str) -> StoreResult<PoiRecord> {
        let row = sqlx::query(
            "SELECT id, poi_id, file_id, kind, name, file_path, start_line, end_line, metadata, created_at FROM pois WHERE poi_id = ?",
        )
        .bind(poi_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("poi {poi_id}")))?;

        Self::row_to_record(&row)
    }

    async fn exists(&self, poi_id: &str) -> StoreResult<bool> {
        let row = sqlx::query("SELECT EXISTS(SELECT 1 FROM pois WHERE poi_id = ?) AS present")
            .bind(poi_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<bool, _>("present")?)
    }

    async fn list_by_file(&self, file_id: i64) -> StoreResult<Vec<PoiRecord>> {
        let rows = sqlx::query(
            "SELECT id, poi_id, file_id, kind, name, file_path, start_line, end_line, metadata, created_at FROM pois WHERE file_id = ? ORDER BY start_line ASC",
        )
        .bind(file_id)
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
        sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await.unwrap();
        sqlx::query(
            r#"
            CREATE TABLE files (id INTEGER PRIMARY KEY AUTOINCREMENT, path TEXT NOT NULL UNIQUE);
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            r#"
            CREATE TABLE pois (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                poi_id TEXT NOT NULL UNIQUE,
                file_id INTEGER NOT NULL REFERENCES files (id),
                kind TEXT NOT NULL,
                name TEXT NOT NULL,
                file_path TEXT NOT NULL,
                start_line INTEGER NOT NULL,
                end_line INTEGER NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("INSERT INTO files (id, path) VALUES (1, 'src/lib.rs')")
            .execute(&pool)
            .await
            .unwrap();
        pool
    }

    fn sample_poi() -> NewPoi {
        NewPoi {
            poi_id: "src/lib.rs::function::run::10".to_string(),
            file_id: 1,
            kind: PoiKind::Function,
            name: "run".to_string(),
            file_path: "src/lib.rs".to_string(),
            start_line: 10,
            end_line: 20,
            metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_by_poi_id() {
        let repo = SqlitePoiRepository::new(memory_pool().await);
        let first = repo.upsert(&sample_poi()).await.unwrap();

        let mut updated = sample_poi();
        updated.end_line = 25;
        let second = repo.upsert(&updated).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.end_line, 25);
    }

    #[tokio::test]
    async fn test_exists() {
        let repo = SqlitePoiRepository::new(memory_pool().await);
        assert!(!repo.exists("nope").await.unwrap());
        repo.upsert(&sample_poi()).await.unwrap();
        assert!(repo.exists(&sample_poi().poi_id).await.unwrap());
    }
}
