//! Pool exhaustion and backpressure tests.
//!
//! Test coverage:
//! - Normal acquisition below capacity
//! - Early rejection once the pool hits its acquire timeout
//! - Metrics recording path
//! - Concurrent access safety
//! - Backpressure rejects before queuing behind a saturated pool

use pipeline_db::{acquire_with_backpressure, acquire_with_metrics, create_pool, BackpressureConfig, DbConfig};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

fn test_config(max_connections: u32, acquire_timeout_secs: u64) -> DbConfig {
    DbConfig {
        service_name: "pool-test".to_string(),
        db_path: ":memory:".to_string(),
        max_connections,
        min_connections: 1,
        acquire_timeout_secs,
        idle_timeout_secs: 60,
        max_lifetime_secs: 300,
        busy_timeout_ms: 1000,
    }
}

async fn test_pool(max_connections: u32, acquire_timeout_secs: u64) -> SqlitePool {
    create_pool(test_config(max_connections, acquire_timeout_secs))
        .await
        .expect("failed to create test pool")
}

#[tokio::test]
async fn test_normal_acquisition_below_threshold() {
    let pool = test_pool(5, 5).await;

    let mut connections = Vec::new();
    for _ in 0..3 {
        let conn = acquire_with_metrics(&pool, "pool-test")
            .await
            .expect("should acquire connection when below threshold");
        connections.push(conn);
    }

    assert_eq!(pool.size(), 3);
    assert_eq!(pool.num_idle(), 0);

    drop(connections);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(pool.num_idle() > 0);
}

#[tokio::test]
async fn test_early_rejection_at_capacity() {
    let pool = test_pool(2, 1).await;

    let _conn1 = pool.acquire().await.expect("first acquire should succeed");
    let _conn2 = pool.acquire().await.expect("second acquire should succeed");

    let result = acquire_with_metrics(&pool, "pool-test").await;
    assert!(result.is_err(), "should fail once pool is at capacity");
    assert!(matches!(result.unwrap_err(), sqlx::Error::PoolTimedOut));
}

#[tokio::test]
async fn test_metrics_recording_path_completes() {
    let pool = test_pool(5, 5).await;

    let conn = acquire_with_metrics(&pool, "pool-test")
        .await
        .expect("should acquire connection");

    assert!(conn.ping().await.is_ok());
}

#[tokio::test]
async fn test_concurrent_access_safety() {
    let pool = Arc::new(test_pool(10, 5).await);
    let mut handles = vec![];

    for i in 0..50 {
        let pool = Arc::clone(&pool);
        handles.push(tokio::spawn(async move {
            let mut conn = acquire_with_metrics(&pool, "pool-test")
                .await
                .unwrap_or_else(|_| panic!("task {i} failed to acquire connection"));

            sqlx::query("SELECT 1")
                .execute(&mut *conn)
                .await
                .expect("query should succeed")
                .rows_affected()
        }));
    }

    let mut success_count = 0;
    for handle in handles {
        if let Ok(rows) = handle.await {
            if rows == 0 {
                success_count += 1;
            }
        }
    }

    assert_eq!(success_count, 50, "all 50 tasks should complete");
}

#[tokio::test]
async fn test_backpressure_rejects_when_saturated() {
    let pool = test_pool(4, 5).await;
    let config = BackpressureConfig { threshold: 0.5 };

    let _conn1 = pool.acquire().await.unwrap();
    let _conn2 = pool.acquire().await.unwrap();

    let result = acquire_with_backpressure(&pool, "pool-test", &config).await;
    assert!(
        result.is_err(),
        "50% utilization should trip a 0.5 threshold"
    );
}

#[tokio::test]
async fn test_backpressure_allows_when_under_threshold() {
    let pool = test_pool(10, 5).await;
    let config = BackpressureConfig { threshold: 0.85 };

    let _conn1 = pool.acquire().await.unwrap();

    let result = acquire_with_backpressure(&pool, "pool-test", &config).await;
    assert!(result.is_ok(), "10% utilization should stay under threshold");
}
