//! Integration tests for the idempotent consumer library.
//!
//! These exercise the guard against an in-memory SQLite pool, covering:
//! 1. Basic idempotency check and marking
//! 2. Concurrent processing safety (10 parallel consumers)
//! 3. Process-if-new atomic operation
//! 4. Cleanup of old events
//! 5. Error handling for invalid event IDs

use idempotent_consumer::{IdempotencyGuard, ProcessingResult};
use sqlx::{Row, SqlitePool};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

async fn test_pool() -> SqlitePool {
    let pool = SqlitePool::connect(":memory:").await.unwrap();
    sqlx::query(
        r#"
        CREATE TABLE processed_events (
            id TEXT PRIMARY KEY,
            event_id TEXT NOT NULL UNIQUE,
            processed_at TEXT NOT NULL,
            metadata TEXT
        )
        "#,
    )
    .execute(&pool)
    .await
    .unwrap();
    pool
}

#[tokio::test]
async fn test_is_processed_returns_false_for_new_event() {
    let pool = test_pool().await;
    let guard = IdempotencyGuard::new(pool, Duration::from_secs(86400));

    assert!(!guard.is_processed("evt-1").await.unwrap());
}

#[tokio::test]
async fn test_mark_processed_and_verify() {
    let pool = test_pool().await;
    let guard = IdempotencyGuard::new(pool, Duration::from_secs(86400));
    let event_id = "evt-mark-1";

    assert!(guard.mark_processed(event_id, None).await.unwrap());
    assert!(guard.is_processed(event_id).await.unwrap());
}

#[tokio::test]
async fn test_duplicate_mark_returns_false() {
    let pool = test_pool().await;
    let guard = IdempotencyGuard::new(pool, Duration::from_secs(86400));
    let event_id = "evt-dup-1";

    assert!(guard.mark_processed(event_id, None).await.unwrap());
    assert!(!guard.mark_processed(event_id, None).await.unwrap());
}

#[tokio::test]
async fn test_mark_processed_with_metadata() {
    let pool = test_pool().await;
    let guard = IdempotencyGuard::new(pool.clone(), Duration::from_secs(86400));
    let event_id = "evt-meta-1";

    let metadata = serde_json::json!({"queue": "file-analysis-queue", "row_id": 42});
    guard
        .mark_processed(event_id, Some(metadata.clone()))
        .await
        .unwrap();

    let row = sqlx::query("SELECT metadata FROM processed_events WHERE event_id = ?")
        .bind(event_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    let stored: Option<serde_json::Value> = row.try_get("metadata").unwrap();
    assert_eq!(stored, Some(metadata));
}

#[tokio::test]
async fn test_process_if_new_success() {
    let pool = test_pool().await;
    let guard = IdempotencyGuard::new(pool, Duration::from_secs(86400));
    let event_id = "evt-new-1";

    let counter = Arc::new(AtomicU32::new(0));
    let counter_clone = counter.clone();

    let result = guard
        .process_if_new(event_id, || async move {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(result, ProcessingResult::Success);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert!(guard.is_processed(event_id).await.unwrap());
}

#[tokio::test]
async fn test_process_if_new_already_processed() {
    let pool = test_pool().await;
    let guard = IdempotencyGuard::new(pool, Duration::from_secs(86400));
    let event_id = "evt-existing-1";

    guard.mark_processed(event_id, None).await.unwrap();

    let counter = Arc::new(AtomicU32::new(0));
    let counter_clone = counter.clone();

    let result = guard
        .process_if_new(event_id, || async move {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(result, ProcessingResult::AlreadyProcessed);
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_process_if_new_processing_fails() {
    let pool = test_pool().await;
    let guard = IdempotencyGuard::new(pool, Duration::from_secs(86400));
    let event_id = "evt-fail-1";

    let result = guard
        .process_if_new(event_id, || async { Err(anyhow::anyhow!("business logic failed")) })
        .await
        .unwrap();

    match result {
        ProcessingResult::Failed(msg) => assert!(msg.contains("business logic failed")),
        other => panic!("expected Failed, got {other:?}"),
    }

    assert!(!guard.is_processed(event_id).await.unwrap());
}

#[tokio::test]
async fn test_concurrent_processing_same_event() {
    let pool = test_pool().await;
    let guard = Arc::new(IdempotencyGuard::new(pool, Duration::from_secs(86400)));
    let event_id = "evt-concurrent-1";
    let execution_counter = Arc::new(AtomicU32::new(0));

    let mut handles = vec![];
    for i in 0..10 {
        let guard = guard.clone();
        let counter = execution_counter.clone();
        handles.push(tokio::spawn(async move {
            sleep(Duration::from_millis(i * 5)).await;
            guard
                .process_if_new(event_id, || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    sleep(Duration::from_millis(20)).await;
                    Ok(())
                })
                .await
        }));
    }

    let results: Vec<_> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    let success_count = results
        .iter()
        .filter(|r| **r == ProcessingResult::Success)
        .count();
    let already_count = results
        .iter()
        .filter(|r| **r == ProcessingResult::AlreadyProcessed)
        .count();

    assert_eq!(success_count, 1);
    assert_eq!(already_count, 9);
    assert_eq!(execution_counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_concurrent_marking_same_event() {
    let pool = test_pool().await;
    let guard = Arc::new(IdempotencyGuard::new(pool, Duration::from_secs(86400)));
    let event_id = "evt-concurrent-mark-1";

    let mut handles = vec![];
    for _ in 0..10 {
        let guard = guard.clone();
        handles.push(tokio::spawn(
            async move { guard.mark_processed(event_id, None).await },
        ));
    }

    let results: Vec<_> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    let success_count = results.iter().filter(|&&inserted| inserted).count();
    assert_eq!(success_count, 1);
}

#[tokio::test]
async fn test_cleanup_old_events() {
    let pool = test_pool().await;
    let guard = IdempotencyGuard::new(pool.clone(), Duration::from_secs(2));

    let old_event = "evt-old-1";
    let new_event = "evt-new-1";

    guard.mark_processed(old_event, None).await.unwrap();

    sqlx::query(
        "UPDATE processed_events SET processed_at = datetime('now', '-3 seconds') WHERE event_id = ?",
    )
    .bind(old_event)
    .execute(&pool)
    .await
    .unwrap();

    guard.mark_processed(new_event, None).await.unwrap();

    let deleted = guard.cleanup_old_events().await.unwrap();
    assert_eq!(deleted, 1);

    assert!(!guard.is_processed(old_event).await.unwrap());
    assert!(guard.is_processed(new_event).await.unwrap());
}

#[tokio::test]
async fn test_invalid_event_id_empty() {
    let pool = test_pool().await;
    let guard = IdempotencyGuard::new(pool, Duration::from_secs(86400));
    assert!(guard.is_processed("").await.is_err());
}

#[tokio::test]
async fn test_invalid_event_id_too_long() {
    let pool = test_pool().await;
    let guard = IdempotencyGuard::new(pool, Duration::from_secs(86400));
    let long_id = "x".repeat(256);
    assert!(guard.is_processed(&long_id).await.is_err());
}

#[tokio::test]
async fn test_multiple_different_events() {
    let pool = test_pool().await;
    let guard = IdempotencyGuard::new(pool, Duration::from_secs(86400));

    for i in 0..100 {
        let event_id = format!("evt-multi-{i}");
        guard.mark_processed(&event_id, None).await.unwrap();
    }

    for i in 0..100 {
        let event_id = format!("evt-multi-{i}");
        assert!(guard.is_processed(&event_id).await.unwrap());
    }
}

#[test]
fn test_processing_result_helpers() {
    assert!(ProcessingResult::Success.is_ok());
    assert!(ProcessingResult::AlreadyProcessed.is_ok());
    assert!(!ProcessingResult::Failed("error".to_string()).is_ok());

    assert!(!ProcessingResult::Success.is_failed());
    assert!(!ProcessingResult::AlreadyProcessed.is_failed());
    assert!(ProcessingResult::Failed("error".to_string()).is_failed());
}
