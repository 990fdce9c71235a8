//! Convenience macros for working with the outbox.

/// Insert an outbox event within an active transaction.
///
/// # Usage
///
/// ```rust,no_run
/// use outbox::{publish_event, SqliteOutboxRepository};
/// use sqlx::SqlitePool;
/// use serde_json::json;
///
/// # async fn example(pool: SqlitePool, repo: SqliteOutboxRepository) -> Result<(), Box<dyn std::error::Error>> {
/// let mut tx = pool.begin().await?;
///
/// sqlx::query("UPDATE files SET status = 'analyzing' WHERE id = ?")
///     .bind(1i64)
///     .execute(&mut *tx)
///     .await?;
///
/// publish_event!(
///     &mut tx,
///     &repo,
///     "file.batched",
///     "file-analysis-queue",
///     json!({ "file_id": 1 })
/// );
///
/// tx.commit().await?;
/// # Ok(())
/// # }
/// ```
#[macro_export]
macro_rules! publish_event {
    ($tx:expr, $repo:expr, $event_type:expr, $queue_name:expr, $payload:expr) => {{
        use $crate::{OutboxEvent, OutboxRepository};

        let event = OutboxEvent::new($event_type, $queue_name, $payload);
        $repo.insert($tx, &event).await
    }};
}

#[cfg(test)]
mod tests {
    // Macro tests are compile-time checks. If this file compiles, the macro
    // is syntactically correct.
}
