//! Demonstrates connection pool metrics tracking.
//!
//! Run with:
//! ```bash
//! cargo run --example metrics_demo --features metrics
//! ```

use pipeline_db::{acquire_with_metrics, create_pool, DbConfig};
use prometheus::{Encoder, TextEncoder};
use sqlx::Row;
use std::time::Duration;
use tokio::time::sleep;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    println!("=== Pipeline DB Pool Metrics Demo ===\n");

    let db_path = std::env::var("SQLITE_DB_PATH").unwrap_or_else(|_| ":memory:".to_string());

    println!("Creating pool with config:");
    let config = DbConfig {
        service_name: "metrics-demo".to_string(),
        db_path,
        max_connections: 10,
        min_connections: 2,
        acquire_timeout_secs: 10,
        idle_timeout_secs: 60,
        max_lifetime_secs: 300,
        busy_timeout_ms: 5000,
    };
    config.log_config();

    let pool = create_pool(config).await?;
    println!("\n✓ Pool created successfully with automatic metrics\n");

    println!("Simulating database activity...\n");

    for i in 0..5 {
        println!("Iteration {}: Acquiring connection...", i + 1);

        let mut conn = acquire_with_metrics(&pool, "metrics-demo").await?;

        let result = sqlx::query("SELECT 1 as value")
            .fetch_one(&mut *conn)
            .await?;

        let value: i32 = result.get("value");
        println!("  Query result: {}", value);

        sleep(Duration::from_millis(200)).await;
    }

    println!("\n=== Metrics Snapshot ===\n");

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    for mf in metric_families {
        if mf.get_name().starts_with("pipeline_db_pool") {
            let mut buffer = Vec::new();
            encoder.encode(&[mf.clone()], &mut buffer)?;
            print!("{}", String::from_utf8(buffer)?);
        }
    }

    println!("\npipeline_db_pool_connections{{state=\"active\"}}  - currently in-use connections");
    println!("pipeline_db_pool_connections{{state=\"idle\"}}    - available connections in pool");
    println!("pipeline_db_pool_connections{{state=\"max\"}}     - maximum pool capacity");
    println!("pipeline_db_pool_acquire_duration_seconds_*      - acquisition latency histogram");
    println!("pipeline_db_pool_connection_errors_total         - acquisition errors\n");

    Ok(())
}
