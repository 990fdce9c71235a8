//! Shared application context wiring every ambient dependency (store, queue
//! broker, graph repository, oracle client, idempotency guard) into one
//! handle workers and the CLI both take by `Arc`.

use std::sync::Arc;
use std::time::Duration;

use graph_store::GraphRepository;
use idempotent_consumer::IdempotencyGuard;
use oracle_client::{OracleClient, OracleConfig};
use outbox::SqliteOutboxRepository;
use pipeline_config::PipelineConfig;
use queue_broker::{BrokerConfig, QueueBroker};
use redis_utils::RedisPool;
use sqlx::SqlitePool;
use store::Store;

/// Process-wide shared state. Cheap to clone (every field is an `Arc` or a
/// `sqlx` pool, which is itself a handle).
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<PipelineConfig>,
    pub pool: SqlitePool,
    pub store: Store,
    pub outbox: Arc<SqliteOutboxRepository>,
    pub broker: Arc<QueueBroker>,
    pub graph: Arc<GraphRepository>,
    pub oracle: Arc<OracleClient>,
    pub idempotency: Arc<IdempotencyGuard>,
    manager: redis_utils::SharedConnectionManager,
}

impl AppContext {
    pub async fn bootstrap(config: PipelineConfig) -> anyhow::Result<Self> {
        let db_config = pipeline_db::DbConfig {
            service_name: "pipeline".to_string(),
            db_path: config.store.db_path.clone(),
            ..pipeline_db::DbConfig::default()
        };
        db_config.log_config();
        let pool = pipeline_db::create_pool(db_config).await?;
        pipeline_db::migrate(&pool).await?;

        let store = Store::new(pool.clone());
        let outbox = Arc::new(SqliteOutboxRepository::new(pool.clone()));

        let redis_pool = RedisPool::connect(&config.redis.url, None).await?;
        let manager = redis_pool.manager();
        // Leaked intentionally: the pool's Sentinel/keepalive background
        // tasks must outlive this function; the process owns it for its
        // whole lifetime.
        Box::leak(Box::new(redis_pool));

        let broker = Arc::new(QueueBroker::new(
            manager.clone(),
            BrokerConfig {
                max_attempts: config.max_job_attempts,
                ..BrokerConfig::default()
            },
        ));

        let graph = Arc::new(
            GraphRepository::new(&config.graph.uri, &config.graph.user, &config.graph.password)
                .await?,
        );

        let oracle_config = OracleConfig {
            api_key: config.oracle.api_key.clone(),
            base_url: std::env::var("ORACLE_BASE_URL")
                .unwrap_or_else(|_| "https://api.anthropic.com/v1/messages".to_string()),
            model: std::env::var("ORACLE_MODEL")
                .unwrap_or_else(|_| "claude-3-5-sonnet-latest".to_string()),
            timeout: Duration::from_millis(config.oracle.timeout_ms),
            max_concurrent: config.oracle.max_concurrent,
            max_response_bytes: pipeline_db::parse_env_with_default(
                "ORACLE_MAX_RESPONSE_BYTES",
                10 * 1024 * 1024,
            ),
            max_response_tokens: pipeline_db::parse_env_with_default(
                "ORACLE_MAX_RESPONSE_TOKENS",
                8192,
            ),
        };
        let oracle = Arc::new(OracleClient::new(oracle_config));

        let idempotency = Arc::new(IdempotencyGuard::new(
            pool.clone(),
            Duration::from_secs(7 * 86_400),
        ));

        Ok(Self {
            config: Arc::new(config),
            pool,
            store,
            outbox,
            broker,
            graph,
            oracle,
            idempotency,
            manager,
        })
    }

    pub fn redis_manager(&self) -> redis_utils::SharedConnectionManager {
        self.manager.clone()
    }
}
