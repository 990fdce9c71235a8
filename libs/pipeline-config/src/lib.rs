//! Startup configuration for the triangulation pipeline.
//!
//! Loads `.env` via `dotenvy`, the required string settings via
//! `envy::from_env()`, and the numeric tunables via `pipeline_db`'s
//! `parse_env_with_default`/`parse_env_required` helpers, into one typed
//! [`PipelineConfig`]. Every recognized option is validated eagerly; the
//! caller is expected to exit with code 1 on the first error (spec §6).

mod error;

pub use error::ConfigError;

use pipeline_db::{parse_env_optional, parse_env_required, parse_env_with_default};
use serde::Deserialize;
use std::path::PathBuf;
use tracing::info;

/// String-valued settings with no sensible default, fetched in one shot via
/// `envy` (field names map to `SCREAMING_SNAKE_CASE` env vars).
#[derive(Debug, Deserialize)]
struct RequiredSettings {
    target_directory: String,
    sqlite_db_path: String,
    neo4j_uri: String,
    neo4j_user: String,
    redis_url: String,
    anthropic_api_key: String,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub db_path: String,
}

#[derive(Debug, Clone)]
pub struct GraphSettings {
    pub uri: String,
    pub user: String,
    pub password: String,
    pub database: String,
}

#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub url: String,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IngestorSettings {
    pub batch_size: u32,
    pub interval_ms: u64,
}

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub max_tokens: u32,
    pub max_files: u32,
}

/// Per-worker-type concurrency (spec §5).
#[derive(Debug, Clone)]
pub struct WorkerConcurrency {
    pub file_analysis: u32,
    pub directory: u32,
    pub reconciliation: u32,
    pub graph_builder: u32,
}

#[derive(Debug, Clone)]
pub struct OracleSettings {
    pub api_key: String,
    pub timeout_ms: u64,
    pub max_concurrent: u32,
}

/// Noisy-OR combiner weights (spec §4.8), overridable per source.
#[derive(Debug, Clone)]
pub struct ReconciliationWeights {
    pub deterministic: f64,
    pub intra_file: f64,
    pub intra_directory: f64,
    pub global: f64,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub environment: String,
    pub target_directory: PathBuf,
    pub store: StoreSettings,
    pub graph: GraphSettings,
    pub redis: RedisSettings,
    pub oracle: OracleSettings,
    pub ingestor: IngestorSettings,
    pub batch: BatchSettings,
    pub worker_concurrency: WorkerConcurrency,
    pub max_job_attempts: u32,
    pub reconciliation_weights: ReconciliationWeights,
}

/// Neo4j's own quick-start docker command (`NEO4J_AUTH=neo4j/password`)
/// seeds this default; production deployments must override it.
const DEFAULT_NEO4J_PASSWORD_DEV_ONLY: &str = "password";

impl PipelineConfig {
    /// Load and validate configuration. Returns the first error encountered
    /// (missing/invalid env var, or a failed production-mode check).
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let required: RequiredSettings = envy::from_env()?;

        let target_directory = PathBuf::from(&required.target_directory);
        if !target_directory.is_dir() {
            return Err(ConfigError::Invalid {
                key: "TARGET_DIRECTORY".to_string(),
                reason: format!("{} is not a directory", target_directory.display()),
            });
        }

        let neo4j_password = parse_env_optional::<String>("NEO4J_PASSWORD")
            .unwrap_or_else(|| DEFAULT_NEO4J_PASSWORD_DEV_ONLY.to_string());
        let neo4j_database = parse_env_optional::<String>("NEO4J_DATABASE")
            .unwrap_or_else(|| "neo4j".to_string());
        let redis_password = parse_env_optional::<String>("REDIS_PASSWORD");

        let environment =
            parse_env_optional::<String>("APP_ENV").unwrap_or_else(|| "development".to_string());

        let config = PipelineConfig {
            target_directory,
            store: StoreSettings {
                db_path: required.sqlite_db_path,
            },
            graph: GraphSettings {
                uri: required.neo4j_uri,
                user: required.neo4j_user,
                password: neo4j_password,
                database: neo4j_database,
            },
            redis: RedisSettings {
                url: required.redis_url,
                password: redis_password,
            },
            oracle: OracleSettings {
                api_key: required.anthropic_api_key,
                timeout_ms: parse_env_with_default("ORACLE_TIMEOUT_MS", 30 * 60 * 1000),
                max_concurrent: parse_env_with_default("ORACLE_MAX_CONCURRENT", 4),
            },
            ingestor: IngestorSettings {
                batch_size: parse_env_required("INGESTOR_BATCH_SIZE").map_err(|_| {
                    ConfigError::Missing("INGESTOR_BATCH_SIZE".to_string())
                })?,
                interval_ms: parse_env_required("INGESTOR_INTERVAL_MS").map_err(|_| {
                    ConfigError::Missing("INGESTOR_INTERVAL_MS".to_string())
                })?,
            },
            batch: BatchSettings {
                max_tokens: parse_env_with_default("MAX_BATCH_TOKENS", 100_000),
                max_files: parse_env_with_default("MAX_BATCH_FILES", 50),
            },
            worker_concurrency: WorkerConcurrency {
                file_analysis: parse_env_with_default("WORKER_CONCURRENCY_FILE_ANALYSIS", 4),
                directory: parse_env_with_default("WORKER_CONCURRENCY_DIRECTORY", 2),
                reconciliation: parse_env_with_default("WORKER_CONCURRENCY_RECONCILIATION", 8),
                graph_builder: parse_env_with_default("WORKER_CONCURRENCY_GRAPH_BUILDER", 1),
            },
            max_job_attempts: parse_env_with_default("MAX_JOB_ATTEMPTS", 3),
            reconciliation_weights: ReconciliationWeights {
                deterministic: parse_env_with_default("RECONCILIATION_WEIGHT_DETERMINISTIC", 1.0),
                intra_file: parse_env_with_default("RECONCILIATION_WEIGHT_INTRA_FILE", 0.7),
                intra_directory: parse_env_with_default(
                    "RECONCILIATION_WEIGHT_INTRA_DIRECTORY",
                    0.5,
                ),
                global: parse_env_with_default("RECONCILIATION_WEIGHT_GLOBAL", 0.4),
            },
            environment,
        };

        config.validate_production()?;
        config.log_config();

        Ok(config)
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    fn validate_production(&self) -> Result<(), ConfigError> {
        if !self.is_production() {
            return Ok(());
        }

        if self.graph.password == DEFAULT_NEO4J_PASSWORD_DEV_ONLY {
            return Err(ConfigError::ProductionCheck(
                "NEO4J_PASSWORD must not be the default development password".to_string(),
            ));
        }

        if self.redis.password.is_none() {
            return Err(ConfigError::ProductionCheck(
                "REDIS_PASSWORD is required in production".to_string(),
            ));
        }

        Ok(())
    }

    fn log_config(&self) {
        info!(
            environment = %self.environment,
            target_directory = %self.target_directory.display(),
            worker_concurrency_file_analysis = self.worker_concurrency.file_analysis,
            worker_concurrency_directory = self.worker_concurrency.directory,
            worker_concurrency_reconciliation = self.worker_concurrency.reconciliation,
            worker_concurrency_graph_builder = self.worker_concurrency.graph_builder,
            max_job_attempts = self.max_job_attempts,
            "pipeline configuration loaded"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn set_required_env(dir: &std::path::Path) {
        std::env::set_var("TARGET_DIRECTORY", dir.to_str().unwrap());
        std::env::set_var("SQLITE_DB_PATH", "test.db");
        std::env::set_var("NEO4J_URI", "bolt://localhost:7687");
        std::env::set_var("NEO4J_USER", "neo4j");
        std::env::set_var("REDIS_URL", "redis://localhost:6379");
        std::env::set_var("ANTHROPIC_API_KEY", "sk-test");
        std::env::set_var("INGESTOR_BATCH_SIZE", "10");
        std::env::set_var("INGESTOR_INTERVAL_MS", "1000");
    }

    fn clear_env() {
        for key in [
            "TARGET_DIRECTORY",
            "SQLITE_DB_PATH",
            "NEO4J_URI",
            "NEO4J_USER",
            "NEO4J_PASSWORD",
            "NEO4J_DATABASE",
            "REDIS_URL",
            "REDIS_PASSWORD",
            "ANTHROPIC_API_KEY",
            "INGESTOR_BATCH_SIZE",
            "INGESTOR_INTERVAL_MS",
            "APP_ENV",
            "MAX_JOB_ATTEMPTS",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial_test::serial]
    fn test_load_with_defaults() {
        clear_env();
        let dir = tempdir();
        set_required_env(dir.path());

        let config = PipelineConfig::load().unwrap();
        assert_eq!(config.max_job_attempts, 3);
        assert_eq!(config.worker_concurrency.reconciliation, 8);
        assert_eq!(config.graph.password, "password");
        assert!(!config.is_production());

        clear_env();
    }

    #[test]
    #[serial_test::serial]
    fn test_load_missing_required_var_fails() {
        clear_env();
        let dir = tempdir();
        set_required_env(dir.path());
        std::env::remove_var("ANTHROPIC_API_KEY");

        assert!(PipelineConfig::load().is_err());

        clear_env();
    }

    #[test]
    #[serial_test::serial]
    fn test_load_nonexistent_target_directory_fails() {
        clear_env();
        set_required_env(std::path::Path::new("/nonexistent-target-directory-xyz"));

        let result = PipelineConfig::load();
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));

        clear_env();
    }

    #[test]
    #[serial_test::serial]
    fn test_production_rejects_default_graph_password() {
        clear_env();
        let dir = tempdir();
        set_required_env(dir.path());
        std::env::set_var("APP_ENV", "production");
        std::env::set_var("REDIS_PASSWORD", "s3cret");

        let result = PipelineConfig::load();
        assert!(matches!(result, Err(ConfigError::ProductionCheck(_))));

        clear_env();
    }

    #[test]
    #[serial_test::serial]
    fn test_production_requires_redis_password() {
        clear_env();
        let dir = tempdir();
        set_required_env(dir.path());
        std::env::set_var("APP_ENV", "production");
        std::env::set_var("NEO4J_PASSWORD", "a-real-secret");

        let result = PipelineConfig::load();
        assert!(matches!(result, Err(ConfigError::ProductionCheck(_))));

        clear_env();
    }

    #[test]
    #[serial_test::serial]
    fn test_production_passes_with_both_overridden() {
        clear_env();
        let dir = tempdir();
        set_required_env(dir.path());
        std::env::set_var("APP_ENV", "production");
        std::env::set_var("NEO4J_PASSWORD", "a-real-secret");
        std::env::set_var("REDIS_PASSWORD", "s3cret");

        let config = PipelineConfig::load().unwrap();
        assert!(config.is_production());

        clear_env();
    }

    struct TempDirGuard(PathBuf);
    impl Drop for TempDirGuard {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }
    impl TempDirGuard {
        fn path(&self) -> &std::path::Path {
            &self.0
        }
    }

    fn tempdir() -> TempDirGuard {
        let mut path = std::env::temp_dir();
        path.push(format!("pipeline-config-test-{}", std::process::id()));
        std::fs::create_dir_all(&path).unwrap();
        let mut marker = path.clone();
        marker.push(".keep");
        let _ = std::fs::File::create(&marker).and_then(|mut f| f.write_all(b"x"));
        TempDirGuard(path)
    }
}
