use pipeline_db::{parse_env_required, parse_env_with_default};
use std::time::Duration;

/// Oracle client configuration, loaded from `ANTHROPIC_API_KEY` and the
/// `ORACLE_*` tunables (spec §6).
#[derive(Clone)]
pub struct OracleConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
    pub max_concurrent: u32,
    pub max_response_bytes: usize,
    pub max_response_tokens: u32,
}

impl OracleConfig {
    pub fn from_env() -> Result<Self, String> {
        let api_key = parse_env_required::<String>("ANTHROPIC_API_KEY")?;

        let timeout_ms: u64 = parse_env_with_default("ORACLE_TIMEOUT_MS", 30 * 60 * 1000);

        Ok(Self {
            api_key,
            base_url: std::env::var("ORACLE_BASE_URL")
                .unwrap_or_else(|_| "https://api.anthropic.com/v1/messages".to_string()),
            model: std::env::var("ORACLE_MODEL")
                .unwrap_or_else(|_| "claude-3-5-sonnet-latest".to_string()),
            timeout: Duration::from_millis(timeout_ms),
            max_concurrent: parse_env_with_default("ORACLE_MAX_CONCURRENT", 4),
            max_response_bytes: parse_env_with_default(
                "ORACLE_MAX_RESPONSE_BYTES",
                10 * 1024 * 1024,
            ),
            max_response_tokens: parse_env_with_default("ORACLE_MAX_RESPONSE_TOKENS", 8192),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[serial_test::serial]
    fn test_from_env_missing_api_key() {
        std::env::remove_var("ANTHROPIC_API_KEY");
        assert!(OracleConfig::from_env().is_err());
    }

    #[test]
    #[serial_test::serial]
    fn test_from_env_with_defaults() {
        std::env::set_var("ANTHROPIC_API_KEY", "sk-test-key");
        std::env::remove_var("ORACLE_MAX_CONCURRENT");

        let config = OracleConfig::from_env().unwrap();
        assert_eq!(config.api_key, "sk-test-key");
        assert_eq!(config.max_concurrent, 4);
        assert_eq!(config.timeout, Duration::from_secs(30 * 60));

        std::env::remove_var("ANTHROPIC_API_KEY");
    }

    #[test]
    #[serial_test::serial]
    fn test_from_env_override() {
        std::env::set_var("ANTHROPIC_API_KEY", "sk-test-key");
        std::env::set_var("ORACLE_MAX_CONCURRENT", "8");

        let config = OracleConfig::from_env().unwrap();
        assert_eq!(config.max_concurrent, 8);

        std::env::remove_var("ANTHROPIC_API_KEY");
        std::env::remove_var("ORACLE_MAX_CONCURRENT");
    }
}
