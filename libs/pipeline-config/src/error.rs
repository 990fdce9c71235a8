use thiserror::Error;

/// Configuration load/validation errors. The binary exits with code 1 on
/// any of these (spec §6: "process exits non-zero on missing/invalid").
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing or unreadable environment variable: {0}")]
    Missing(String),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },

    #[error("production mode check failed: {0}")]
    ProductionCheck(String),
}

impl From<envy::Error> for ConfigError {
    fn from(err: envy::Error) -> Self {
        ConfigError::Missing(err.to_string())
    }
}
