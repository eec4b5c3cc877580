use thiserror::Error;

/// Invalid configuration values, reported by [`crate::Config::validate`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid notification channel '{0}': {1}")]
    InvalidChannel(String, &'static str),

    #[error("unknown targets backend '{0}': must be one of: postgres, memory")]
    UnknownBackend(String),

    #[error("invalid backoff: initial={initial_ms}ms, max={max_ms}ms")]
    InvalidBackoff { initial_ms: u64, max_ms: u64 },

    #[error("invalid {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}
