use thiserror::Error;

use cartograph_core::ConfigError;

/// Failures of a backing store round trip or subscriber connection.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced to callers of [`crate::TargetStore`].
#[derive(Debug, Error)]
pub enum TargetStoreError {
    /// The backing store could not be reached while opening the store.
    #[error("cannot open target store: {0}")]
    Connection(#[source] BackendError),

    /// Rejected before any I/O.
    #[error("invalid target rule: {0}")]
    Validation(String),

    /// An insert, delete or reload round trip failed. The cache is untouched.
    #[error("target store write failed: {0}")]
    Persistence(#[source] BackendError),

    #[error("target store is closed")]
    Closed,

    #[error("invalid target store configuration: {0}")]
    Config(#[from] ConfigError),
}

impl TargetStoreError {
    /// Map to an HTTP status code for API responses.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Connection(_) | Self::Closed => 503,
            Self::Persistence(_) | Self::Config(_) => 500,
        }
    }
}
