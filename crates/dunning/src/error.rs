//! Dunning error types

use thiserror::Error;

pub type DunningResult<T> = Result<T, DunningError>;

#[derive(Debug, Error)]
pub enum DunningError {
    /// A sequence with zero steps was selected. Fatal, never retried.
    #[error("Dunning sequence '{0}' has no steps")]
    EmptySequence(String),

    #[error("Unknown dunning sequence: {0}")]
    UnknownSequence(String),

    #[error("Invalid dunning configuration: {0}")]
    InvalidConfig(String),

    #[error("Dunning state not found: {0}")]
    StateNotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// An injected callback (retry, access, cancel, notify, custom) failed
    #[error("Callback failed: {0}")]
    Callback(String),

    #[error("Event handler failed: {0}")]
    EventHandler(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DunningError {
    /// Configuration errors are fatal and must not be retried by a scheduler
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            DunningError::EmptySequence(_)
                | DunningError::UnknownSequence(_)
                | DunningError::InvalidConfig(_)
        )
    }
}

impl From<sqlx::Error> for DunningError {
    fn from(err: sqlx::Error) -> Self {
        DunningError::Database(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for DunningError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DunningError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for DunningError {
    fn from(err: serde_json::Error) -> Self {
        DunningError::Serialization(err.to_string())
    }
}
