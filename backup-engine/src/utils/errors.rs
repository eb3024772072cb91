//! Custom error types for the backup engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Missing or invalid repository configuration. Raised before any job exists.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An external tool or ephemeral task exited non-zero.
    #[error("Execution error: {0}")]
    Execution(String),

    /// An expected object is missing from the repository after upload.
    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A backup of the same volume is already in flight.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Container runtime error: {0}")]
    Runtime(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    pub fn storage(e: impl std::fmt::Display) -> Self {
        EngineError::Storage(e.to_string())
    }

    pub fn runtime(e: impl std::fmt::Display) -> Self {
        EngineError::Runtime(e.to_string())
    }
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(e: tokio::task::JoinError) -> Self {
        EngineError::Execution(format!("background task failed: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
