//! Error types for tide-core.

use thiserror::Error;

/// Core error types.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid alert level: {0}")]
    InvalidLevel(String),

    #[error("Invalid side: {0}")]
    InvalidSide(String),

    #[error("Payload hashing failed: {0}")]
    Hash(#[from] serde_json::Error),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
