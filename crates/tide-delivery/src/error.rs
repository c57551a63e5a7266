//! Delivery error types.

use thiserror::Error;

/// Configuration and construction errors. Delivery failures themselves are
/// reported through `DeliveryOutcome`, never as `Err`.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Unknown destination '{name}' referenced by {referenced_by}")]
    UnknownDestination { name: String, referenced_by: String },

    #[error("Invalid URL for destination '{name}': {reason}")]
    InvalidUrl { name: String, reason: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}

pub type DeliveryResult<T> = Result<T, DeliveryError>;

/// Transport-level failure of a single POST.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("connection error: {0}")]
    Io(String),

    #[error("invalid request: {0}")]
    Invalid(String),
}

impl TransportError {
    /// Timeouts, refused and reset connections are worth retrying.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Invalid(_))
    }
}
