//! Gate error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GateError {
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type GateResult<T> = Result<T, GateError>;
