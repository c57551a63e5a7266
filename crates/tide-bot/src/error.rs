//! Application error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Gate configuration error: {0}")]
    Gate(#[from] tide_gate::GateError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] tide_delivery::DeliveryError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] tide_persistence::PersistenceError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] tide_telemetry::TelemetryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AppResult<T> = Result<T, AppError>;
