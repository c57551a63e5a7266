//! Prometheus metrics and structured logging for the tide dispatch engine.
//!
//! - `init_logging`: tracing-subscriber setup (JSON in production, pretty otherwise)
//! - `Metrics`: facade over the process-wide Prometheus registry

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::{init_logging, LoggingConfig};
pub use metrics::Metrics;
