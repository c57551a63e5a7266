//! Tide alert dispatch service.
//!
//! Wires the dispatch pipeline together:
//! - `Dispatcher`: routing, cascade aggregation, throttling, delivery and
//!   outcome recording behind `submit` / `get_stats`
//! - `AppConfig`: TOML configuration with `TIDE__*` environment overrides
//! - HTTP API (axum) for API-created alerts, stats and record queries
//! - `Application`: component construction and periodic maintenance

pub mod app;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod server;

pub use app::Application;
pub use config::{ApiConfig, AppConfig};
pub use dispatcher::{
    CascadeFormatter, DispatchStatsSnapshot, Dispatcher, MaintenanceReport, PlainCascadeFormatter,
    StatsReport, SubmitResult,
};
pub use error::{AppError, AppResult};
pub use server::{create_router, AppState};
