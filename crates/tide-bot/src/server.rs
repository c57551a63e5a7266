//! HTTP API using axum.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use tide_core::{AlertEnvelope, AlertLevel, DispatchOutcome, EventMetric};
use tide_persistence::RecordFilter;
use tide_telemetry::Metrics;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::ApiConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{AppError, AppResult};

/// Shared state for axum handlers.
#[derive(Clone)]
pub struct AppState {
    dispatcher: Arc<Dispatcher>,
}

impl AppState {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

/// Body of `POST /api/alerts`.
#[derive(Debug, Deserialize)]
pub struct CreateAlertRequest {
    pub category: String,
    /// Case-insensitive level name. Default: "info".
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub entity_key: Option<String>,
    pub payload: Value,
    #[serde(default)]
    pub metric: Option<EventMetric>,
}

fn default_level() -> String {
    "info".to_string()
}

/// Create the axum router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/stats", get(get_stats))
        .route("/api/alerts", get(list_alerts).post(create_alert))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn get_stats(State(state): State<AppState>) -> Response {
    Json(state.dispatcher.get_stats()).into_response()
}

/// API-created alerts always bypass throttling.
async fn create_alert(
    State(state): State<AppState>,
    Json(request): Json<CreateAlertRequest>,
) -> Response {
    let level: AlertLevel = match request.level.parse() {
        Ok(level) => level,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };

    let mut envelope =
        AlertEnvelope::new(request.category, level, request.payload).with_throttle_override();
    if let Some(entity) = request.entity_key {
        envelope = envelope.with_entity(entity);
    }
    envelope.metric = request.metric;

    let result = state.dispatcher.submit(envelope).await;
    let status = match &result.outcome {
        DispatchOutcome::Sent { .. } => StatusCode::OK,
        DispatchOutcome::Aggregated { .. } => StatusCode::ACCEPTED,
        DispatchOutcome::Throttled(_) => StatusCode::TOO_MANY_REQUESTS,
        DispatchOutcome::NoDestination => StatusCode::UNPROCESSABLE_ENTITY,
        DispatchOutcome::Errors { .. } => StatusCode::BAD_GATEWAY,
    };
    (status, Json(result)).into_response()
}

async fn list_alerts(
    State(state): State<AppState>,
    Query(filter): Query<RecordFilter>,
) -> Response {
    match state.dispatcher.store().query(&filter) {
        Ok(records) => Json(records).into_response(),
        Err(e) => {
            error!(error = %e, "Alert query failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn metrics() -> Response {
    match Metrics::render() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// Serve on an already-bound listener until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> AppResult<()> {
    let app = create_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

/// Bind the configured address and serve the API.
pub async fn run_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> AppResult<()> {
    let addr: SocketAddr = format!("{}:{}", config.bind_addr, config.port)
        .parse()
        .map_err(|e| AppError::Config(format!("Invalid api bind address: {e}")))?;

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Starting HTTP API");
    serve(listener, state, shutdown).await
}
