//! Application lifecycle.
//!
//! Builds every component explicitly from `AppConfig`, serves the HTTP API,
//! and runs periodic maintenance until Ctrl-C or cancellation.

use std::sync::Arc;
use std::time::Duration;

use tide_core::{SharedClock, SystemClock};
use tide_delivery::{DeliveryEngine, Router, Transport, WebhookTransport};
use tide_gate::{AggregationBuffer, ThrottleTable};
use tide_persistence::{open_store, AlertStore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::AppConfig;
use crate::dispatcher::Dispatcher;
use crate::error::AppResult;
use crate::server::{run_server, AppState};

/// Main application.
pub struct Application {
    config: AppConfig,
    dispatcher: Arc<Dispatcher>,
    store: Arc<dyn AlertStore>,
    shutdown: CancellationToken,
}

impl Application {
    /// Create the application with the system clock and reqwest transports.
    ///
    /// The fallback attempt uses its own client so a wedged primary pool
    /// cannot block it.
    pub fn new(config: AppConfig) -> AppResult<Self> {
        let connect_timeout = Duration::from_secs(config.delivery.connect_timeout_secs);
        let pool = config.delivery.pool_max_idle_per_host;
        let primary: Arc<dyn Transport> = Arc::new(WebhookTransport::new(pool, connect_timeout)?);
        let fallback: Arc<dyn Transport> = Arc::new(WebhookTransport::new(pool, connect_timeout)?);
        Self::build(config, SystemClock::shared(), primary, Some(fallback))
    }

    /// Create the application with an injected clock and transport.
    pub fn with_parts(
        config: AppConfig,
        clock: SharedClock,
        transport: Arc<dyn Transport>,
    ) -> AppResult<Self> {
        Self::build(config, clock, transport, None)
    }

    fn build(
        config: AppConfig,
        clock: SharedClock,
        primary: Arc<dyn Transport>,
        fallback: Option<Arc<dyn Transport>>,
    ) -> AppResult<Self> {
        config.validate()?;

        let router = Router::new(config.routing.clone())?;
        let throttle = ThrottleTable::new(config.throttle.clone(), clock.clone());
        let aggregation = AggregationBuffer::new(config.aggregation.clone(), clock.clone());
        let mut delivery = DeliveryEngine::new(config.delivery.clone(), primary);
        if let Some(fallback) = fallback {
            delivery = delivery.with_fallback_transport(fallback);
        }
        let store = open_store(&config.persistence)?;

        info!(
            destinations = ?router.destination_names().collect::<Vec<_>>(),
            backend = ?config.persistence.backend,
            "Dispatcher configured"
        );

        let dispatcher = Dispatcher::new(
            router,
            throttle,
            aggregation,
            delivery,
            store.clone(),
            clock,
        );

        Ok(Self {
            config,
            dispatcher: Arc::new(dispatcher),
            store,
            shutdown: CancellationToken::new(),
        })
    }

    /// Handle for producers running inside the process.
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    /// Cancelling this token stops `run`.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until Ctrl-C or cancellation, then flush the store.
    pub async fn run(self) -> AppResult<()> {
        info!("Starting application");

        let server_handle = if self.config.api.enabled {
            let state = AppState::new(self.dispatcher.clone());
            let api_config = self.config.api.clone();
            let token = self.shutdown.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = run_server(state, &api_config, token.clone()).await {
                    error!(error = %e, "HTTP API failed");
                    token.cancel();
                }
            }))
        } else {
            None
        };

        let period = Duration::from_secs(self.config.throttle.eviction_interval_secs);
        let mut maintenance_interval = tokio::time::interval(period);
        // First tick completes immediately.
        maintenance_interval.tick().await;

        loop {
            tokio::select! {
                _ = maintenance_interval.tick() => {
                    let report = self.dispatcher.run_maintenance();
                    debug!(
                        throttle_evicted = report.throttle.total(),
                        idle_buckets = report.idle_buckets,
                        "Periodic maintenance"
                    );
                }

                _ = self.shutdown.cancelled() => {
                    info!("Cancellation requested");
                    break;
                }

                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.shutdown.cancel();
        if let Some(handle) = server_handle {
            if let Err(e) = handle.await {
                error!(error = %e, "HTTP API task panicked");
            }
        }

        let stats = self.dispatcher.get_stats();
        info!(
            submitted = stats.dispatch.submitted,
            sent = stats.dispatch.sent,
            errors = stats.dispatch.errors,
            throttled = stats.dispatch.throttled + stats.dispatch.duplicates,
            cascades = stats.dispatch.cascades,
            "Shutting down"
        );
        self.store.flush()?;
        Ok(())
    }
}
