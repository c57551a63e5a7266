//! Dispatch facade.
//!
//! `Dispatcher::submit` is the single entry point for alerts:
//!
//! 1. Resolve destinations. None: `NoDestination`, nothing else happens.
//! 2. Record aggregating categories in the cascade buffer. Triggered cascades
//!    re-enter `submit` as their own envelopes. `only` mode stops here.
//! 3. Unless overridden, check-and-mark the throttle table in one step.
//! 4. Deliver to every destination.
//! 5. `Sent` if any destination accepted the alert, else `Errors`.
//!
//! Every terminal outcome is counted, exported as a metric and handed to the
//! store collaborator. Nothing here returns `Err`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tide_core::{
    content_hash, AlertEnvelope, DispatchOutcome, OutcomeKind, SharedClock, ThrottleReason,
};
use tide_delivery::{
    BoxFuture, DeliveryEngine, DeliveryReport, DeliveryStatsSnapshot, Router,
};
use tide_gate::{
    AggregationBuffer, AggregationMode, CascadeAlert, EvictionReport, ThrottleDecision,
    ThrottleTable,
};
use tide_persistence::{AlertRecord, AlertStore};
use tide_telemetry::Metrics;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Turns a detected cascade into a webhook payload.
pub trait CascadeFormatter: Send + Sync {
    fn format(&self, cascade: &CascadeAlert) -> Value;
}

/// One summary line plus the structured statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainCascadeFormatter;

impl CascadeFormatter for PlainCascadeFormatter {
    fn format(&self, cascade: &CascadeAlert) -> Value {
        let content = format!(
            "[{}] {} cascade on {}: ${:.0} across {} events, {} dominant ({:.1} events/min)",
            cascade.severity,
            cascade.scope.label(),
            cascade.scope,
            cascade.total_usd,
            cascade.event_count,
            cascade.dominance.as_str(),
            cascade.events_per_minute,
        );
        json!({
            "content": content,
            "cascade": {
                "scope": cascade.scope.to_string(),
                "severity": cascade.severity,
                "total_usd": cascade.total_usd,
                "event_count": cascade.event_count,
                "buy_usd": cascade.buy_usd,
                "sell_usd": cascade.sell_usd,
                "buy_sell_ratio": cascade.buy_sell_ratio,
                "dominance": cascade.dominance,
                "largest_usd": cascade.largest.usd_value,
                "largest_side": cascade.largest.side,
                "twap": cascade.twap,
                "events_per_minute": cascade.events_per_minute,
                "first_event_ms": cascade.first_event_ms,
                "last_event_ms": cascade.last_event_ms,
            }
        })
    }
}

/// Result of one `submit` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitResult {
    pub alert_id: Uuid,
    pub outcome: DispatchOutcome,
    /// One report per destination delivery.
    #[serde(default)]
    pub deliveries: Vec<DeliveryReport>,
    /// Cascades this submission triggered, each dispatched on its own.
    #[serde(default)]
    pub cascades: Vec<SubmitResult>,
}

/// Process-wide dispatch counters.
#[derive(Debug, Default)]
struct DispatchStats {
    submitted: AtomicU64,
    sent: AtomicU64,
    errors: AtomicU64,
    throttled: AtomicU64,
    duplicates: AtomicU64,
    no_destination: AtomicU64,
    aggregated: AtomicU64,
    cascades: AtomicU64,
}

impl DispatchStats {
    fn record(&self, kind: OutcomeKind) {
        let counter = match kind {
            OutcomeKind::Sent => &self.sent,
            OutcomeKind::Errors => &self.errors,
            OutcomeKind::Throttled => &self.throttled,
            OutcomeKind::Duplicate => &self.duplicates,
            OutcomeKind::NoDestination => &self.no_destination,
            OutcomeKind::Aggregated => &self.aggregated,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            no_destination: self.no_destination.load(Ordering::Relaxed),
            aggregated: self.aggregated.load(Ordering::Relaxed),
            cascades: self.cascades.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStatsSnapshot {
    pub submitted: u64,
    pub sent: u64,
    pub errors: u64,
    /// Cooldown denials.
    pub throttled: u64,
    /// Dedup denials.
    pub duplicates: u64,
    pub no_destination: u64,
    pub aggregated: u64,
    pub cascades: u64,
}

/// `getStats` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsReport {
    pub dispatch: DispatchStatsSnapshot,
    pub delivery: DeliveryStatsSnapshot,
    pub throttle_entries: usize,
    pub tracked_entities: usize,
}

/// Result of one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub throttle: EvictionReport,
    pub idle_buckets: usize,
}

/// Orchestrates routing, aggregation, throttling, delivery and recording.
pub struct Dispatcher {
    router: Router,
    throttle: ThrottleTable,
    aggregation: AggregationBuffer,
    delivery: DeliveryEngine,
    store: Arc<dyn AlertStore>,
    formatter: Arc<dyn CascadeFormatter>,
    clock: SharedClock,
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new(
        router: Router,
        throttle: ThrottleTable,
        aggregation: AggregationBuffer,
        delivery: DeliveryEngine,
        store: Arc<dyn AlertStore>,
        clock: SharedClock,
    ) -> Self {
        Self {
            router,
            throttle,
            aggregation,
            delivery,
            store,
            formatter: Arc::new(PlainCascadeFormatter),
            clock,
            stats: DispatchStats::default(),
        }
    }

    #[must_use]
    pub fn with_formatter(mut self, formatter: Arc<dyn CascadeFormatter>) -> Self {
        self.formatter = formatter;
        self
    }

    pub fn store(&self) -> &Arc<dyn AlertStore> {
        &self.store
    }

    /// Dispatch one alert. Consumes the envelope.
    pub fn submit(&self, envelope: AlertEnvelope) -> BoxFuture<'_, SubmitResult> {
        // Boxed because cascades re-enter `submit`.
        Box::pin(async move {
            self.stats.submitted.fetch_add(1, Ordering::Relaxed);

            let destinations = self.router.resolve(&envelope.category);
            if destinations.is_empty() {
                warn!(
                    category = %envelope.category,
                    entity = envelope.entity_key.as_deref().unwrap_or("-"),
                    "No destination for category"
                );
                return self.finish(&envelope, DispatchOutcome::NoDestination, Vec::new(), Vec::new());
            }

            let mode = self.aggregation.config().mode_for(&envelope.category);
            let mut cascades = Vec::new();
            let mut recorded = false;
            if mode != AggregationMode::Off {
                if let (Some(metric), Some(entity)) = (envelope.metric, envelope.entity_key.as_deref()) {
                    recorded = true;
                    let triggered = self.aggregation.record(entity, metric, envelope.timestamp_ms);
                    for cascade in triggered {
                        cascades.push(self.dispatch_cascade(&cascade).await);
                    }
                } else {
                    debug!(
                        category = %envelope.category,
                        "Aggregating category without metric or entity, delivering directly"
                    );
                }
            }

            if mode == AggregationMode::Only && recorded {
                let outcome = DispatchOutcome::Aggregated {
                    cascades: cascades.len(),
                };
                return self.finish(&envelope, outcome, Vec::new(), cascades);
            }

            if !envelope.throttle_override {
                if let ThrottleDecision::Denied(reason) = self.acquire(&envelope) {
                    debug!(
                        category = %envelope.category,
                        entity = envelope.entity_key.as_deref().unwrap_or("-"),
                        %reason,
                        "Alert throttled"
                    );
                    return self.finish(&envelope, DispatchOutcome::Throttled(reason), Vec::new(), cascades);
                }
            }

            let mut deliveries = Vec::with_capacity(destinations.len());
            for destination in &destinations {
                let report = self
                    .delivery
                    .deliver(destination, &envelope.category, &envelope.payload)
                    .await;
                deliveries.push(report);
            }

            let delivered = deliveries.iter().filter(|r| r.is_delivered()).count();
            let failed = deliveries.len() - delivered;
            let outcome = if delivered > 0 {
                DispatchOutcome::Sent { delivered, failed }
            } else {
                DispatchOutcome::Errors { failed }
            };
            self.finish(&envelope, outcome, deliveries, cascades)
        })
    }

    /// Throttle check-and-mark. Runs only once destinations are known, so the
    /// mark always precedes at least one delivery attempt.
    fn acquire(&self, envelope: &AlertEnvelope) -> ThrottleDecision {
        let precision = self.throttle.config().dedup_precision;
        let hash = match content_hash(
            &envelope.category,
            envelope.entity_key.as_deref(),
            &envelope.payload,
            precision,
        ) {
            Ok(hash) => Some(hash),
            Err(e) => {
                warn!(category = %envelope.category, error = %e, "Content hash failed, dedup skipped");
                None
            }
        };

        let decision = self.throttle.try_acquire(&envelope.throttle_key(), hash.as_ref());
        Metrics::throttle_entries(self.throttle.len());
        decision
    }

    async fn dispatch_cascade(&self, cascade: &CascadeAlert) -> SubmitResult {
        self.stats.cascades.fetch_add(1, Ordering::Relaxed);
        Metrics::cascade_detected(cascade.scope.label(), cascade.severity.as_str());

        let mut envelope = AlertEnvelope::new(
            self.aggregation.config().cascade_category.clone(),
            cascade.severity.alert_level(),
            self.formatter.format(cascade),
        )
        .with_timestamp_ms(cascade.triggered_at_ms)
        // The buffer's own trigger cooldown governs cascades.
        .with_throttle_override();
        if let Some(entity) = cascade.scope.entity_key() {
            envelope = envelope.with_entity(entity);
        }

        self.submit(envelope).await
    }

    fn finish(
        &self,
        envelope: &AlertEnvelope,
        outcome: DispatchOutcome,
        deliveries: Vec<DeliveryReport>,
        cascades: Vec<SubmitResult>,
    ) -> SubmitResult {
        let kind = outcome.kind();
        self.stats.record(kind);
        Metrics::dispatch_outcome(&envelope.category, kind.as_str());

        match &outcome {
            DispatchOutcome::Sent { delivered, failed } => info!(
                alert_id = %envelope.id,
                category = %envelope.category,
                entity = envelope.entity_key.as_deref().unwrap_or("-"),
                delivered,
                failed,
                "Alert dispatched"
            ),
            DispatchOutcome::Errors { failed } => error!(
                alert_id = %envelope.id,
                category = %envelope.category,
                entity = envelope.entity_key.as_deref().unwrap_or("-"),
                failed,
                "Alert delivery failed on every destination"
            ),
            _ => {}
        }

        let (delivered_to, failed_to): (Vec<&DeliveryReport>, Vec<&DeliveryReport>) =
            deliveries.iter().partition(|r| r.is_delivered());
        let mut record = AlertRecord::from_envelope(envelope, kind, self.clock.now_ms())
            .with_destinations(
                delivered_to.iter().map(|r| r.destination.clone()).collect(),
                failed_to.iter().map(|r| r.destination.clone()).collect(),
            );
        match &outcome {
            DispatchOutcome::Throttled(reason) => record = record.with_detail(reason.to_string()),
            DispatchOutcome::Aggregated { cascades } if *cascades > 0 => {
                record = record.with_detail(format!("{cascades} cascade(s) triggered"));
            }
            _ => {}
        }
        if let Err(e) = self.store.store(record) {
            error!(alert_id = %envelope.id, error = %e, "Failed to persist alert record");
        }

        SubmitResult {
            alert_id: envelope.id,
            outcome,
            deliveries,
            cascades,
        }
    }

    /// Caller-facing counters.
    pub fn get_stats(&self) -> StatsReport {
        StatsReport {
            dispatch: self.stats.snapshot(),
            delivery: self.delivery.stats(),
            throttle_entries: self.throttle.len(),
            tracked_entities: self.aggregation.entity_count(),
        }
    }

    /// Evict expired throttle records and idle buckets, then flush the store.
    pub fn run_maintenance(&self) -> MaintenanceReport {
        let throttle = self.throttle.evict_expired();
        Metrics::throttle_evicted("expired", throttle.expired);
        Metrics::throttle_evicted("capacity", throttle.forced);
        Metrics::throttle_entries(self.throttle.len());

        let idle_buckets = self.aggregation.evict_idle();
        if let Err(e) = self.store.flush() {
            error!(error = %e, "Failed to flush alert store");
        }

        debug!(
            expired = throttle.expired,
            forced = throttle.forced,
            idle_buckets,
            "Maintenance pass complete"
        );
        MaintenanceReport {
            throttle,
            idle_buckets,
        }
    }
}

/// `DispatchOutcome::Throttled` helper for callers matching on reason.
pub fn throttle_reason(result: &SubmitResult) -> Option<&ThrottleReason> {
    match &result.outcome {
        DispatchOutcome::Throttled(reason) => Some(reason),
        _ => None,
    }
}
