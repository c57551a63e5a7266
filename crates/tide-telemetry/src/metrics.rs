//! Prometheus metrics for the tide dispatch engine.
//!
//! # Panics
//!
//! Metric registration uses `unwrap()` intentionally. A registration failure
//! means duplicate metric names, a programming error that should crash at
//! startup. These panics only occur during static initialization.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_counter_vec, register_int_gauge,
    CounterVec, Encoder, HistogramVec, IntCounterVec, IntGauge, TextEncoder,
};

use crate::error::TelemetryResult;

/// Submissions by category and terminal outcome.
pub static DISPATCH_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tide_dispatch_total",
        "Total alert submissions by terminal outcome",
        &["category", "outcome"]
    )
    .unwrap()
});

/// Delivery attempts by destination and result.
/// Labels: result (success/recoverable/fatal)
pub static DELIVERY_ATTEMPTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tide_delivery_attempts_total",
        "Total webhook delivery attempts",
        &["destination", "result"]
    )
    .unwrap()
});

/// Per-attempt delivery latency in milliseconds.
pub static DELIVERY_LATENCY_MS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "tide_delivery_latency_ms",
        "Webhook delivery attempt latency in milliseconds",
        &["destination"],
        vec![5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0, 30000.0]
    )
    .unwrap()
});

/// Fallback transport uses.
pub static DELIVERY_FALLBACK_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tide_delivery_fallback_total",
        "Total fallback delivery attempts",
        &["destination"]
    )
    .unwrap()
});

/// Live throttle records (cooldown keys plus content hashes).
pub static THROTTLE_ENTRIES: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("tide_throttle_entries", "Live throttle table records").unwrap()
});

/// Evicted throttle records.
/// Labels: reason (expired/capacity)
pub static THROTTLE_EVICTED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tide_throttle_evicted_total",
        "Total throttle records evicted",
        &["reason"]
    )
    .unwrap()
});

/// Cascades detected by the aggregation buffer.
pub static CASCADES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tide_cascades_total",
        "Total cascade alerts detected",
        &["scope", "severity"]
    )
    .unwrap()
});

/// Metrics helper for recording values.
pub struct Metrics;

impl Metrics {
    /// Record a terminal dispatch outcome.
    pub fn dispatch_outcome(category: &str, outcome: &str) {
        DISPATCH_TOTAL.with_label_values(&[category, outcome]).inc();
    }

    /// Record one delivery attempt and its latency.
    pub fn delivery_attempt(destination: &str, result: &str, latency_ms: f64) {
        DELIVERY_ATTEMPTS_TOTAL
            .with_label_values(&[destination, result])
            .inc();
        DELIVERY_LATENCY_MS
            .with_label_values(&[destination])
            .observe(latency_ms);
    }

    /// Record a fallback transport use.
    pub fn delivery_fallback(destination: &str) {
        DELIVERY_FALLBACK_TOTAL
            .with_label_values(&[destination])
            .inc();
    }

    /// Set the live throttle record count.
    pub fn throttle_entries(count: usize) {
        THROTTLE_ENTRIES.set(count as i64);
    }

    /// Record evicted throttle records.
    pub fn throttle_evicted(reason: &str, count: usize) {
        if count > 0 {
            THROTTLE_EVICTED_TOTAL
                .with_label_values(&[reason])
                .inc_by(count as u64);
        }
    }

    /// Record a detected cascade.
    pub fn cascade_detected(scope: &str, severity: &str) {
        CASCADES_TOTAL.with_label_values(&[scope, severity]).inc();
    }

    /// Render the default registry in text exposition format.
    pub fn render() -> TelemetryResult<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&prometheus::gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
