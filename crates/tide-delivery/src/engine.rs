//! Retrying webhook delivery.
//!
//! Per delivery: up to `max_retries` primary attempts, each bounded by
//! `attempt_timeout_secs`, separated by backoff sleeps. A recoverable failure
//! (configured status or transport error) moves on to the next attempt; any
//! other non-2xx status stops the primary loop immediately. If the primary
//! path did not deliver and a fallback route exists, exactly one fallback
//! attempt is made with a simplified payload and its outcome is final.
//!
//! Delivery is at-most-once: nothing is queued once a delivery is exhausted.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tide_telemetry::Metrics;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{DeliveryError, DeliveryResult, TransportError};
use crate::router::Destination;
use crate::stats::{DeliveryStats, DeliveryStatsSnapshot};
use crate::transport::Transport;

/// Longest `content` the fallback payload carries.
const MAX_FALLBACK_CONTENT_CHARS: usize = 2000;

/// Delivery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Total primary attempts per delivery. Default: 3.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the second attempt in milliseconds. Default: 1000.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Growth factor per retry when exponential backoff is on. Default: 2.0.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Cap on a single backoff delay in milliseconds. Default: 30000.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Grow the delay between retries. Default: true.
    #[serde(default = "default_true")]
    pub exponential_backoff: bool,
    /// Random jitter added to each delay (0..=jitter_ms). Default: 0.
    #[serde(default)]
    pub jitter_ms: u64,
    /// Statuses that trigger a retry.
    #[serde(default = "default_recoverable_statuses")]
    pub recoverable_statuses: Vec<u16>,
    /// Per-attempt timeout in seconds. Default: 30.
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
    /// Allow the single fallback attempt. Default: true.
    #[serde(default = "default_true")]
    pub fallback_enabled: bool,
    /// Idle connections kept per host. Default: 10.
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,
    /// TCP connect timeout in seconds. Default: 10.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

fn default_recoverable_statuses() -> Vec<u16> {
    vec![429, 500, 502, 503, 504]
}

fn default_attempt_timeout_secs() -> u64 {
    30
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            exponential_backoff: true,
            jitter_ms: 0,
            recoverable_statuses: default_recoverable_statuses(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            fallback_enabled: true,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl DeliveryConfig {
    /// Validate once at load time.
    pub fn validate(&self) -> DeliveryResult<()> {
        if self.max_retries == 0 {
            return Err(DeliveryError::ConfigError(
                "delivery.max_retries must be at least 1".to_string(),
            ));
        }
        if !(self.backoff_multiplier.is_finite() && self.backoff_multiplier >= 1.0) {
            return Err(DeliveryError::ConfigError(
                "delivery.backoff_multiplier must be >= 1".to_string(),
            ));
        }
        if self.attempt_timeout_secs == 0 {
            return Err(DeliveryError::ConfigError(
                "delivery.attempt_timeout_secs must be positive".to_string(),
            ));
        }
        if let Some(bad) = self
            .recoverable_statuses
            .iter()
            .find(|s| !(100..=599).contains(*s))
        {
            return Err(DeliveryError::ConfigError(format!(
                "delivery.recoverable_statuses contains invalid status {bad}"
            )));
        }
        Ok(())
    }

    /// Delay before retry number `retry` (1 = before the second attempt).
    ///
    /// Exponential: `initial * multiplier^(retry-1)`, capped at `max_delay_ms`.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let base = self.initial_delay_ms as f64;
        let delay = if self.exponential_backoff {
            let exponent = retry.saturating_sub(1).min(20) as i32;
            base * self.backoff_multiplier.powi(exponent)
        } else {
            base
        };
        let delay = (delay as u64).min(self.max_delay_ms);
        Duration::from_millis(delay + jitter(self.jitter_ms))
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    fn is_recoverable_status(&self, status: u16) -> bool {
        self.recoverable_statuses.contains(&status)
    }
}

/// Pseudo-random jitter in `0..=max_ms`.
fn jitter(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    u64::from(nanos) % (max_ms + 1)
}

/// Which transport path an attempt used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStage {
    Primary,
    Fallback,
}

/// Classified result of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptResult {
    Success,
    RecoverableFailure,
    FatalFailure,
}

impl AttemptResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::RecoverableFailure => "recoverable",
            Self::FatalFailure => "fatal",
        }
    }
}

/// One delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub destination: String,
    /// 1-based, counting primary and fallback attempts together.
    pub attempt: u32,
    pub stage: DeliveryStage,
    pub result: AttemptResult,
    pub status: Option<u16>,
    pub error: Option<String>,
    pub latency_ms: u64,
}

/// Final result of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// A primary attempt succeeded.
    Delivered,
    /// The fallback attempt succeeded.
    DeliveredViaFallback,
    /// Every primary attempt failed recoverably and no fallback was made.
    RetriesExhausted,
    /// A non-recoverable response stopped the primary loop and no fallback was made.
    Fatal,
    /// The fallback attempt failed too.
    FallbackFailed,
}

impl DeliveryOutcome {
    #[must_use]
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered | Self::DeliveredViaFallback)
    }
}

/// Everything that happened during one delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub destination: String,
    pub outcome: DeliveryOutcome,
    pub records: Vec<DeliveryRecord>,
    /// Backoff sleeps between primary attempts, in order.
    #[serde(with = "millis_vec")]
    pub backoff_delays: Vec<Duration>,
}

impl DeliveryReport {
    pub fn is_delivered(&self) -> bool {
        self.outcome.is_delivered()
    }

    pub fn attempts(&self) -> usize {
        self.records.len()
    }
}

mod millis_vec {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(delays: &[Duration], s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(delays.iter().map(|d| d.as_millis() as u64))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Duration>, D::Error> {
        let millis = Vec::<u64>::deserialize(d)?;
        Ok(millis.into_iter().map(Duration::from_millis).collect())
    }
}

/// Simplified payload for the fallback attempt.
///
/// Uses the payload's `content`, else the first embed title, else a generic
/// `[category] alert` line.
pub fn simplify_payload(category: &str, payload: &Value) -> Value {
    let content = payload
        .get("content")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .or_else(|| {
            payload
                .get("embeds")
                .and_then(Value::as_array)
                .and_then(|embeds| embeds.first())
                .and_then(|embed| embed.get("title"))
                .and_then(Value::as_str)
                .filter(|s| !s.trim().is_empty())
        })
        .map(|s| s.chars().take(MAX_FALLBACK_CONTENT_CHARS).collect::<String>())
        .unwrap_or_else(|| format!("[{category}] alert"));

    json!({ "content": content })
}

/// Delivers payloads to resolved destinations.
pub struct DeliveryEngine {
    config: DeliveryConfig,
    primary: Arc<dyn Transport>,
    fallback: Option<Arc<dyn Transport>>,
    stats: DeliveryStats,
}

impl DeliveryEngine {
    /// Create an engine using `primary` for every attempt.
    pub fn new(config: DeliveryConfig, primary: Arc<dyn Transport>) -> Self {
        Self {
            config,
            primary,
            fallback: None,
            stats: DeliveryStats::new(),
        }
    }

    /// Use a separate transport for fallback attempts.
    #[must_use]
    pub fn with_fallback_transport(mut self, fallback: Arc<dyn Transport>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    pub fn stats(&self) -> DeliveryStatsSnapshot {
        self.stats.snapshot()
    }

    /// Deliver `payload` to `destination`.
    ///
    /// Never returns an error: every failure mode ends in a `DeliveryOutcome`.
    pub async fn deliver(
        &self,
        destination: &Destination,
        category: &str,
        payload: &Value,
    ) -> DeliveryReport {
        let mut records = Vec::new();
        let mut backoff_delays = Vec::new();
        let max_attempts = self.config.max_retries.max(1);
        let mut last_result = AttemptResult::RecoverableFailure;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = self.config.backoff_delay(attempt - 1);
                self.stats.record_retry();
                warn!(
                    destination = %destination.name,
                    category,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying delivery after backoff"
                );
                backoff_delays.push(delay);
                tokio::time::sleep(delay).await;
            }

            let record = self
                .attempt(
                    destination,
                    DeliveryStage::Primary,
                    attempt,
                    self.primary.as_ref(),
                    &destination.url,
                    payload,
                )
                .await;
            last_result = record.result;
            records.push(record);

            match last_result {
                AttemptResult::Success => {
                    self.stats.record_success();
                    info!(destination = %destination.name, category, attempt, "Alert delivered");
                    return DeliveryReport {
                        destination: destination.name.clone(),
                        outcome: DeliveryOutcome::Delivered,
                        records,
                        backoff_delays,
                    };
                }
                AttemptResult::RecoverableFailure => {}
                AttemptResult::FatalFailure => break,
            }
        }

        let outcome = match self.fallback_route(destination) {
            Some((transport, url)) => {
                self.stats.record_fallback();
                Metrics::delivery_fallback(&destination.name);
                warn!(
                    destination = %destination.name,
                    category,
                    "Primary delivery failed, trying fallback"
                );

                let simplified = simplify_payload(category, payload);
                let attempt = records.len() as u32 + 1;
                let record = self
                    .attempt(
                        destination,
                        DeliveryStage::Fallback,
                        attempt,
                        transport,
                        url,
                        &simplified,
                    )
                    .await;
                let result = record.result;
                records.push(record);

                if result == AttemptResult::Success {
                    info!(destination = %destination.name, category, "Alert delivered via fallback");
                    DeliveryOutcome::DeliveredViaFallback
                } else {
                    DeliveryOutcome::FallbackFailed
                }
            }
            None if last_result == AttemptResult::FatalFailure => DeliveryOutcome::Fatal,
            None => DeliveryOutcome::RetriesExhausted,
        };

        if outcome.is_delivered() {
            self.stats.record_success();
        } else {
            self.stats.record_failure();
            error!(
                destination = %destination.name,
                category,
                attempts = records.len(),
                outcome = ?outcome,
                "Delivery failed, dropping alert"
            );
        }

        DeliveryReport {
            destination: destination.name.clone(),
            outcome,
            records,
            backoff_delays,
        }
    }

    /// Transport and URL for the fallback attempt, if any.
    fn fallback_route<'a>(
        &'a self,
        destination: &'a Destination,
    ) -> Option<(&'a dyn Transport, &'a str)> {
        if !self.config.fallback_enabled {
            return None;
        }
        match (destination.fallback_url.as_deref(), self.fallback.as_deref()) {
            (Some(url), Some(transport)) => Some((transport, url)),
            (Some(url), None) => Some((self.primary.as_ref(), url)),
            (None, Some(transport)) => Some((transport, destination.url.as_str())),
            (None, None) => None,
        }
    }

    async fn attempt(
        &self,
        destination: &Destination,
        stage: DeliveryStage,
        attempt: u32,
        transport: &dyn Transport,
        url: &str,
        payload: &Value,
    ) -> DeliveryRecord {
        self.stats.record_attempt();
        let started = Instant::now();
        let response = tokio::time::timeout(self.config.attempt_timeout(), transport.post(url, payload))
            .await
            .unwrap_or(Err(TransportError::Timeout));
        let latency_ms = started.elapsed().as_millis() as u64;

        let (result, status, error) = match response {
            Ok(status) if (200..300).contains(&status) => (AttemptResult::Success, Some(status), None),
            Ok(status) if self.config.is_recoverable_status(status) => {
                (AttemptResult::RecoverableFailure, Some(status), None)
            }
            Ok(status) => (AttemptResult::FatalFailure, Some(status), None),
            Err(e) if e.is_recoverable() => {
                (AttemptResult::RecoverableFailure, None, Some(e.to_string()))
            }
            Err(e) => (AttemptResult::FatalFailure, None, Some(e.to_string())),
        };

        Metrics::delivery_attempt(&destination.name, result.as_str(), latency_ms as f64);
        if result == AttemptResult::Success {
            debug!(destination = %destination.name, attempt, ?stage, latency_ms, "Attempt succeeded");
        } else {
            warn!(
                destination = %destination.name,
                attempt,
                ?stage,
                status,
                error = error.as_deref().unwrap_or(""),
                result = result.as_str(),
                "Delivery attempt failed"
            );
        }

        DeliveryRecord {
            destination: destination.name.clone(),
            attempt,
            stage,
            result,
            status,
            error,
            latency_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    const PRIMARY_URL: &str = "https://hooks.example.com/alerts";
    const FALLBACK_URL: &str = "https://backup.example.com/alerts";

    fn destination(fallback_url: Option<&str>) -> Destination {
        Destination {
            name: "alerts".to_string(),
            url: PRIMARY_URL.to_string(),
            fallback_url: fallback_url.map(str::to_string),
        }
    }

    fn engine(config: DeliveryConfig) -> (DeliveryEngine, Arc<MockTransport>) {
        let mock = Arc::new(MockTransport::new());
        (DeliveryEngine::new(config, mock.clone()), mock)
    }

    fn connect_error() -> TransportError {
        TransportError::Connect("connection refused".to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_exponential_backoff() {
        let (engine, mock) = engine(DeliveryConfig::default());
        mock.push_status(503);
        mock.push_status(503);
        mock.push_status(204);

        let report = engine
            .deliver(&destination(None), "cpu", &json!({"content": "cpu high"}))
            .await;

        assert_eq!(report.outcome, DeliveryOutcome::Delivered);
        assert_eq!(
            report.backoff_delays,
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );

        let calls = mock.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1].at - calls[0].at, Duration::from_secs(1));
        assert_eq!(calls[2].at - calls[1].at, Duration::from_secs(2));

        let stats = engine.stats();
        assert_eq!(stats.total_attempts, 3);
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_after_connection_errors() {
        let (engine, mock) = engine(DeliveryConfig::default());
        for _ in 0..3 {
            mock.push_error(connect_error());
        }
        mock.push_status(204);

        let payload = json!({"content": "BTC long", "embeds": [{"title": "Signal"}]});
        let report = engine
            .deliver(&destination(Some(FALLBACK_URL)), "signal", &payload)
            .await;

        assert_eq!(report.outcome, DeliveryOutcome::DeliveredViaFallback);
        assert_eq!(report.attempts(), 4);
        assert_eq!(report.records[3].stage, DeliveryStage::Fallback);

        let fallback_calls = mock.calls_to(FALLBACK_URL);
        assert_eq!(fallback_calls.len(), 1);
        assert_eq!(fallback_calls[0].payload, json!({"content": "BTC long"}));

        let stats = engine.stats();
        assert_eq!(stats.fallback_uses, 1);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.failures, 0);
        assert_eq!(stats.total_attempts, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_fallback_transport_uses_primary_url() {
        let (engine, primary) = engine(DeliveryConfig::default());
        let fallback = Arc::new(MockTransport::new());
        let engine = engine.with_fallback_transport(fallback.clone());
        primary.set_default(Err(connect_error()));

        let report = engine
            .deliver(&destination(None), "cpu", &json!({}))
            .await;

        assert_eq!(report.outcome, DeliveryOutcome::DeliveredViaFallback);
        assert_eq!(primary.call_count(), 3);
        let calls = fallback.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].url, PRIMARY_URL);
        assert_eq!(calls[0].payload, json!({"content": "[cpu] alert"}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_status_stops_retries() {
        let (engine, mock) = engine(DeliveryConfig::default());
        mock.push_status(400);

        let report = engine
            .deliver(&destination(None), "cpu", &json!({"content": "x"}))
            .await;

        assert_eq!(report.outcome, DeliveryOutcome::Fatal);
        assert_eq!(mock.call_count(), 1);
        assert!(report.backoff_delays.is_empty());
        assert_eq!(report.records[0].result, AttemptResult::FatalFailure);
        assert_eq!(report.records[0].status, Some(400));
        assert_eq!(engine.stats().failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_status_goes_straight_to_fallback() {
        let (engine, mock) = engine(DeliveryConfig::default());
        mock.push_status(404);
        mock.push_status(500);

        let report = engine
            .deliver(&destination(Some(FALLBACK_URL)), "cpu", &json!({"content": "x"}))
            .await;

        assert_eq!(report.outcome, DeliveryOutcome::FallbackFailed);
        assert_eq!(mock.calls_to(PRIMARY_URL).len(), 1);
        assert_eq!(mock.calls_to(FALLBACK_URL).len(), 1);
        let stats = engine.stats();
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.fallback_uses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_without_fallback() {
        let config = DeliveryConfig {
            fallback_enabled: false,
            ..Default::default()
        };
        let (engine, mock) = engine(config);
        mock.set_default(Ok(502));

        let report = engine
            .deliver(&destination(Some(FALLBACK_URL)), "cpu", &json!({}))
            .await;

        assert_eq!(report.outcome, DeliveryOutcome::RetriesExhausted);
        assert_eq!(mock.call_count(), 3);
        assert!(mock.calls_to(FALLBACK_URL).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_recoverable() {
        let (engine, mock) = engine(DeliveryConfig::default());
        mock.push_delayed(Duration::from_secs(60), Ok(204));
        mock.push_status(204);

        let report = engine
            .deliver(&destination(None), "cpu", &json!({}))
            .await;

        assert_eq!(report.outcome, DeliveryOutcome::Delivered);
        assert_eq!(report.records[0].result, AttemptResult::RecoverableFailure);
        assert_eq!(report.records[0].latency_ms, 30_000);
        assert_eq!(report.records[0].error.as_deref(), Some("request timed out"));
    }

    #[test]
    fn test_backoff_delay_growth_and_cap() {
        let config = DeliveryConfig {
            initial_delay_ms: 1000,
            max_delay_ms: 5000,
            ..Default::default()
        };
        assert_eq!(config.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(config.backoff_delay(2), Duration::from_secs(2));
        assert_eq!(config.backoff_delay(3), Duration::from_secs(4));
        assert_eq!(config.backoff_delay(4), Duration::from_secs(5));

        let linear = DeliveryConfig {
            exponential_backoff: false,
            ..config
        };
        assert_eq!(linear.backoff_delay(3), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_bounded() {
        let config = DeliveryConfig {
            jitter_ms: 250,
            ..Default::default()
        };
        let delay = config.backoff_delay(1);
        assert!(delay >= Duration::from_millis(1000));
        assert!(delay <= Duration::from_millis(1250));
    }

    #[test]
    fn test_simplify_payload() {
        assert_eq!(
            simplify_payload("cpu", &json!({"embeds": [{"title": "CPU 95%"}]})),
            json!({"content": "CPU 95%"})
        );
        assert_eq!(
            simplify_payload("cpu", &json!({"content": "  ", "embeds": []})),
            json!({"content": "[cpu] alert"})
        );
        let long = "x".repeat(5000);
        let simplified = simplify_payload("cpu", &json!({"content": long}));
        assert_eq!(simplified["content"].as_str().unwrap().len(), 2000);
    }

    #[test]
    fn test_config_validate() {
        assert!(DeliveryConfig::default().validate().is_ok());
        let zero = DeliveryConfig {
            max_retries: 0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());
        let shrinking = DeliveryConfig {
            backoff_multiplier: 0.5,
            ..Default::default()
        };
        assert!(shrinking.validate().is_err());
        let bad_status = DeliveryConfig {
            recoverable_statuses: vec![503, 42],
            ..Default::default()
        };
        assert!(bad_status.validate().is_err());
    }
}
