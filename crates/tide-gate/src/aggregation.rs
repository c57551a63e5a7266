//! Rolling aggregation buffer for cascade detection.
//!
//! Many small events (e.g. liquidations) can add up to a market-moving cascade
//! even though no single event crosses an alert threshold. Events are kept in
//! one bucket per entity plus one global bucket, each pruned to a rolling
//! window before every evaluation.
//!
//! A bucket triggers when it holds at least `min_events` entries, their sum is
//! at least `threshold_usd`, and the bucket's own cooldown has elapsed. On
//! trigger the bucket is snapshotted, cleared and stamped with the trigger
//! time inside the same lock acquisition that evaluated it; statistics are
//! computed from the snapshot afterwards.
//!
//! Entity and global cooldowns are independent, so one burst of events can
//! produce both an entity cascade and a global cascade.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use tide_core::{classify, EventMetric, Severity, SharedClock, Side};
use tracing::{debug, info, warn};

use crate::error::{GateError, GateResult};

/// Buy/sell ratio reported when one side is empty.
const ONE_SIDED_RATIO: f64 = 10.0;
/// Dominance threshold between sides.
const DOMINANCE_FACTOR: f64 = 1.5;

/// How a category participates in aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationMode {
    /// Not aggregated.
    #[default]
    Off,
    /// Recorded in the buffer instead of being delivered directly.
    Only,
    /// Recorded in the buffer and delivered directly.
    Also,
}

/// Trigger limits for one bucket kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketLimits {
    /// Cumulative USD value that triggers a cascade.
    pub threshold_usd: f64,
    /// Rolling window in seconds.
    pub window_secs: u64,
    /// Minimum events in the window before a trigger is considered.
    pub min_events: usize,
    /// Minimum seconds between two triggers of the same bucket.
    pub cooldown_secs: u64,
}

impl BucketLimits {
    pub fn window_ms(&self) -> u64 {
        self.window_secs.saturating_mul(1000)
    }

    pub fn cooldown_ms(&self) -> u64 {
        self.cooldown_secs.saturating_mul(1000)
    }

    fn validate(&self, name: &str) -> GateResult<()> {
        if !(self.threshold_usd.is_finite() && self.threshold_usd > 0.0) {
            return Err(GateError::ConfigError(format!(
                "aggregation.{name}.threshold_usd must be positive"
            )));
        }
        if self.window_secs == 0 {
            return Err(GateError::ConfigError(format!(
                "aggregation.{name}.window_secs must be positive"
            )));
        }
        if self.min_events == 0 {
            return Err(GateError::ConfigError(format!(
                "aggregation.{name}.min_events must be positive"
            )));
        }
        Ok(())
    }
}

/// Aggregation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Per-entity bucket limits.
    #[serde(default = "default_entity_limits")]
    pub entity: BucketLimits,
    /// Global (cross-entity) bucket limits.
    #[serde(default = "default_global_limits")]
    pub global: BucketLimits,
    /// Aggregation mode per category. Unlisted categories are `off`.
    #[serde(default = "default_category_modes")]
    pub categories: HashMap<String, AggregationMode>,
    /// Category cascade alerts are dispatched under.
    #[serde(default = "default_cascade_category")]
    pub cascade_category: String,
    /// Hard cap on entries per bucket. Default: 10,000.
    #[serde(default = "default_max_bucket_entries")]
    pub max_bucket_entries: usize,
}

fn default_entity_limits() -> BucketLimits {
    BucketLimits {
        threshold_usd: 1_000_000.0,
        window_secs: 300,
        min_events: 3,
        cooldown_secs: 600,
    }
}

fn default_global_limits() -> BucketLimits {
    BucketLimits {
        threshold_usd: 2_000_000.0,
        window_secs: 300,
        min_events: 5,
        cooldown_secs: 900,
    }
}

fn default_category_modes() -> HashMap<String, AggregationMode> {
    HashMap::from([("liquidation".to_string(), AggregationMode::Also)])
}

fn default_cascade_category() -> String {
    "liquidation_cascade".to_string()
}

fn default_max_bucket_entries() -> usize {
    10_000
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            entity: default_entity_limits(),
            global: default_global_limits(),
            categories: default_category_modes(),
            cascade_category: default_cascade_category(),
            max_bucket_entries: default_max_bucket_entries(),
        }
    }
}

impl AggregationConfig {
    /// Validate once at load time.
    pub fn validate(&self) -> GateResult<()> {
        self.entity.validate("entity")?;
        self.global.validate("global")?;
        if self.max_bucket_entries == 0 {
            return Err(GateError::ConfigError(
                "aggregation.max_bucket_entries must be positive".to_string(),
            ));
        }
        if self.categories.contains_key(&self.cascade_category) {
            // A cascade feeding the buffer again would re-trigger on itself.
            return Err(GateError::ConfigError(format!(
                "aggregation.cascade_category '{}' cannot itself be aggregated",
                self.cascade_category
            )));
        }
        Ok(())
    }

    /// Aggregation mode for a category.
    pub fn mode_for(&self, category: &str) -> AggregationMode {
        self.categories.get(category).copied().unwrap_or_default()
    }
}

/// One recorded event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggregationEvent {
    pub timestamp_ms: u64,
    pub usd_value: f64,
    pub side: Side,
    pub price: f64,
}

/// Bucket a cascade was detected in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "entity", rename_all = "lowercase")]
pub enum BucketScope {
    Entity(String),
    Global,
}

impl BucketScope {
    pub fn entity_key(&self) -> Option<&str> {
        match self {
            Self::Entity(key) => Some(key),
            Self::Global => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Entity(_) => "entity",
            Self::Global => "global",
        }
    }
}

impl fmt::Display for BucketScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Entity(key) => write!(f, "{key}"),
            Self::Global => write!(f, "GLOBAL"),
        }
    }
}

/// Dominant side of a cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Dominance {
    Long,
    Short,
    Mixed,
}

impl Dominance {
    fn from_totals(buy_usd: f64, sell_usd: f64) -> Self {
        if buy_usd > sell_usd * DOMINANCE_FACTOR {
            Self::Long
        } else if sell_usd > buy_usd * DOMINANCE_FACTOR {
            Self::Short
        } else {
            Self::Mixed
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Long => "LONG",
            Self::Short => "SHORT",
            Self::Mixed => "MIXED",
        }
    }
}

/// Cascade detected by the buffer, with statistics over the cleared snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeAlert {
    pub scope: BucketScope,
    pub total_usd: f64,
    pub event_count: usize,
    pub buy_usd: f64,
    pub sell_usd: f64,
    pub buy_sell_ratio: f64,
    pub dominance: Dominance,
    pub largest: AggregationEvent,
    /// Time-weighted average price over the snapshot.
    pub twap: f64,
    pub events_per_minute: f64,
    pub first_event_ms: u64,
    pub last_event_ms: u64,
    pub triggered_at_ms: u64,
    pub severity: Severity,
    pub events: Vec<AggregationEvent>,
}

impl CascadeAlert {
    fn from_snapshot(scope: BucketScope, mut events: Vec<AggregationEvent>, now_ms: u64) -> Self {
        events.sort_by_key(|e| e.timestamp_ms);

        let total_usd: f64 = events.iter().map(|e| e.usd_value).sum();
        let buy_usd: f64 = events
            .iter()
            .filter(|e| e.side == Side::Buy)
            .map(|e| e.usd_value)
            .sum();
        let sell_usd = total_usd - buy_usd;
        let buy_sell_ratio = buy_sell_ratio(buy_usd, sell_usd);

        let largest = events
            .iter()
            .copied()
            .max_by(|a, b| a.usd_value.total_cmp(&b.usd_value))
            .unwrap_or(AggregationEvent {
                timestamp_ms: now_ms,
                usd_value: 0.0,
                side: Side::Buy,
                price: 0.0,
            });

        let first_event_ms = events.first().map_or(now_ms, |e| e.timestamp_ms);
        let last_event_ms = events.last().map_or(now_ms, |e| e.timestamp_ms);
        let elapsed_secs = last_event_ms.saturating_sub(first_event_ms) as f64 / 1000.0;
        let events_per_minute = if total_usd == 0.0 || elapsed_secs == 0.0 {
            0.0
        } else {
            events.len() as f64 / elapsed_secs * 60.0
        };

        let severity = classify(total_usd, events.len() as f64, buy_sell_ratio);

        Self {
            scope,
            total_usd,
            event_count: events.len(),
            buy_usd,
            sell_usd,
            buy_sell_ratio,
            dominance: Dominance::from_totals(buy_usd, sell_usd),
            largest,
            twap: time_weighted_price(&events, now_ms),
            events_per_minute,
            first_event_ms,
            last_event_ms,
            triggered_at_ms: now_ms,
            severity,
            events,
        }
    }
}

fn buy_sell_ratio(buy_usd: f64, sell_usd: f64) -> f64 {
    match (buy_usd > 0.0, sell_usd > 0.0) {
        (true, true) => buy_usd / sell_usd,
        (true, false) => ONE_SIDED_RATIO,
        (false, true) => 1.0 / ONE_SIDED_RATIO,
        (false, false) => 1.0,
    }
}

/// Each price is weighted by how long it stood until the next event (the last
/// one until `now_ms`). Falls back to the plain mean when no time elapsed.
/// `events` must be sorted by timestamp.
fn time_weighted_price(events: &[AggregationEvent], now_ms: u64) -> f64 {
    let priced: Vec<&AggregationEvent> = events
        .iter()
        .filter(|e| e.price.is_finite() && e.price > 0.0)
        .collect();
    if priced.is_empty() {
        return 0.0;
    }

    let mut weighted = 0.0;
    let mut total_weight = 0.0;
    for (i, event) in priced.iter().enumerate() {
        let until = priced.get(i + 1).map_or(now_ms, |next| next.timestamp_ms);
        let weight = until.saturating_sub(event.timestamp_ms) as f64;
        weighted += event.price * weight;
        total_weight += weight;
    }

    if total_weight > 0.0 {
        weighted / total_weight
    } else {
        priced.iter().map(|e| e.price).sum::<f64>() / priced.len() as f64
    }
}

#[derive(Debug, Default)]
struct Bucket {
    entries: VecDeque<AggregationEvent>,
    last_trigger_ms: Option<u64>,
}

impl Bucket {
    fn prune(&mut self, now_ms: u64, window_ms: u64) {
        self.entries
            .retain(|e| now_ms.saturating_sub(e.timestamp_ms) <= window_ms);
    }

    /// Always recomputed from live entries.
    fn total(&self) -> f64 {
        self.entries.iter().map(|e| e.usd_value).sum()
    }

    fn cooling_down(&self, now_ms: u64, cooldown_ms: u64) -> bool {
        self.last_trigger_ms
            .is_some_and(|t| now_ms.saturating_sub(t) < cooldown_ms)
    }

    /// Evaluate and, on trigger, clear and stamp in the same step.
    fn take_if_triggered(
        &mut self,
        limits: &BucketLimits,
        now_ms: u64,
    ) -> Option<Vec<AggregationEvent>> {
        if self.entries.len() < limits.min_events {
            return None;
        }
        if self.total() < limits.threshold_usd {
            return None;
        }
        if self.cooling_down(now_ms, limits.cooldown_ms()) {
            return None;
        }
        self.last_trigger_ms = Some(now_ms);
        Some(std::mem::take(&mut self.entries).into())
    }
}

#[derive(Default)]
struct BufferState {
    entities: HashMap<String, Bucket>,
    global: Bucket,
}

/// Per-entity and global cascade detector.
pub struct AggregationBuffer {
    config: AggregationConfig,
    clock: SharedClock,
    state: Mutex<BufferState>,
}

impl AggregationBuffer {
    /// Create a new aggregation buffer.
    pub fn new(config: AggregationConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(BufferState::default()),
        }
    }

    pub fn config(&self) -> &AggregationConfig {
        &self.config
    }

    /// Record an event and evaluate the entity and global buckets.
    ///
    /// Returns the cascades triggered by this event (entity first, then
    /// global). Events older than the window at `now` are ignored and events
    /// stamped after `now` are recorded at `now`. Negative or non-finite values
    /// are recorded as zero.
    pub fn record(
        &self,
        entity_key: &str,
        metric: EventMetric,
        timestamp_ms: u64,
    ) -> Vec<CascadeAlert> {
        let now_ms = self.clock.now_ms();
        if timestamp_ms > now_ms {
            debug!(
                entity = entity_key,
                ahead_ms = timestamp_ms - now_ms,
                "Event stamped in the future, recording at now"
            );
        }
        let event = AggregationEvent {
            timestamp_ms: timestamp_ms.min(now_ms),
            usd_value: if metric.usd_value.is_finite() && metric.usd_value > 0.0 {
                metric.usd_value
            } else {
                0.0
            },
            side: metric.side,
            price: metric.price,
        };

        let mut triggered = Vec::new();
        let mut state = self.state.lock();

        let entity_limits = &self.config.entity;
        let bucket = state.entities.entry(entity_key.to_string()).or_default();
        if let Some(snapshot) = self.push_and_evaluate(bucket, event, entity_limits, now_ms) {
            triggered.push((BucketScope::Entity(entity_key.to_string()), snapshot));
        }

        let global_limits = &self.config.global;
        if let Some(snapshot) =
            self.push_and_evaluate(&mut state.global, event, global_limits, now_ms)
        {
            triggered.push((BucketScope::Global, snapshot));
        }
        drop(state);

        triggered
            .into_iter()
            .map(|(scope, snapshot)| {
                let cascade = CascadeAlert::from_snapshot(scope, snapshot, now_ms);
                info!(
                    scope = %cascade.scope,
                    total_usd = cascade.total_usd,
                    events = cascade.event_count,
                    dominance = cascade.dominance.as_str(),
                    severity = %cascade.severity,
                    "Cascade threshold crossed"
                );
                cascade
            })
            .collect()
    }

    fn push_and_evaluate(
        &self,
        bucket: &mut Bucket,
        event: AggregationEvent,
        limits: &BucketLimits,
        now_ms: u64,
    ) -> Option<Vec<AggregationEvent>> {
        let window_ms = limits.window_ms();
        bucket.prune(now_ms, window_ms);

        if now_ms.saturating_sub(event.timestamp_ms) > window_ms {
            debug!(
                timestamp_ms = event.timestamp_ms,
                now_ms, "Ignoring event older than aggregation window"
            );
            return None;
        }

        bucket.entries.push_back(event);
        if bucket.entries.len() > self.config.max_bucket_entries {
            warn!(
                max = self.config.max_bucket_entries,
                "Aggregation bucket full, dropping oldest event"
            );
            bucket.entries.pop_front();
        }

        bucket.take_if_triggered(limits, now_ms)
    }

    /// Prune every bucket and drop idle entity buckets.
    ///
    /// An entity bucket is idle when it is empty after pruning and its trigger
    /// cooldown has elapsed. Returns the number of buckets dropped.
    pub fn evict_idle(&self) -> usize {
        let now_ms = self.clock.now_ms();
        let entity = &self.config.entity;
        let mut state = self.state.lock();

        state
            .global
            .prune(now_ms, self.config.global.window_ms());

        let before = state.entities.len();
        state.entities.retain(|_, bucket| {
            bucket.prune(now_ms, entity.window_ms());
            !bucket.entries.is_empty() || bucket.cooling_down(now_ms, entity.cooldown_ms())
        });
        before - state.entities.len()
    }

    /// Number of live entries in a bucket.
    pub fn bucket_len(&self, scope: &BucketScope) -> usize {
        let state = self.state.lock();
        match scope {
            BucketScope::Entity(key) => state.entities.get(key).map_or(0, |b| b.entries.len()),
            BucketScope::Global => state.global.entries.len(),
        }
    }

    /// Sum of live entries in a bucket.
    pub fn bucket_total(&self, scope: &BucketScope) -> f64 {
        let state = self.state.lock();
        match scope {
            BucketScope::Entity(key) => state.entities.get(key).map_or(0.0, Bucket::total),
            BucketScope::Global => state.global.total(),
        }
    }

    /// Number of tracked entity buckets.
    pub fn entity_count(&self) -> usize {
        self.state.lock().entities.len()
    }
}
