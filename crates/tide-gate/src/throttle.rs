//! Per-key cooldown and per-content dedup table.
//!
//! Two maps are kept under one lock:
//! - `last_sent`: `ThrottleKey -> last send (ms)`, checked against the
//!   category cooldown
//! - `content_seen`: `ContentHash -> last send (ms)`, checked against the dedup
//!   window regardless of key
//!
//! Records are expired once they are older than the longest window in force.
//! Each map is also capped at `max_entries`, and the cap takes precedence over
//! retention: when expiry alone cannot bring a map under the cap, the oldest
//! records are dropped even if they could still deny a submission.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tide_core::{ContentHash, SharedClock, ThrottleKey, ThrottleReason};
use tracing::{debug, warn};

use crate::error::{GateError, GateResult};

/// Throttle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Cooldown per category in seconds.
    #[serde(default = "default_category_cooldowns")]
    pub category_cooldowns_secs: HashMap<String, u64>,
    /// Cooldown for categories without an explicit entry. Default: 60.
    #[serde(default = "default_cooldown_secs")]
    pub default_cooldown_secs: u64,
    /// Window during which identical content is suppressed. Default: 300.
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,
    /// Decimals numeric payload values are rounded to before hashing. Default: 2.
    #[serde(default = "default_dedup_precision")]
    pub dedup_precision: u32,
    /// Entry cap per map. Default: 10,000.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Opportunistic sweep interval in seconds. Default: 300.
    #[serde(default = "default_eviction_interval_secs")]
    pub eviction_interval_secs: u64,
}

fn default_category_cooldowns() -> HashMap<String, u64> {
    HashMap::from([
        ("system".to_string(), 60),
        ("signal".to_string(), 300),
        ("whale_activity".to_string(), 180),
        ("liquidation".to_string(), 120),
    ])
}

fn default_cooldown_secs() -> u64 {
    60
}

fn default_dedup_window_secs() -> u64 {
    300
}

fn default_dedup_precision() -> u32 {
    2
}

fn default_max_entries() -> usize {
    10_000
}

fn default_eviction_interval_secs() -> u64 {
    300
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            category_cooldowns_secs: default_category_cooldowns(),
            default_cooldown_secs: default_cooldown_secs(),
            dedup_window_secs: default_dedup_window_secs(),
            dedup_precision: default_dedup_precision(),
            max_entries: default_max_entries(),
            eviction_interval_secs: default_eviction_interval_secs(),
        }
    }
}

impl ThrottleConfig {
    /// Validate once at load time.
    pub fn validate(&self) -> GateResult<()> {
        if self.max_entries == 0 {
            return Err(GateError::ConfigError(
                "throttle.max_entries must be positive".to_string(),
            ));
        }
        if self.eviction_interval_secs == 0 {
            return Err(GateError::ConfigError(
                "throttle.eviction_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Cooldown for a category in milliseconds.
    pub fn cooldown_ms(&self, category: &str) -> u64 {
        self.category_cooldowns_secs
            .get(category)
            .copied()
            .unwrap_or(self.default_cooldown_secs)
            .saturating_mul(1000)
    }

    /// Longest window any record can be relevant for.
    pub fn retention_ms(&self) -> u64 {
        let longest_cooldown = self
            .category_cooldowns_secs
            .values()
            .copied()
            .max()
            .unwrap_or(0)
            .max(self.default_cooldown_secs);
        longest_cooldown
            .max(self.dedup_window_secs)
            .saturating_mul(1000)
    }
}

/// Result of a throttle check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThrottleDecision {
    Allowed,
    Denied(ThrottleReason),
}

impl ThrottleDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Records removed by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Records older than the retention window.
    pub expired: usize,
    /// Live records dropped to honor the entry cap.
    pub forced: usize,
}

impl EvictionReport {
    pub fn total(&self) -> usize {
        self.expired + self.forced
    }
}

#[derive(Default)]
struct ThrottleState {
    last_sent: HashMap<ThrottleKey, u64>,
    content_seen: HashMap<ContentHash, u64>,
    last_sweep_ms: u64,
}

/// Cooldown and dedup store.
///
/// Explicitly constructed and injected; independent instances never share
/// state.
pub struct ThrottleTable {
    config: ThrottleConfig,
    clock: SharedClock,
    state: Mutex<ThrottleState>,
}

impl ThrottleTable {
    /// Create a new throttle table.
    pub fn new(config: ThrottleConfig, clock: SharedClock) -> Self {
        let now_ms = clock.now_ms();
        Self {
            config,
            clock,
            state: Mutex::new(ThrottleState {
                last_sweep_ms: now_ms,
                ..Default::default()
            }),
        }
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    /// Read-only check: would a submission for `key` with `hash` be allowed now?
    pub fn check(&self, key: &ThrottleKey, hash: Option<&ContentHash>) -> ThrottleDecision {
        let now_ms = self.clock.now_ms();
        let state = self.state.lock();
        self.decide(&state, key, hash, now_ms)
    }

    /// Contract form of [`check`](Self::check).
    pub fn allow(&self, key: &ThrottleKey, hash: Option<&ContentHash>) -> bool {
        self.check(key, hash).is_allowed()
    }

    /// Record a send for `key` (and `hash`). Idempotent.
    ///
    /// Call only once the caller is committed to sending.
    pub fn mark_sent(&self, key: &ThrottleKey, hash: Option<&ContentHash>) {
        let now_ms = self.clock.now_ms();
        let mut state = self.state.lock();
        self.mark(&mut state, key, hash, now_ms);
    }

    /// Check and, if allowed, mark sent under a single lock acquisition.
    ///
    /// Two concurrent submissions for the same key or content can never both
    /// be allowed.
    pub fn try_acquire(&self, key: &ThrottleKey, hash: Option<&ContentHash>) -> ThrottleDecision {
        let now_ms = self.clock.now_ms();
        let mut state = self.state.lock();

        let decision = self.decide(&state, key, hash, now_ms);
        if decision.is_allowed() {
            self.mark(&mut state, key, hash, now_ms);
        } else {
            debug!(key = %key, ?decision, "Throttle denied");
        }
        decision
    }

    /// Remove expired records and enforce the entry cap.
    pub fn evict_expired(&self) -> EvictionReport {
        let now_ms = self.clock.now_ms();
        let mut state = self.state.lock();
        self.sweep(&mut state, now_ms)
    }

    /// Number of tracked keys and content hashes.
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.last_sent.len() + state.content_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn decide(
        &self,
        state: &ThrottleState,
        key: &ThrottleKey,
        hash: Option<&ContentHash>,
        now_ms: u64,
    ) -> ThrottleDecision {
        let cooldown_ms = self.config.cooldown_ms(&key.category);
        if let Some(&sent_ms) = state.last_sent.get(key) {
            let elapsed = now_ms.saturating_sub(sent_ms);
            if elapsed < cooldown_ms {
                return ThrottleDecision::Denied(ThrottleReason::Cooldown {
                    remaining_ms: cooldown_ms - elapsed,
                });
            }
        }

        if let Some(hash) = hash {
            let window_ms = self.config.dedup_window_secs.saturating_mul(1000);
            if let Some(&seen_ms) = state.content_seen.get(hash) {
                let elapsed = now_ms.saturating_sub(seen_ms);
                if elapsed < window_ms {
                    return ThrottleDecision::Denied(ThrottleReason::Duplicate {
                        remaining_ms: window_ms - elapsed,
                    });
                }
            }
        }

        ThrottleDecision::Allowed
    }

    fn mark(
        &self,
        state: &mut ThrottleState,
        key: &ThrottleKey,
        hash: Option<&ContentHash>,
        now_ms: u64,
    ) {
        state.last_sent.insert(key.clone(), now_ms);
        if let Some(hash) = hash {
            state.content_seen.insert(hash.clone(), now_ms);
        }

        let over_cap = state.last_sent.len() > self.config.max_entries
            || state.content_seen.len() > self.config.max_entries;
        let sweep_due = now_ms.saturating_sub(state.last_sweep_ms)
            >= self.config.eviction_interval_secs.saturating_mul(1000);
        if over_cap || sweep_due {
            self.sweep(state, now_ms);
        }
    }

    fn sweep(&self, state: &mut ThrottleState, now_ms: u64) -> EvictionReport {
        let retention_ms = self.config.retention_ms();
        let before = state.last_sent.len() + state.content_seen.len();

        state
            .last_sent
            .retain(|_, &mut sent_ms| now_ms.saturating_sub(sent_ms) < retention_ms);
        state
            .content_seen
            .retain(|_, &mut seen_ms| now_ms.saturating_sub(seen_ms) < retention_ms);

        let expired = before - (state.last_sent.len() + state.content_seen.len());
        let forced = evict_oldest(&mut state.last_sent, self.config.max_entries)
            + evict_oldest(&mut state.content_seen, self.config.max_entries);

        if forced > 0 {
            warn!(
                forced,
                max_entries = self.config.max_entries,
                "Throttle table over capacity, evicted oldest live records"
            );
        }
        state.last_sweep_ms = now_ms;

        EvictionReport { expired, forced }
    }
}

/// Drop the oldest records until `map` holds at most `cap` entries.
fn evict_oldest<K: Clone + Eq + std::hash::Hash>(map: &mut HashMap<K, u64>, cap: usize) -> usize {
    if map.len() <= cap {
        return 0;
    }
    let excess = map.len() - cap;
    let mut by_age: Vec<(K, u64)> = map.iter().map(|(k, &t)| (k.clone(), t)).collect();
    by_age.sort_by_key(|&(_, t)| t);
    for (key, _) in by_age.into_iter().take(excess) {
        map.remove(&key);
    }
    excess
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tide_core::{content_hash, ManualClock};

    fn table_with(config: ThrottleConfig) -> (ThrottleTable, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        (ThrottleTable::new(config, clock.clone()), clock)
    }

    fn key(category: &str, scope: Option<&str>) -> ThrottleKey {
        ThrottleKey::new(category, scope.map(str::to_string))
    }

    #[test]
    fn test_cooldown_blocks_then_allows() {
        let config = ThrottleConfig {
            category_cooldowns_secs: HashMap::from([("cpu".to_string(), 60)]),
            ..Default::default()
        };
        let (table, clock) = table_with(config);
        let k = key("cpu", Some("host-1"));

        assert!(table.try_acquire(&k, None).is_allowed());

        clock.advance(Duration::from_secs(30));
        assert_eq!(
            table.try_acquire(&k, None),
            ThrottleDecision::Denied(ThrottleReason::Cooldown {
                remaining_ms: 30_000
            })
        );

        clock.advance(Duration::from_secs(31));
        assert!(table.try_acquire(&k, None).is_allowed());
    }

    #[test]
    fn test_cooldown_scoped_per_key() {
        let (table, _clock) = table_with(ThrottleConfig::default());
        assert!(table.try_acquire(&key("signal", Some("BTC")), None).is_allowed());
        assert!(table.try_acquire(&key("signal", Some("ETH")), None).is_allowed());
        assert!(!table.allow(&key("signal", Some("BTC")), None));
    }

    #[test]
    fn test_default_cooldown_for_unknown_category() {
        let (table, clock) = table_with(ThrottleConfig::default());
        let k = key("market_report", None);
        assert!(table.try_acquire(&k, None).is_allowed());
        clock.advance(Duration::from_secs(59));
        assert!(!table.allow(&k, None));
        clock.advance(Duration::from_secs(1));
        assert!(table.allow(&k, None));
    }

    #[test]
    fn test_dedup_across_keys() {
        let (table, clock) = table_with(ThrottleConfig::default());
        let hash = content_hash("signal", Some("BTC"), &json!({"score": 0.91}), 2).unwrap();

        assert!(table
            .try_acquire(&key("signal", Some("BTC:long")), Some(&hash))
            .is_allowed());

        clock.advance(Duration::from_secs(10));
        let decision = table.try_acquire(&key("signal", Some("BTC:breakout")), Some(&hash));
        assert_eq!(
            decision,
            ThrottleDecision::Denied(ThrottleReason::Duplicate {
                remaining_ms: 290_000
            })
        );

        clock.advance(Duration::from_secs(290));
        assert!(table
            .try_acquire(&key("signal", Some("BTC:breakout")), Some(&hash))
            .is_allowed());
    }

    #[test]
    fn test_check_does_not_mark() {
        let (table, _clock) = table_with(ThrottleConfig::default());
        let k = key("signal", Some("SOL"));
        assert!(table.allow(&k, None));
        assert!(table.allow(&k, None));
        table.mark_sent(&k, None);
        table.mark_sent(&k, None);
        assert!(!table.allow(&k, None));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_eviction_keeps_live_records() {
        let (table, clock) = table_with(ThrottleConfig::default());
        let hash = content_hash("signal", None, &json!({"x": 1}), 2).unwrap();
        table.mark_sent(&key("signal", Some("BTC")), Some(&hash));

        // Longest window is the 300s signal cooldown / dedup window.
        clock.advance(Duration::from_secs(299));
        assert_eq!(table.evict_expired().total(), 0);
        assert_eq!(table.len(), 2);

        clock.advance(Duration::from_secs(1));
        let report = table.evict_expired();
        assert_eq!(report.expired, 2);
        assert_eq!(report.forced, 0);
        assert!(table.is_empty());
    }

    #[test]
    fn test_huge_windows_saturate() {
        let config = ThrottleConfig {
            category_cooldowns_secs: HashMap::from([("cpu".to_string(), u64::MAX)]),
            dedup_window_secs: u64::MAX,
            eviction_interval_secs: u64::MAX,
            ..Default::default()
        };
        assert_eq!(config.cooldown_ms("cpu"), u64::MAX);
        assert_eq!(config.retention_ms(), u64::MAX);

        let (table, clock) = table_with(config);
        let k = key("cpu", None);
        table.mark_sent(&k, None);
        clock.advance(Duration::from_secs(1));
        assert_eq!(
            table.try_acquire(&k, None),
            ThrottleDecision::Denied(ThrottleReason::Cooldown {
                remaining_ms: u64::MAX - 1000
            })
        );
        assert_eq!(table.evict_expired().total(), 0);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_entry_cap_evicts_oldest() {
        let config = ThrottleConfig {
            max_entries: 3,
            ..Default::default()
        };
        let (table, clock) = table_with(config);
        for i in 0..5 {
            table.mark_sent(&key("signal", Some(&format!("S{i}"))), None);
            clock.advance(Duration::from_millis(10));
        }
        assert_eq!(table.len(), 3);
        // Newest keys survive.
        assert!(!table.allow(&key("signal", Some("S4")), None));
        assert!(table.allow(&key("signal", Some("S0")), None));
    }

    #[test]
    fn test_periodic_sweep_on_mark() {
        let config = ThrottleConfig {
            default_cooldown_secs: 10,
            category_cooldowns_secs: HashMap::new(),
            dedup_window_secs: 10,
            eviction_interval_secs: 60,
            ..Default::default()
        };
        let (table, clock) = table_with(config);
        table.mark_sent(&key("cpu", Some("a")), None);
        clock.advance(Duration::from_secs(61));
        table.mark_sent(&key("cpu", Some("b")), None);
        // "a" expired and was swept opportunistically.
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_concurrent_try_acquire_single_winner() {
        let (table, _clock) = table_with(ThrottleConfig::default());
        let table = Arc::new(table);
        let barrier = Arc::new(std::sync::Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = table.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    table
                        .try_acquire(&key("liquidation", Some("BTC")), None)
                        .is_allowed()
                })
            })
            .collect();

        let allowed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&a| a)
            .count();
        assert_eq!(allowed, 1);
    }

    #[test]
    fn test_validate_rejects_zero_cap() {
        let config = ThrottleConfig {
            max_entries: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
