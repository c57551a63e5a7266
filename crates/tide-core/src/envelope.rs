//! Alert envelope and its classification enums.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::CoreError;

/// Alert level supplied by the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertLevel {
    /// Lowercase label used for metrics and persisted records.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertLevel {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "info" => Ok(Self::Info),
            "warning" | "warn" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "critical" => Ok(Self::Critical),
            other => Err(CoreError::InvalidLevel(other.to_string())),
        }
    }
}

/// Side of an aggregated market event.
///
/// `Buy` events count toward the LONG side of a cascade, `Sell` toward SHORT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Cascade direction label.
    pub fn direction(&self) -> &'static str {
        match self {
            Self::Buy => "LONG",
            Self::Sell => "SHORT",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

impl FromStr for Side {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "buy" | "long" => Ok(Self::Buy),
            "sell" | "short" => Ok(Self::Sell),
            other => Err(CoreError::InvalidSide(other.to_string())),
        }
    }
}

/// Quantitative part of an event that participates in aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EventMetric {
    /// Notional value in USD.
    pub usd_value: f64,
    /// Event side.
    pub side: Side,
    /// Execution price.
    pub price: f64,
}

/// Key the throttle table tracks cooldowns under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThrottleKey {
    pub category: String,
    /// Entity key, or the envelope's explicit throttle scope when set.
    pub scope: Option<String>,
}

impl ThrottleKey {
    pub fn new(category: impl Into<String>, scope: Option<String>) -> Self {
        Self {
            category: category.into(),
            scope,
        }
    }
}

impl fmt::Display for ThrottleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{}:{}", self.category, scope),
            None => write!(f, "{}", self.category),
        }
    }
}

/// Unit of work submitted to the dispatcher.
///
/// Constructed by a producer (signal generator, risk monitor, API) and moved
/// into `Dispatcher::submit`, which consumes it exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEnvelope {
    /// Unique alert ID.
    pub id: Uuid,
    /// Drives routing and the cooldown bucket (e.g. "liquidation", "cpu").
    pub category: String,
    pub level: AlertLevel,
    /// Scopes per-entity cooldowns and aggregation buckets (e.g. a symbol).
    #[serde(default)]
    pub entity_key: Option<String>,
    /// Already-formatted payload; only hashed by the engine.
    pub payload: serde_json::Value,
    /// Creation time (Unix milliseconds).
    pub timestamp_ms: u64,
    /// Bypass throttling entirely.
    #[serde(default)]
    pub throttle_override: bool,
    /// Overrides the entity key as throttle scope.
    #[serde(default)]
    pub throttle_scope: Option<String>,
    /// Aggregation input, if the event carries a notional value.
    #[serde(default)]
    pub metric: Option<EventMetric>,
}

impl AlertEnvelope {
    /// Create a new envelope stamped with the current time.
    pub fn new(category: impl Into<String>, level: AlertLevel, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            category: category.into(),
            level,
            entity_key: None,
            payload,
            timestamp_ms: chrono::Utc::now().timestamp_millis().max(0) as u64,
            throttle_override: false,
            throttle_scope: None,
            metric: None,
        }
    }

    #[must_use]
    pub fn with_entity(mut self, entity_key: impl Into<String>) -> Self {
        self.entity_key = Some(entity_key.into());
        self
    }

    #[must_use]
    pub fn with_timestamp_ms(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    /// Force-bypass throttling (used for API-created alerts).
    #[must_use]
    pub fn with_throttle_override(mut self) -> Self {
        self.throttle_override = true;
        self
    }

    #[must_use]
    pub fn with_throttle_scope(mut self, scope: impl Into<String>) -> Self {
        self.throttle_scope = Some(scope.into());
        self
    }

    #[must_use]
    pub fn with_metric(mut self, usd_value: f64, side: Side, price: f64) -> Self {
        self.metric = Some(EventMetric {
            usd_value,
            side,
            price,
        });
        self
    }

    /// Throttle key for this envelope.
    pub fn throttle_key(&self) -> ThrottleKey {
        ThrottleKey::new(
            self.category.clone(),
            self.throttle_scope.clone().or_else(|| self.entity_key.clone()),
        )
    }
}
