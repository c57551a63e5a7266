//! Caller-visible dispatch outcomes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a submission was throttled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ThrottleReason {
    /// The throttle key was sent less than its cooldown ago.
    Cooldown { remaining_ms: u64 },
    /// Identical content was sent within the dedup window.
    Duplicate { remaining_ms: u64 },
}

impl fmt::Display for ThrottleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cooldown { remaining_ms } => write!(f, "cooldown ({remaining_ms}ms left)"),
            Self::Duplicate { remaining_ms } => write!(f, "duplicate ({remaining_ms}ms left)"),
        }
    }
}

/// Overall result of one `submit` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// At least one destination accepted the alert.
    Sent { delivered: usize, failed: usize },
    /// Every destination delivery failed.
    Errors { failed: usize },
    /// Suppressed by cooldown or dedup.
    Throttled(ThrottleReason),
    /// Routing produced no destination for the category.
    NoDestination,
    /// Recorded in the aggregation buffer only.
    Aggregated { cascades: usize },
}

impl DispatchOutcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Self::Sent { .. } => OutcomeKind::Sent,
            Self::Errors { .. } => OutcomeKind::Errors,
            Self::Throttled(ThrottleReason::Cooldown { .. }) => OutcomeKind::Throttled,
            Self::Throttled(ThrottleReason::Duplicate { .. }) => OutcomeKind::Duplicate,
            Self::NoDestination => OutcomeKind::NoDestination,
            Self::Aggregated { .. } => OutcomeKind::Aggregated,
        }
    }

    pub fn is_sent(&self) -> bool {
        matches!(self, Self::Sent { .. })
    }

    pub fn is_throttled(&self) -> bool {
        matches!(self, Self::Throttled(_))
    }
}

/// Flat outcome label used by metrics, persistence and queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Sent,
    Errors,
    Throttled,
    Duplicate,
    NoDestination,
    Aggregated,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Errors => "errors",
            Self::Throttled => "throttled",
            Self::Duplicate => "duplicate",
            Self::NoDestination => "no_destination",
            Self::Aggregated => "aggregated",
        }
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
