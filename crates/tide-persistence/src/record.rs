//! Persisted alert record and query filter.

use serde::{Deserialize, Serialize};
use tide_core::{AlertEnvelope, AlertLevel, OutcomeKind};
use uuid::Uuid;

/// One terminal dispatch outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub alert_id: Uuid,
    pub category: String,
    pub entity_key: Option<String>,
    pub level: AlertLevel,
    /// Alert creation time (Unix milliseconds).
    pub timestamp_ms: u64,
    pub outcome: OutcomeKind,
    /// Destinations that accepted the alert.
    #[serde(default)]
    pub delivered_to: Vec<String>,
    /// Destinations whose delivery failed.
    #[serde(default)]
    pub failed_to: Vec<String>,
    /// Throttle reason, cascade count, etc.
    #[serde(default)]
    pub detail: Option<String>,
    /// When the outcome was recorded (Unix milliseconds).
    pub recorded_at_ms: u64,
}

impl AlertRecord {
    /// Record for `envelope` with no destinations or detail.
    pub fn from_envelope(envelope: &AlertEnvelope, outcome: OutcomeKind, recorded_at_ms: u64) -> Self {
        Self {
            alert_id: envelope.id,
            category: envelope.category.clone(),
            entity_key: envelope.entity_key.clone(),
            level: envelope.level,
            timestamp_ms: envelope.timestamp_ms,
            outcome,
            delivered_to: Vec::new(),
            failed_to: Vec::new(),
            detail: None,
            recorded_at_ms,
        }
    }

    #[must_use]
    pub fn with_destinations(mut self, delivered_to: Vec<String>, failed_to: Vec<String>) -> Self {
        self.delivered_to = delivered_to;
        self.failed_to = failed_to;
        self
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Query filter. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFilter {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub entity_key: Option<String>,
    #[serde(default)]
    pub outcome: Option<OutcomeKind>,
    /// Only records with `timestamp_ms >= since_ms`.
    #[serde(default)]
    pub since_ms: Option<u64>,
    /// Maximum records returned, newest first.
    #[serde(default)]
    pub limit: Option<usize>,
}

impl RecordFilter {
    pub fn matches(&self, record: &AlertRecord) -> bool {
        if let Some(category) = &self.category {
            if &record.category != category {
                return false;
            }
        }
        if let Some(entity) = &self.entity_key {
            if record.entity_key.as_ref() != Some(entity) {
                return false;
            }
        }
        if let Some(outcome) = self.outcome {
            if record.outcome != outcome {
                return false;
            }
        }
        if let Some(since) = self.since_ms {
            if record.timestamp_ms < since {
                return false;
            }
        }
        true
    }

    /// Sort newest first and apply `limit`.
    pub(crate) fn finish(&self, mut records: Vec<AlertRecord>) -> Vec<AlertRecord> {
        records.sort_by(|a, b| {
            b.recorded_at_ms
                .cmp(&a.recorded_at_ms)
                .then(b.timestamp_ms.cmp(&a.timestamp_ms))
        });
        if let Some(limit) = self.limit {
            records.truncate(limit);
        }
        records
    }
}

#[cfg(test)]
pub(crate) fn test_record(category: &str, entity: Option<&str>, outcome: OutcomeKind, at_ms: u64) -> AlertRecord {
    AlertRecord {
        alert_id: Uuid::new_v4(),
        category: category.to_string(),
        entity_key: entity.map(str::to_string),
        level: AlertLevel::Warning,
        timestamp_ms: at_ms,
        outcome,
        delivered_to: Vec::new(),
        failed_to: Vec::new(),
        detail: None,
        recorded_at_ms: at_ms,
    }
}
