//! Cascade severity classification.
//!
//! Three sub-scores (volume, event count, side skew), each a tier in 1..=4,
//! are combined as a weighted average: volume 40%, count 30%, skew 30%.
//!
//! | score  | severity |
//! |--------|----------|
//! | >= 3.5 | EXTREME  |
//! | >= 2.5 | HIGH     |
//! | >= 1.5 | MODERATE |
//! | else   | LOW      |

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::envelope::AlertLevel;

/// USD volume tier boundaries (tier 1 below the first bound).
const VOLUME_TIERS: [f64; 3] = [1_000_000.0, 5_000_000.0, 10_000_000.0];
/// Event count tier boundaries.
const COUNT_TIERS: [f64; 3] = [5.0, 10.0, 20.0];
/// Skew tier boundaries, applied to `max(r, 1/r)`.
const SKEW_TIERS: [f64; 3] = [1.5, 3.0, 5.0];

const VOLUME_WEIGHT: f64 = 0.4;
const COUNT_WEIGHT: f64 = 0.3;
const SKEW_WEIGHT: f64 = 0.3;

/// Severity tier of a cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Moderate,
    High,
    Extreme,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Moderate => "MODERATE",
            Self::High => "HIGH",
            Self::Extreme => "EXTREME",
        }
    }

    /// Alert level a cascade of this severity is dispatched with.
    pub fn alert_level(&self) -> AlertLevel {
        match self {
            Self::Low => AlertLevel::Info,
            Self::Moderate => AlertLevel::Warning,
            Self::High => AlertLevel::Error,
            Self::Extreme => AlertLevel::Critical,
        }
    }

    fn from_score(score: f64) -> Self {
        if score >= 3.5 {
            Self::Extreme
        } else if score >= 2.5 {
            Self::High
        } else if score >= 1.5 {
            Self::Moderate
        } else {
            Self::Low
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a cascade from its total volume, event count and buy/sell ratio.
///
/// Pure function. Negative or non-finite volume/count are treated as zero; a
/// ratio that is non-finite, negative or zero is treated as neutral (1.0), so a
/// single malformed upstream metric cannot corrupt the classification.
pub fn classify(volume: f64, event_count: f64, ratio: f64) -> Severity {
    let volume = sanitize(volume);
    let event_count = sanitize(event_count);
    let skew = if ratio.is_finite() && ratio > 0.0 {
        ratio.max(1.0 / ratio)
    } else {
        1.0
    };

    let score = VOLUME_WEIGHT * tier(volume, &VOLUME_TIERS)
        + COUNT_WEIGHT * tier(event_count, &COUNT_TIERS)
        + SKEW_WEIGHT * tier(skew, &SKEW_TIERS);

    Severity::from_score(score)
}

fn sanitize(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

fn tier(value: f64, bounds: &[f64; 3]) -> f64 {
    let passed = bounds.iter().filter(|&&b| value >= b).count();
    (passed + 1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_low_for_small_cascade() {
        assert_eq!(classify(100_000.0, 3.0, 1.0), Severity::Low);
    }

    #[test]
    fn test_moderate_for_skewed_million() {
        // volume tier 2, count tier 1, skew 2.5 -> tier 2: 0.8 + 0.3 + 0.6 = 1.7
        assert_eq!(classify(1_050_000.0, 3.0, 2.5), Severity::Moderate);
    }

    #[test]
    fn test_high_and_extreme() {
        // 0.4*3 + 0.3*3 + 0.3*2 = 2.7
        assert_eq!(classify(6_000_000.0, 12.0, 2.0), Severity::High);
        // all tier 4
        assert_eq!(classify(25_000_000.0, 40.0, 8.0), Severity::Extreme);
    }

    #[test]
    fn test_ratio_symmetric() {
        for r in [1.2, 2.0, 4.0, 7.5] {
            assert_eq!(
                classify(3_000_000.0, 8.0, r),
                classify(3_000_000.0, 8.0, 1.0 / r),
                "ratio {r} and its inverse must classify equally"
            );
        }
    }

    #[test]
    fn test_invalid_inputs_clamped() {
        assert_eq!(classify(f64::NAN, -5.0, f64::INFINITY), Severity::Low);
        assert_eq!(
            classify(25_000_000.0, 40.0, f64::NAN),
            classify(25_000_000.0, 40.0, 1.0)
        );
        assert_eq!(classify(-1.0, 0.0, -2.0), classify(0.0, 0.0, 1.0));
    }

    #[test]
    fn test_classify_is_pure() {
        let first = classify(7_300_000.0, 14.0, 0.3);
        for _ in 0..10 {
            assert_eq!(classify(7_300_000.0, 14.0, 0.3), first);
        }
    }

    #[test]
    fn test_alert_level_mapping() {
        assert_eq!(Severity::Extreme.alert_level(), AlertLevel::Critical);
        assert_eq!(Severity::Low.alert_level(), AlertLevel::Info);
    }
}
