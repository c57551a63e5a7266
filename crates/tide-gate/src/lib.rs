//! Stateful admission gates for alert dispatch.
//!
//! - `ThrottleTable`: per-key cooldowns and per-content dedup with bounded memory
//! - `AggregationBuffer`: rolling per-entity and global buckets that emit
//!   cascade alerts when a cumulative threshold is crossed
//!
//! Both keep their state behind a single `parking_lot::Mutex` and expose only
//! synchronous methods. A check and the mutation it guards always happen under
//! one lock acquisition, so no caller can observe a state that is "ready but
//! not yet marked" even with many submissions in flight.

pub mod aggregation;
pub mod error;
pub mod throttle;

pub use aggregation::{
    AggregationBuffer, AggregationConfig, AggregationEvent, AggregationMode, BucketLimits,
    BucketScope, CascadeAlert, Dominance,
};
pub use error::{GateError, GateResult};
pub use throttle::{EvictionReport, ThrottleConfig, ThrottleDecision, ThrottleTable};
