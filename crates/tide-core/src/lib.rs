//! Core domain types for the tide alert dispatch engine.
//!
//! This crate provides the types shared by every other tide crate:
//! - `AlertEnvelope`: the unit of work submitted for dispatch
//! - `AlertLevel`, `Severity`: alert classification enums
//! - `classify`: the pure cascade severity classifier
//! - `ContentHash`: rounded, key-sorted payload digest used for dedup
//! - `Clock`: injectable time source (`SystemClock`, `ManualClock`)
//! - `DispatchOutcome`: caller-visible result of a submission

pub mod clock;
pub mod envelope;
pub mod error;
pub mod hash;
pub mod outcome;
pub mod severity;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use envelope::{AlertEnvelope, AlertLevel, EventMetric, Side, ThrottleKey};
pub use error::{CoreError, Result};
pub use hash::{content_hash, ContentHash};
pub use outcome::{DispatchOutcome, OutcomeKind, ThrottleReason};
pub use severity::{classify, Severity};
