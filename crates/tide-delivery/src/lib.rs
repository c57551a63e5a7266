//! Destination routing and webhook delivery.
//!
//! - `Router`: pure category → destination resolution with optional mirroring
//! - `Transport`: dyn-compatible HTTP POST abstraction (`WebhookTransport`,
//!   `MockTransport`)
//! - `DeliveryEngine`: bounded retries with exponential backoff, per-attempt
//!   timeout, and a single simplified-payload fallback attempt
//! - `DeliveryStats`: process-wide delivery counters

pub mod engine;
pub mod error;
pub mod router;
pub mod stats;
pub mod transport;

pub use engine::{
    simplify_payload, AttemptResult, DeliveryConfig, DeliveryEngine, DeliveryOutcome,
    DeliveryRecord, DeliveryReport, DeliveryStage,
};
pub use error::{DeliveryError, DeliveryResult, TransportError};
pub use router::{Destination, DestinationConfig, Router, RoutingConfig, RoutingRule};
pub use stats::{DeliveryStats, DeliveryStatsSnapshot};
pub use transport::{BoxFuture, MockCall, MockTransport, Transport, WebhookTransport};
