//! Durable message bus decoupling the three pipeline stages.
//!
//! Three logical streams ride the same broker: `validation` (ingestion to
//! workers), `aggregation` (workers to the aggregator), and `review` (the
//! operator side channel for everything that does not join the tally).

mod queue;

pub use queue::{BusError, BusOptions, DeadReason, Delivery, MessageBus};

/// Stream of freshly ingested envelopes awaiting validation.
pub const VALIDATION_QUEUE: &str = "validation";
/// Stream of accepted envelopes awaiting tally application.
pub const AGGREGATION_QUEUE: &str = "aggregation";
/// Operator side channel: invalid, duplicate, and aggregation-failed
/// envelopes.
pub const REVIEW_QUEUE: &str = "review";

/// Routing key for review publications.
pub const REVIEW_ROUTING_KEY: &str = "vote.review";
/// Routing key for aggregation publications.
pub const AGGREGATION_ROUTING_KEY: &str = "vote.aggregation";
