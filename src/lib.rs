//! Distributed vote-processing pipeline.
//!
//! Ingests, authenticates, deduplicates, aggregates, and audits ballots
//! for two ballot styles: a binary referendum and a regional candidate
//! election (single-choice or ranked-choice).
//!
//! The pipeline has three independently scaled stages joined by a durable
//! message bus:
//!
//! - **Ingestion** (`ingest`): a stateless HTTP front-end that validates
//!   submission shape, derives the credential fingerprint, and publishes
//!   envelopes to the `validation` stream with durable-publish semantics.
//! - **Validation workers** (`worker`): authenticate the fingerprint
//!   against the valid set, perform the atomic claim that guarantees
//!   at-most-once acceptance, write the audit record, and forward accepted
//!   envelopes to the `aggregation` stream.
//! - **Aggregation** (`aggregate`): applies accepted envelopes to the
//!   persistent tallies in time-and-size-bounded batches of idempotent,
//!   additive upserts.
//!
//! Supporting modules: `bus` (the durable broker), `credential` (the
//! valid/cast/duplicate-counter store), `store` (audit and tally clients),
//! `domain` (shared data model), `config`, and `retry`.

pub mod aggregate;
pub mod bus;
pub mod config;
pub mod credential;
pub mod domain;
pub mod ingest;
pub mod retry;
pub mod store;
pub mod worker;
