//! Aggregation service: turns the stream of accepted envelopes into tally
//! rows, amortizing database cost across batches while keeping tally lag
//! bounded.
//!
//! Messages are acknowledged only after their batch commits. An
//! at-least-once broker can therefore redeliver a committed envelope after
//! a crash between commit and ack; the resulting rare double-count is
//! bounded and shows up in the reconciliation report.

use std::collections::BTreeMap;
use std::time::Instant;

use snafu::{ResultExt, Snafu};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::bus::{
    BusError, Delivery, MessageBus, AGGREGATION_QUEUE, AGGREGATION_ROUTING_KEY, REVIEW_QUEUE,
    REVIEW_ROUTING_KEY,
};
use crate::config::AggregatorConfig;
use crate::domain::{
    election_scope, ElectionVote, Envelope, Fingerprint, ProcessedEnvelope, VoteChoice, VoteStatus,
    VotingMethod,
};
use crate::store::{AuditStore, ElectionDelta, LawDelta, StoreError, TallyStore};

/// Aggregation failures.
#[derive(Debug, Snafu)]
pub enum AggregateError {
    #[snafu(display("bus operation failed: {source}"))]
    Bus { source: BusError },

    #[snafu(display("tally store operation failed: {source}"))]
    Store { source: StoreError },

    #[snafu(display("failed to encode envelope: {source}"))]
    Encode { source: serde_json::Error },
}

/// The aggregation service. One logical writer per tally database; the
/// additive upserts stay correct if more instances are ever run, but one
/// is the intended shape.
pub struct Aggregator {
    consumer_id: String,
    bus: MessageBus,
    tally: TallyStore,
    config: AggregatorConfig,
}

impl Aggregator {
    pub fn new(bus: MessageBus, tally: TallyStore, config: AggregatorConfig) -> Self {
        Self {
            consumer_id: format!("aggregator-{}", uuid::Uuid::new_v4()),
            bus,
            tally,
            config,
        }
    }

    /// Consume the aggregation stream until shutdown, flushing the final
    /// partial batch on the way out.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(consumer_id = %self.consumer_id, "aggregator starting");

        let mut buffer: Vec<(Delivery, ProcessedEnvelope)> = Vec::new();
        let mut first_buffered_at: Option<Instant> = None;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let want = self.config.batch_size.saturating_sub(buffer.len()).max(1) as u32;
            let deliveries = match self.bus.dequeue(AGGREGATION_QUEUE, &self.consumer_id, want).await
            {
                Ok(deliveries) => deliveries,
                Err(e) => {
                    warn!(error = %e, "dequeue failed, backing off");
                    tokio::time::sleep(self.config.poll_interval).await;
                    continue;
                }
            };
            let idle = deliveries.is_empty();

            for delivery in deliveries {
                match serde_json::from_slice::<ProcessedEnvelope>(&delivery.payload) {
                    Ok(processed) if processed.status == VoteStatus::Accepted => {
                        if buffer.is_empty() {
                            first_buffered_at = Some(Instant::now());
                        }
                        buffer.push((delivery, processed));
                    }
                    Ok(processed) => {
                        warn!(
                            status = %processed.status,
                            "non-accepted envelope on the aggregation stream"
                        );
                        self.discard(&delivery, "unexpected status on aggregation stream").await;
                    }
                    Err(e) => {
                        warn!(error = %e, "unparseable aggregation message");
                        self.discard(&delivery, "malformed aggregation message").await;
                    }
                }
            }

            let due_by_size = buffer.len() >= self.config.batch_size;
            let due_by_time = first_buffered_at
                .is_some_and(|t| t.elapsed() >= self.config.batch_interval);
            if !buffer.is_empty() && (due_by_size || due_by_time) {
                self.flush(&mut buffer).await;
                first_buffered_at = None;
            }

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }

        if !buffer.is_empty() {
            info!(count = buffer.len(), "flushing final batch before shutdown");
            self.flush(&mut buffer).await;
        }
        info!(consumer_id = %self.consumer_id, "aggregator stopped");
    }

    async fn discard(&self, delivery: &Delivery, reason: &str) {
        if let Err(e) = self
            .bus
            .nack(&delivery.receipt, false, Some(reason.to_string()))
            .await
        {
            debug!(error = %e, "nack failed");
        }
    }

    /// Apply one batch: group by tally key, upsert within a single
    /// transaction, retry with exponential backoff, and move the batch to
    /// review once the retries are spent. Messages are acked only after
    /// the commit.
    async fn flush(&self, buffer: &mut Vec<(Delivery, ProcessedEnvelope)>) {
        let (law, election) = group_batch(buffer.iter().map(|(_, p)| &p.envelope));
        let batch_size = buffer.len();
        let policy = self.config.retry_policy();

        for attempt in 1..=policy.max_attempts {
            match self.tally.apply_batch(law.clone(), election.clone()).await {
                Ok(()) => {
                    for (delivery, _) in buffer.drain(..) {
                        if let Err(e) = self.bus.ack(&delivery.receipt).await {
                            // Redelivery after a commit is the accepted
                            // double-count window; reconciliation surfaces it.
                            warn!(error = %e, "ack failed after commit");
                        }
                    }
                    info!(batch_size, attempt, "batch applied");
                    return;
                }
                Err(e) => {
                    warn!(batch_size, attempt, error = %e, "batch apply failed");
                    if attempt < policy.max_attempts {
                        tokio::time::sleep(policy.delay_for(attempt)).await;
                    }
                }
            }
        }

        warn!(batch_size, "batch retries exhausted, moving to review");
        for (delivery, mut processed) in buffer.drain(..) {
            processed.reason = Some("aggregation batch failed".to_string());
            match serde_json::to_vec(&processed) {
                Ok(payload) => {
                    if let Err(e) = self
                        .bus
                        .publish(REVIEW_QUEUE, REVIEW_ROUTING_KEY, payload)
                        .await
                    {
                        warn!(error = %e, "review publish failed");
                    }
                }
                Err(e) => warn!(error = %e, "review encode failed"),
            }
            self.discard(&delivery, "aggregation batch failed").await;
        }
    }
}

/// Group envelopes by tally key. Ranked election ballots credit their
/// first preference only.
fn group_batch<'a>(
    envelopes: impl Iterator<Item = &'a Envelope>,
) -> (Vec<LawDelta>, Vec<ElectionDelta>) {
    let mut law: BTreeMap<String, (i64, i64)> = BTreeMap::new();
    let mut election: BTreeMap<(i64, i64, i64), i64> = BTreeMap::new();

    for envelope in envelopes {
        if let Some(vote) = &envelope.law {
            let entry = law.entry(vote.ballot_id.clone()).or_default();
            match vote.choice {
                VoteChoice::Yes => entry.0 += 1,
                VoteChoice::No => entry.1 += 1,
            }
        } else if let Some(vote) = &envelope.election {
            if let Some(candidate) = vote.tallied_candidate() {
                *election
                    .entry((vote.election_id, vote.region_id, candidate))
                    .or_default() += 1;
            }
        }
    }

    (
        law.into_iter()
            .map(|(ballot_id, (yes, no))| LawDelta { ballot_id, yes, no })
            .collect(),
        election
            .into_iter()
            .map(|((election_id, region_id, candidate_id), votes)| ElectionDelta {
                election_id,
                region_id,
                candidate_id,
                votes,
            })
            .collect(),
    )
}

/// Compare accepted audits against tallies and re-emit one aggregation
/// message per missing count, rebuilt from the audit rows. Meant to run at
/// quiescence (no in-flight aggregation batches), otherwise in-flight
/// messages are counted as missing and re-emitted.
pub async fn reconcile(
    bus: &MessageBus,
    tally: &TallyStore,
    audit: &AuditStore,
) -> Result<u64, AggregateError> {
    let report = tally.reconciliation_report().await.context(StoreSnafu)?;
    if report.is_clean() {
        info!("reconciliation clean, nothing to emit");
        return Ok(0);
    }

    let mut emitted = 0u64;

    for delta in &report.law {
        let rows = audit
            .accepted_for_scope(&delta.ballot_id)
            .await
            .context(StoreSnafu)?;
        let mut yes_left = delta.yes;
        let mut no_left = delta.no;
        for row in rows {
            if yes_left == 0 && no_left == 0 {
                break;
            }
            let choice = match row.choice_payload["choice"].as_str() {
                Some("yes") if yes_left > 0 => {
                    yes_left -= 1;
                    VoteChoice::Yes
                }
                Some("no") if no_left > 0 => {
                    no_left -= 1;
                    VoteChoice::No
                }
                _ => continue,
            };
            let Ok(fingerprint) = Fingerprint::parse(&row.fingerprint) else {
                continue;
            };
            let envelope = Envelope::law(fingerprint, delta.ballot_id.clone(), choice, row.received_at);
            publish_accepted(bus, envelope).await?;
            emitted += 1;
        }
    }

    for delta in &report.election {
        let scope = election_scope(delta.election_id);
        let rows = audit.accepted_for_scope(&scope).await.context(StoreSnafu)?;
        let mut left = delta.votes;
        for row in rows {
            if left == 0 {
                break;
            }
            let payload = &row.choice_payload;
            let region = payload["region_id"].as_i64();
            let single = payload["single_choice"].as_i64();
            let first_preference = payload["ranked_choices"][0].as_i64();
            if region != Some(delta.region_id)
                || single.or(first_preference) != Some(delta.candidate_id)
            {
                continue;
            }
            let Ok(fingerprint) = Fingerprint::parse(&row.fingerprint) else {
                continue;
            };
            let vote = if payload["method"].as_str() == Some("ranked") {
                ElectionVote {
                    election_id: delta.election_id,
                    region_id: delta.region_id,
                    method: VotingMethod::Ranked,
                    single_choice: None,
                    ranked_choices: payload["ranked_choices"]
                        .as_array()
                        .map(|a| a.iter().filter_map(|v| v.as_i64()).collect()),
                }
            } else {
                ElectionVote {
                    election_id: delta.election_id,
                    region_id: delta.region_id,
                    method: VotingMethod::Single,
                    single_choice: single,
                    ranked_choices: None,
                }
            };
            let envelope = Envelope::election(fingerprint, vote, row.received_at);
            publish_accepted(bus, envelope).await?;
            left -= 1;
            emitted += 1;
        }
    }

    info!(emitted, "reconciliation messages emitted");
    Ok(emitted)
}

async fn publish_accepted(bus: &MessageBus, envelope: Envelope) -> Result<(), AggregateError> {
    let processed = ProcessedEnvelope::accepted(envelope);
    let payload = serde_json::to_vec(&processed).context(EncodeSnafu)?;
    bus.publish(AGGREGATION_QUEUE, AGGREGATION_ROUTING_KEY, payload)
        .await
        .context(BusSnafu)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::bus::BusOptions;
    use crate::store::open_pool;

    fn envelope_law(seed: &str, ballot_id: &str, choice: VoteChoice) -> Envelope {
        Envelope::law(
            Fingerprint::compute("123456789", "ABC123", seed),
            ballot_id.to_string(),
            choice,
            Utc::now(),
        )
    }

    #[test]
    fn grouping_credits_first_preference_only() {
        let envelopes = vec![
            envelope_law("a", "L1", VoteChoice::Yes),
            envelope_law("b", "L1", VoteChoice::Yes),
            envelope_law("c", "L1", VoteChoice::No),
            envelope_law("d", "L2", VoteChoice::No),
            Envelope::election(
                Fingerprint::compute("123456789", "ABC123", "e"),
                ElectionVote {
                    election_id: 1,
                    region_id: 1,
                    method: VotingMethod::Ranked,
                    single_choice: None,
                    ranked_choices: Some(vec![7, 3, 9]),
                },
                Utc::now(),
            ),
            Envelope::election(
                Fingerprint::compute("123456789", "ABC123", "f"),
                ElectionVote {
                    election_id: 1,
                    region_id: 1,
                    method: VotingMethod::Single,
                    single_choice: Some(7),
                    ranked_choices: None,
                },
                Utc::now(),
            ),
        ];

        let (law, election) = group_batch(envelopes.iter());
        assert_eq!(
            law,
            vec![
                LawDelta { ballot_id: "L1".to_string(), yes: 2, no: 1 },
                LawDelta { ballot_id: "L2".to_string(), yes: 0, no: 1 },
            ]
        );
        assert_eq!(
            election,
            vec![ElectionDelta { election_id: 1, region_id: 1, candidate_id: 7, votes: 2 }]
        );
    }

    struct Rig {
        _dir: tempfile::TempDir,
        bus: MessageBus,
        tally: TallyStore,
        audit: AuditStore,
    }

    fn rig() -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let bus = MessageBus::open(&dir.path().join("bus.db"), BusOptions::default()).unwrap();
        let pool = open_pool(&dir.path().join("tally.db")).unwrap();
        Rig {
            _dir: dir,
            bus,
            tally: TallyStore::new(pool.clone()),
            audit: AuditStore::new(pool),
        }
    }

    fn fast_config(batch_size: usize) -> AggregatorConfig {
        let mut config = AggregatorConfig::default();
        config.batch_size = batch_size;
        config.batch_interval = Duration::from_millis(50);
        config.poll_interval = Duration::from_millis(10);
        config.retry_base = Duration::from_millis(10);
        config
    }

    async fn publish_accepted_law(rig: &Rig, seed: &str, ballot_id: &str, choice: VoteChoice) {
        let processed = ProcessedEnvelope::accepted(envelope_law(seed, ballot_id, choice));
        rig.bus
            .publish(
                AGGREGATION_QUEUE,
                AGGREGATION_ROUTING_KEY,
                serde_json::to_vec(&processed).unwrap(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn interval_flush_applies_partial_batches() {
        let rig = rig();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let aggregator = Aggregator::new(rig.bus.clone(), rig.tally.clone(), fast_config(100));
        let handle = tokio::spawn(aggregator.run(shutdown_rx));

        publish_accepted_law(&rig, "a", "L1", VoteChoice::Yes).await;
        publish_accepted_law(&rig, "b", "L1", VoteChoice::No).await;

        // Two envelopes, batch size 100: only the interval can flush them.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let row = rig.tally.law_results("L1").await.unwrap().unwrap();
        assert_eq!((row.yes_count, row.no_count), (1, 1));
        assert_eq!(rig.bus.depth(AGGREGATION_QUEUE).await.unwrap(), 0);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_flushes_the_buffer() {
        let rig = rig();
        let mut config = fast_config(100);
        config.batch_interval = Duration::from_secs(3600);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let aggregator = Aggregator::new(rig.bus.clone(), rig.tally.clone(), config);
        let handle = tokio::spawn(aggregator.run(shutdown_rx));

        publish_accepted_law(&rig, "a", "L1", VoteChoice::Yes).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        // Interval is an hour out: nothing flushed yet.
        assert!(rig.tally.law_results("L1").await.unwrap().is_none());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        let row = rig.tally.law_results("L1").await.unwrap().unwrap();
        assert_eq!(row.yes_count, 1);
    }

    #[tokio::test]
    async fn malformed_aggregation_messages_are_dead_lettered() {
        let rig = rig();
        rig.bus
            .publish(AGGREGATION_QUEUE, AGGREGATION_ROUTING_KEY, b"nope".to_vec())
            .await
            .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let aggregator = Aggregator::new(rig.bus.clone(), rig.tally.clone(), fast_config(1));
        let handle = tokio::spawn(aggregator.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(rig.bus.dead_count(AGGREGATION_QUEUE).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reconcile_reemits_missing_ballots() {
        let rig = rig();
        // Two accepted audits, an empty tally.
        for (f, choice) in [("a", "yes"), ("b", "no")] {
            rig.audit
                .insert(crate::store::AuditRecord {
                    fingerprint: Fingerprint::compute("123456789", "ABC123", f)
                        .as_str()
                        .to_string(),
                    scope: "L1".to_string(),
                    choice_payload: serde_json::json!({ "choice": choice }),
                    status: VoteStatus::Accepted,
                    attempt_count: None,
                    error: None,
                    received_at: Utc::now(),
                    processed_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let emitted = reconcile(&rig.bus, &rig.tally, &rig.audit).await.unwrap();
        assert_eq!(emitted, 2);
        assert_eq!(rig.bus.depth(AGGREGATION_QUEUE).await.unwrap(), 2);

        // Run the aggregator over the re-emitted messages: books balance.
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let aggregator = Aggregator::new(rig.bus.clone(), rig.tally.clone(), fast_config(2));
        let handle = tokio::spawn(aggregator.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(rig.tally.reconciliation_report().await.unwrap().is_clean());
        assert_eq!(reconcile(&rig.bus, &rig.tally, &rig.audit).await.unwrap(), 0);
    }
}
