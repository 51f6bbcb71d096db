//! Validation worker: consumes the `validation` stream, decides
//! authenticity and duplication, writes the audit record, and forwards
//! accepted envelopes to aggregation.
//!
//! This is the only component that mutates the cast set C and the
//! duplicate counters D. Per message the worker produces exactly one audit
//! row, exactly one of {forward to aggregation, publish to review}, and
//! exactly one broker resolution. The step order (authenticate, claim,
//! audit, forward, ack) is what makes redelivery safe: a crash between
//! any two steps either has no effect or degrades to a spurious duplicate
//! audit, never to a double-counted ballot.

use std::sync::Arc;

use chrono::Utc;
use snafu::{ResultExt, Snafu};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::bus::{
    BusError, Delivery, MessageBus, AGGREGATION_QUEUE, AGGREGATION_ROUTING_KEY, REVIEW_QUEUE,
    REVIEW_ROUTING_KEY, VALIDATION_QUEUE,
};
use crate::config::WorkerConfig;
use crate::credential::{ClaimOutcome, CredentialError, CredentialStore};
use crate::domain::{Envelope, Fingerprint, ProcessedEnvelope, VoteStatus};
use crate::store::{AuditRecord, AuditStore, StoreError, TallyStore};

/// Worker failures. `CastSetInconsistent` is fatal; everything else is
/// transient and resolves to a requeue.
#[derive(Debug, Snafu)]
pub enum WorkerError {
    #[snafu(display("bus operation failed: {source}"))]
    Bus { source: BusError },

    #[snafu(display("credential store operation failed: {source}"))]
    Credential { source: CredentialError },

    #[snafu(display("audit store operation failed: {source}"))]
    Audit { source: StoreError },

    #[snafu(display("failed to encode envelope: {source}"))]
    Encode { source: serde_json::Error },

    #[snafu(display(
        "cast set inconsistent for {fingerprint}: accepted audit exists but the claim is absent"
    ))]
    CastSetInconsistent { fingerprint: String },
}

impl WorkerError {
    /// Fatal errors terminate the worker; they signal an inconsistency no
    /// retry can repair.
    pub fn is_fatal(&self) -> bool {
        matches!(self, WorkerError::CastSetInconsistent { .. })
    }
}

/// How one delivery ended, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Accepted, audited, forwarded to aggregation.
    Accepted,
    /// Duplicate with its attempt count, routed to review.
    Duplicate(u64),
    /// Not in the valid set (or structurally invalid fingerprint), routed
    /// to review.
    Invalid,
    /// Never-parseable payload, dead-lettered without requeue.
    Rejected,
}

/// One validation worker. Stateless apart from its connections; any number
/// of workers may run against the same bus and stores.
pub struct ValidationWorker<C> {
    worker_id: String,
    bus: MessageBus,
    credentials: Arc<C>,
    audit: AuditStore,
    tally: TallyStore,
    config: WorkerConfig,
}

impl<C: CredentialStore + 'static> ValidationWorker<C> {
    pub fn new(
        worker_id: impl Into<String>,
        bus: MessageBus,
        credentials: Arc<C>,
        audit: AuditStore,
        tally: TallyStore,
        config: WorkerConfig,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            bus,
            credentials,
            audit,
            tally,
            config,
        }
    }

    /// Consume the validation stream until shutdown. Returns an error only
    /// for fatal inconsistencies.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), WorkerError> {
        info!(worker_id = %self.worker_id, "validation worker starting");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let deliveries = match self
                .bus
                .dequeue(VALIDATION_QUEUE, &self.worker_id, self.config.prefetch)
                .await
            {
                Ok(deliveries) => deliveries,
                Err(e) => {
                    warn!(worker_id = %self.worker_id, error = %e, "dequeue failed, backing off");
                    tokio::time::sleep(self.config.poll_interval).await;
                    continue;
                }
            };

            if deliveries.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            for delivery in deliveries {
                if *shutdown.borrow() {
                    // Unprocessed deliveries return via the visibility
                    // timeout.
                    break;
                }
                match timeout(self.config.message_deadline, self.process(&delivery)).await {
                    Ok(Ok(outcome)) => {
                        debug!(
                            worker_id = %self.worker_id,
                            message_id = delivery.message_id,
                            ?outcome,
                            "message processed"
                        );
                    }
                    Ok(Err(e)) if e.is_fatal() => {
                        error!(worker_id = %self.worker_id, error = %e, "fatal inconsistency, exiting");
                        return Err(e);
                    }
                    Ok(Err(e)) => {
                        warn!(
                            worker_id = %self.worker_id,
                            message_id = delivery.message_id,
                            error = %e,
                            "transient failure, requeueing"
                        );
                        self.requeue(&delivery, &e.to_string()).await;
                    }
                    Err(_) => {
                        warn!(
                            worker_id = %self.worker_id,
                            message_id = delivery.message_id,
                            "message deadline exceeded, requeueing"
                        );
                        self.requeue(&delivery, "message deadline exceeded").await;
                    }
                }
            }
        }

        info!(worker_id = %self.worker_id, "validation worker stopped");
        Ok(())
    }

    async fn requeue(&self, delivery: &Delivery, reason: &str) {
        if let Err(e) = self
            .bus
            .nack(&delivery.receipt, true, Some(reason.to_string()))
            .await
        {
            // Receipt may have lapsed already; redelivery happens anyway.
            debug!(worker_id = %self.worker_id, error = %e, "nack failed");
        }
    }

    /// Decide one delivery. Transient failures bubble up as errors and the
    /// caller requeues; every classified path resolves the broker message
    /// itself.
    pub async fn process(&self, delivery: &Delivery) -> Result<Outcome, WorkerError> {
        if delivery.payload.len() > self.config.max_envelope_bytes {
            warn!(
                worker_id = %self.worker_id,
                bytes = delivery.payload.len(),
                "oversized payload rejected"
            );
            return self.reject(delivery, "oversized payload").await;
        }

        let envelope: Envelope = match serde_json::from_slice(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(e) => return self.reject(delivery, &format!("malformed envelope: {e}")).await,
        };
        if let Err(e) = envelope.check_shape() {
            return self.reject(delivery, &e.to_string()).await;
        }

        let fingerprint = match Fingerprint::parse(&envelope.fingerprint) {
            Ok(fingerprint) => fingerprint,
            Err(_) => {
                return self
                    .finish_invalid(delivery, envelope, "fingerprint is not 64 lowercase hex chars")
                    .await;
            }
        };

        if self.config.enforce_window {
            if let Some(vote) = &envelope.election {
                let window = self
                    .tally
                    .election_window(vote.election_id)
                    .await
                    .context(AuditSnafu)?;
                if let Some((start, end)) = window {
                    if envelope.received_at < start || envelope.received_at >= end {
                        return self
                            .finish_invalid(delivery, envelope, "received outside the voting window")
                            .await;
                    }
                }
            }
        }

        // Authenticate against V.
        if !self
            .credentials
            .is_valid(&fingerprint)
            .await
            .context(CredentialSnafu)?
        {
            if self
                .credentials
                .is_cast(&fingerprint)
                .await
                .context(CredentialSnafu)?
            {
                // Cast but not valid should be impossible under correct
                // generator operation; classify as duplicate and flag it.
                warn!(
                    worker_id = %self.worker_id,
                    fingerprint = %fingerprint,
                    "fingerprint is cast but missing from the valid set"
                );
                return self.finish_duplicate(delivery, envelope, &fingerprint).await;
            }
            return self
                .finish_invalid(delivery, envelope, "fingerprint not in the valid set")
                .await;
        }

        // Claim: the single linearization point.
        if self
            .credentials
            .claim(&fingerprint)
            .await
            .context(CredentialSnafu)?
            == ClaimOutcome::Duplicate
        {
            return self.finish_duplicate(delivery, envelope, &fingerprint).await;
        }

        // Audit before forwarding: the accepted path is gated on this
        // insert, so a crash before it leaves the tallies untouched.
        let record = AuditRecord {
            fingerprint: fingerprint.as_str().to_string(),
            scope: envelope.scope(),
            choice_payload: envelope.choice_payload(),
            status: VoteStatus::Accepted,
            attempt_count: None,
            error: None,
            received_at: envelope.received_at,
            processed_at: Utc::now(),
        };
        match self.audit.insert(record).await {
            Ok(_) => {}
            Err(StoreError::DuplicateAccepted { .. }) => {
                // The claim said new but an accepted audit exists. If C
                // agrees the ballot was cast this is a replay artifact;
                // otherwise the cast set has lost state.
                if self
                    .credentials
                    .is_cast(&fingerprint)
                    .await
                    .context(CredentialSnafu)?
                {
                    warn!(
                        worker_id = %self.worker_id,
                        fingerprint = %fingerprint,
                        "accepted audit already present, re-classifying as duplicate"
                    );
                    return self.finish_duplicate(delivery, envelope, &fingerprint).await;
                }
                return Err(WorkerError::CastSetInconsistent {
                    fingerprint: fingerprint.as_str().to_string(),
                });
            }
            Err(source) => return Err(WorkerError::Audit { source }),
        }

        // Forward, then ack. Publish is confirmed on return.
        let accepted = ProcessedEnvelope::accepted(envelope);
        let payload = serde_json::to_vec(&accepted).context(EncodeSnafu)?;
        self.bus
            .publish(AGGREGATION_QUEUE, AGGREGATION_ROUTING_KEY, payload)
            .await
            .context(BusSnafu)?;
        self.bus.ack(&delivery.receipt).await.context(BusSnafu)?;

        info!(
            worker_id = %self.worker_id,
            fingerprint = %fingerprint,
            scope = %accepted.envelope.scope(),
            "ballot accepted"
        );
        Ok(Outcome::Accepted)
    }

    async fn finish_duplicate(
        &self,
        delivery: &Delivery,
        envelope: Envelope,
        fingerprint: &Fingerprint,
    ) -> Result<Outcome, WorkerError> {
        let attempt = self
            .credentials
            .record_duplicate(fingerprint)
            .await
            .context(CredentialSnafu)?;

        self.audit
            .insert(AuditRecord {
                fingerprint: fingerprint.as_str().to_string(),
                scope: envelope.scope(),
                choice_payload: envelope.choice_payload(),
                status: VoteStatus::Duplicate,
                attempt_count: Some(attempt),
                error: None,
                received_at: envelope.received_at,
                processed_at: Utc::now(),
            })
            .await
            .context(AuditSnafu)?;

        let review = ProcessedEnvelope::duplicate(envelope, attempt);
        let payload = serde_json::to_vec(&review).context(EncodeSnafu)?;
        self.bus
            .publish(REVIEW_QUEUE, REVIEW_ROUTING_KEY, payload)
            .await
            .context(BusSnafu)?;
        self.bus.ack(&delivery.receipt).await.context(BusSnafu)?;

        info!(
            worker_id = %self.worker_id,
            fingerprint = %fingerprint,
            attempt,
            "duplicate ballot dropped"
        );
        Ok(Outcome::Duplicate(attempt))
    }

    async fn finish_invalid(
        &self,
        delivery: &Delivery,
        envelope: Envelope,
        reason: &str,
    ) -> Result<Outcome, WorkerError> {
        self.audit
            .insert(AuditRecord {
                fingerprint: envelope.fingerprint.clone(),
                scope: envelope.scope(),
                choice_payload: envelope.choice_payload(),
                status: VoteStatus::Invalid,
                attempt_count: None,
                error: Some(reason.to_string()),
                received_at: envelope.received_at,
                processed_at: Utc::now(),
            })
            .await
            .context(AuditSnafu)?;

        let review = ProcessedEnvelope::invalid(envelope, reason);
        let payload = serde_json::to_vec(&review).context(EncodeSnafu)?;
        self.bus
            .publish(REVIEW_QUEUE, REVIEW_ROUTING_KEY, payload)
            .await
            .context(BusSnafu)?;
        self.bus.ack(&delivery.receipt).await.context(BusSnafu)?;

        info!(worker_id = %self.worker_id, reason, "invalid ballot rejected");
        Ok(Outcome::Invalid)
    }

    /// Never-parseable message: note it on the review channel and
    /// dead-letter the raw payload without requeue.
    async fn reject(&self, delivery: &Delivery, reason: &str) -> Result<Outcome, WorkerError> {
        let note = serde_json::json!({
            "status": "invalid",
            "reason": reason,
            "message_id": delivery.message_id,
        });
        let payload = serde_json::to_vec(&note).context(EncodeSnafu)?;
        self.bus
            .publish(REVIEW_QUEUE, REVIEW_ROUTING_KEY, payload)
            .await
            .context(BusSnafu)?;
        self.bus
            .nack(&delivery.receipt, false, Some(reason.to_string()))
            .await
            .context(BusSnafu)?;
        Ok(Outcome::Rejected)
    }
}

/// Spawn a pool of identical workers sharing one credential store.
pub fn spawn_pool<C: CredentialStore + 'static>(
    count: usize,
    bus: MessageBus,
    credentials: Arc<C>,
    audit: AuditStore,
    tally: TallyStore,
    config: WorkerConfig,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<Result<(), WorkerError>>> {
    (0..count)
        .map(|i| {
            let worker = ValidationWorker::new(
                format!("worker-{i}"),
                bus.clone(),
                credentials.clone(),
                audit.clone(),
                tally.clone(),
                config.clone(),
            );
            tokio::spawn(worker.run(shutdown.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusOptions;
    use crate::credential::MemoryCredentialStore;
    use crate::domain::VoteChoice;
    use crate::store::open_pool;

    struct Rig {
        _dir: tempfile::TempDir,
        bus: MessageBus,
        credentials: Arc<MemoryCredentialStore>,
        audit: AuditStore,
        tally: TallyStore,
        worker: ValidationWorker<MemoryCredentialStore>,
    }

    fn rig() -> Rig {
        rig_with(WorkerConfig::default())
    }

    fn rig_with(config: WorkerConfig) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let bus = MessageBus::open(&dir.path().join("bus.db"), BusOptions::default()).unwrap();
        let pool = open_pool(&dir.path().join("tally.db")).unwrap();
        let audit = AuditStore::new(pool.clone());
        let tally = TallyStore::new(pool);
        let credentials = Arc::new(MemoryCredentialStore::new(None));
        let worker = ValidationWorker::new(
            "worker-test",
            bus.clone(),
            credentials.clone(),
            audit.clone(),
            tally.clone(),
            config,
        );
        Rig {
            _dir: dir,
            bus,
            credentials,
            audit,
            tally,
            worker,
        }
    }

    fn law_envelope(scope: &str) -> (Fingerprint, Envelope) {
        let fingerprint = Fingerprint::compute("123456789", "ABC123", scope);
        let envelope = Envelope::law(
            fingerprint.clone(),
            scope.to_string(),
            VoteChoice::Yes,
            Utc::now(),
        );
        (fingerprint, envelope)
    }

    async fn deliver(bus: &MessageBus, envelope: &Envelope) -> Delivery {
        bus.publish(
            VALIDATION_QUEUE,
            envelope.routing_key(),
            serde_json::to_vec(envelope).unwrap(),
        )
        .await
        .unwrap();
        bus.dequeue(VALIDATION_QUEUE, "test", 1).await.unwrap().remove(0)
    }

    #[tokio::test]
    async fn accepted_ballot_is_audited_and_forwarded() {
        let rig = rig();
        let (fingerprint, envelope) = law_envelope("L2025-001");
        rig.credentials.insert_valid(fingerprint.clone()).await;

        let delivery = deliver(&rig.bus, &envelope).await;
        let outcome = rig.worker.process(&delivery).await.unwrap();
        assert_eq!(outcome, Outcome::Accepted);

        // One accepted audit, one aggregation message, input acked.
        assert_eq!(
            rig.audit
                .count_by_status(VoteStatus::Accepted, Some("L2025-001"))
                .await
                .unwrap(),
            1
        );
        assert_eq!(rig.bus.depth(AGGREGATION_QUEUE).await.unwrap(), 1);
        assert_eq!(rig.bus.depth(VALIDATION_QUEUE).await.unwrap(), 0);

        let forwarded = rig.bus.dequeue(AGGREGATION_QUEUE, "agg", 1).await.unwrap().remove(0);
        let processed: ProcessedEnvelope = serde_json::from_slice(&forwarded.payload).unwrap();
        assert_eq!(processed.status, VoteStatus::Accepted);
        assert_eq!(processed.envelope.fingerprint, fingerprint.as_str());
    }

    #[tokio::test]
    async fn duplicates_count_up_and_go_to_review() {
        let rig = rig();
        let (fingerprint, envelope) = law_envelope("L2025-001");
        rig.credentials.insert_valid(fingerprint.clone()).await;

        let delivery = deliver(&rig.bus, &envelope).await;
        assert_eq!(rig.worker.process(&delivery).await.unwrap(), Outcome::Accepted);

        for expected in 1..=2u64 {
            let delivery = deliver(&rig.bus, &envelope).await;
            assert_eq!(
                rig.worker.process(&delivery).await.unwrap(),
                Outcome::Duplicate(expected)
            );
        }

        assert_eq!(rig.credentials.duplicate_count(&fingerprint).await.unwrap(), 2);
        assert_eq!(
            rig.audit
                .count_by_status(VoteStatus::Duplicate, Some("L2025-001"))
                .await
                .unwrap(),
            2
        );
        assert_eq!(rig.bus.depth(REVIEW_QUEUE).await.unwrap(), 2);
        // Only the first submission reached aggregation.
        assert_eq!(rig.bus.depth(AGGREGATION_QUEUE).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_fingerprint_is_invalid_not_duplicate() {
        let rig = rig();
        let (_, envelope) = law_envelope("L2025-001");

        let delivery = deliver(&rig.bus, &envelope).await;
        assert_eq!(rig.worker.process(&delivery).await.unwrap(), Outcome::Invalid);

        assert_eq!(
            rig.audit
                .count_by_status(VoteStatus::Invalid, Some("L2025-001"))
                .await
                .unwrap(),
            1
        );
        assert_eq!(rig.bus.depth(AGGREGATION_QUEUE).await.unwrap(), 0);
        assert_eq!(rig.bus.depth(REVIEW_QUEUE).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cast_but_not_valid_is_treated_as_duplicate() {
        let rig = rig();
        let (fingerprint, envelope) = law_envelope("L2025-001");
        rig.credentials.restore_cast([fingerprint.clone()]).await;

        let delivery = deliver(&rig.bus, &envelope).await;
        assert_eq!(
            rig.worker.process(&delivery).await.unwrap(),
            Outcome::Duplicate(1)
        );
    }

    #[tokio::test]
    async fn malformed_fingerprint_is_invalid() {
        let rig = rig();
        let (_, mut envelope) = law_envelope("L2025-001");
        envelope.fingerprint = "short".to_string();

        let delivery = deliver(&rig.bus, &envelope).await;
        assert_eq!(rig.worker.process(&delivery).await.unwrap(), Outcome::Invalid);
    }

    #[tokio::test]
    async fn unparseable_payload_is_dead_lettered() {
        let rig = rig();
        rig.bus
            .publish(VALIDATION_QUEUE, "vote.validation.law", b"{not json".to_vec())
            .await
            .unwrap();
        let delivery = rig.bus.dequeue(VALIDATION_QUEUE, "test", 1).await.unwrap().remove(0);

        assert_eq!(rig.worker.process(&delivery).await.unwrap(), Outcome::Rejected);
        assert_eq!(rig.bus.dead_count(VALIDATION_QUEUE).await.unwrap(), 1);
        assert_eq!(rig.bus.depth(REVIEW_QUEUE).await.unwrap(), 1);
        // Nothing audited for garbage.
        assert_eq!(rig.audit.count_by_status(VoteStatus::Invalid, None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn oversized_payload_is_dead_lettered() {
        let mut config = WorkerConfig::default();
        config.max_envelope_bytes = 64;
        let rig = rig_with(config);

        let (_, envelope) = law_envelope("L2025-001");
        let delivery = deliver(&rig.bus, &envelope).await;
        assert_eq!(rig.worker.process(&delivery).await.unwrap(), Outcome::Rejected);
        assert_eq!(rig.bus.dead_count(VALIDATION_QUEUE).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn redelivered_accepted_envelope_becomes_duplicate() {
        let rig = rig();
        let (fingerprint, envelope) = law_envelope("L2025-001");
        rig.credentials.insert_valid(fingerprint.clone()).await;

        // First delivery accepted; the bus then redelivers the same
        // envelope, as an at-least-once broker may.
        let first = deliver(&rig.bus, &envelope).await;
        rig.worker.process(&first).await.unwrap();
        let second = deliver(&rig.bus, &envelope).await;
        assert_eq!(
            rig.worker.process(&second).await.unwrap(),
            Outcome::Duplicate(1)
        );

        // Still exactly one accepted audit and one aggregation message.
        assert_eq!(
            rig.audit
                .count_by_status(VoteStatus::Accepted, Some("L2025-001"))
                .await
                .unwrap(),
            1
        );
        assert_eq!(rig.bus.depth(AGGREGATION_QUEUE).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn window_enforcement_rejects_when_enabled() {
        let mut config = WorkerConfig::default();
        config.enforce_window = true;
        let rig = rig_with(config);

        // Election whose window closed an hour ago.
        rig.tally
            .upsert_election(crate::store::Election {
                id: 1,
                name: None,
                method: "single".to_string(),
                start_at: Utc::now() - chrono::Duration::hours(3),
                end_at: Utc::now() - chrono::Duration::hours(1),
            })
            .await
            .unwrap();

        let fingerprint = Fingerprint::compute("123456789", "ABC123", "election:1");
        rig.credentials.insert_valid(fingerprint.clone()).await;
        let envelope = Envelope::election(
            fingerprint,
            crate::domain::ElectionVote {
                election_id: 1,
                region_id: 1,
                method: crate::domain::VotingMethod::Single,
                single_choice: Some(7),
                ranked_choices: None,
            },
            Utc::now(),
        );

        let delivery = deliver(&rig.bus, &envelope).await;
        assert_eq!(rig.worker.process(&delivery).await.unwrap(), Outcome::Invalid);
    }
}
