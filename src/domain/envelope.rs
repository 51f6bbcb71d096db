//! The ballot envelope: the canonical in-pipeline representation of a
//! submission. Carries the fingerprint and choice payload, never the raw
//! credential.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::Snafu;

use super::ballot::{VoteChoice, VotingMethod};
use super::fingerprint::{election_scope, Fingerprint};

/// Which ballot style an envelope carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BallotKind {
    Law,
    Election,
}

/// Law-vote payload of an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LawVote {
    pub ballot_id: String,
    pub choice: VoteChoice,
}

/// Election-vote payload of an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElectionVote {
    pub election_id: i64,
    pub region_id: i64,
    pub method: VotingMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub single_choice: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ranked_choices: Option<Vec<i64>>,
}

impl ElectionVote {
    /// The candidate credited in the tally: the single choice, or the first
    /// preference of a ranked ballot.
    pub fn tallied_candidate(&self) -> Option<i64> {
        match self.method {
            VotingMethod::Single => self.single_choice,
            VotingMethod::Ranked => self.ranked_choices.as_ref().and_then(|c| c.first().copied()),
        }
    }
}

/// Structural failure of a decoded envelope. These are permanent: the
/// message can never become processable and is rejected without requeue.
#[derive(Debug, Snafu)]
pub enum EnvelopeShapeError {
    #[snafu(display("kind is {kind:?} but the matching payload is missing"))]
    MissingPayload { kind: BallotKind },

    #[snafu(display("kind is {kind:?} but a foreign payload is present"))]
    ForeignPayload { kind: BallotKind },

    #[snafu(display("election payload carries no tallied candidate"))]
    NoCandidate,
}

/// A ballot in flight between pipeline stages.
///
/// Wire format: exactly one of `law` / `election` is present, matching
/// `kind`. The fingerprint is kept as a raw string here; workers re-validate
/// it so that a mangled fingerprint is classified rather than crashing the
/// decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: BallotKind,
    pub fingerprint: String,
    pub received_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub law: Option<LawVote>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub election: Option<ElectionVote>,
}

impl Envelope {
    /// Envelope for a law ballot.
    pub fn law(
        fingerprint: Fingerprint,
        ballot_id: String,
        choice: VoteChoice,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: BallotKind::Law,
            fingerprint: fingerprint.as_str().to_string(),
            received_at,
            law: Some(LawVote { ballot_id, choice }),
            election: None,
        }
    }

    /// Envelope for an election ballot.
    pub fn election(fingerprint: Fingerprint, vote: ElectionVote, received_at: DateTime<Utc>) -> Self {
        Self {
            kind: BallotKind::Election,
            fingerprint: fingerprint.as_str().to_string(),
            received_at,
            law: None,
            election: Some(vote),
        }
    }

    /// Verify the variant invariant after decoding.
    pub fn check_shape(&self) -> Result<(), EnvelopeShapeError> {
        match self.kind {
            BallotKind::Law => {
                if self.law.is_none() {
                    return Err(EnvelopeShapeError::MissingPayload { kind: self.kind });
                }
                if self.election.is_some() {
                    return Err(EnvelopeShapeError::ForeignPayload { kind: self.kind });
                }
            }
            BallotKind::Election => {
                let Some(vote) = &self.election else {
                    return Err(EnvelopeShapeError::MissingPayload { kind: self.kind });
                };
                if self.law.is_some() {
                    return Err(EnvelopeShapeError::ForeignPayload { kind: self.kind });
                }
                if vote.tallied_candidate().is_none() {
                    return Err(EnvelopeShapeError::NoCandidate);
                }
            }
        }
        Ok(())
    }

    /// Ballot scope: the referendum identifier, or `election:{id}`.
    pub fn scope(&self) -> String {
        match (&self.law, &self.election) {
            (Some(law), _) => law.ballot_id.clone(),
            (_, Some(election)) => election_scope(election.election_id),
            _ => String::new(),
        }
    }

    /// Routing key on the validation stream.
    pub fn routing_key(&self) -> &'static str {
        match self.kind {
            BallotKind::Law => "vote.validation.law",
            BallotKind::Election => "vote.validation.election",
        }
    }

    /// Choice payload as stored in the audit log. Ranked ballots keep the
    /// full ranking here even though only the first preference is tallied.
    pub fn choice_payload(&self) -> serde_json::Value {
        match (&self.law, &self.election) {
            (Some(law), _) => serde_json::json!({ "choice": law.choice }),
            (_, Some(election)) => match election.method {
                VotingMethod::Single => serde_json::json!({
                    "method": election.method,
                    "region_id": election.region_id,
                    "single_choice": election.single_choice,
                }),
                VotingMethod::Ranked => serde_json::json!({
                    "method": election.method,
                    "region_id": election.region_id,
                    "ranked_choices": election.ranked_choices,
                }),
            },
            _ => serde_json::Value::Null,
        }
    }
}

/// Final classification of a processed envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteStatus {
    Accepted,
    Duplicate,
    Invalid,
}

impl VoteStatus {
    /// Storage form, shared by audit rows and review payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteStatus::Accepted => "accepted",
            VoteStatus::Duplicate => "duplicate",
            VoteStatus::Invalid => "invalid",
        }
    }
}

impl std::fmt::Display for VoteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope on the `aggregation` and `review` streams: the validation
/// envelope plus its classification, and for duplicates the attempt count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedEnvelope {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub status: VoteStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ProcessedEnvelope {
    pub fn accepted(envelope: Envelope) -> Self {
        Self {
            envelope,
            status: VoteStatus::Accepted,
            attempt_count: None,
            reason: None,
        }
    }

    pub fn duplicate(envelope: Envelope, attempt_count: u64) -> Self {
        Self {
            envelope,
            status: VoteStatus::Duplicate,
            attempt_count: Some(attempt_count),
            reason: None,
        }
    }

    pub fn invalid(envelope: Envelope, reason: impl Into<String>) -> Self {
        Self {
            envelope,
            status: VoteStatus::Invalid,
            attempt_count: None,
            reason: Some(reason.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fp() -> Fingerprint {
        Fingerprint::compute("123456789", "ABC123", "L2025-001")
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn law_wire_format() {
        let envelope = Envelope::law(fp(), "L2025-001".to_string(), VoteChoice::Yes, at());
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["kind"], "law");
        assert_eq!(json["law"]["choice"], "yes");
        assert_eq!(json["law"]["ballot_id"], "L2025-001");
        assert!(json.get("election").is_none());

        let back: Envelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, envelope);
        back.check_shape().unwrap();
        assert_eq!(back.scope(), "L2025-001");
        assert_eq!(back.routing_key(), "vote.validation.law");
    }

    #[test]
    fn election_wire_format_and_first_preference() {
        let vote = ElectionVote {
            election_id: 1,
            region_id: 1,
            method: VotingMethod::Ranked,
            single_choice: None,
            ranked_choices: Some(vec![7, 3, 9]),
        };
        let envelope = Envelope::election(fp(), vote, at());
        envelope.check_shape().unwrap();
        assert_eq!(envelope.scope(), "election:1");
        assert_eq!(envelope.election.as_ref().unwrap().tallied_candidate(), Some(7));
        assert_eq!(
            envelope.choice_payload()["ranked_choices"],
            serde_json::json!([7, 3, 9])
        );
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let mut envelope = Envelope::law(fp(), "L2025-001".to_string(), VoteChoice::No, at());
        envelope.kind = BallotKind::Election;
        assert!(envelope.check_shape().is_err());

        envelope.kind = BallotKind::Law;
        envelope.election = Some(ElectionVote {
            election_id: 1,
            region_id: 1,
            method: VotingMethod::Single,
            single_choice: Some(1),
            ranked_choices: None,
        });
        assert!(envelope.check_shape().is_err());
    }

    #[test]
    fn review_envelope_carries_attempt_count() {
        let envelope = Envelope::law(fp(), "L2025-001".to_string(), VoteChoice::Yes, at());
        let review = ProcessedEnvelope::duplicate(envelope, 2);
        let json = serde_json::to_value(&review).unwrap();
        assert_eq!(json["status"], "duplicate");
        assert_eq!(json["attempt_count"], 2);
        // Flattened: the inner envelope fields sit at the top level.
        assert_eq!(json["kind"], "law");
    }
}
