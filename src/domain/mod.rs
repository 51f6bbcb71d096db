//! Shared data model for the vote pipeline.
//!
//! Everything the three stages exchange lives here: the ballot request
//! types with their field validation, the credential fingerprint, and the
//! envelope that travels the bus. Handlers and workers depend on this
//! module rather than on each other.

mod ballot;
mod envelope;
mod fingerprint;

pub use ballot::{ElectionBallot, FieldError, LawBallot, VoteChoice, VotingMethod, MAX_BALLOT_ID_LEN};
pub use envelope::{
    BallotKind, ElectionVote, Envelope, EnvelopeShapeError, LawVote, ProcessedEnvelope, VoteStatus,
};
pub use fingerprint::{election_scope, Fingerprint, InvalidFingerprint, FINGERPRINT_LEN};
