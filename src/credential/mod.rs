//! Credential store: the valid-credential set V, the cast-credential set C,
//! and the duplicate-attempt counters D.
//!
//! Validation workers are the only writers, and only through the two atomic
//! primitives (`claim`, `record_duplicate`). Enumeration and removal are
//! deliberately not part of the trait: V is read-only during a voting
//! window and C is insert-only.

mod memory;

use async_trait::async_trait;
use snafu::Snafu;

use crate::domain::Fingerprint;

pub use memory::MemoryCredentialStore;

/// Credential-store failures. All of them are transient from the worker's
/// point of view: the message is requeued and retried against a healthy
/// store.
#[derive(Debug, Snafu)]
pub enum CredentialError {
    #[snafu(display("credential store unavailable: {reason}"))]
    Unavailable { reason: String },
}

/// Outcome of the atomic claim on the cast set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The caller is the unique claimer; the ballot proceeds.
    New,
    /// The fingerprint had already been claimed.
    Duplicate,
}

/// Operations the validation workers rely on. `claim` is the linearization
/// point of the at-most-once guarantee: exactly one caller per fingerprint
/// ever observes `New`.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Membership test against the valid set V.
    async fn is_valid(&self, fingerprint: &Fingerprint) -> Result<bool, CredentialError>;

    /// Atomic insert-if-absent into the cast set C.
    async fn claim(&self, fingerprint: &Fingerprint) -> Result<ClaimOutcome, CredentialError>;

    /// Membership test against C without claiming. Used to distinguish
    /// never-valid submissions from replays, and to diagnose audit
    /// uniqueness conflicts.
    async fn is_cast(&self, fingerprint: &Fingerprint) -> Result<bool, CredentialError>;

    /// Atomic increment of the duplicate-attempt counter, returning the new
    /// value.
    async fn record_duplicate(&self, fingerprint: &Fingerprint) -> Result<u64, CredentialError>;

    /// Current duplicate-attempt count (0 when none recorded).
    async fn duplicate_count(&self, fingerprint: &Fingerprint) -> Result<u64, CredentialError>;

    /// Connectivity probe for health reporting.
    async fn ping(&self) -> Result<(), CredentialError>;
}

#[async_trait]
impl<T: CredentialStore + ?Sized> CredentialStore for std::sync::Arc<T> {
    async fn is_valid(&self, fingerprint: &Fingerprint) -> Result<bool, CredentialError> {
        (**self).is_valid(fingerprint).await
    }

    async fn claim(&self, fingerprint: &Fingerprint) -> Result<ClaimOutcome, CredentialError> {
        (**self).claim(fingerprint).await
    }

    async fn is_cast(&self, fingerprint: &Fingerprint) -> Result<bool, CredentialError> {
        (**self).is_cast(fingerprint).await
    }

    async fn record_duplicate(&self, fingerprint: &Fingerprint) -> Result<u64, CredentialError> {
        (**self).record_duplicate(fingerprint).await
    }

    async fn duplicate_count(&self, fingerprint: &Fingerprint) -> Result<u64, CredentialError> {
        (**self).duplicate_count(fingerprint).await
    }

    async fn ping(&self) -> Result<(), CredentialError> {
        (**self).ping().await
    }
}
