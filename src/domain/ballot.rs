//! Ballot submission types and field validation.

use serde::{Deserialize, Serialize};

/// Maximum accepted length of a law ballot identifier.
pub const MAX_BALLOT_ID_LEN: usize = 50;

/// Choice on a binary referendum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteChoice {
    Yes,
    No,
}

/// How an election ballot expresses its preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VotingMethod {
    /// One candidate per ballot.
    Single,
    /// Ordered list of candidates; only the first preference is tallied.
    Ranked,
}

/// A field-level validation failure, reported back to the client as
/// `{error, field}`.
#[derive(Debug, Clone, Serialize)]
pub struct FieldError {
    /// Human-readable description of the failure.
    pub error: String,
    /// Name of the offending field.
    pub field: &'static str,
}

impl FieldError {
    fn new(field: &'static str, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            field,
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.error)
    }
}

impl std::error::Error for FieldError {}

fn validate_credentials(nas: &str, code: &str) -> Result<(), FieldError> {
    if nas.len() != 9 || !nas.bytes().all(|b| b.is_ascii_digit()) {
        return Err(FieldError::new("nas", "must be exactly 9 decimal digits"));
    }
    if code.len() != 6 || !code.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(FieldError::new(
            "code",
            "must be exactly 6 alphanumeric characters",
        ));
    }
    Ok(())
}

/// Referendum ballot as submitted over HTTP. Holds the raw credential; must
/// not outlive the request handler.
#[derive(Debug, Clone, Deserialize)]
pub struct LawBallot {
    pub nas: String,
    pub code: String,
    pub ballot_id: String,
    pub choice: VoteChoice,
}

impl LawBallot {
    /// Shape validation; first failing field wins.
    pub fn validate(&self) -> Result<(), FieldError> {
        validate_credentials(&self.nas, &self.code)?;
        if self.ballot_id.is_empty() || self.ballot_id.len() > MAX_BALLOT_ID_LEN {
            return Err(FieldError::new(
                "ballot_id",
                format!("must be 1..={MAX_BALLOT_ID_LEN} characters"),
            ));
        }
        Ok(())
    }
}

/// Election ballot as submitted over HTTP.
#[derive(Debug, Clone, Deserialize)]
pub struct ElectionBallot {
    pub nas: String,
    pub code: String,
    pub election_id: i64,
    pub region_id: i64,
    pub method: VotingMethod,
    #[serde(default)]
    pub single_choice: Option<i64>,
    #[serde(default)]
    pub ranked_choices: Option<Vec<i64>>,
}

impl ElectionBallot {
    /// Shape validation: credential fields, positive identifiers, and the
    /// method/payload agreement (exactly one of `single_choice` /
    /// `ranked_choices`, matching `method`; ranked lists non-empty with
    /// distinct entries).
    pub fn validate(&self) -> Result<(), FieldError> {
        validate_credentials(&self.nas, &self.code)?;
        if self.election_id <= 0 {
            return Err(FieldError::new("election_id", "must be a positive integer"));
        }
        if self.region_id <= 0 {
            return Err(FieldError::new("region_id", "must be a positive integer"));
        }
        match self.method {
            VotingMethod::Single => {
                if self.ranked_choices.is_some() {
                    return Err(FieldError::new(
                        "ranked_choices",
                        "not allowed when method is single",
                    ));
                }
                match self.single_choice {
                    Some(id) if id > 0 => {}
                    Some(_) => {
                        return Err(FieldError::new(
                            "single_choice",
                            "must be a positive integer",
                        ));
                    }
                    None => {
                        return Err(FieldError::new(
                            "single_choice",
                            "required when method is single",
                        ));
                    }
                }
            }
            VotingMethod::Ranked => {
                if self.single_choice.is_some() {
                    return Err(FieldError::new(
                        "single_choice",
                        "not allowed when method is ranked",
                    ));
                }
                let choices = self.ranked_choices.as_deref().unwrap_or_default();
                if choices.is_empty() {
                    return Err(FieldError::new(
                        "ranked_choices",
                        "must contain at least one candidate",
                    ));
                }
                if choices.iter().any(|id| *id <= 0) {
                    return Err(FieldError::new(
                        "ranked_choices",
                        "candidate ids must be positive integers",
                    ));
                }
                let mut seen = std::collections::HashSet::new();
                if !choices.iter().all(|id| seen.insert(*id)) {
                    return Err(FieldError::new(
                        "ranked_choices",
                        "candidate ids must be distinct",
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn law(nas: &str, code: &str, ballot_id: &str) -> LawBallot {
        LawBallot {
            nas: nas.to_string(),
            code: code.to_string(),
            ballot_id: ballot_id.to_string(),
            choice: VoteChoice::Yes,
        }
    }

    #[test]
    fn law_ballot_shapes() {
        assert!(law("123456789", "ABC123", "L2025-001").validate().is_ok());
        assert_eq!(law("12345678", "ABC123", "L").validate().unwrap_err().field, "nas");
        assert_eq!(law("12345678a", "ABC123", "L").validate().unwrap_err().field, "nas");
        assert_eq!(law("123456789", "AB!123", "L").validate().unwrap_err().field, "code");
        assert_eq!(law("123456789", "ABC123", "").validate().unwrap_err().field, "ballot_id");
        let long = "x".repeat(MAX_BALLOT_ID_LEN + 1);
        assert_eq!(law("123456789", "ABC123", &long).validate().unwrap_err().field, "ballot_id");
    }

    fn election(method: VotingMethod) -> ElectionBallot {
        ElectionBallot {
            nas: "123456789".to_string(),
            code: "ABC123".to_string(),
            election_id: 1,
            region_id: 1,
            method,
            single_choice: None,
            ranked_choices: None,
        }
    }

    #[test]
    fn election_method_payload_agreement() {
        let mut single = election(VotingMethod::Single);
        assert_eq!(single.validate().unwrap_err().field, "single_choice");
        single.single_choice = Some(7);
        assert!(single.validate().is_ok());
        single.ranked_choices = Some(vec![1]);
        assert_eq!(single.validate().unwrap_err().field, "ranked_choices");

        let mut ranked = election(VotingMethod::Ranked);
        assert_eq!(ranked.validate().unwrap_err().field, "ranked_choices");
        ranked.ranked_choices = Some(vec![7, 3, 9]);
        assert!(ranked.validate().is_ok());
        ranked.ranked_choices = Some(vec![7, 3, 7]);
        assert_eq!(ranked.validate().unwrap_err().field, "ranked_choices");
        ranked.ranked_choices = Some(vec![]);
        assert_eq!(ranked.validate().unwrap_err().field, "ranked_choices");
    }

    #[test]
    fn election_positive_ids() {
        let mut ballot = election(VotingMethod::Single);
        ballot.single_choice = Some(7);
        ballot.election_id = 0;
        assert_eq!(ballot.validate().unwrap_err().field, "election_id");
        ballot.election_id = 1;
        ballot.region_id = -2;
        assert_eq!(ballot.validate().unwrap_err().field, "region_id");
    }

    #[test]
    fn choice_serde_is_lowercase() {
        assert_eq!(serde_json::to_string(&VoteChoice::Yes).unwrap(), "\"yes\"");
        assert_eq!(serde_json::to_string(&VotingMethod::Ranked).unwrap(), "\"ranked\"");
    }
}
