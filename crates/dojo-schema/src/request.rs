use crate::types::SessionId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Longest accepted session id. The id is used verbatim as a namespace name and
/// as a username prefix, so it has to leave room for the `-pNN` suffix inside
/// the 63 character DNS label limit.
pub const MAX_SESSION_ID_LEN: usize = 40;

/// Upper bound on participants per session.
pub const MAX_PARTICIPANTS: u32 = 99;

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("failed to read session request: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse session request: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("invalid session id '{id}': {reason}")]
    InvalidSessionId { id: String, reason: &'static str },
    #[error("participant_count must be at least 1")]
    NoParticipants,
    #[error("participant_count {0} exceeds the maximum of {MAX_PARTICIPANTS}")]
    TooManyParticipants(u32),
}

/// A request to provision one workshop session. Immutable once submitted.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SessionRequest {
    pub session_id: SessionId,
    #[serde(default = "default_participants")]
    pub participant_count: u32,
    #[serde(default)]
    pub chaos_enabled: bool,
    #[serde(default)]
    pub ticket_required: bool,
}

fn default_participants() -> u32 {
    1
}

impl SessionRequest {
    pub fn new(session_id: impl Into<SessionId>, participant_count: u32) -> Self {
        Self {
            session_id: session_id.into(),
            participant_count,
            chaos_enabled: false,
            ticket_required: false,
        }
    }

    #[must_use]
    pub fn with_chaos(mut self, enabled: bool) -> Self {
        self.chaos_enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_ticket(mut self, required: bool) -> Self {
        self.ticket_required = required;
        self
    }

    pub fn validate(&self) -> Result<(), RequestError> {
        validate_session_id(&self.session_id)?;
        if self.participant_count == 0 {
            return Err(RequestError::NoParticipants);
        }
        if self.participant_count > MAX_PARTICIPANTS {
            return Err(RequestError::TooManyParticipants(self.participant_count));
        }
        Ok(())
    }

    /// Usernames of the participant identities, in creation order.
    pub fn usernames(&self) -> Vec<String> {
        (1..=self.participant_count)
            .map(|n| format!("{}-p{n}", self.session_id))
            .collect()
    }
}

/// Session ids become namespace names, so they follow DNS-1123 label rules.
pub fn validate_session_id(id: &str) -> Result<(), RequestError> {
    let invalid = |reason| RequestError::InvalidSessionId {
        id: id.to_owned(),
        reason,
    };
    if id.is_empty() || id.len() > MAX_SESSION_ID_LEN {
        return Err(invalid("must be 1-40 characters"));
    }
    if !id
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return Err(invalid("must match [a-z0-9-]"));
    }
    if id.starts_with('-') || id.ends_with('-') {
        return Err(invalid("must start and end with an alphanumeric character"));
    }
    Ok(())
}

pub fn parse_request_str(input: &str) -> Result<SessionRequest, RequestError> {
    let request: SessionRequest = toml::from_str(input)?;
    request.validate()?;
    Ok(request)
}

pub fn parse_request_file(path: impl AsRef<Path>) -> Result<SessionRequest, RequestError> {
    let content = fs::read_to_string(path)?;
    parse_request_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_request() {
        let input = r#"
session_id = "ws-42"
participant_count = 3
chaos_enabled = true
ticket_required = true
"#;
        let req = parse_request_str(input).unwrap();
        assert_eq!(req.session_id, "ws-42");
        assert_eq!(req.participant_count, 3);
        assert!(req.chaos_enabled);
        assert!(req.ticket_required);
    }

    #[test]
    fn parses_minimal_request() {
        let req = parse_request_str("session_id = \"ws-1\"\n").unwrap();
        assert_eq!(req.participant_count, 1);
        assert!(!req.chaos_enabled);
        assert!(!req.ticket_required);
    }

    #[test]
    fn rejects_unknown_fields() {
        let input = "session_id = \"ws-1\"\nregion = \"eu\"\n";
        assert!(parse_request_str(input).is_err());
    }

    #[test]
    fn rejects_zero_participants() {
        let input = "session_id = \"ws-1\"\nparticipant_count = 0\n";
        assert!(matches!(
            parse_request_str(input),
            Err(RequestError::NoParticipants)
        ));
    }

    #[test]
    fn rejects_too_many_participants() {
        let req = SessionRequest::new("ws-1", 100);
        assert!(matches!(
            req.validate(),
            Err(RequestError::TooManyParticipants(100))
        ));
    }

    #[test]
    fn session_id_rules() {
        assert!(validate_session_id("ws-42").is_ok());
        assert!(validate_session_id("a").is_ok());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id("WS-42").is_err());
        assert!(validate_session_id("ws_42").is_err());
        assert!(validate_session_id("-ws").is_err());
        assert!(validate_session_id("ws-").is_err());
        assert!(validate_session_id(&"a".repeat(41)).is_err());
    }

    #[test]
    fn usernames_follow_participant_order() {
        let req = SessionRequest::new("ws-42", 3);
        assert_eq!(req.usernames(), vec!["ws-42-p1", "ws-42-p2", "ws-42-p3"]);
    }

    #[test]
    fn builder_flags() {
        let req = SessionRequest::new("ws-42", 1)
            .with_chaos(true)
            .with_ticket(true);
        assert!(req.chaos_enabled);
        assert!(req.ticket_required);
    }

    #[test]
    fn parse_request_file_reads_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.toml");
        fs::write(&path, "session_id = \"ws-7\"\nchaos_enabled = true\n").unwrap();
        let req = parse_request_file(&path).unwrap();
        assert_eq!(req.session_id, "ws-7");
        assert!(req.chaos_enabled);
    }
}
