use crate::handle::ResourceHandle;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SessionState {
    Pending,
    Provisioning,
    Ready,
    TearingDown,
    Failed,
    Closed,
}

impl SessionState {
    /// Whether no further work is pending for the session.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Ready | SessionState::Closed | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Pending => write!(f, "pending"),
            SessionState::Provisioning => write!(f, "provisioning"),
            SessionState::Ready => write!(f, "ready"),
            SessionState::TearingDown => write!(f, "tearing_down"),
            SessionState::Failed => write!(f, "failed"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// One step of the fixed provisioning sequence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionStep {
    CreateIdentity,
    CreateNamespace,
    BindIdentity,
    StartChaos,
    OpenTicket,
}

impl fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisionStep::CreateIdentity => write!(f, "create_identity"),
            ProvisionStep::CreateNamespace => write!(f, "create_namespace"),
            ProvisionStep::BindIdentity => write!(f, "bind_identity"),
            ProvisionStep::StartChaos => write!(f, "start_chaos"),
            ProvisionStep::OpenTicket => write!(f, "open_ticket"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailurePhase {
    Provision,
    Teardown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Retry budget exhausted on a retriable error.
    Transient,
    /// The resource exists with parameters owned by someone else.
    Conflict,
    /// Non-retriable rejection (credentials, validation, malformed response).
    Rejected,
    /// An explicit stop request interrupted provisioning.
    Cancelled,
    /// At least one delete kept failing; the ledger still lists it.
    UnrecoverableTeardown,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Transient => write!(f, "transient"),
            FailureKind::Conflict => write!(f, "conflict"),
            FailureKind::Rejected => write!(f, "rejected"),
            FailureKind::Cancelled => write!(f, "cancelled"),
            FailureKind::UnrecoverableTeardown => write!(f, "unrecoverable_teardown"),
        }
    }
}

/// Structured cause attached to a session that did not end the way it was asked to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureCause {
    pub phase: FailurePhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<ProvisionStep>,
    pub kind: FailureKind,
    pub message: String,
    /// Handles that could not be reclaimed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retained: Vec<ResourceHandle>,
}

impl FailureCause {
    pub fn provision(step: ProvisionStep, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            phase: FailurePhase::Provision,
            step: Some(step),
            kind,
            message: message.into(),
            retained: Vec::new(),
        }
    }

    /// A stop request seen once every step had already succeeded.
    pub fn stopped(message: impl Into<String>) -> Self {
        Self {
            phase: FailurePhase::Provision,
            step: None,
            kind: FailureKind::Cancelled,
            message: message.into(),
            retained: Vec::new(),
        }
    }

    pub fn teardown(retained: Vec<ResourceHandle>, message: impl Into<String>) -> Self {
        Self {
            phase: FailurePhase::Teardown,
            step: None,
            kind: FailureKind::UnrecoverableTeardown,
            message: message.into(),
            retained,
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.step {
            Some(step) => write!(f, "{} failed at {step}: {}", self.kind, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}
