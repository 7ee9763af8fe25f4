//! Data model and configuration for dojo workshop sessions.
//!
//! This crate defines the schema layer: identifier newtypes, the immutable
//! `SessionRequest`, the `ResourceHandle` variants recorded for every created
//! external resource, the append-only `ProvisioningLedger`, the `SessionState`
//! lifecycle enum, TOML configuration (`DojoConfig`), and participant
//! credential generation.

pub mod config;
pub mod credential;
pub mod handle;
pub mod request;
pub mod state;
pub mod types;

pub use config::{
    parse_config_file, parse_config_str, resolve_secret, ChaosFault, ChaosSection, ClusterSection,
    ConfigError, CredentialSection, DojoConfig, IdentitySection, QuotaSection, RetrySection,
    TicketSection,
};
pub use credential::{
    generate_password, generate_suffix, validate_password, Credential, CredentialError,
};
pub use handle::{ProvisioningLedger, ResourceHandle, ResourceKind};
pub use request::{
    parse_request_file, parse_request_str, validate_session_id, RequestError, SessionRequest,
    MAX_PARTICIPANTS, MAX_SESSION_ID_LEN,
};
pub use state::{FailureCause, FailureKind, FailurePhase, ProvisionStep, SessionState};
pub use types::{ExperimentId, NamespaceName, Realm, SessionId, TicketId, UserId};
