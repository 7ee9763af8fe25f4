//! Session orchestration for dojo workshop environments.
//!
//! The `Orchestrator` drives the identity, cluster, chaos and ticket clients
//! through the fixed provisioning sequence, records every created resource in
//! the session ledger before moving on, and reverses exactly those resources
//! on failure or explicit teardown. `SessionRegistry` answers the store-only
//! queries without any client. This crate also holds the lifecycle state
//! machine, the retry policy for transient client failures, per-session
//! locking and process-wide shutdown handling.

pub mod concurrency;
pub mod lifecycle;
pub mod orchestrator;
pub mod registry;
pub mod retry;

pub use concurrency::{install_signal_handler, shutdown_requested, SessionLock};
pub use lifecycle::validate_transition;
pub use orchestrator::{Orchestrator, OrchestratorSettings, ProvisionOutcome};
pub use registry::SessionRegistry;
pub use retry::{retry_call, RetryError, RetryPolicy};

use dojo_schema::SessionState;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid session request: {0}")]
    Request(#[from] dojo_schema::RequestError),
    #[error("config error: {0}")]
    Config(#[from] dojo_schema::ConfigError),
    #[error("store error: {0}")]
    Store(#[from] dojo_store::StoreError),
    #[error("client setup error: {0}")]
    Client(#[from] dojo_clients::ClientError),
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("session already exists: {0}")]
    SessionExists(String),
    #[error("session is busy (locked by another run): {0}")]
    SessionBusy(String),
    #[error("session requires {0}, but no {0} client is configured")]
    MissingCapability(&'static str),
    #[error("session {session} is {state}; only closed sessions can be purged")]
    NotClosed { session: String, state: SessionState },
    #[error("session {session} is {state}; only pending or provisioning sessions can be stopped")]
    NotInProgress { session: String, state: SessionState },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
