//! Capability clients for the external systems a workshop session touches.
//!
//! Each system sits behind a `Send + Sync` trait (`IdentityProvider`,
//! `ClusterProvider`, `ChaosProvider`, `TicketProvider`). The HTTP
//! implementations talk to Keycloak, Kubernetes, Harness chaos and ServiceNow
//! through a shared `ureq` transport that classifies failures into
//! `ClientError`; `mock::MockWorld` implements all four in memory.

pub mod chaos;
pub mod cluster;
pub mod http;
pub mod identity;
pub mod mock;
pub mod ticket;

pub use chaos::{experiment_id_for, generate_probe_id, ChaosOperation, HarnessChaosClient};
pub use cluster::{KubeClient, SESSION_LABEL};
pub use http::{Auth, HttpReply, HttpTransport};
pub use identity::KeycloakClient;
pub use mock::{Call, MockWorld, Operation};
pub use ticket::ServiceNowClient;

use dojo_schema::{
    resolve_secret, ChaosFault, ChaosSection, Credential, DojoConfig, ExperimentId, NamespaceName,
    QuotaSection, Realm, SessionId, TicketId, UserId,
};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    /// Network failure, timeout, 408, 429 or 5xx. Worth retrying.
    #[error("transient failure: {0}")]
    Transient(String),
    /// The resource exists but belongs to a different session.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// Any other 4xx: bad credentials, validation, forbidden.
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("unexpected response: {0}")]
    Protocol(String),
    #[error("client config error: {0}")]
    Config(String),
}

impl ClientError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Transient(_))
    }
}

/// Outcome of an idempotent delete or stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Deleted,
    AlreadyAbsent,
}

/// A created (or adopted) participant identity together with its fresh credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityGrant {
    pub user_id: UserId,
    pub username: String,
    pub credential: Credential,
}

/// What to inject into a session namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentSpec {
    pub fault: ChaosFault,
    pub duration_secs: u32,
    pub target_app: String,
    pub probe_url: Option<String>,
}

impl ExperimentSpec {
    pub fn from_section(section: &ChaosSection) -> Self {
        Self {
            fault: section.fault,
            duration_secs: section.duration_secs,
            target_app: section.target_app.clone(),
            probe_url: section.probe_url.clone(),
        }
    }
}

impl Default for ExperimentSpec {
    fn default() -> Self {
        Self {
            fault: ChaosFault::PodDelete,
            duration_secs: 60,
            target_app: "frontend".to_owned(),
            probe_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketMetadata {
    pub short_description: String,
    pub description: String,
    pub assignment_group: Option<String>,
}

pub trait IdentityProvider: Send + Sync {
    fn create_user(
        &self,
        realm: &Realm,
        session_id: &SessionId,
        username: &str,
    ) -> Result<IdentityGrant, ClientError>;

    fn delete_user(&self, realm: &Realm, user_id: &UserId) -> Result<Removal, ClientError>;
}

pub trait ClusterProvider: Send + Sync {
    /// Create the session namespace with `quota` as its hard limits.
    fn create_namespace(
        &self,
        session_id: &SessionId,
        quota: &QuotaSection,
    ) -> Result<NamespaceName, ClientError>;

    fn bind_identity(&self, namespace: &NamespaceName, username: &str) -> Result<(), ClientError>;

    fn delete_namespace(&self, namespace: &NamespaceName) -> Result<Removal, ClientError>;
}

pub trait ChaosProvider: Send + Sync {
    fn start_experiment(
        &self,
        session_id: &SessionId,
        namespace: &NamespaceName,
        spec: &ExperimentSpec,
    ) -> Result<ExperimentId, ClientError>;

    fn stop_experiment(&self, experiment_id: &ExperimentId) -> Result<Removal, ClientError>;
}

pub trait TicketProvider: Send + Sync {
    fn open_ticket(
        &self,
        session_id: &SessionId,
        metadata: &TicketMetadata,
    ) -> Result<TicketId, ClientError>;

    fn annotate_ticket(&self, ticket_id: &TicketId, note: &str) -> Result<(), ClientError>;

    fn close_ticket(&self, ticket_id: &TicketId) -> Result<Removal, ClientError>;
}

/// The set of clients handed to the orchestrator.
///
/// Chaos and ticketing are optional; a request that needs a missing one is
/// rejected before anything is created.
#[derive(Clone)]
pub struct Clients {
    pub identity: Arc<dyn IdentityProvider>,
    pub cluster: Arc<dyn ClusterProvider>,
    pub chaos: Option<Arc<dyn ChaosProvider>>,
    pub ticket: Option<Arc<dyn TicketProvider>>,
}

impl Clients {
    pub fn new(identity: Arc<dyn IdentityProvider>, cluster: Arc<dyn ClusterProvider>) -> Self {
        Self {
            identity,
            cluster,
            chaos: None,
            ticket: None,
        }
    }

    #[must_use]
    pub fn with_chaos(mut self, chaos: Arc<dyn ChaosProvider>) -> Self {
        self.chaos = Some(chaos);
        self
    }

    #[must_use]
    pub fn with_ticket(mut self, ticket: Arc<dyn TicketProvider>) -> Self {
        self.ticket = Some(ticket);
        self
    }

    /// Build the HTTP clients described by `config`, resolving `env:` secrets.
    pub fn from_config(config: &DojoConfig) -> Result<Self, ClientError> {
        let timeout = config.retry.call_timeout();
        let secret =
            |value: &str| resolve_secret(value).map_err(|e| ClientError::Config(e.to_string()));

        let identity = KeycloakClient::new(
            &config.identity.endpoint,
            &config.identity.admin_user,
            &secret(&config.identity.admin_password)?,
            timeout,
        )
        .with_email_domain(&config.identity.email_domain)
        .with_credentials(&config.credentials);

        let cluster = KubeClient::new(
            &config.cluster.endpoint,
            &secret(&config.cluster.token)?,
            timeout,
        )
        .with_cluster_role(&config.cluster.cluster_role)
        .with_user_prefix(&config.cluster.user_prefix);

        let mut clients = Self::new(Arc::new(identity), Arc::new(cluster));

        if let Some(ref chaos) = config.chaos {
            let client = HarnessChaosClient::new(
                &chaos.endpoint,
                &secret(&chaos.api_key)?,
                &chaos.account_id,
                &chaos.org_id,
                &chaos.project_id,
                &chaos.infra_id,
                timeout,
            );
            clients = clients.with_chaos(Arc::new(client));
        }

        if let Some(ref ticket) = config.ticket {
            let base = ticket
                .base_url()
                .ok_or_else(|| ClientError::Config("ticket endpoint or instance required".to_owned()))?;
            let client = ServiceNowClient::new(
                &base,
                &ticket.username,
                &secret(&ticket.password)?,
                timeout,
            );
            clients = clients.with_ticket(Arc::new(client));
        }

        Ok(clients)
    }
}
