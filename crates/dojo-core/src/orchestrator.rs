use crate::concurrency::{shutdown_requested, SessionLock};
use crate::lifecycle::validate_transition;
use crate::registry::SessionRegistry;
use crate::retry::{retry_call, RetryError, RetryPolicy};
use crate::CoreError;
use dojo_clients::{ClientError, Clients, ExperimentSpec, Removal, TicketMetadata};
use dojo_schema::{
    Credential, DojoConfig, FailureCause, FailureKind, NamespaceName, ProvisionStep,
    ProvisioningLedger, QuotaSection, Realm, ResourceHandle, SessionId, SessionRequest,
    SessionState,
};
use dojo_store::{SessionRecord, StoreError, StoreLayout};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Knobs the orchestrator applies to every session.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub realm: Realm,
    /// Per-participant quota; scaled by the participant count.
    pub quota: QuotaSection,
    pub experiment: ExperimentSpec,
    pub assignment_group: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            realm: Realm::new("workshop"),
            quota: QuotaSection::default(),
            experiment: ExperimentSpec::default(),
            assignment_group: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &DojoConfig) -> Self {
        Self {
            realm: Realm::new(config.identity.realm.as_str()),
            quota: config.cluster.quota.clone(),
            experiment: config
                .chaos
                .as_ref()
                .map(ExperimentSpec::from_section)
                .unwrap_or_default(),
            assignment_group: config
                .ticket
                .as_ref()
                .and_then(|t| t.assignment_group.clone()),
            retry: RetryPolicy::from_section(&config.retry),
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Result of a provisioning run.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionOutcome {
    pub session_id: SessionId,
    pub state: SessionState,
    /// What is still recorded (and still exists) after the run.
    pub ledger: ProvisioningLedger,
    /// Everything that had been created when the run stopped going forward.
    pub created: ProvisioningLedger,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureCause>,
    /// Participant logins; empty unless the session is `Ready`.
    pub credentials: Vec<Credential>,
}

/// Why forward progress stopped.
enum Interrupt {
    Step(FailureCause),
    Local(CoreError),
}

impl From<CoreError> for Interrupt {
    fn from(e: CoreError) -> Self {
        Interrupt::Local(e)
    }
}

impl From<StoreError> for Interrupt {
    fn from(e: StoreError) -> Self {
        Interrupt::Local(e.into())
    }
}

fn step_cause(step: ProvisionStep, err: RetryError) -> FailureCause {
    let kind = match err {
        RetryError::Exhausted { .. } => FailureKind::Transient,
        RetryError::Cancelled { .. } => FailureKind::Cancelled,
        RetryError::Failed(ClientError::Conflict(_)) => FailureKind::Conflict,
        RetryError::Failed(_) => FailureKind::Rejected,
    };
    FailureCause::provision(step, kind, err.to_string())
}

fn transition(record: &mut SessionRecord, to: SessionState) -> Result<(), CoreError> {
    validate_transition(record.state, to)?;
    debug!("session {}: {} -> {to}", record.session_id, record.state);
    record.state = to;
    Ok(())
}

/// Drives the four clients through a session's lifecycle.
///
/// Every run on a session holds that session's lock for its whole duration;
/// different sessions proceed independently.
pub struct Orchestrator {
    registry: SessionRegistry,
    clients: Clients,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    /// Create an orchestrator over the store at `store_root`, initializing it if needed.
    pub fn new(
        store_root: impl Into<PathBuf>,
        clients: Clients,
        settings: OrchestratorSettings,
    ) -> Result<Self, CoreError> {
        Ok(Self {
            registry: SessionRegistry::open(store_root)?,
            clients,
            settings,
        })
    }

    /// Build HTTP clients and settings from a parsed config.
    pub fn from_config(
        store_root: impl Into<PathBuf>,
        config: &DojoConfig,
    ) -> Result<Self, CoreError> {
        let clients = Clients::from_config(config)?;
        Self::new(store_root, clients, OrchestratorSettings::from_config(config))
    }

    pub fn store_layout(&self) -> &StoreLayout {
        self.registry.layout()
    }

    fn load(&self, session_id: &str) -> Result<SessionRecord, CoreError> {
        self.registry.load(session_id)
    }

    fn stop_requested(&self, session_id: &str) -> bool {
        shutdown_requested() || self.registry.stops.is_requested(session_id)
    }

    fn persist(&self, record: &SessionRecord) -> Result<(), CoreError> {
        self.registry.store.put(record)?;
        Ok(())
    }

    /// Run one forward call under the retry policy, honouring stop requests.
    fn step<T>(
        &self,
        session_id: &SessionId,
        step: ProvisionStep,
        op: impl FnMut() -> Result<T, ClientError>,
    ) -> Result<T, Interrupt> {
        if self.stop_requested(session_id) {
            return Err(Interrupt::Step(FailureCause::provision(
                step,
                FailureKind::Cancelled,
                format!("stop requested before {step}"),
            )));
        }
        let name = format!("{session_id}:{step}");
        retry_call(
            &self.settings.retry,
            &name,
            &|| self.stop_requested(session_id),
            op,
        )
        .map_err(|e| Interrupt::Step(step_cause(step, e)))
    }

    fn record_handle(
        &self,
        record: &mut SessionRecord,
        handle: ResourceHandle,
    ) -> Result<(), CoreError> {
        info!("session {}: recorded {handle}", record.session_id);
        record.ledger.push(handle);
        self.persist(record)
    }

    fn run_steps(
        &self,
        record: &mut SessionRecord,
        credentials: &mut Vec<Credential>,
    ) -> Result<(), Interrupt> {
        let request = record.request.clone();
        let sid = &request.session_id;
        let realm = &self.settings.realm;
        let usernames = request.usernames();

        for username in &usernames {
            let grant = self.step(sid, ProvisionStep::CreateIdentity, || {
                self.clients.identity.create_user(realm, sid, username)
            })?;
            self.record_handle(
                record,
                ResourceHandle::Identity {
                    realm: realm.clone(),
                    user_id: grant.user_id,
                    username: grant.username,
                },
            )?;
            credentials.push(grant.credential);
        }

        let quota = self.settings.quota.scaled(request.participant_count);
        let namespace = self.step(sid, ProvisionStep::CreateNamespace, || {
            self.clients.cluster.create_namespace(sid, &quota)
        })?;
        self.record_handle(
            record,
            ResourceHandle::Namespace {
                name: namespace.clone(),
            },
        )?;

        // Bindings live inside the namespace and go away with it.
        for username in &usernames {
            self.step(sid, ProvisionStep::BindIdentity, || {
                self.clients.cluster.bind_identity(&namespace, username)
            })?;
        }

        if request.chaos_enabled {
            let chaos = self
                .clients
                .chaos
                .as_ref()
                .ok_or(CoreError::MissingCapability("chaos"))?;
            let experiment_id = self.step(sid, ProvisionStep::StartChaos, || {
                chaos.start_experiment(sid, &namespace, &self.settings.experiment)
            })?;
            self.record_handle(
                record,
                ResourceHandle::ChaosExperiment {
                    experiment_id,
                    namespace: namespace.clone(),
                },
            )?;
        }

        if request.ticket_required {
            let ticket = self
                .clients
                .ticket
                .as_ref()
                .ok_or(CoreError::MissingCapability("ticket"))?;
            let metadata = self.ticket_metadata(&request);
            let ticket_id = self.step(sid, ProvisionStep::OpenTicket, || {
                ticket.open_ticket(sid, &metadata)
            })?;
            self.record_handle(record, ResourceHandle::Ticket { ticket_id })?;
        }

        if self.stop_requested(sid) {
            return Err(Interrupt::Step(FailureCause::stopped(
                "stop requested before the session became ready",
            )));
        }
        Ok(())
    }

    fn ticket_metadata(&self, request: &SessionRequest) -> TicketMetadata {
        TicketMetadata {
            short_description: format!("Workshop session {}", request.session_id),
            description: format!(
                "Ephemeral workshop environment for {} participant(s); chaos {}.",
                request.participant_count,
                if request.chaos_enabled {
                    "enabled"
                } else {
                    "disabled"
                }
            ),
            assignment_group: self.settings.assignment_group.clone(),
        }
    }

    fn ready_note(record: &SessionRecord, namespace: Option<&NamespaceName>) -> String {
        let mut note = format!(
            "Environment ready: {} participant(s): {}",
            record.request.participant_count,
            record.request.usernames().join(", ")
        );
        if let Some(ns) = namespace {
            note.push_str(&format!("; namespace {ns}"));
        }
        for handle in &record.ledger {
            if let ResourceHandle::ChaosExperiment { experiment_id, .. } = handle {
                note.push_str(&format!("; chaos experiment {experiment_id}"));
            }
        }
        note
    }

    /// Best effort: a failed annotation never affects the session state.
    fn annotate_ready(&self, record: &SessionRecord) {
        let Some(ticket) = self.clients.ticket.as_ref() else {
            return;
        };
        let note = Self::ready_note(record, record.ledger.namespace());
        for handle in &record.ledger {
            if let ResourceHandle::Ticket { ticket_id } = handle {
                let result = retry_call(&self.settings.retry, "annotate_ticket", &|| false, || {
                    ticket.annotate_ticket(ticket_id, &note)
                });
                if let Err(e) = result {
                    warn!("could not annotate ticket {ticket_id}: {e}");
                }
            }
        }
    }

    fn remove_handle(&self, handle: &ResourceHandle) -> Result<Removal, ClientError> {
        match handle {
            ResourceHandle::Identity { realm, user_id, .. } => {
                self.clients.identity.delete_user(realm, user_id)
            }
            ResourceHandle::Namespace { name } => self.clients.cluster.delete_namespace(name),
            ResourceHandle::ChaosExperiment { experiment_id, .. } => match self.clients.chaos {
                Some(ref chaos) => chaos.stop_experiment(experiment_id),
                None => Err(ClientError::Config("no chaos client configured".to_owned())),
            },
            ResourceHandle::Ticket { ticket_id } => match self.clients.ticket {
                Some(ref ticket) => ticket.close_ticket(ticket_id),
                None => Err(ClientError::Config("no ticket client configured".to_owned())),
            },
        }
    }

    /// Reverse the ledger, newest first. A handle leaves the ledger only once
    /// its delete is confirmed; handles whose delete kept failing are returned.
    fn unwind(&self, record: &mut SessionRecord) -> Result<Vec<ResourceHandle>, CoreError> {
        let mut retained = Vec::new();
        for index in (0..record.ledger.len()).rev() {
            let Some(handle) = record.ledger.get(index).cloned() else {
                continue;
            };
            let name = format!("{}:remove {}", record.session_id, handle.kind());
            match retry_call(&self.settings.retry, &name, &|| false, || {
                self.remove_handle(&handle)
            }) {
                Ok(removal) => {
                    record.ledger.remove(index);
                    self.persist(record)?;
                    match removal {
                        Removal::Deleted => info!("session {}: removed {handle}", record.session_id),
                        Removal::AlreadyAbsent => {
                            info!("session {}: {handle} was already gone", record.session_id);
                        }
                    }
                }
                Err(e) => {
                    warn!("session {}: could not remove {handle}: {e}", record.session_id);
                    retained.push(handle);
                }
            }
        }
        retained.reverse();
        Ok(retained)
    }

    /// Finish a teardown pass: `Closed` if the ledger drained, `Failed` otherwise.
    fn settle(
        &self,
        record: &mut SessionRecord,
        retained: Vec<ResourceHandle>,
    ) -> Result<(), CoreError> {
        if retained.is_empty() {
            transition(record, SessionState::Closed)?;
            record.failure = None;
        } else {
            transition(record, SessionState::Failed)?;
            let listed: Vec<String> = retained.iter().map(ToString::to_string).collect();
            record.failure = Some(FailureCause::teardown(
                retained,
                format!("could not reclaim: {}", listed.join(", ")),
            ));
        }
        self.persist(record)
    }

    /// Provision every resource the request asks for.
    ///
    /// Step failures are not errors: they come back as a `Failed` (or, for a
    /// fully rolled-back stop request, `Closed`) outcome with the cause attached.
    /// A stop that lands after the session became `Ready` is honoured by tearing
    /// the session down before returning.
    pub fn provision(&self, request: SessionRequest) -> Result<ProvisionOutcome, CoreError> {
        request.validate()?;
        if request.chaos_enabled && self.clients.chaos.is_none() {
            return Err(CoreError::MissingCapability("chaos"));
        }
        if request.ticket_required && self.clients.ticket.is_none() {
            return Err(CoreError::MissingCapability("ticket"));
        }

        let sid = request.session_id.clone();
        let lock_path = self.registry.layout.lock_path(&sid);
        let Some(lock) = SessionLock::try_acquire(&lock_path)? else {
            return Err(CoreError::SessionBusy(sid.into_inner()));
        };
        if self.registry.store.exists(&sid) {
            return Err(CoreError::SessionExists(sid.into_inner()));
        }
        self.registry.stops.clear(&sid)?;

        info!(
            "provisioning session {sid}: participants={} chaos={} ticket={}",
            request.participant_count, request.chaos_enabled, request.ticket_required
        );
        let mut record = SessionRecord::new(request);
        self.persist(&record)?;
        transition(&mut record, SessionState::Provisioning)?;
        self.persist(&record)?;

        let mut credentials = Vec::new();
        let cause = match self.run_steps(&mut record, &mut credentials) {
            Ok(()) => {
                transition(&mut record, SessionState::Ready)?;
                self.persist(&record)?;
                self.annotate_ready(&record);
                drop(lock);
                info!("session {sid} ready with {} resources", record.ledger.len());
                if let Some(state) = self.honour_late_stop(&sid)? {
                    let settled = self.load(&sid)?;
                    return Ok(ProvisionOutcome {
                        session_id: sid,
                        state,
                        created: record.ledger,
                        ledger: settled.ledger,
                        failure: settled.failure,
                        credentials: Vec::new(),
                    });
                }
                return Ok(ProvisionOutcome {
                    session_id: sid,
                    state: SessionState::Ready,
                    created: record.ledger.clone(),
                    ledger: record.ledger,
                    failure: None,
                    credentials,
                });
            }
            Err(Interrupt::Local(e)) => return Err(e),
            Err(Interrupt::Step(cause)) => cause,
        };

        warn!("session {sid}: {cause}; rolling back");
        let created = record.ledger.clone();
        transition(&mut record, SessionState::TearingDown)?;
        record.failure = Some(cause.clone());
        self.persist(&record)?;

        let retained = self.unwind(&mut record)?;
        if cause.kind == FailureKind::Cancelled && retained.is_empty() {
            transition(&mut record, SessionState::Closed)?;
            record.failure = None;
        } else {
            transition(&mut record, SessionState::Failed)?;
            let mut cause = cause;
            cause.retained = retained;
            record.failure = Some(cause);
        }
        self.persist(&record)?;
        self.registry.stops.clear(&sid)?;

        Ok(ProvisionOutcome {
            session_id: sid,
            state: record.state,
            ledger: record.ledger,
            created,
            failure: record.failure,
            credentials: Vec::new(),
        })
    }

    /// Release everything still recorded for the session.
    ///
    /// Idempotent: a `Closed` session returns `Closed` without touching any
    /// external system. If another run holds the session, a stop is requested
    /// and `TearingDown` is returned; that run performs the rollback.
    pub fn teardown(&self, session_id: &str) -> Result<SessionState, CoreError> {
        let record = self.load(session_id)?;
        if record.state == SessionState::Closed {
            debug!("session {session_id} already closed");
            return Ok(SessionState::Closed);
        }

        let Some(_lock) = self.claim_for_teardown(session_id)? else {
            info!("session {session_id} is busy; stop requested");
            return Ok(SessionState::TearingDown);
        };
        self.teardown_locked(session_id)
    }

    /// Take the session for teardown. When another run holds it, leave a stop
    /// marker and try once more in case that run let go in between.
    fn claim_for_teardown(&self, session_id: &str) -> Result<Option<SessionLock>, CoreError> {
        let lock_path = self.registry.layout.lock_path(session_id);
        if let Some(lock) = SessionLock::try_acquire(&lock_path)? {
            return Ok(Some(lock));
        }
        self.registry.stops.request(session_id)?;
        SessionLock::try_acquire(&lock_path)
    }

    /// Pick up a stop marker left while a run was finishing. Runs after the
    /// session lock is released, so a marker written at any point is seen
    /// either here or by the teardown that wrote it.
    fn honour_late_stop(&self, session_id: &str) -> Result<Option<SessionState>, CoreError> {
        if !self.registry.stops.is_requested(session_id) {
            return Ok(None);
        }
        let lock_path = self.registry.layout.lock_path(session_id);
        match SessionLock::try_acquire(&lock_path)? {
            Some(_lock) => {
                info!("session {session_id}: stop requested after ready; tearing down");
                self.teardown_locked(session_id).map(Some)
            }
            // The teardown that wrote the marker took the session.
            None => Ok(Some(SessionState::TearingDown)),
        }
    }

    fn teardown_locked(&self, session_id: &str) -> Result<SessionState, CoreError> {
        let mut record = self.load(session_id)?;
        if record.state == SessionState::Closed {
            self.registry.stops.clear(session_id)?;
            return Ok(SessionState::Closed);
        }
        info!(
            "tearing down session {session_id} ({} resources)",
            record.ledger.len()
        );
        if record.state != SessionState::TearingDown {
            transition(&mut record, SessionState::TearingDown)?;
        }
        self.persist(&record)?;

        let retained = self.unwind(&mut record)?;
        self.settle(&mut record, retained)?;
        self.registry.stops.clear(session_id)?;
        info!("session {session_id} is {}", record.state);
        Ok(record.state)
    }

    pub fn get_state(&self, session_id: &str) -> Result<SessionState, CoreError> {
        self.registry.get_state(session_id)
    }

    pub fn inspect(&self, session_id: &str) -> Result<SessionRecord, CoreError> {
        self.registry.inspect(session_id)
    }

    pub fn list(&self) -> Result<Vec<SessionRecord>, CoreError> {
        self.registry.list()
    }

    /// Ask an active provisioning run for this session to stop and roll back.
    pub fn request_stop(&self, session_id: &str) -> Result<(), CoreError> {
        self.registry.request_stop(session_id)
    }

    /// Forget a closed session so its id can be provisioned again.
    pub fn purge(&self, session_id: &str) -> Result<(), CoreError> {
        self.registry.purge(session_id)
    }
}
