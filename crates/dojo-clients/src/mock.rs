//! In-memory stand-ins for all four external systems.
//!
//! `MockWorld` keeps the "remote" state behind one mutex, records every call,
//! and can be scripted to fail specific operations a number of times or
//! permanently. It is used by the orchestrator tests.

use crate::{
    ChaosProvider, ClientError, Clients, ClusterProvider, ExperimentSpec, IdentityGrant,
    IdentityProvider, Removal, TicketMetadata, TicketProvider,
};
use chrono::{Duration, Utc};
use dojo_schema::{
    Credential, ExperimentId, NamespaceName, QuotaSection, Realm, ResourceHandle, SessionId,
    TicketId, UserId,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateUser,
    DeleteUser,
    CreateNamespace,
    BindIdentity,
    DeleteNamespace,
    StartExperiment,
    StopExperiment,
    OpenTicket,
    AnnotateTicket,
    CloseTicket,
}

/// One recorded client call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: Operation,
    pub target: String,
}

enum Fault {
    Times(u32, ClientError),
    Always(ClientError),
}

struct MockUser {
    username: String,
    session: String,
}

struct MockTicket {
    session: String,
    notes: Vec<String>,
    closed: bool,
}

#[derive(Default)]
struct WorldState {
    users: BTreeMap<String, MockUser>,
    namespaces: BTreeMap<String, String>,
    bindings: Vec<(String, String)>,
    experiments: BTreeMap<String, String>,
    tickets: BTreeMap<String, MockTicket>,
    quotas: BTreeMap<String, QuotaSection>,
    calls: Vec<Call>,
    faults: HashMap<Operation, Fault>,
    next_id: u64,
}

impl WorldState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }
}

type CallHook = Box<dyn Fn(Operation) + Send + Sync>;

#[derive(Default)]
pub struct MockWorld {
    state: Mutex<WorldState>,
    hook: Mutex<Option<CallHook>>,
}

impl MockWorld {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, WorldState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A full client bundle (identity, cluster, chaos, ticket) backed by this world.
    pub fn clients(self: &Arc<Self>) -> Clients {
        Clients::new(self.clone(), self.clone())
            .with_chaos(self.clone())
            .with_ticket(self.clone())
    }

    /// Fail the next `times` calls of `op` with `err`.
    pub fn fail_times(&self, op: Operation, times: u32, err: ClientError) {
        self.lock().faults.insert(op, Fault::Times(times, err));
    }

    /// Fail every call of `op` with `err` until cleared.
    pub fn fail_always(&self, op: Operation, err: ClientError) {
        self.lock().faults.insert(op, Fault::Always(err));
    }

    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// Run `hook` at the start of every call, before faults are applied.
    pub fn on_call(&self, hook: impl Fn(Operation) + Send + Sync + 'static) {
        *self.hook.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(hook));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn count(&self, op: Operation) -> usize {
        self.lock().calls.iter().filter(|c| c.op == op).count()
    }

    /// Whether the resource a handle names currently exists.
    pub fn exists(&self, handle: &ResourceHandle) -> bool {
        let state = self.lock();
        match handle {
            ResourceHandle::Identity { user_id, .. } => state.users.contains_key(user_id.as_str()),
            ResourceHandle::Namespace { name } => state.namespaces.contains_key(name.as_str()),
            ResourceHandle::ChaosExperiment { experiment_id, .. } => {
                state.experiments.contains_key(experiment_id.as_str())
            }
            ResourceHandle::Ticket { ticket_id } => state
                .tickets
                .get(ticket_id.as_str())
                .is_some_and(|t| !t.closed),
        }
    }

    /// Number of live resources of every kind. Zero means nothing leaked.
    pub fn live_count(&self) -> usize {
        let state = self.lock();
        state.users.len()
            + state.namespaces.len()
            + state.experiments.len()
            + state.tickets.values().filter(|t| !t.closed).count()
    }

    pub fn usernames(&self) -> Vec<String> {
        self.lock().users.values().map(|u| u.username.clone()).collect()
    }

    pub fn has_namespace(&self, name: &str) -> bool {
        self.lock().namespaces.contains_key(name)
    }

    pub fn bindings(&self, namespace: &str) -> Vec<String> {
        self.lock()
            .bindings
            .iter()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, user)| user.clone())
            .collect()
    }

    pub fn quota(&self, namespace: &str) -> Option<QuotaSection> {
        self.lock().quotas.get(namespace).cloned()
    }

    pub fn ticket_notes(&self, ticket_id: &str) -> Vec<String> {
        self.lock()
            .tickets
            .get(ticket_id)
            .map(|t| t.notes.clone())
            .unwrap_or_default()
    }

    /// Pre-create a namespace owned by `session`, e.g. to provoke a conflict.
    pub fn seed_namespace(&self, name: &str, session: &str) {
        self.lock()
            .namespaces
            .insert(name.to_owned(), session.to_owned());
    }

    /// Pre-create a user owned by `session`. Returns its id.
    pub fn seed_user(&self, username: &str, session: &str) -> String {
        let mut state = self.lock();
        let id = state.next_id("user");
        state.users.insert(
            id.clone(),
            MockUser {
                username: username.to_owned(),
                session: session.to_owned(),
            },
        );
        id
    }

    fn begin(&self, op: Operation, target: &str) -> Result<(), ClientError> {
        self.lock().calls.push(Call {
            op,
            target: target.to_owned(),
        });
        if let Some(ref hook) = *self.hook.lock().unwrap_or_else(PoisonError::into_inner) {
            hook(op);
        }
        let mut state = self.lock();
        let (result, exhausted) = match state.faults.get_mut(&op) {
            Some(Fault::Always(err)) => (Err(err.clone()), false),
            Some(Fault::Times(n, err)) => {
                *n = n.saturating_sub(1);
                (Err(err.clone()), *n == 0)
            }
            None => (Ok(()), false),
        };
        if exhausted {
            state.faults.remove(&op);
        }
        result
    }
}

impl IdentityProvider for MockWorld {
    fn create_user(
        &self,
        _realm: &Realm,
        session_id: &SessionId,
        username: &str,
    ) -> Result<IdentityGrant, ClientError> {
        self.begin(Operation::CreateUser, username)?;
        let mut state = self.lock();
        let existing = state
            .users
            .iter()
            .find(|(_, u)| u.username == username)
            .map(|(id, u)| (id.clone(), u.session.clone()));
        let user_id = match existing {
            Some((id, owner)) if owner == session_id.as_str() => id,
            Some(_) => {
                return Err(ClientError::Conflict(format!(
                    "user '{username}' belongs to another session"
                )))
            }
            None => {
                let id = state.next_id("user");
                state.users.insert(
                    id.clone(),
                    MockUser {
                        username: username.to_owned(),
                        session: session_id.to_string(),
                    },
                );
                id
            }
        };
        Ok(IdentityGrant {
            user_id: UserId::new(user_id),
            username: username.to_owned(),
            credential: Credential {
                username: username.to_owned(),
                password: "Mock1password".to_owned(),
                expires_at: Utc::now() + Duration::hours(8),
            },
        })
    }

    fn delete_user(&self, _realm: &Realm, user_id: &UserId) -> Result<Removal, ClientError> {
        self.begin(Operation::DeleteUser, user_id)?;
        Ok(match self.lock().users.remove(user_id.as_str()) {
            Some(_) => Removal::Deleted,
            None => Removal::AlreadyAbsent,
        })
    }
}

impl ClusterProvider for MockWorld {
    fn create_namespace(
        &self,
        session_id: &SessionId,
        quota: &QuotaSection,
    ) -> Result<NamespaceName, ClientError> {
        self.begin(Operation::CreateNamespace, session_id)?;
        let mut state = self.lock();
        let name = session_id.to_string();
        if let Some(owner) = state.namespaces.get(&name) {
            if owner != session_id.as_str() {
                return Err(ClientError::Conflict(format!(
                    "namespace '{name}' belongs to session {owner}"
                )));
            }
        }
        state.namespaces.insert(name.clone(), session_id.to_string());
        state.quotas.insert(name.clone(), quota.clone());
        Ok(NamespaceName::new(name))
    }

    fn bind_identity(&self, namespace: &NamespaceName, username: &str) -> Result<(), ClientError> {
        self.begin(Operation::BindIdentity, username)?;
        let mut state = self.lock();
        if !state.namespaces.contains_key(namespace.as_str()) {
            return Err(ClientError::NotFound(format!("namespace {namespace}")));
        }
        let binding = (namespace.to_string(), username.to_owned());
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    fn delete_namespace(&self, namespace: &NamespaceName) -> Result<Removal, ClientError> {
        self.begin(Operation::DeleteNamespace, namespace)?;
        let mut state = self.lock();
        state.bindings.retain(|(ns, _)| ns != namespace.as_str());
        state.quotas.remove(namespace.as_str());
        Ok(match state.namespaces.remove(namespace.as_str()) {
            Some(_) => Removal::Deleted,
            None => Removal::AlreadyAbsent,
        })
    }
}

impl ChaosProvider for MockWorld {
    fn start_experiment(
        &self,
        session_id: &SessionId,
        namespace: &NamespaceName,
        _spec: &ExperimentSpec,
    ) -> Result<ExperimentId, ClientError> {
        self.begin(Operation::StartExperiment, namespace)?;
        let id = crate::chaos::experiment_id_for(session_id);
        self.lock()
            .experiments
            .insert(id.to_string(), namespace.to_string());
        Ok(id)
    }

    fn stop_experiment(&self, experiment_id: &ExperimentId) -> Result<Removal, ClientError> {
        self.begin(Operation::StopExperiment, experiment_id)?;
        Ok(match self.lock().experiments.remove(experiment_id.as_str()) {
            Some(_) => Removal::Deleted,
            None => Removal::AlreadyAbsent,
        })
    }
}

impl TicketProvider for MockWorld {
    fn open_ticket(
        &self,
        session_id: &SessionId,
        metadata: &TicketMetadata,
    ) -> Result<TicketId, ClientError> {
        self.begin(Operation::OpenTicket, session_id)?;
        let mut state = self.lock();
        if let Some((id, _)) = state
            .tickets
            .iter()
            .find(|(_, t)| t.session == session_id.as_str() && !t.closed)
        {
            return Ok(TicketId::new(id.clone()));
        }
        let id = state.next_id("ticket");
        state.tickets.insert(
            id.clone(),
            MockTicket {
                session: session_id.to_string(),
                notes: vec![metadata.short_description.clone()],
                closed: false,
            },
        );
        Ok(TicketId::new(id))
    }

    fn annotate_ticket(&self, ticket_id: &TicketId, note: &str) -> Result<(), ClientError> {
        self.begin(Operation::AnnotateTicket, ticket_id)?;
        match self.lock().tickets.get_mut(ticket_id.as_str()) {
            Some(ticket) => {
                ticket.notes.push(note.to_owned());
                Ok(())
            }
            None => Err(ClientError::NotFound(format!("ticket {ticket_id}"))),
        }
    }

    fn close_ticket(&self, ticket_id: &TicketId) -> Result<Removal, ClientError> {
        self.begin(Operation::CloseTicket, ticket_id)?;
        match self.lock().tickets.get_mut(ticket_id.as_str()) {
            Some(ticket) => {
                ticket.closed = true;
                Ok(Removal::Deleted)
            }
            None => Ok(Removal::AlreadyAbsent),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(s: &str) -> SessionId {
        SessionId::new(s)
    }

    #[test]
    fn client_bundle_shares_one_world() {
        let world = Arc::new(MockWorld::new());
        let clients = world.clients();
        assert!(clients.chaos.is_some());
        assert!(clients.ticket.is_some());

        clients
            .identity
            .create_user(&Realm::new("workshop"), &sid("ws-1"), "ws-1-p1")
            .unwrap();
        assert_eq!(world.usernames(), vec!["ws-1-p1"]);
        assert_eq!(world.count(Operation::CreateUser), 1);
    }

    #[test]
    fn create_user_is_idempotent_per_session() {
        let world = MockWorld::new();
        let realm = Realm::new("workshop");
        let a = world.create_user(&realm, &sid("ws-1"), "ws-1-p1").unwrap();
        let b = world.create_user(&realm, &sid("ws-1"), "ws-1-p1").unwrap();
        assert_eq!(a.user_id, b.user_id);
        assert_eq!(world.usernames(), vec!["ws-1-p1"]);
    }

    #[test]
    fn foreign_user_conflicts() {
        let world = MockWorld::new();
        world.seed_user("ws-1-p1", "other");
        let err = world
            .create_user(&Realm::new("workshop"), &sid("ws-1"), "ws-1-p1")
            .unwrap_err();
        assert!(matches!(err, ClientError::Conflict(_)));
    }

    #[test]
    fn delete_of_absent_resource_reports_already_absent() {
        let world = MockWorld::new();
        assert_eq!(
            world
                .delete_namespace(&NamespaceName::new("ghost"))
                .unwrap(),
            Removal::AlreadyAbsent
        );
        assert_eq!(
            world.close_ticket(&TicketId::new("ghost")).unwrap(),
            Removal::AlreadyAbsent
        );
    }

    #[test]
    fn scripted_faults_expire() {
        let world = MockWorld::new();
        world.fail_times(
            Operation::CreateNamespace,
            2,
            ClientError::Transient("503".to_owned()),
        );
        let quota = QuotaSection::default();
        assert!(world.create_namespace(&sid("ws-1"), &quota).is_err());
        assert!(world.create_namespace(&sid("ws-1"), &quota).is_err());
        assert!(world.create_namespace(&sid("ws-1"), &quota).is_ok());
        assert_eq!(world.count(Operation::CreateNamespace), 3);
    }

    #[test]
    fn namespace_delete_drops_bindings() {
        let world = MockWorld::new();
        let ns = world
            .create_namespace(&sid("ws-1"), &QuotaSection::default())
            .unwrap();
        world.bind_identity(&ns, "ws-1-p1").unwrap();
        assert_eq!(world.bindings("ws-1"), vec!["ws-1-p1"]);
        world.delete_namespace(&ns).unwrap();
        assert!(world.bindings("ws-1").is_empty());
        assert_eq!(world.live_count(), 0);
    }

    #[test]
    fn hook_sees_every_call() {
        let world = MockWorld::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        world.on_call(move |op| seen_clone.lock().unwrap().push(op));
        world
            .create_namespace(&sid("ws-1"), &QuotaSection::default())
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![Operation::CreateNamespace]);
    }

    #[test]
    fn ticket_reuse_and_notes() {
        let world = MockWorld::new();
        let meta = TicketMetadata {
            short_description: "Workshop ws-1".to_owned(),
            description: String::new(),
            assignment_group: None,
        };
        let a = world.open_ticket(&sid("ws-1"), &meta).unwrap();
        let b = world.open_ticket(&sid("ws-1"), &meta).unwrap();
        assert_eq!(a, b);
        world.annotate_ticket(&a, "ready").unwrap();
        assert_eq!(world.ticket_notes(&a), vec!["Workshop ws-1", "ready"]);
        world.close_ticket(&a).unwrap();
        assert!(!world.exists(&ResourceHandle::Ticket { ticket_id: a }));
    }
}
