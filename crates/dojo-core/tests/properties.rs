//! Lifecycle properties exercised against the in-memory mock clients.
//!
//! Every test runs a real `Orchestrator` over a temporary store, so ledger
//! persistence, locking and stop markers are the production code paths.

use dojo_clients::{ClientError, MockWorld, Operation};
use dojo_core::{CoreError, Orchestrator, OrchestratorSettings, RetryPolicy};
use dojo_schema::{
    FailureKind, ProvisionStep, ResourceHandle, ResourceKind, SessionRequest, SessionState,
};
use dojo_store::{SessionStore, StopMarkers, StoreLayout};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

fn setup() -> (tempfile::TempDir, Arc<MockWorld>, Orchestrator) {
    let dir = tempfile::tempdir().unwrap();
    let world = Arc::new(MockWorld::new());
    let settings = OrchestratorSettings::default().with_retry(RetryPolicy::immediate(4));
    let orch = Orchestrator::new(dir.path(), world.clients(), settings).unwrap();
    (dir, world, orch)
}

fn transient() -> ClientError {
    ClientError::Transient("connection reset".to_owned())
}

fn ops_since(world: &MockWorld, start: usize) -> Vec<Operation> {
    world.calls()[start..].iter().map(|c| c.op).collect()
}

#[test]
fn teardown_twice_is_idempotent() {
    let (_dir, world, orch) = setup();
    orch.provision(SessionRequest::new("ws-1", 2).with_chaos(true).with_ticket(true))
        .unwrap();

    assert_eq!(orch.teardown("ws-1").unwrap(), SessionState::Closed);
    let after_first = world.calls().len();
    assert_eq!(orch.teardown("ws-1").unwrap(), SessionState::Closed);
    assert_eq!(world.calls().len(), after_first, "second teardown must not call out");
    assert_eq!(world.live_count(), 0);
}

#[test]
fn ledger_never_names_a_resource_that_does_not_exist() {
    let (dir, world, orch) = setup();
    let store = SessionStore::new(StoreLayout::new(dir.path()));
    let violations = Arc::new(Mutex::new(Vec::new()));

    let observed: Weak<MockWorld> = Arc::downgrade(&world);
    let sink = Arc::clone(&violations);
    world.on_call(move |op| {
        let Some(world) = observed.upgrade() else {
            return;
        };
        let Ok(record) = store.get("ws-1") else {
            return;
        };
        for handle in &record.ledger {
            if !world.exists(handle) {
                sink.lock().unwrap().push(format!("{op:?}: {handle}"));
            }
        }
    });

    let outcome = orch
        .provision(SessionRequest::new("ws-1", 3).with_chaos(true).with_ticket(true))
        .unwrap();
    assert_eq!(outcome.state, SessionState::Ready);
    orch.teardown("ws-1").unwrap();

    let violations = violations.lock().unwrap();
    assert!(violations.is_empty(), "ledger ahead of reality: {violations:?}");
}

#[test]
fn teardown_deletes_in_reverse_creation_order() {
    let (_dir, world, orch) = setup();
    let outcome = orch
        .provision(SessionRequest::new("ws-1", 2).with_chaos(true).with_ticket(true))
        .unwrap();
    let expected: Vec<String> = outcome
        .ledger
        .iter()
        .rev()
        .map(|h| h.id().to_owned())
        .collect();

    let start = world.calls().len();
    orch.teardown("ws-1").unwrap();
    let targets: Vec<String> = world.calls()[start..]
        .iter()
        .map(|c| c.target.clone())
        .collect();
    assert_eq!(targets, expected);
}

#[test]
fn chaos_failure_rolls_back_identity_and_namespace() {
    let (_dir, world, orch) = setup();
    world.fail_always(Operation::StartExperiment, transient());

    let outcome = orch
        .provision(SessionRequest::new("ws-1", 1).with_chaos(true))
        .unwrap();

    assert_eq!(outcome.state, SessionState::Failed);
    assert_eq!(
        outcome.created.kinds(),
        vec![ResourceKind::Identity, ResourceKind::Namespace]
    );
    assert!(outcome.ledger.is_empty());
    let failure = outcome.failure.unwrap();
    assert_eq!(failure.kind, FailureKind::Transient);
    assert_eq!(failure.step, Some(ProvisionStep::StartChaos));
    assert_eq!(world.count(Operation::StartExperiment), 4);
    assert_eq!(world.count(Operation::DeleteNamespace), 1);
    assert_eq!(world.count(Operation::DeleteUser), 1);
    assert_eq!(world.live_count(), 0);
    assert_eq!(orch.get_state("ws-1").unwrap(), SessionState::Failed);
}

#[test]
fn namespace_conflict_is_not_retried() {
    let (_dir, world, orch) = setup();
    world.seed_namespace("ws-1", "someone-else");

    let outcome = orch.provision(SessionRequest::new("ws-1", 1)).unwrap();

    assert_eq!(outcome.state, SessionState::Failed);
    assert_eq!(outcome.failure.unwrap().kind, FailureKind::Conflict);
    assert_eq!(world.count(Operation::CreateNamespace), 1);
    assert_eq!(world.count(Operation::DeleteUser), 1);
    assert_eq!(world.count(Operation::DeleteNamespace), 0);
    assert!(world.has_namespace("ws-1"), "foreign namespace must be left alone");
    assert!(world.usernames().is_empty());
}

#[test]
fn single_participant_end_to_end() {
    let (_dir, world, orch) = setup();
    let outcome = orch
        .provision(SessionRequest::new("ws-42", 1).with_chaos(true))
        .unwrap();

    assert_eq!(outcome.state, SessionState::Ready);
    assert_eq!(
        outcome.ledger.kinds(),
        vec![
            ResourceKind::Identity,
            ResourceKind::Namespace,
            ResourceKind::ChaosExperiment
        ]
    );
    match &outcome.ledger.handles()[0] {
        ResourceHandle::Identity { username, .. } => assert_eq!(username, "ws-42-p1"),
        other => panic!("expected identity, got {other}"),
    }
    assert_eq!(outcome.ledger.namespace().unwrap(), "ws-42");
    assert_eq!(outcome.credentials[0].username, "ws-42-p1");

    assert_eq!(orch.teardown("ws-42").unwrap(), SessionState::Closed);
    let record = orch.inspect("ws-42").unwrap();
    assert!(record.ledger.is_empty());
    assert!(record.failure.is_none());
    assert_eq!(world.live_count(), 0);
}

#[test]
fn failed_teardown_resumes_with_remaining_handle_only() {
    let (_dir, world, orch) = setup();
    orch.provision(SessionRequest::new("ws-1", 1).with_ticket(true))
        .unwrap();
    world.fail_always(Operation::CloseTicket, transient());

    assert_eq!(orch.teardown("ws-1").unwrap(), SessionState::Failed);
    let record = orch.inspect("ws-1").unwrap();
    assert_eq!(record.ledger.kinds(), vec![ResourceKind::Ticket]);
    assert_eq!(
        record.failure.as_ref().map(|f| f.kind),
        Some(FailureKind::UnrecoverableTeardown)
    );
    assert_eq!(world.count(Operation::CloseTicket), 4);
    assert_eq!(world.count(Operation::DeleteNamespace), 1);
    assert_eq!(world.count(Operation::DeleteUser), 1);

    world.clear_faults();
    let start = world.calls().len();
    assert_eq!(orch.teardown("ws-1").unwrap(), SessionState::Closed);
    assert_eq!(ops_since(&world, start), vec![Operation::CloseTicket]);
}

#[test]
fn stop_during_retry_starts_no_further_step() {
    let (dir, world, orch) = setup();
    world.fail_always(Operation::CreateNamespace, transient());
    let markers = StopMarkers::new(StoreLayout::new(dir.path()));
    world.on_call(move |op| {
        if op == Operation::CreateNamespace {
            markers.request("ws-1").unwrap();
        }
    });

    let outcome = orch
        .provision(SessionRequest::new("ws-1", 1).with_chaos(true).with_ticket(true))
        .unwrap();

    assert_eq!(outcome.state, SessionState::Closed);
    assert_eq!(world.count(Operation::CreateNamespace), 1);
    assert_eq!(world.count(Operation::BindIdentity), 0);
    assert_eq!(world.count(Operation::StartExperiment), 0);
    assert_eq!(world.count(Operation::OpenTicket), 0);
    assert_eq!(world.count(Operation::DeleteUser), 1);
    assert_eq!(world.live_count(), 0);
}

#[test]
fn concurrent_provision_of_same_session_is_busy() {
    let (dir, world, orch) = setup();
    let orch = Arc::new(orch);
    let (entered_tx, entered_rx) = std::sync::mpsc::channel();
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let entered_tx = Mutex::new(entered_tx);
    let release_rx = Mutex::new(release_rx);
    world.on_call(move |op| {
        if op == Operation::CreateUser {
            let _ = entered_tx.lock().unwrap().send(());
            let _ = release_rx.lock().unwrap().recv();
        }
    });

    let background = {
        let orch = Arc::clone(&orch);
        thread::spawn(move || orch.provision(SessionRequest::new("ws-1", 1)))
    };
    entered_rx.recv().unwrap();

    // Same process, different orchestrator: the lock file is the arbiter.
    let second = Orchestrator::new(
        dir.path(),
        world.clients(),
        OrchestratorSettings::default().with_retry(RetryPolicy::immediate(1)),
    )
    .unwrap();
    assert!(matches!(
        second.provision(SessionRequest::new("ws-1", 1)),
        Err(CoreError::SessionBusy(_))
    ));
    assert_eq!(second.teardown("ws-1").unwrap(), SessionState::TearingDown);

    release_tx.send(()).unwrap();
    let outcome = background.join().unwrap().unwrap();
    assert_eq!(outcome.state, SessionState::Closed);
    assert_eq!(world.live_count(), 0);
}

#[test]
fn teardown_while_ready_is_being_announced_is_not_lost() {
    let (dir, world, orch) = setup();
    let store_root = dir.path().to_path_buf();
    let answered = Arc::new(Mutex::new(None));

    let observed: Weak<MockWorld> = Arc::downgrade(&world);
    let sink = Arc::clone(&answered);
    world.on_call(move |op| {
        if op != Operation::AnnotateTicket {
            return;
        }
        let Some(world) = observed.upgrade() else {
            return;
        };
        let other = Orchestrator::new(
            &store_root,
            world.clients(),
            OrchestratorSettings::default().with_retry(RetryPolicy::immediate(1)),
        )
        .unwrap();
        *sink.lock().unwrap() = Some(other.teardown("ws-1").unwrap());
    });

    let outcome = orch
        .provision(SessionRequest::new("ws-1", 1).with_ticket(true))
        .unwrap();

    assert_eq!(*answered.lock().unwrap(), Some(SessionState::TearingDown));
    assert_eq!(outcome.state, SessionState::Closed);
    assert!(outcome.credentials.is_empty());
    assert_eq!(outcome.created.len(), 3);
    assert!(outcome.ledger.is_empty());
    assert_eq!(world.count(Operation::CloseTicket), 1);
    assert_eq!(world.live_count(), 0);
    assert_eq!(orch.get_state("ws-1").unwrap(), SessionState::Closed);
    assert!(!orch.store_layout().stop_marker("ws-1").exists());
}

#[test]
fn sessions_proceed_independently() {
    let (_dir, world, orch) = setup();
    let orch = Arc::new(orch);
    let handles: Vec<_> = (1..=4)
        .map(|i| {
            let orch = Arc::clone(&orch);
            thread::spawn(move || {
                orch.provision(SessionRequest::new(format!("ws-{i}"), 2).with_chaos(true))
            })
        })
        .collect();
    for h in handles {
        assert_eq!(h.join().unwrap().unwrap().state, SessionState::Ready);
    }
    assert_eq!(orch.list().unwrap().len(), 4);
    assert_eq!(world.usernames().len(), 8);
}
