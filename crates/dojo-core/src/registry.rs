use crate::concurrency::SessionLock;
use crate::CoreError;
use dojo_schema::{validate_session_id, SessionState};
use dojo_store::{SessionRecord, SessionStore, StopMarkers, StoreError, StoreLayout};
use std::path::PathBuf;
use tracing::info;

/// Store-side session operations that never reach an external system.
///
/// `Orchestrator` builds on this; the CLI uses it on its own for commands
/// that only read or annotate local state.
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    pub(crate) layout: StoreLayout,
    pub(crate) store: SessionStore,
    pub(crate) stops: StopMarkers,
}

impl SessionRegistry {
    /// Open the store at `store_root`, initializing it if needed.
    pub fn open(store_root: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let layout = StoreLayout::new(store_root);
        layout.initialize()?;
        Ok(Self {
            store: SessionStore::new(layout.clone()),
            stops: StopMarkers::new(layout.clone()),
            layout,
        })
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    /// The record as persisted. Ids are checked before they touch the store.
    pub(crate) fn load(&self, session_id: &str) -> Result<SessionRecord, CoreError> {
        validate_session_id(session_id)?;
        self.store.get(session_id).map_err(|e| match e {
            StoreError::SessionNotFound(id) => CoreError::SessionNotFound(id),
            other => other.into(),
        })
    }

    /// A pending stop outranks the recorded state until the run holding the
    /// session acts on it.
    fn reported(&self, mut record: SessionRecord) -> SessionRecord {
        let open = matches!(
            record.state,
            SessionState::Pending | SessionState::Provisioning | SessionState::Ready
        );
        if open && self.stops.is_requested(&record.session_id) {
            record.state = SessionState::TearingDown;
        }
        record
    }

    pub fn get_state(&self, session_id: &str) -> Result<SessionState, CoreError> {
        Ok(self.inspect(session_id)?.state)
    }

    pub fn inspect(&self, session_id: &str) -> Result<SessionRecord, CoreError> {
        Ok(self.reported(self.load(session_id)?))
    }

    pub fn list(&self) -> Result<Vec<SessionRecord>, CoreError> {
        Ok(self
            .store
            .list()?
            .into_iter()
            .map(|r| self.reported(r))
            .collect())
    }

    /// Ask an active provisioning run for this session to stop and roll back.
    ///
    /// Only sessions still on their way to `Ready` can be stopped; anything
    /// else goes through teardown.
    pub fn request_stop(&self, session_id: &str) -> Result<(), CoreError> {
        let record = self.load(session_id)?;
        if !matches!(
            record.state,
            SessionState::Pending | SessionState::Provisioning
        ) {
            return Err(CoreError::NotInProgress {
                session: session_id.to_owned(),
                state: record.state,
            });
        }
        self.stops.request(session_id)?;
        Ok(())
    }

    /// Forget a closed session so its id can be provisioned again.
    pub fn purge(&self, session_id: &str) -> Result<(), CoreError> {
        let record = self.load(session_id)?;
        if record.state != SessionState::Closed {
            return Err(CoreError::NotClosed {
                session: session_id.to_owned(),
                state: record.state,
            });
        }
        let Some(lock) = SessionLock::try_acquire(&self.layout.lock_path(session_id))? else {
            return Err(CoreError::SessionBusy(session_id.to_owned()));
        };
        self.store.remove(session_id)?;
        self.stops.clear(session_id)?;
        drop(lock);
        info!("purged session {session_id}");
        Ok(())
    }
}
