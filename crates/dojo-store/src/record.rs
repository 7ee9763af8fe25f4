use crate::layout::StoreLayout;
use crate::{atomic_write, StoreError};
use dojo_schema::{FailureCause, ProvisioningLedger, SessionId, SessionRequest, SessionState};
use serde::{Deserialize, Serialize};
use std::fs;

/// Persisted state of one session: its request, lifecycle state and ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub request: SessionRequest,
    pub state: SessionState,
    pub ledger: ProvisioningLedger,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureCause>,
    pub created_at: String,
    pub updated_at: String,
    /// blake3 checksum over the rest of the record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl SessionRecord {
    /// A fresh `Pending` record with an empty ledger.
    pub fn new(request: SessionRequest) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            session_id: request.session_id.clone(),
            request,
            state: SessionState::Pending,
            ledger: ProvisioningLedger::new(),
            failure: None,
            created_at: now.clone(),
            updated_at: now,
            checksum: None,
        }
    }

    fn compute_checksum(&self) -> Result<String, StoreError> {
        let mut copy = self.clone();
        copy.checksum = None;
        let json = serde_json::to_string_pretty(&copy)?;
        Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
    }
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    layout: StoreLayout,
}

impl SessionStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    /// Durably write `record`, stamping `updated_at` and the checksum.
    pub fn put(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let mut stamped = record.clone();
        stamped.updated_at = chrono::Utc::now().to_rfc3339();
        stamped.checksum = None;
        stamped.checksum = Some(stamped.compute_checksum()?);
        let content = serde_json::to_string_pretty(&stamped)?;

        let dir = self.layout.sessions_dir();
        fs::create_dir_all(&dir)?;
        atomic_write(
            &dir,
            &self.layout.session_path(&record.session_id),
            content.as_bytes(),
        )?;
        tracing::debug!(
            "persisted session {} state={} ledger={}",
            record.session_id,
            record.state,
            record.ledger.len()
        );
        Ok(())
    }

    pub fn get(&self, session_id: &str) -> Result<SessionRecord, StoreError> {
        let path = self.layout.session_path(session_id);
        if !path.exists() {
            return Err(StoreError::SessionNotFound(session_id.to_owned()));
        }
        let content = fs::read_to_string(&path)?;
        let record: SessionRecord = serde_json::from_str(&content)?;
        if record.session_id.as_str() != session_id {
            return Err(StoreError::SessionMismatch {
                requested: session_id.to_owned(),
                found: record.session_id.into_inner(),
            });
        }

        if let Some(ref expected) = record.checksum {
            let actual = record.compute_checksum()?;
            if actual != *expected {
                return Err(StoreError::IntegrityFailure {
                    session: session_id.to_owned(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        Ok(record)
    }

    pub fn exists(&self, session_id: &str) -> bool {
        self.layout.session_path(session_id).exists()
    }

    pub fn remove(&self, session_id: &str) -> Result<(), StoreError> {
        let path = self.layout.session_path(session_id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// All readable records, sorted by session id. Corrupted entries are skipped with a warning.
    pub fn list(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let dir = self.layout.sessions_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut results = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(session_id) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if session_id.starts_with('.') {
                continue;
            }
            match self.get(session_id) {
                Ok(record) => results.push(record),
                Err(e) => {
                    tracing::warn!("skipping corrupted session record '{session_id}': {e}");
                }
            }
        }
        results.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(results)
    }
}
