//! Durable session storage for dojo.
//!
//! `StoreLayout` owns the directory structure and the format version marker,
//! `SessionStore` persists one checksummed `SessionRecord` per session, and
//! stop markers let one process ask another to abandon a provisioning run.

pub mod layout;
pub mod record;
pub mod stop;

pub use layout::{StoreLayout, STORE_FORMAT_VERSION};
pub use record::{SessionRecord, SessionStore};
pub use stop::StopMarkers;

use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use thiserror::Error;

/// Fsync a directory so that a preceding rename into it survives a crash.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

/// Write `content` to `dest` through a temp file in the same directory.
pub(crate) fn atomic_write(dir: &Path, dest: &Path, content: &[u8]) -> Result<(), StoreError> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| StoreError::Io(e.error))?;
    fsync_dir(dir)?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("integrity check failed for session '{session}': expected {expected}, got {actual}")]
    IntegrityFailure {
        session: String,
        expected: String,
        actual: String,
    },
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("record for session '{requested}' belongs to '{found}'")]
    SessionMismatch { requested: String, found: String },
    #[error("store format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_display_session_not_found() {
        let e = StoreError::SessionNotFound("ws-42".to_owned());
        assert!(e.to_string().contains("ws-42"));
    }

    #[test]
    fn store_error_display_integrity_failure() {
        let e = StoreError::IntegrityFailure {
            session: "ws-1".to_owned(),
            expected: "exp".to_owned(),
            actual: "act".to_owned(),
        };
        let msg = e.to_string();
        assert!(msg.contains("ws-1"));
        assert!(msg.contains("exp"));
        assert!(msg.contains("act"));
    }

    #[test]
    fn atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("file.json");
        atomic_write(dir.path(), &dest, b"one").unwrap();
        atomic_write(dir.path(), &dest, b"two").unwrap();
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "two");
    }
}
