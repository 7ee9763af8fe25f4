use crate::{atomic_write, StoreError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Current store format version. Incremented on incompatible layout changes.
pub const STORE_FORMAT_VERSION: u32 = 1;
const VERSION_FILE: &str = "version";

/// Directory layout of a dojo store.
///
/// ```text
/// <root>/store/version
/// <root>/store/sessions/<session_id>.json
/// <root>/store/locks/<session_id>.lock
/// <root>/store/stop/<session_id>
/// ```
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreVersion {
    format_version: u32,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn store_dir(&self) -> PathBuf {
        self.root.join("store")
    }

    #[inline]
    pub fn sessions_dir(&self) -> PathBuf {
        self.store_dir().join("sessions")
    }

    #[inline]
    pub fn session_path(&self, session_id: &str) -> PathBuf {
        self.sessions_dir().join(format!("{session_id}.json"))
    }

    #[inline]
    pub fn locks_dir(&self) -> PathBuf {
        self.store_dir().join("locks")
    }

    #[inline]
    pub fn lock_path(&self, session_id: &str) -> PathBuf {
        self.locks_dir().join(format!("{session_id}.lock"))
    }

    #[inline]
    pub fn stop_dir(&self) -> PathBuf {
        self.store_dir().join("stop")
    }

    #[inline]
    pub fn stop_marker(&self, session_id: &str) -> PathBuf {
        self.stop_dir().join(session_id)
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.sessions_dir())?;
        fs::create_dir_all(self.locks_dir())?;
        fs::create_dir_all(self.stop_dir())?;

        let version_path = self.store_dir().join(VERSION_FILE);
        if version_path.exists() {
            self.verify_version()?;
        } else {
            let ver = StoreVersion {
                format_version: STORE_FORMAT_VERSION,
            };
            let content = serde_json::to_string_pretty(&ver)?;
            atomic_write(&self.store_dir(), &version_path, content.as_bytes())?;
        }

        Ok(())
    }

    pub fn verify_version(&self) -> Result<(), StoreError> {
        let content = fs::read_to_string(self.store_dir().join(VERSION_FILE))?;
        let ver: StoreVersion = serde_json::from_str(&content)?;

        if ver.format_version != STORE_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STORE_FORMAT_VERSION,
                found: ver.format_version,
            });
        }
        Ok(())
    }
}
