use crate::layout::StoreLayout;
use crate::StoreError;
use std::fs;

/// Per-session stop requests, kept as marker files so they cross process boundaries.
#[derive(Debug, Clone)]
pub struct StopMarkers {
    layout: StoreLayout,
}

impl StopMarkers {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    pub fn request(&self, session_id: &str) -> Result<(), StoreError> {
        fs::create_dir_all(self.layout.stop_dir())?;
        fs::write(
            self.layout.stop_marker(session_id),
            chrono::Utc::now().to_rfc3339(),
        )?;
        tracing::info!("stop requested for session {session_id}");
        Ok(())
    }

    pub fn is_requested(&self, session_id: &str) -> bool {
        self.layout.stop_marker(session_id).exists()
    }

    pub fn clear(&self, session_id: &str) -> Result<(), StoreError> {
        let path = self.layout.stop_marker(session_id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}
