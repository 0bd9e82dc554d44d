use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pairlink_network::PeerMemory;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::PairlinkConfig;

/// State that survives restarts.
///
/// Persisted to `~/.pairlink/session.json`. The last peer name seeds the
/// reconnect supervisor when the node starts.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SessionState {
    pub last_peer_name: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl SessionState {
    /// Persist session state to `~/.pairlink/session.json`.
    pub fn save(&self) -> Result<()> {
        self.save_to(&PairlinkConfig::session_path()?)
    }

    /// Load session state from disk. Missing or corrupt files yield
    /// `Default`.
    pub fn load() -> Result<Self> {
        Self::load_from(&PairlinkConfig::session_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read session: {}", path.display()))?;
            let state: Self = serde_json::from_str(&content).unwrap_or_default();
            Ok(state)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to save session: {}", path.display()))?;
        Ok(())
    }

    /// Record a successful connection.
    pub fn record_peer(&mut self, peer_name: &str) {
        self.last_peer_name = Some(peer_name.to_string());
        self.updated_at = Some(Utc::now());
    }
}

/// [`PeerMemory`] backed by a session file.
pub struct JsonPeerMemory {
    path: PathBuf,
    state: Mutex<SessionState>,
}

impl JsonPeerMemory {
    /// Open the session file at `path`. Read errors degrade to an empty
    /// session.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = SessionState::load_from(&path).unwrap_or_else(|e| {
            warn!("Ignoring unreadable session file: {e:#}");
            SessionState::default()
        });
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PeerMemory for JsonPeerMemory {
    fn load(&self) -> Option<String> {
        self.state.lock().last_peer_name.clone()
    }

    fn remember(&self, peer_name: &str) {
        let mut state = self.state.lock();
        state.record_peer(peer_name);
        match state.save_to(&self.path) {
            Ok(()) => debug!("Remembered last peer '{peer_name}'"),
            Err(e) => warn!("Failed to persist last peer: {e:#}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn session_path_in(dir: &TempDir) -> PathBuf {
        dir.path().join("session.json")
    }

    #[test]
    fn test_save_and_load() {
        let tmp = TempDir::new().unwrap();
        let path = session_path_in(&tmp);

        let mut state = SessionState::default();
        state.record_peer("Studio");
        state.save_to(&path).unwrap();

        let loaded = SessionState::load_from(&path).unwrap();
        assert_eq!(loaded.last_peer_name.as_deref(), Some("Studio"));
        assert!(loaded.updated_at.is_some());
    }

    #[test]
    fn test_missing_and_corrupt_files_default() {
        let tmp = TempDir::new().unwrap();
        let path = session_path_in(&tmp);
        assert!(SessionState::load_from(&path).unwrap().last_peer_name.is_none());

        std::fs::write(&path, "{{{{").unwrap();
        assert!(SessionState::load_from(&path).unwrap().last_peer_name.is_none());
    }

    #[test]
    fn test_json_memory_persists_across_instances() {
        let tmp = TempDir::new().unwrap();
        let path = session_path_in(&tmp);

        let memory = JsonPeerMemory::open(&path);
        assert!(memory.load().is_none());
        memory.remember("Studio");
        memory.remember("Laptop");

        let reopened = JsonPeerMemory::open(&path);
        assert_eq!(reopened.load().as_deref(), Some("Laptop"));
        assert_eq!(reopened.path(), path.as_path());
    }

    #[test]
    fn test_json_memory_survives_unwritable_path() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("missing-dir").join("session.json");

        let memory = JsonPeerMemory::open(&path);
        memory.remember("Studio");
        assert_eq!(memory.load().as_deref(), Some("Studio"));
        assert!(!path.exists());
    }
}
