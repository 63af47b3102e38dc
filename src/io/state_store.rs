//! Persisted tracking state (`state.json`)
//!
//! Survives restarts so `start_on_boot` can resume tracking and event seqs
//! keep increasing across launches.

use crate::domain::types::epoch_ms;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub enabled: bool,
    /// Seq for the first event of the next launch
    #[serde(default)]
    pub next_seq: u64,
    /// Last write (epoch ms)
    pub updated_at: u64,
}

impl PersistedState {
    pub fn new(enabled: bool, next_seq: u64) -> Self {
        Self { enabled, next_seq, updated_at: epoch_ms() }
    }
}

pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` if nothing was ever saved
    pub fn load(&self) -> anyhow::Result<Option<PersistedState>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read state: {}", self.path.display()))
            }
        };
        let state = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state: {}", self.path.display()))?;
        Ok(Some(state))
    }

    pub fn save(&self, state: &PersistedState) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(state)?)
            .with_context(|| format!("Failed to write: {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace: {}", self.path.display()))?;
        debug!(enabled = %state.enabled, next_seq = %state.next_seq, "state_saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_round_trip_and_missing() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join("data/state.json"));
        assert_eq!(store.load().unwrap(), None);

        store.save(&PersistedState::new(true, 7)).unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert!(loaded.enabled);
        assert_eq!(loaded.next_seq, 7);
        store.save(&PersistedState::new(false, 9)).unwrap();
        assert!(!store.load().unwrap().unwrap().enabled);
    }

    #[test]
    fn test_state_without_seq_defaults_to_zero() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, r#"{"enabled":true,"updated_at":1}"#).unwrap();
        let loaded = StateStore::new(path).load().unwrap().unwrap();
        assert!(loaded.enabled);
        assert_eq!(loaded.next_seq, 0);
    }

    #[test]
    fn test_corrupt_state_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{oops").unwrap();
        assert!(StateStore::new(path).load().is_err());
    }
}
