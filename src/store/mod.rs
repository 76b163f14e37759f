//! Fleet state persistence
//!
//! A [`FleetSnapshot`] is written as pretty JSON to a temp file next to the
//! target and renamed into place, so readers never observe a partial write.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::ValidationTargets;
use crate::fleet::GroupSnapshot;
use crate::network::SecurityGroupSpec;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("State file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("State file is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Everything needed to rebuild a controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetSnapshot {
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub security_groups: Vec<SecurityGroupSpec>,
    #[serde(default)]
    pub groups: Vec<GroupSnapshot>,
    #[serde(default)]
    pub validation: ValidationTargets,
}

/// Default state file: ~/.fleetsim/state.json
pub fn default_state_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".fleetsim")
        .join("state.json")
}

#[derive(Debug, Clone)]
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

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "state.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Returns `None` when no state has been saved yet
    pub fn load(&self) -> Result<Option<FleetSnapshot>, StoreError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let snapshot: FleetSnapshot = serde_json::from_str(&content)?;
        info!(
            path = %self.path.display(),
            groups = snapshot.groups.len(),
            saved_at = %snapshot.saved_at,
            "Loaded fleet state"
        );
        Ok(Some(snapshot))
    }

    pub fn save(&self, snapshot: &FleetSnapshot) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let content = serde_json::to_string_pretty(snapshot)?;
        let temp = self.temp_path();
        std::fs::write(&temp, content)?;
        std::fs::rename(&temp, &self.path)?;

        debug!(path = %self.path.display(), "Saved fleet state");
        Ok(())
    }
}
