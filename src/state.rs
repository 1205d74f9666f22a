//! Persisted runtime state.
//!
//! Read at the start of a pass and written back after each component that
//! changed it, so every pass starts from what the host actually received.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ConvergeError, Result};
use crate::fs_ops::write_file_atomic;

/// The binary placed by an archive install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledArtifact {
    /// Versioned executable the stable symlink points at.
    pub path: PathBuf,
    pub version: String,
    /// SHA-256 of the archive it was extracted from.
    pub checksum: String,
    pub installed_at: DateTime<Utc>,
}

/// Everything the pass remembers between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeState {
    #[serde(default)]
    pub artifact: Option<InstalledArtifact>,
    /// Fingerprint of the configuration the service last picked up.
    #[serde(default)]
    pub applied_config: Option<String>,
    #[serde(default)]
    pub applied_at: Option<DateTime<Utc>>,
}

impl RuntimeState {
    /// Load state from `path`; a missing file is an empty state.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No runtime state at {}, starting fresh", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(ConvergeError::io(path, e)),
        };
        serde_json::from_str(&raw).map_err(|e| {
            ConvergeError::config(format!(
                "corrupt runtime state at {}: {}",
                path.display(),
                e
            ))
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut json = serde_json::to_vec_pretty(self)
            .map_err(|e| ConvergeError::config(format!("failed to encode runtime state: {}", e)))?;
        json.push(b'\n');
        write_file_atomic(path, &json, 0o600)
    }
}
