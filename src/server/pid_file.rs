//! On-disk record of a running server.
//!
//! The PID file lets a separate invocation (e.g. `stop` after a detached
//! `start`) find the server. It is a cache, not a source of truth: every
//! read through [`PidFile::read_running`] re-checks that the process is
//! alive and deletes the file when it is not.

use crate::error::{Error, Result};
use crate::server::platform;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Contents of the PID file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PidFileData {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub world: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detached: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
}

/// Handle to the PID file at a fixed path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Use the given path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Per-platform default location, under the user's local data directory.
    pub fn default_path() -> PathBuf {
        let base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
        base.join("valheim-runner").join("server.pid")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write (or replace) the record, creating parent directories.
    pub fn write(&self, data: &PidFileData) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::PidFile(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }

        let json = serde_json::to_string_pretty(data)
            .map_err(|e| Error::Serialization(format!("Failed to serialize PID file: {}", e)))?;

        std::fs::write(&self.path, json).map_err(|e| {
            Error::PidFile(format!("Failed to write {}: {}", self.path.display(), e))
        })?;

        tracing::debug!(path = %self.path.display(), pid = data.pid, "Wrote PID file");
        Ok(())
    }

    /// Read the record without checking liveness.
    ///
    /// Returns `Ok(None)` when the file does not exist and an error when it
    /// exists but cannot be parsed.
    pub fn read(&self) -> Result<Option<PidFileData>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::PidFile(format!(
                    "Failed to read {}: {}",
                    self.path.display(),
                    e
                )));
            }
        };

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| Error::PidFile(format!("Corrupt PID file: {}", e)))
    }

    /// Read the record only if its process is still alive.
    ///
    /// A stale or corrupt file is removed and reported as `None`.
    pub fn read_running(&self) -> Result<Option<PidFileData>> {
        let data = match self.read() {
            Ok(Some(data)) => data,
            Ok(None) => return Ok(None),
            Err(Error::PidFile(reason)) => {
                tracing::warn!(path = %self.path.display(), %reason, "Discarding unreadable PID file");
                self.remove()?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if platform::is_process_running(data.pid) {
            Ok(Some(data))
        } else {
            tracing::info!(pid = data.pid, "PID file refers to a dead process, removing it");
            self.remove()?;
            Ok(None)
        }
    }

    /// Delete the file. Missing files are not an error.
    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "Removed PID file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::PidFile(format!(
                "Failed to remove {}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}

impl Default for PidFile {
    fn default() -> Self {
        Self::new(Self::default_path())
    }
}
