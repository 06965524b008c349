//! Date-stamped log files for detached servers.

use crate::error::{Error, Result};
use chrono::{DateTime, Local};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

const LOG_PREFIX: &str = "valheim-";
const LOG_SUFFIX: &str = ".log";

/// Default directory for detached server logs.
pub fn default_log_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join("valheim-runner").join("logs")
}

/// Path of the log file for a server started at `at`.
pub fn log_file_path(dir: &Path, at: DateTime<Local>) -> PathBuf {
    dir.join(format!(
        "{}{}{}",
        LOG_PREFIX,
        at.format("%Y-%m-%d_%H-%M-%S"),
        LOG_SUFFIX
    ))
}

/// Create a fresh log file in `dir` and prune old ones so that at most
/// `keep` files remain, including the new one.
pub fn create_log_file(dir: &Path, keep: usize) -> Result<(PathBuf, File)> {
    std::fs::create_dir_all(dir)
        .map_err(|e| Error::Io(format!("Failed to create log dir {}: {}", dir.display(), e)))?;

    let path = log_file_path(dir, Local::now());
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| Error::Io(format!("Failed to open log file {}: {}", path.display(), e)))?;

    if let Err(e) = prune_logs(dir, keep) {
        tracing::warn!(error = %e, dir = %dir.display(), "Failed to prune old server logs");
    }

    Ok((path, file))
}

/// Delete the oldest server logs in `dir` beyond the newest `keep`.
///
/// Returns the paths that were removed. The timestamped names sort
/// chronologically, so ordering is by file name.
pub fn prune_logs(dir: &Path, keep: usize) -> Result<Vec<PathBuf>> {
    let mut logs: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|e| Error::Io(format!("Failed to list {}: {}", dir.display(), e)))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.starts_with(LOG_PREFIX) && name.ends_with(LOG_SUFFIX))
                .unwrap_or(false)
        })
        .collect();

    logs.sort();

    let excess = logs.len().saturating_sub(keep.max(1));
    let mut removed = Vec::with_capacity(excess);
    for path in logs.into_iter().take(excess) {
        match std::fs::remove_file(&path) {
            Ok(()) => removed.push(path),
            Err(e) => tracing::warn!(error = %e, path = %path.display(), "Failed to remove old log"),
        }
    }

    Ok(removed)
}
