use crate::server::lines::LineBuffer;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::task::JoinHandle;
use tokio::time;

/// Where a new tailer starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailFrom {
    /// Replay the whole file (fresh log of a process we just spawned)
    Start,
    /// Only lines written after the tailer started (re-attaching)
    End,
}

/// Follows a growing log file by polling.
///
/// Detached servers write to a file instead of a pipe; the tailer turns that
/// file back into a line stream. If the file shrinks (truncated or replaced)
/// reading restarts from the beginning. Dropping the tailer stops it.
pub struct LogTailer {
    path: PathBuf,
    task: Option<JoinHandle<()>>,
}

impl LogTailer {
    /// Start polling `path` every `interval`, calling `on_line` for each
    /// complete line in file order.
    pub fn start<F>(path: impl Into<PathBuf>, interval: Duration, from: TailFrom, on_line: F) -> Self
    where
        F: FnMut(String) + Send + 'static,
    {
        let path = path.into();
        let task = tokio::spawn(Self::run(path.clone(), interval, from, on_line));
        tracing::debug!(path = %path.display(), ?from, "Started log tailer");
        Self {
            path,
            task: Some(task),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop polling. Idempotent.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::debug!(path = %self.path.display(), "Stopped log tailer");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    async fn run<F>(path: PathBuf, interval: Duration, from: TailFrom, mut on_line: F)
    where
        F: FnMut(String) + Send + 'static,
    {
        let mut offset: u64 = match from {
            TailFrom::Start => 0,
            TailFrom::End => tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0),
        };
        let mut buffer = LineBuffer::new();
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let len = match tokio::fs::metadata(&path).await {
                Ok(meta) => meta.len(),
                // Not created yet, or rotated away; try again next tick.
                Err(_) => continue,
            };

            if len < offset {
                tracing::debug!(path = %path.display(), "Log file shrank, rereading from start");
                offset = 0;
                buffer = LineBuffer::new();
            }
            if len == offset {
                continue;
            }

            match Self::read_from(&path, offset).await {
                Ok(chunk) => {
                    offset += chunk.len() as u64;
                    for line in buffer.push(&chunk) {
                        on_line(line);
                    }
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to read log file");
                }
            }
        }
    }

    async fn read_from(path: &Path, offset: u64) -> std::io::Result<Vec<u8>> {
        let mut file = File::open(path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut chunk = Vec::new();
        file.read_to_end(&mut chunk).await?;
        Ok(chunk)
    }
}

impl Drop for LogTailer {
    fn drop(&mut self) {
        self.stop();
    }
}
