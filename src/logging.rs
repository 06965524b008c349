//! Logging configuration using tracing

use crate::error::{Error, Result};
use std::path::PathBuf;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Environment variable holding the log filter
pub const LOG_ENV: &str = "VALHEIM_RUNNER_LOG";
const DEFAULT_FILTER: &str = "valheim_runner=info,warn";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Where log output goes
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Write to stderr
    pub stderr: bool,
    /// Also write to a daily rolling file in this directory
    pub file_dir: Option<PathBuf>,
    /// Filter used when neither `VALHEIM_RUNNER_LOG` nor `RUST_LOG` is set
    pub default_filter: String,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            stderr: true,
            file_dir: None,
            default_filter: DEFAULT_FILTER.to_string(),
        }
    }
}

impl LogOptions {
    /// Stderr plus a rolling file under [`default_log_directory`].
    pub fn with_default_file() -> Self {
        Self {
            file_dir: Some(default_log_directory()),
            ..Self::default()
        }
    }
}

/// Initialize the logging subsystem
///
/// The filter comes from `VALHEIM_RUNNER_LOG`, then `RUST_LOG`, then
/// `options.default_filter`.
///
/// # Examples
/// ```bash
/// VALHEIM_RUNNER_LOG=debug cargo run --example supervise
/// VALHEIM_RUNNER_LOG=valheim_runner::transport=trace cargo run --example rcon_command
/// ```
pub fn init(options: LogOptions) -> Result<()> {
    let env_filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(&options.default_filter));

    let stderr_layer = options.stderr.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_timer(fmt::time::ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
    });

    let file_layer = match &options.file_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| {
                Error::Io(format!("Failed to create log dir {}: {}", dir.display(), e))
            })?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, "valheim-runner.log");
            Some(
                fmt::layer()
                    .with_writer(appender)
                    .with_ansi(false)
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_timer(fmt::time::ChronoLocal::new(TIMESTAMP_FORMAT.to_string())),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Other(format!("Failed to install log subscriber: {}", e)))?;

    if let Some(dir) = &options.file_dir {
        tracing::info!("Log directory: {}", dir.display());
    }
    Ok(())
}

/// Default directory for the runner's own log files
pub fn default_log_directory() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join("valheim-runner").join("runner-logs")
}
