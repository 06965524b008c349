/// Valheim dedicated server supervision.
///
/// This module spawns, observes and restarts the server process. Server
/// output is split into lines, classified by the log parser and delivered as
/// [`ServerEvent`]s over a channel. All public components are instrumented
/// with `tracing` spans.
///
/// # Components
///
/// * `process` - Process monitor owning one OS process ([`ServerProcess`])
/// * `watchdog` - Crash recovery with exponential backoff ([`Watchdog`])
/// * `log_parser` - Classification of server log lines
/// * `pid_file` - On-disk record used to re-attach to detached servers
/// * `tailer` - Polling log file follower for detached servers
/// * `platform` - OS-specific spawning and signalling
///
/// # Examples
///
/// Classifying a log line:
///
/// ```
/// use valheim_runner::server::{parse_log_line, ParsedEvent};
///
/// let event = parse_log_line("02/19/2024 13:37:01: Game server connected");
/// assert_eq!(event, Some(ParsedEvent::ServerReady));
/// ```
///
/// Supervising a server:
///
/// ```no_run
/// use valheim_runner::config::{ServerLaunchConfig, WatchdogConfig};
/// use valheim_runner::server::{ProcessOptions, Watchdog};
/// use std::time::Duration;
/// use tokio::sync::mpsc;
///
/// # async fn run() -> valheim_runner::Result<()> {
/// let launch = ServerLaunchConfig::new("My Server", 2456, "Dedicated", "secret");
/// let options = ProcessOptions::new("/opt/valheim/valheim_server.x86_64");
/// let (tx, mut rx) = mpsc::unbounded_channel();
///
/// let (watchdog, _task) = Watchdog::start(launch, WatchdogConfig::default(), options, tx).await?;
/// while let Some(event) = rx.recv().await {
///     println!("{:?}", event.kind);
/// }
/// watchdog.stop(Duration::from_secs(30)).await?;
/// # Ok(())
/// # }
/// ```
pub mod lifecycle;
pub mod lines;
pub mod log_files;
pub mod log_parser;
pub mod pid_file;
pub mod platform;
mod process;
pub mod tailer;
pub mod watchdog;

pub use lifecycle::{OutputStream, ProcessState, ServerEvent, ServerEventKind};
pub use log_parser::{ParsedEvent, StartupPhase, parse_log_line};
pub use pid_file::{PidFile, PidFileData};
pub use process::{ProcessOptions, ServerId, ServerProcess};
pub(crate) use process::wait_pid_exit;
pub use tailer::{LogTailer, TailFrom};
pub use watchdog::{RestartDecision, RestartPolicy, Watchdog, WatchdogHandle, WatchdogStatus};
