// src/server/process.rs
use crate::config::ServerLaunchConfig;
use crate::error::{Error, Result};
use crate::server::lifecycle::{
    EventSender, OutputStream, ProcessState, ServerEvent, ServerEventKind,
};
use crate::server::lines::LineBuffer;
use crate::server::log_files;
use crate::server::log_parser::{ParsedEvent, StartupPhase, parse_log_line};
use crate::server::pid_file::{PidFile, PidFileData};
use crate::server::platform;
use crate::server::tailer::{LogTailer, TailFrom};
use async_process::Child;
use chrono::Utc;
use futures_lite::io::AsyncReadExt;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Time allowed for a force-killed process to be reaped.
const KILL_GRACE: Duration = Duration::from_secs(5);
/// Time allowed for output readers to drain after the process exits.
const READER_DRAIN: Duration = Duration::from_secs(1);
/// Poll step while waiting for a non-child process to disappear.
const EXIT_POLL_STEP: Duration = Duration::from_millis(100);

/// Unique identifier for a server process instance
///
/// Every [`ServerProcess`] gets a new id, so events from a restarted
/// server can be told apart from those of the instance that crashed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ServerId(Uuid);

impl ServerId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where and how the server executable is run.
///
/// Everything here is supervisor-side plumbing; the game-facing settings
/// live in [`ServerLaunchConfig`].
#[derive(Debug, Clone)]
pub struct ProcessOptions {
    /// Dedicated server executable (e.g. `valheim_server.x86_64`)
    pub executable: PathBuf,
    /// Directory for detached-mode log files
    pub log_dir: PathBuf,
    /// PID file location
    pub pid_file: PathBuf,
    /// Number of detached log files to keep
    pub log_retention: usize,
    /// Liveness probe interval for attached (non-child) processes
    pub liveness_interval: Duration,
    /// Poll interval of the log tailer
    pub tail_interval: Duration,
    /// Extra environment for the server process
    pub extra_env: HashMap<String, String>,
}

impl ProcessOptions {
    /// Options with default paths and intervals for the given executable.
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        let mut env = HashMap::new();
        env.insert("SteamAppId".to_string(), "892970".to_string());

        Self {
            executable: executable.into(),
            log_dir: log_files::default_log_dir(),
            pid_file: PidFile::default_path(),
            log_retention: 10,
            liveness_interval: Duration::from_secs(5),
            tail_interval: Duration::from_millis(500),
            extra_env: env,
        }
    }
}

/// State shared between a process monitor and its background tasks.
struct Shared {
    state: Mutex<ProcessState>,
    phase: Mutex<Option<StartupPhase>>,
    /// Set when the operator asked for the exit (stop/kill/detach).
    operator_exit: AtomicBool,
    events: EventSender,
}

impl Shared {
    fn state(&self) -> ProcessState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Set the state, emitting `StateChanged` only on an actual change.
    fn set_state(&self, next: ProcessState) -> bool {
        let changed = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let changed = *state != next;
            *state = next;
            changed
        };
        if changed {
            tracing::debug!(server_id = %self.events.server_id(), state = %next, "State changed");
            self.events
                .emit(ServerEventKind::StateChanged { state: next });
        }
        changed
    }

    /// Move to `next` only when currently in one of `from`.
    fn transition(&self, from: &[ProcessState], next: ProcessState) -> bool {
        let allowed = from.contains(&self.state());
        allowed && self.set_state(next)
    }

    fn phase(&self) -> Option<StartupPhase> {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_phase(&self, phase: StartupPhase) {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = Some(phase);
    }

    /// Feed one output line through the parser and emit the derived events.
    fn handle_line(&self, line: String, stream: OutputStream) {
        let parsed = parse_log_line(&line);
        self.events.emit(ServerEventKind::Log { line, stream });

        let Some(event) = parsed else {
            return;
        };
        self.events.emit(ServerEventKind::Parsed {
            event: event.clone(),
        });

        match event {
            ParsedEvent::ServerReady => {
                self.set_phase(StartupPhase::Ready);
                if self.transition(&[ProcessState::Starting], ProcessState::Online) {
                    tracing::info!(server_id = %self.events.server_id(), "Server is ready");
                }
            }
            ParsedEvent::StartupPhase { phase } => {
                tracing::debug!(server_id = %self.events.server_id(), %phase, "Startup phase");
                self.set_phase(phase);
            }
            ParsedEvent::PlayerJoin { name } => {
                tracing::info!(player = %name, "Player joined");
                self.events.emit(ServerEventKind::PlayerJoined { name });
            }
            ParsedEvent::PlayerLeave { name } => {
                self.events.emit(ServerEventKind::PlayerLeft { name });
            }
            ParsedEvent::Error { message } => {
                self.events.error(message);
            }
            ParsedEvent::WorldSaved | ParsedEvent::WorldGenerated | ParsedEvent::ServerShutdown => {}
        }
    }

    /// Classify a process exit that was just observed.
    fn on_exit(&self, description: &str) {
        if self.operator_exit.load(Ordering::Acquire) {
            self.set_state(ProcessState::Offline);
            return;
        }

        match self.state() {
            ProcessState::Starting | ProcessState::Online => {
                tracing::warn!(
                    server_id = %self.events.server_id(),
                    exit = %description,
                    "Server process exited unexpectedly"
                );
                self.events.error(format!(
                    "Server process exited unexpectedly ({})",
                    description
                ));
                self.set_state(ProcessState::Crashed);
            }
            ProcessState::Stopping => {
                self.set_state(ProcessState::Offline);
            }
            ProcessState::Offline | ProcessState::Crashed => {}
        }
    }
}

/// Handle on a process this monitor spawned itself.
struct ChildControl {
    pid: u32,
    kill_tx: Option<oneshot::Sender<()>>,
    exited: Arc<AtomicBool>,
    exit_notify: Arc<Notify>,
    wait_task: JoinHandle<()>,
}

impl ChildControl {
    fn spawn(
        child: Child,
        readers: Vec<JoinHandle<()>>,
        shared: Arc<Shared>,
        pid_file: PidFile,
    ) -> Self {
        let pid = child.id();
        let exited = Arc::new(AtomicBool::new(false));
        let exit_notify = Arc::new(Notify::new());
        let (kill_tx, kill_rx) = oneshot::channel();

        let wait_task = tokio::spawn(wait_for_exit(
            child,
            kill_rx,
            readers,
            shared,
            pid_file,
            Arc::clone(&exited),
            Arc::clone(&exit_notify),
        ));

        Self {
            pid,
            kill_tx: Some(kill_tx),
            exited,
            exit_notify,
            wait_task,
        }
    }

    fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    /// Wait for the exit notification, returning whether it arrived in time.
    async fn wait_exit(&self, timeout: Duration) -> bool {
        // Create the future before the flag check so a notification in
        // between cannot be missed.
        let notified = self.exit_notify.notified();
        if self.has_exited() {
            return true;
        }
        tokio::time::timeout(timeout, notified).await.is_ok()
    }

    fn force_kill(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            // The wait task may have finished already.
            let _ = tx.send(());
        }
    }
}

/// Background task: owns `child`, waits for it to exit and classifies the exit.
async fn wait_for_exit(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    readers: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
    pid_file: PidFile,
    exited: Arc<AtomicBool>,
    exit_notify: Arc<Notify>,
) {
    let status = tokio::select! {
        result = child.status() => result,
        _ = kill_rx => {
            tracing::info!(pid = child.id(), "Force-killing server process");
            if let Err(e) = child.kill() {
                tracing::error!(error = %e, "Failed to kill server process");
            }
            child.status().await
        }
    };

    let description = match &status {
        Ok(status) => status.to_string(),
        Err(e) => format!("wait failed: {}", e),
    };
    tracing::info!(pid = child.id(), exit = %description, "Server process exited");

    // Deliver the last lines before reporting the exit.
    for reader in readers {
        if tokio::time::timeout(READER_DRAIN, reader).await.is_err() {
            tracing::debug!("Output reader did not finish after exit");
        }
    }

    shared.on_exit(&description);
    if let Err(e) = pid_file.remove() {
        tracing::warn!(error = %e, "Failed to remove PID file after exit");
    }

    exited.store(true, Ordering::Release);
    exit_notify.notify_waiters();
}

/// Read a pipe chunk by chunk and feed complete lines to the parser.
async fn read_output<R>(mut pipe: R, stream: OutputStream, shared: Arc<Shared>)
where
    R: futures_lite::AsyncRead + Unpin + Send + 'static,
{
    let mut buffer = LineBuffer::new();
    let mut chunk = vec![0u8; 8192];

    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                for line in buffer.push(&chunk[..n]) {
                    shared.handle_line(line, stream);
                }
            }
            Err(e) => {
                tracing::debug!(?stream, error = %e, "Output pipe read failed");
                break;
            }
        }
    }

    if let Some(line) = buffer.finish() {
        shared.handle_line(line, stream);
    }
    tracing::trace!(?stream, "Output reader finished");
}

/// Background task for processes we did not spawn: probe the PID until it
/// disappears.
async fn poll_liveness(
    pid: u32,
    interval: Duration,
    shared: Arc<Shared>,
    pid_file: PidFile,
    exited: Arc<AtomicBool>,
    exit_notify: Arc<Notify>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if platform::is_process_running(pid) {
            continue;
        }

        if shared.operator_exit.load(Ordering::Acquire) {
            shared.set_state(ProcessState::Offline);
        } else {
            tracing::warn!(pid, "Attached server process disappeared");
            shared.events.error(format!(
                "Server process {} is no longer running; it may have crashed or been stopped outside this supervisor",
                pid
            ));
            shared.set_state(ProcessState::Crashed);
        }
        if let Err(e) = pid_file.remove() {
            tracing::warn!(error = %e, "Failed to remove stale PID file");
        }

        exited.store(true, Ordering::Release);
        exit_notify.notify_waiters();
        break;
    }
}

/// How the monitor is currently connected to an OS process.
enum Supervision {
    None,
    /// Spawned by this monitor; exit observed through the child handle.
    Spawned {
        control: ChildControl,
        tailer: Option<LogTailer>,
        detached: bool,
    },
    /// Re-attached by PID; exit observed by signal probing.
    Attached {
        pid: u32,
        poller: JoinHandle<()>,
        tailer: Option<LogTailer>,
        exited: Arc<AtomicBool>,
        exit_notify: Arc<Notify>,
    },
}

/// A supervised Valheim server process
///
/// Owns at most one OS process at a time. Output lines, parsed log events,
/// state transitions and process-level errors are delivered over the event
/// channel passed to the constructor instead of being returned.
pub struct ServerProcess {
    /// Server configuration
    config: ServerLaunchConfig,
    /// Supervisor-side options
    options: ProcessOptions,
    /// Server ID
    id: ServerId,
    /// State shared with background tasks
    shared: Arc<Shared>,
    /// Connection to the OS process
    supervision: Supervision,
}

impl ServerProcess {
    /// Create a new process monitor; nothing is spawned until [`start`](Self::start).
    pub fn new(
        config: ServerLaunchConfig,
        options: ProcessOptions,
        events: mpsc::UnboundedSender<ServerEvent>,
    ) -> Self {
        let id = ServerId::new();
        Self {
            config,
            options,
            id,
            shared: Arc::new(Shared {
                state: Mutex::new(ProcessState::Offline),
                phase: Mutex::new(None),
                operator_exit: AtomicBool::new(false),
                events: EventSender::new(id, events),
            }),
            supervision: Supervision::None,
        }
    }

    /// Resume supervision of a detached server started by another invocation.
    ///
    /// The process is assumed to be online: its startup history is not
    /// observable after the fact. Liveness is polled every
    /// `options.liveness_interval`; when the PID disappears the monitor moves
    /// to [`ProcessState::Crashed`] with an explanatory error.
    #[tracing::instrument(skip(options, events), fields(pid = data.pid))]
    pub fn attach(
        data: PidFileData,
        options: ProcessOptions,
        events: mpsc::UnboundedSender<ServerEvent>,
    ) -> Result<Self> {
        if !platform::is_process_running(data.pid) {
            tracing::warn!("Cannot attach, process is not running");
            return Err(Error::NotRunning);
        }

        let config = ServerLaunchConfig {
            detached: true,
            log_file: data.log_file.clone(),
            ..ServerLaunchConfig::new(
                data.server_name.clone().unwrap_or_default(),
                data.port,
                data.world.clone(),
                String::new(),
            )
        };

        let mut process = Self::new(config, options, events);
        process.shared.set_state(ProcessState::Online);

        let tailer = data.log_file.as_ref().map(|path| {
            let shared = Arc::clone(&process.shared);
            LogTailer::start(
                path.clone(),
                process.options.tail_interval,
                TailFrom::End,
                move |line| shared.handle_line(line, OutputStream::LogFile),
            )
        });

        let exited = Arc::new(AtomicBool::new(false));
        let exit_notify = Arc::new(Notify::new());
        let poller = tokio::spawn(poll_liveness(
            data.pid,
            process.options.liveness_interval,
            Arc::clone(&process.shared),
            PidFile::new(process.options.pid_file.clone()),
            Arc::clone(&exited),
            Arc::clone(&exit_notify),
        ));

        process.supervision = Supervision::Attached {
            pid: data.pid,
            poller,
            tailer,
            exited,
            exit_notify,
        };

        tracing::info!(server_id = %process.id, "Attached to running server");
        Ok(process)
    }

    /// Get the server ID
    pub fn id(&self) -> ServerId {
        self.id
    }

    /// Get the server name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Get the launch configuration
    pub fn config(&self) -> &ServerLaunchConfig {
        &self.config
    }

    /// Get the process state
    pub fn state(&self) -> ProcessState {
        self.shared.state()
    }

    /// Last startup phase seen in the output
    pub fn phase(&self) -> Option<StartupPhase> {
        self.shared.phase()
    }

    /// OS process id, while a process is supervised
    pub fn pid(&self) -> Option<u32> {
        match &self.supervision {
            Supervision::None => None,
            Supervision::Spawned { control, .. } => Some(control.pid),
            Supervision::Attached { pid, .. } => Some(*pid),
        }
    }

    /// Whether the supervised process outlives this monitor
    pub fn is_detached(&self) -> bool {
        match &self.supervision {
            Supervision::None => false,
            Supervision::Spawned { detached, .. } => *detached,
            Supervision::Attached { .. } => true,
        }
    }

    /// Start the server process.
    ///
    /// Returns once the process is spawned; the monitor moves to
    /// [`ProcessState::Online`] later, when the server logs that it is ready.
    #[tracing::instrument(skip(self), fields(server_id = %self.id, detached = self.config.detached))]
    pub async fn start(&mut self) -> Result<()> {
        if !self.state().can_start() {
            return Err(Error::AlreadyRunning);
        }
        self.release();

        self.shared.operator_exit.store(false, Ordering::Release);
        self.shared.set_state(ProcessState::Starting);

        let result = if self.config.detached {
            self.spawn_detached()
        } else {
            self.spawn_attached()
        };

        match result {
            Ok(supervision) => {
                self.supervision = supervision;
                tracing::info!(pid = ?self.pid(), "Server process spawned");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to spawn server process");
                self.shared.events.error(e.to_string());
                self.shared.set_state(ProcessState::Crashed);
                Err(e)
            }
        }
    }

    fn spawn_attached(&mut self) -> Result<Supervision> {
        let args = self.config.command_args();
        let mut child =
            platform::spawn_attached(&self.options.executable, &args, &self.options.extra_env)?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Process("Failed to get stdout pipe from child process".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Process("Failed to get stderr pipe from child process".to_string()))?;

        let readers = vec![
            tokio::spawn(read_output(stdout, OutputStream::Stdout, Arc::clone(&self.shared))),
            tokio::spawn(read_output(stderr, OutputStream::Stderr, Arc::clone(&self.shared))),
        ];

        let pid_file = PidFile::new(self.options.pid_file.clone());
        self.record_pid(&pid_file, child.id(), None, false);

        let control = ChildControl::spawn(child, readers, Arc::clone(&self.shared), pid_file);
        Ok(Supervision::Spawned {
            control,
            tailer: None,
            detached: false,
        })
    }

    fn spawn_detached(&mut self) -> Result<Supervision> {
        let args = self.config.command_args();
        let (own_log, log_handle) =
            log_files::create_log_file(&self.options.log_dir, self.options.log_retention)?;

        let child = platform::spawn_detached(
            &self.options.executable,
            &args,
            &self.options.extra_env,
            log_handle,
        )?;

        // With -logFile the server writes there itself and stdout stays
        // mostly empty, so follow that file instead. It may still hold the
        // previous run until the server truncates it.
        let (tail_path, from) = match &self.config.log_file {
            Some(path) => (path.clone(), TailFrom::End),
            None => (own_log, TailFrom::Start),
        };

        let pid_file = PidFile::new(self.options.pid_file.clone());
        self.record_pid(&pid_file, child.id(), Some(tail_path.clone()), true);

        let shared = Arc::clone(&self.shared);
        let tailer = LogTailer::start(tail_path, self.options.tail_interval, from, move |line| {
            shared.handle_line(line, OutputStream::LogFile)
        });

        let control = ChildControl::spawn(child, Vec::new(), Arc::clone(&self.shared), pid_file);
        Ok(Supervision::Spawned {
            control,
            tailer: Some(tailer),
            detached: true,
        })
    }

    /// Write the PID file; failure is reported but does not fail the start.
    fn record_pid(&self, pid_file: &PidFile, pid: u32, log_file: Option<PathBuf>, detached: bool) {
        let data = PidFileData {
            pid,
            started_at: Utc::now(),
            world: self.config.world.clone(),
            port: self.config.port,
            log_file,
            detached: Some(detached),
            server_name: Some(self.config.name.clone()),
        };
        if let Err(e) = pid_file.write(&data) {
            tracing::warn!(error = %e, "Failed to write PID file");
            self.shared.events.error(e.to_string());
        }
    }

    /// Stop the server process gracefully.
    ///
    /// Sends a termination request and waits up to `timeout` for the process
    /// to exit, then force-kills it. Always ends in [`ProcessState::Offline`].
    /// Does nothing when already offline.
    #[tracing::instrument(skip(self), fields(server_id = %self.id))]
    pub async fn stop(&mut self, timeout: Duration) -> Result<()> {
        match self.state() {
            ProcessState::Offline => return Ok(()),
            ProcessState::Crashed => {
                self.release();
                self.shared.set_state(ProcessState::Offline);
                return Ok(());
            }
            _ => {}
        }

        tracing::info!("Stopping server process");
        self.shared.operator_exit.store(true, Ordering::Release);
        self.shared.set_state(ProcessState::Stopping);

        let mut kill_error = None;
        match &mut self.supervision {
            Supervision::None => {}
            Supervision::Spawned { control, .. } => {
                if let Err(e) = platform::terminate(control.pid) {
                    tracing::warn!(error = %e, "Graceful termination failed");
                }
                if !control.wait_exit(timeout).await {
                    tracing::warn!("Timeout waiting for graceful exit, force killing");
                    control.force_kill();
                    if !control.wait_exit(KILL_GRACE).await {
                        tracing::error!("Server process did not exit after kill");
                    }
                }
            }
            Supervision::Attached { pid, exited, .. } => {
                let pid = *pid;
                if let Err(e) = platform::terminate(pid) {
                    tracing::warn!(error = %e, "Graceful termination failed");
                }
                if !wait_pid_exit(pid, timeout).await {
                    tracing::warn!(pid, "Timeout waiting for graceful exit, force killing");
                    match platform::force_kill(pid) {
                        Ok(()) => {
                            wait_pid_exit(pid, KILL_GRACE).await;
                        }
                        Err(e) => kill_error = Some(e),
                    }
                }
                exited.store(true, Ordering::Release);
            }
        }

        if let Some(e) = kill_error {
            return Err(self.abandon(e));
        }
        self.finish_operator_exit();
        tracing::info!("Server process stopped");
        Ok(())
    }

    /// Kill the server process immediately. Always ends in
    /// [`ProcessState::Offline`]; does nothing when already offline.
    #[tracing::instrument(skip(self), fields(server_id = %self.id))]
    pub async fn kill(&mut self) -> Result<()> {
        if self.state() == ProcessState::Offline {
            return Ok(());
        }

        self.shared.operator_exit.store(true, Ordering::Release);

        let mut kill_error = None;
        match &mut self.supervision {
            Supervision::None => {}
            Supervision::Spawned { control, .. } => {
                control.force_kill();
                if !control.wait_exit(KILL_GRACE).await {
                    tracing::error!("Server process did not exit after kill");
                }
            }
            Supervision::Attached { pid, exited, .. } => {
                match platform::force_kill(*pid) {
                    Ok(()) => {
                        wait_pid_exit(*pid, KILL_GRACE).await;
                    }
                    Err(e) => kill_error = Some(e),
                }
                exited.store(true, Ordering::Release);
            }
        }

        if let Some(e) = kill_error {
            return Err(self.abandon(e));
        }
        self.finish_operator_exit();
        tracing::info!("Server process killed");
        Ok(())
    }

    /// Stop observing a detached server without terminating it.
    ///
    /// The PID file is kept so another invocation can [`attach`](Self::attach).
    #[tracing::instrument(skip(self), fields(server_id = %self.id))]
    pub fn detach(&mut self) -> Result<()> {
        if !self.is_detached() {
            return Err(Error::Process(
                "Only a server running in detached mode can be detached".to_string(),
            ));
        }

        self.shared.operator_exit.store(true, Ordering::Release);
        let pid = self.pid();

        match std::mem::replace(&mut self.supervision, Supervision::None) {
            Supervision::Spawned {
                control, tailer, ..
            } => {
                // Dropping the child handle does not kill a detached process.
                control.wait_task.abort();
                drop(tailer);
            }
            Supervision::Attached { poller, tailer, .. } => {
                poller.abort();
                drop(tailer);
            }
            Supervision::None => {}
        }

        self.shared.set_state(ProcessState::Offline);
        tracing::info!(?pid, "Detached from server process, it keeps running");
        Ok(())
    }

    /// Common tail of stop/kill.
    fn finish_operator_exit(&mut self) {
        self.release();
        if let Err(e) = PidFile::new(self.options.pid_file.clone()).remove() {
            tracing::warn!(error = %e, "Failed to remove PID file");
        }
        self.shared.set_state(ProcessState::Offline);
    }

    /// Stop supervising a process that could not be killed. The PID file
    /// stays, since the process may still be running.
    fn abandon(&mut self, error: Error) -> Error {
        tracing::error!(error = %error, pid = ?self.pid(), "Failed to kill server process, releasing it");
        self.release();
        self.shared.set_state(ProcessState::Offline);
        error
    }

    /// Drop background tasks of a finished process.
    fn release(&mut self) {
        match std::mem::replace(&mut self.supervision, Supervision::None) {
            Supervision::None => {}
            Supervision::Spawned {
                mut control,
                tailer,
                detached,
            } => {
                drop(tailer);
                if !control.has_exited() && !detached {
                    control.force_kill();
                }
            }
            Supervision::Attached { poller, tailer, .. } => {
                poller.abort();
                drop(tailer);
            }
        }
    }

    /// Wait until the process has been observed to exit, for tests and for
    /// callers that want to block on a crash.
    pub async fn wait_for_exit(&self, timeout: Duration) -> bool {
        match &self.supervision {
            Supervision::None => true,
            Supervision::Spawned { control, .. } => control.wait_exit(timeout).await,
            Supervision::Attached {
                exited,
                exit_notify,
                ..
            } => {
                let notified = exit_notify.notified();
                if exited.load(Ordering::Acquire) {
                    return true;
                }
                tokio::time::timeout(timeout, notified).await.is_ok()
            }
        }
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        // Attached children are killed; detached processes are left alone.
        self.shared.operator_exit.store(true, Ordering::Release);
        self.release();
    }
}

/// Poll until `pid` is gone or `timeout` elapses.
pub(crate) async fn wait_pid_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while platform::is_process_running(pid) {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(EXIT_POLL_STEP).await;
    }
    true
}
