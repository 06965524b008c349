//! Crash recovery for a supervised server.
//!
//! The [`Watchdog`] runs as a background task that owns the current
//! [`ServerProcess`]. It is controlled through a cloneable
//! [`WatchdogHandle`]; all server events pass through it on their way to the
//! caller's channel so it can react to crashes.
//!
//! ```text
//!  WatchdogHandle ──cmd──▶ Watchdog task ──owns──▶ ServerProcess
//!                              │    ▲                    │
//!        caller events ◀──fwd──┘    └────── events ──────┘
//! ```
//!
//! Restarts always build a new [`ServerProcess`] from the same launch
//! configuration; nothing from the crashed instance is reused.

use crate::config::{ServerLaunchConfig, WatchdogConfig};
use crate::error::{Error, Result};
use crate::server::lifecycle::{EventSender, ProcessState, ServerEvent, ServerEventKind};
use crate::server::pid_file::PidFileData;
use crate::server::process::{ProcessOptions, ServerId, ServerProcess};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Graceful stop timeout used by [`WatchdogHandle::restart`].
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of a crash under a [`RestartPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Start a new process after `delay`
    Restart { attempt: u32, delay: Duration },
    /// The restart ceiling was exceeded
    GiveUp { attempts: u32 },
    /// The watchdog is disabled
    Disabled,
}

/// Exponential backoff with a restart ceiling and a cooldown window.
///
/// The n-th crash inside the cooldown window waits
/// `restart_delay * backoff_multiplier^(n-1)`. A crash more than
/// `cooldown_period` after the previous one starts counting from 1 again.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    config: WatchdogConfig,
    restart_count: u32,
    last_crash: Option<Instant>,
}

impl RestartPolicy {
    pub fn new(config: WatchdogConfig) -> Self {
        Self {
            config,
            restart_count: 0,
            last_crash: None,
        }
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    /// Restarts made in the current window
    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    /// Delay before restart number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.config.backoff_multiplier.powi(exponent);
        let millis = self.config.restart_delay.as_millis() as f64 * factor;
        if !millis.is_finite() || millis >= u64::MAX as f64 {
            return Duration::from_millis(u64::MAX);
        }
        Duration::from_millis(millis.round() as u64)
    }

    /// Record a crash observed at `now` and decide what to do.
    pub fn on_crash(&mut self, now: Instant) -> RestartDecision {
        if !self.config.enabled {
            return RestartDecision::Disabled;
        }

        if self.cooled_down(now) {
            self.restart_count = 0;
        }
        self.last_crash = Some(now);
        self.restart_count += 1;

        if self.restart_count > self.config.max_restarts {
            return RestartDecision::GiveUp {
                attempts: self.config.max_restarts,
            };
        }

        RestartDecision::Restart {
            attempt: self.restart_count,
            delay: self.delay_for(self.restart_count),
        }
    }

    /// Record that the server reached `Online` at `now`.
    pub fn on_online(&mut self, now: Instant) {
        if self.restart_count > 0 && self.cooled_down(now) {
            tracing::debug!("Server stable past cooldown, resetting restart counter");
            self.restart_count = 0;
        }
    }

    /// Forget all crash history.
    pub fn reset(&mut self) {
        self.restart_count = 0;
        self.last_crash = None;
    }

    fn cooled_down(&self, now: Instant) -> bool {
        self.last_crash
            .map(|last| now.saturating_duration_since(last) > self.config.cooldown_period)
            .unwrap_or(false)
    }
}

/// Snapshot of a watchdog's view of its server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchdogStatus {
    /// Current process instance, if any
    pub server_id: Option<ServerId>,
    /// State of the current process instance
    pub state: ProcessState,
    /// OS process id of the current instance
    pub pid: Option<u32>,
    /// Restarts made in the current cooldown window
    pub restart_count: u32,
    /// A restart is scheduled but has not started yet
    pub restart_pending: bool,
    /// The restart ceiling was reached
    pub gave_up: bool,
}

enum Command {
    Stop {
        timeout: Duration,
        reply: oneshot::Sender<Result<()>>,
    },
    Kill {
        reply: oneshot::Sender<Result<()>>,
    },
    Restart {
        timeout: Duration,
        reply: oneshot::Sender<Result<()>>,
    },
    Detach {
        reply: oneshot::Sender<Result<()>>,
    },
    Status {
        reply: oneshot::Sender<WatchdogStatus>,
    },
}

/// A clonable handle for controlling a running [`Watchdog`].
///
/// Every handle talks to the same background task. Once the task has exited
/// (after all handles are dropped) calls fail with [`Error::Other`].
#[derive(Clone)]
pub struct WatchdogHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl std::fmt::Debug for WatchdogHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchdogHandle")
            .field("closed", &self.cmd_tx.is_closed())
            .finish()
    }
}

impl WatchdogHandle {
    /// Cancel any pending restart and stop the server gracefully.
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        self.call(|reply| Command::Stop { timeout, reply }).await?
    }

    /// Cancel any pending restart and kill the server.
    pub async fn kill(&self) -> Result<()> {
        self.call(|reply| Command::Kill { reply }).await?
    }

    /// Stop the server and start a fresh instance, clearing crash history.
    pub async fn restart(&self) -> Result<()> {
        self.call(|reply| Command::Restart {
            timeout: DEFAULT_STOP_TIMEOUT,
            reply,
        })
        .await?
    }

    /// Stop supervising a detached server, leaving it running.
    pub async fn detach(&self) -> Result<()> {
        self.call(|reply| Command::Detach { reply }).await?
    }

    /// Current status of the supervised server.
    pub async fn status(&self) -> Result<WatchdogStatus> {
        self.call(|reply| Command::Status { reply }).await
    }

    /// Whether the background task has exited
    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }

    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(reply))
            .await
            .map_err(|_| watchdog_gone())?;
        rx.await.map_err(|_| watchdog_gone())
    }
}

fn watchdog_gone() -> Error {
    Error::Other("Watchdog is no longer running".to_string())
}

/// Restart supervisor around a [`ServerProcess`]
pub struct Watchdog {
    launch: ServerLaunchConfig,
    options: ProcessOptions,
    policy: RestartPolicy,
    process: Option<ServerProcess>,
    /// Events from the owned process instances
    process_tx: mpsc::UnboundedSender<ServerEvent>,
    process_rx: mpsc::UnboundedReceiver<ServerEvent>,
    /// Caller's event channel
    events: mpsc::UnboundedSender<ServerEvent>,
    restart_at: Option<Instant>,
    operator_stop: bool,
    gave_up: bool,
}

impl Watchdog {
    fn new(
        launch: ServerLaunchConfig,
        config: WatchdogConfig,
        options: ProcessOptions,
        events: mpsc::UnboundedSender<ServerEvent>,
    ) -> Self {
        let (process_tx, process_rx) = mpsc::unbounded_channel();
        Self {
            launch,
            options,
            policy: RestartPolicy::new(config),
            process: None,
            process_tx,
            process_rx,
            events,
            restart_at: None,
            operator_stop: false,
            gave_up: false,
        }
    }

    /// Start the server under supervision.
    ///
    /// A failure to spawn the first instance is returned to the caller and
    /// no watchdog is left running; spawn failures of later restarts count
    /// as crashes.
    #[tracing::instrument(skip_all, fields(server = %launch.name))]
    pub async fn start(
        launch: ServerLaunchConfig,
        config: WatchdogConfig,
        options: ProcessOptions,
        events: mpsc::UnboundedSender<ServerEvent>,
    ) -> Result<(WatchdogHandle, JoinHandle<()>)> {
        let mut watchdog = Self::new(launch, config, options, events);

        let mut process = watchdog.new_process();
        if let Err(e) = process.start().await {
            // Flush what the failed instance reported before giving up.
            watchdog.forward_pending();
            return Err(e);
        }
        watchdog.process = Some(process);

        tracing::info!("Watchdog started");
        Ok(watchdog.spawn())
    }

    /// Supervise a detached server started by another invocation.
    ///
    /// `launch` is used for any restart after a crash.
    #[tracing::instrument(skip_all, fields(pid = data.pid))]
    pub fn attach(
        data: PidFileData,
        launch: ServerLaunchConfig,
        config: WatchdogConfig,
        options: ProcessOptions,
        events: mpsc::UnboundedSender<ServerEvent>,
    ) -> Result<(WatchdogHandle, JoinHandle<()>)> {
        let mut watchdog = Self::new(launch, config, options, events);

        let process = ServerProcess::attach(data, watchdog.options.clone(), watchdog.process_tx.clone());
        match process {
            Ok(process) => watchdog.process = Some(process),
            Err(e) => {
                watchdog.forward_pending();
                return Err(e);
            }
        }

        tracing::info!("Watchdog attached");
        Ok(watchdog.spawn())
    }

    fn spawn(self) -> (WatchdogHandle, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let task = tokio::spawn(self.run(cmd_rx));
        (WatchdogHandle { cmd_tx }, task)
    }

    fn new_process(&self) -> ServerProcess {
        ServerProcess::new(
            self.launch.clone(),
            self.options.clone(),
            self.process_tx.clone(),
        )
    }

    fn current_id(&self) -> Option<ServerId> {
        self.process.as_ref().map(|p| p.id())
    }

    fn forward_pending(&mut self) {
        while let Ok(event) = self.process_rx.try_recv() {
            let _ = self.events.send(event);
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        loop {
            let restart_at = self.restart_at;

            tokio::select! {
                Some(event) = self.process_rx.recv() => {
                    self.on_event(event);
                }
                command = cmd_rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        tracing::debug!("All watchdog handles dropped, exiting");
                        break;
                    }
                },
                _ = sleep_until_restart(restart_at), if restart_at.is_some() => {
                    self.restart_at = None;
                    self.restart_now().await;
                }
            }
        }

        // Dropping the process kills an attached child and leaves a
        // detached one running.
        self.process = None;
        self.forward_pending();
    }

    fn on_event(&mut self, event: ServerEvent) {
        let is_current = Some(event.server_id) == self.current_id();
        let state = match &event.kind {
            ServerEventKind::StateChanged { state } => Some(*state),
            _ => None,
        };

        let _ = self.events.send(event.clone());

        if !is_current {
            return;
        }
        match state {
            Some(ProcessState::Crashed) => self.on_crash(event.server_id),
            Some(ProcessState::Online) => self.policy.on_online(Instant::now()),
            _ => {}
        }
    }

    fn on_crash(&mut self, server_id: ServerId) {
        if self.operator_stop {
            tracing::debug!("Exit was operator-initiated, not restarting");
            return;
        }

        let events = EventSender::new(server_id, self.events.clone());
        match self.policy.on_crash(Instant::now()) {
            RestartDecision::Disabled => {
                tracing::info!("Server crashed, watchdog disabled");
            }
            RestartDecision::GiveUp { attempts } => {
                tracing::error!(attempts, "Server keeps crashing, giving up");
                self.gave_up = true;
                events.emit(ServerEventKind::WatchdogGaveUp { attempts });
            }
            RestartDecision::Restart { attempt, delay } => {
                let max = self.policy.config().max_restarts;
                tracing::warn!(attempt, max, delay_ms = delay.as_millis() as u64, "Server crashed, scheduling restart");
                self.restart_at = Some(Instant::now() + delay);
                events.emit(ServerEventKind::WatchdogRestart {
                    attempt,
                    max,
                    delay,
                });
            }
        }
    }

    /// Replace the process with a fresh instance and start it.
    async fn restart_now(&mut self) {
        if let Some(mut old) = self.process.take() {
            if let Err(e) = old.stop(DEFAULT_STOP_TIMEOUT).await {
                tracing::warn!(error = %e, "Failed to clean up previous instance");
            }
        }

        let mut process = self.new_process();
        tracing::info!(server_id = %process.id(), "Starting new server instance");
        let result = process.start().await;
        self.process = Some(process);

        // A spawn failure already reported Crashed through the event channel;
        // the policy handles it when that event is processed.
        if let Err(e) = result {
            tracing::error!(error = %e, "Restart failed to spawn");
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Stop { timeout, reply } => {
                self.cancel_restart();
                self.operator_stop = true;
                let result = match self.process.as_mut() {
                    Some(process) => process.stop(timeout).await,
                    None => Ok(()),
                };
                let _ = reply.send(result);
            }
            Command::Kill { reply } => {
                self.cancel_restart();
                self.operator_stop = true;
                let result = match self.process.as_mut() {
                    Some(process) => process.kill().await,
                    None => Ok(()),
                };
                let _ = reply.send(result);
            }
            Command::Restart { timeout, reply } => {
                self.cancel_restart();
                self.operator_stop = true;
                if let Some(process) = self.process.as_mut() {
                    if let Err(e) = process.stop(timeout).await {
                        let _ = reply.send(Err(e));
                        return;
                    }
                }

                self.policy.reset();
                self.operator_stop = false;
                self.gave_up = false;

                let mut process = self.new_process();
                let result = process.start().await;
                self.process = Some(process);
                let _ = reply.send(result);
            }
            Command::Detach { reply } => {
                let result = match self.process.as_mut() {
                    Some(process) => process.detach(),
                    None => Err(Error::NotRunning),
                };
                if result.is_ok() {
                    self.cancel_restart();
                    self.operator_stop = true;
                }
                let _ = reply.send(result);
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn cancel_restart(&mut self) {
        if self.restart_at.take().is_some() {
            tracing::info!("Cancelled pending restart");
        }
    }

    fn status(&self) -> WatchdogStatus {
        WatchdogStatus {
            server_id: self.current_id(),
            state: self
                .process
                .as_ref()
                .map(|p| p.state())
                .unwrap_or(ProcessState::Offline),
            pid: self.process.as_ref().and_then(|p| p.pid()),
            restart_count: self.policy.restart_count(),
            restart_pending: self.restart_at.is_some(),
            gave_up: self.gave_up,
        }
    }
}

async fn sleep_until_restart(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
