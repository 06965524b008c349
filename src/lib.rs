/*!
 # Valheim Runner

 A Rust library for supervising a Valheim dedicated server and administering
 it over RCON.

 ## Overview

 Valheim Runner provides functionality to:
 - Start the dedicated server, attached to the supervisor or detached from it
 - Follow its output and turn known log lines into structured events
 - Restart it after crashes with exponential backoff
 - Re-attach to a detached server from a later invocation through a PID file
 - Send console commands over Source RCON, with a persistent session that
   reconnects on its own and tracks who is online

 ## Basic Usage

 ```no_run
 use valheim_runner::{RunnerEvent, ServerRunner, Result};
 use valheim_runner::server::ProcessOptions;
 use futures::StreamExt;
 use std::time::Duration;

 #[tokio::main]
 async fn main() -> Result<()> {
     let options = ProcessOptions::new("/opt/valheim/valheim_server.x86_64");
     let mut runner = ServerRunner::from_config_file("valheim.yaml", options)?;

     let events = runner.events().expect("first call");
     runner.start().await?;

     futures::pin_mut!(events);
     while let Some(event) = events.next().await {
         match event {
             RunnerEvent::Server(event) => println!("{:?}", event.kind),
             RunnerEvent::Session(event) => println!("{:?}", event),
         }
     }

     runner.stop(Duration::from_secs(30)).await?;
     Ok(())
 }
 ```

 ## Features

 - **Process supervision**: state machine driven by the server's own output
 - **Watchdog**: bounded restarts with backoff and a cooldown window
 - **Detached mode**: the server outlives the supervisor; logs are tailed
 - **RCON**: fragmentation-safe codec, id-correlated requests, timeouts
 - **Configuration**: JSON or YAML files
*/

pub mod config;
pub mod error;
pub mod logging;
pub mod server;
pub mod session;
pub mod transport;

pub use config::Config;
pub use error::{Error, Result};
pub use server::{ProcessState, ServerEvent, ServerId, ServerProcess};

use config::validate_config;
use futures::Stream;
use server::{PidFile, ProcessOptions, Watchdog, WatchdogHandle, WatchdogStatus};
use session::{RconSession, SessionEvent};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use transport::RconClient;

/// Time allowed for a force-killed detached server to disappear.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Event from either half of a [`ServerRunner`]
#[derive(Debug, Clone)]
pub enum RunnerEvent {
    /// From the supervised process or its watchdog
    Server(ServerEvent),
    /// From the RCON session
    Session(SessionEvent),
}

/// Supervise one Valheim server and its RCON session
///
/// This is the handle one invocation works through: it owns the watchdog
/// and, when RCON is configured, the persistent session. A separate
/// invocation finds a detached server through the PID file instead
/// (see [`ServerRunner::attach`] and [`ServerRunner::stop_detached`]).
/// All public methods are instrumented with `tracing` spans.
pub struct ServerRunner {
    /// Configuration
    config: Config,
    /// Executable and supervisor paths
    options: ProcessOptions,
    /// Control handle of the running watchdog
    watchdog: Option<WatchdogHandle>,
    /// Watchdog task
    watchdog_task: Option<JoinHandle<()>>,
    /// Persistent RCON session, when configured
    rcon: Option<RconSession<RconClient>>,
    /// Sending half handed to each watchdog
    events_tx: mpsc::UnboundedSender<ServerEvent>,
    /// Receiving half, until [`events`](Self::events) takes it
    events_rx: Option<mpsc::UnboundedReceiver<ServerEvent>>,
}

impl ServerRunner {
    /// Create a runner from a configuration file path
    #[tracing::instrument(skip(path, options), fields(config_path = ?path.as_ref()))]
    pub fn from_config_file(path: impl AsRef<Path>, options: ProcessOptions) -> Result<Self> {
        tracing::info!("Loading configuration from file");
        let config = Config::from_file(path)?;
        Self::new(config, options)
    }

    /// Create a runner from a JSON configuration string
    #[tracing::instrument(skip(config, options))]
    pub fn from_config_str(config: &str, options: ProcessOptions) -> Result<Self> {
        tracing::info!("Loading configuration from string");
        let config = Config::parse_from_str(config)?;
        Self::new(config, options)
    }

    /// Create a runner from a validated configuration
    #[tracing::instrument(skip(config, options), fields(server = %config.server.name))]
    pub fn new(config: Config, options: ProcessOptions) -> Result<Self> {
        validate_config(&config)?;

        let rcon = config.rcon.clone().map(|rcon| {
            RconSession::new(Arc::new(RconClient::new(rcon)), config.session.clone())
        });
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        tracing::info!(rcon = rcon.is_some(), "Creating new ServerRunner");
        Ok(Self {
            config,
            options,
            watchdog: None,
            watchdog_task: None,
            rcon,
            events_tx,
            events_rx: Some(events_rx),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// RCON session, when configured
    pub fn rcon(&self) -> Option<&RconSession<RconClient>> {
        self.rcon.as_ref()
    }

    /// Whether a watchdog is currently supervising a server
    pub fn is_supervising(&self) -> bool {
        self.watchdog.as_ref().is_some_and(|w| !w.is_closed())
    }

    /// Merged stream of server and RCON session events.
    ///
    /// Returns `None` after the first call.
    pub fn events(&mut self) -> Option<impl Stream<Item = RunnerEvent> + Send + use<>> {
        let mut server_rx = self.events_rx.take()?;
        let mut session_rx = self.rcon.as_ref().map(|session| session.subscribe());

        Some(async_stream::stream! {
            loop {
                let event = tokio::select! {
                    event = server_rx.recv() => match event {
                        Some(event) => Some(RunnerEvent::Server(event)),
                        None => break,
                    },
                    event = recv_session(&mut session_rx) => match event {
                        Ok(event) => Some(RunnerEvent::Session(event)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Session events dropped, consumer too slow");
                            None
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            session_rx = None;
                            None
                        }
                    },
                };
                if let Some(event) = event {
                    yield event;
                }
            }
        })
    }

    /// Start the server under the watchdog and connect RCON if configured
    #[tracing::instrument(skip(self), fields(server = %self.config.server.name))]
    pub async fn start(&mut self) -> Result<()> {
        if self.is_supervising() {
            return Err(Error::AlreadyRunning);
        }

        tracing::info!("Starting server");
        let (handle, task) = Watchdog::start(
            self.config.server.clone(),
            self.config.watchdog.clone(),
            self.options.clone(),
            self.events_tx.clone(),
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to start server");
            e
        })?;

        self.watchdog = Some(handle);
        self.watchdog_task = Some(task);
        self.start_rcon();
        Ok(())
    }

    /// Resume supervision of a detached server recorded in the PID file.
    ///
    /// Returns `false` when no live server is recorded.
    #[tracing::instrument(skip(self))]
    pub async fn attach(&mut self) -> Result<bool> {
        if self.is_supervising() {
            return Err(Error::AlreadyRunning);
        }

        let pid_file = PidFile::new(self.options.pid_file.clone());
        let Some(data) = pid_file.read_running()? else {
            tracing::info!("No running server recorded");
            return Ok(false);
        };

        let (handle, task) = Watchdog::attach(
            data,
            self.config.server.clone(),
            self.config.watchdog.clone(),
            self.options.clone(),
            self.events_tx.clone(),
        )?;

        self.watchdog = Some(handle);
        self.watchdog_task = Some(task);
        self.start_rcon();
        Ok(true)
    }

    fn start_rcon(&self) {
        if let Some(session) = &self.rcon {
            session.start();
        }
    }

    async fn stop_rcon(&self) {
        if let Some(session) = &self.rcon {
            session.stop().await;
        }
    }

    fn supervisor(&self) -> Result<&WatchdogHandle> {
        self.watchdog.as_ref().ok_or(Error::NotRunning)
    }

    /// Stop the server gracefully and disconnect RCON
    #[tracing::instrument(skip(self))]
    pub async fn stop(&mut self, timeout: Duration) -> Result<()> {
        tracing::info!("Stopping server");
        self.stop_rcon().await;

        if let Some(watchdog) = self.watchdog.take() {
            watchdog.stop(timeout).await?;
        }
        self.join_watchdog().await;
        Ok(())
    }

    /// Kill the server immediately and disconnect RCON
    #[tracing::instrument(skip(self))]
    pub async fn kill(&mut self) -> Result<()> {
        self.stop_rcon().await;
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.kill().await?;
        }
        self.join_watchdog().await;
        Ok(())
    }

    /// Restart the server with a fresh process
    #[tracing::instrument(skip(self))]
    pub async fn restart(&self) -> Result<()> {
        self.supervisor()?.restart().await
    }

    /// Leave a detached server running and stop supervising it
    #[tracing::instrument(skip(self))]
    pub async fn detach(&mut self) -> Result<()> {
        self.supervisor()?.detach().await?;
        self.stop_rcon().await;
        self.watchdog = None;
        self.join_watchdog().await;
        Ok(())
    }

    /// Current watchdog status, if supervising
    pub async fn status(&self) -> Option<WatchdogStatus> {
        match &self.watchdog {
            Some(watchdog) => watchdog.status().await.ok(),
            None => None,
        }
    }

    async fn join_watchdog(&mut self) {
        if let Some(task) = self.watchdog_task.take() {
            // Dropping the last handle ends the task.
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Watchdog task ended abnormally");
            }
        }
    }

    /// Stop a detached server recorded in `pid_file` from an invocation
    /// that is not supervising it.
    ///
    /// Returns `false` when no live server is recorded.
    #[tracing::instrument(skip(pid_file), fields(path = %pid_file.path().display()))]
    pub async fn stop_detached(pid_file: &PidFile, timeout: Duration) -> Result<bool> {
        let Some(data) = pid_file.read_running()? else {
            return Ok(false);
        };

        tracing::info!(pid = data.pid, "Stopping detached server");
        server::platform::terminate(data.pid)?;
        if !server::wait_pid_exit(data.pid, timeout).await {
            tracing::warn!(pid = data.pid, "Detached server ignored termination, killing");
            server::platform::force_kill(data.pid)?;
            if !server::wait_pid_exit(data.pid, KILL_GRACE).await {
                return Err(Error::Process(format!(
                    "Server process {} did not exit",
                    data.pid
                )));
            }
        }

        pid_file.remove()?;
        Ok(true)
    }
}

async fn recv_session(
    rx: &mut Option<broadcast::Receiver<SessionEvent>>,
) -> std::result::Result<SessionEvent, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
