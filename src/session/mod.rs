//! Persistent RCON session.
//!
//! [`RconSession`] keeps one [`Transport`] connected for the whole
//! application: it reconnects with a linearly growing delay, polls the
//! player list and publishes [`SessionEvent`]s on a broadcast channel.
//! Admin helpers never fail outward; they return `None` when the command
//! could not be delivered, so callers can treat RCON as best effort.
//!
//! # Examples
//!
//! ```no_run
//! use valheim_runner::config::{RconConfig, RconSessionConfig};
//! use valheim_runner::session::{RconSession, SessionEvent};
//! use valheim_runner::transport::RconClient;
//! use std::sync::Arc;
//!
//! # async fn run() {
//! let client = Arc::new(RconClient::new(RconConfig::new("127.0.0.1", 2458, "secret")));
//! let session = RconSession::new(client, RconSessionConfig::default());
//! let mut events = session.subscribe();
//! session.start();
//!
//! while let Ok(event) = events.recv().await {
//!     if let SessionEvent::PlayersChanged { players } = event {
//!         println!("online: {:?}", players);
//!     }
//! }
//! # }
//! ```

pub mod commands;
pub mod players;

pub use commands::AdminCommand;
pub use players::{PlayerDiff, parse_player_list};

use crate::config::RconSessionConfig;
use crate::transport::{RconState, Transport};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;

const EVENT_CAPACITY: usize = 64;

/// Event published by an [`RconSession`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Connection state changed
    StateChanged { state: RconState },
    /// The sorted set of online players changed
    PlayersChanged { players: Vec<String> },
    /// Reconnecting stopped after too many failed attempts
    GaveUp { attempts: u32 },
}

/// State shared between the session and its background task.
struct SessionShared<T> {
    transport: Arc<T>,
    config: RconSessionConfig,
    events: broadcast::Sender<SessionEvent>,
    players: Mutex<Vec<String>>,
    last_state: Mutex<RconState>,
    /// Woken when a command notices the connection is gone.
    connection_lost: Notify,
}

impl<T: Transport> SessionShared<T> {
    fn publish(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn publish_state(&self, state: RconState) {
        let changed = {
            let mut last = self.last_state.lock().unwrap_or_else(|e| e.into_inner());
            let changed = *last != state;
            *last = state;
            changed
        };
        if changed {
            self.publish(SessionEvent::StateChanged { state });
        }
    }

    async fn send(&self, command: &str) -> Option<String> {
        if !self.transport.is_connected() {
            tracing::debug!(command, "RCON not connected, dropping command");
            return None;
        }

        match self.transport.send(command).await {
            Ok(response) => Some(response),
            Err(e) => {
                tracing::warn!(command, error = %e, "RCON command failed");
                if e.is_connection_loss() {
                    self.connection_lost.notify_one();
                }
                None
            }
        }
    }

    /// Refresh the player list, publishing only real changes.
    async fn poll_players(&self) -> crate::Result<()> {
        let response = self.transport.send(&self.config.status_command).await?;
        let current = parse_player_list(&response);

        let diff = {
            let mut known = self.players.lock().unwrap_or_else(|e| e.into_inner());
            let diff = PlayerDiff::between(&known, &current);
            if !diff.is_empty() {
                *known = current.clone();
            }
            diff
        };

        if !diff.is_empty() {
            tracing::info!(joined = ?diff.joined, left = ?diff.left, "Player list changed");
            self.publish(SessionEvent::PlayersChanged { players: current });
        }
        Ok(())
    }

    /// Poll until the connection is lost.
    async fn stay_connected(&self) {
        loop {
            match self.poll_players().await {
                Ok(()) => {}
                Err(e) if e.is_connection_loss() => {
                    tracing::warn!(error = %e, "RCON connection lost");
                    return;
                }
                Err(e) => tracing::debug!(error = %e, "Player poll failed"),
            }

            if !self.transport.is_connected() {
                return;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = self.connection_lost.notified() => {}
            }

            if !self.transport.is_connected() {
                return;
            }
        }
    }

    async fn run(self: Arc<Self>) {
        let max = self.config.max_reconnect_attempts;
        let mut failures: u32 = 0;

        loop {
            self.publish_state(RconState::Connecting);
            match self.transport.connect().await {
                Ok(()) => {
                    failures = 0;
                    tracing::info!("RCON session connected");
                    self.publish_state(RconState::Connected);

                    self.stay_connected().await;

                    let _ = self.transport.disconnect().await;
                    self.publish_state(RconState::Disconnected);
                    tokio::time::sleep(self.config.reconnect_base_delay).await;
                }
                Err(e) => {
                    failures += 1;
                    self.publish_state(RconState::Disconnected);

                    if failures >= max {
                        tracing::error!(attempts = failures, error = %e, "Giving up on RCON");
                        self.publish(SessionEvent::GaveUp { attempts: failures });
                        return;
                    }

                    let delay = self.config.reconnect_base_delay * failures;
                    tracing::warn!(
                        attempt = failures,
                        max,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "RCON connect failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Persistent RCON connection with reconnects and presence polling
pub struct RconSession<T: Transport + 'static> {
    shared: Arc<SessionShared<T>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport + 'static> RconSession<T> {
    pub fn new(transport: Arc<T>, config: RconSessionConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(SessionShared {
                transport,
                config,
                events,
                players: Mutex::new(Vec::new()),
                last_state: Mutex::new(RconState::Disconnected),
                connection_lost: Notify::new(),
            }),
            task: Mutex::new(None),
        }
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Start connecting in the background. Does nothing if already running.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        tracing::debug!("Starting RCON session");
        *task = Some(tokio::spawn(Arc::clone(&self.shared).run()));
    }

    /// Stop reconnecting and polling, and close the connection.
    pub async fn stop(&self) {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        if let Err(e) = self.shared.transport.disconnect().await {
            tracing::warn!(error = %e, "Failed to close RCON connection");
        }
        self.shared.publish_state(RconState::Disconnected);
    }

    /// Whether the background task is running
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    pub fn state(&self) -> RconState {
        self.shared.transport.state()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.transport.is_connected()
    }

    /// Last known sorted player list
    pub fn players(&self) -> Vec<String> {
        self.shared
            .players
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.shared.transport
    }

    /// Send a raw console command.
    pub async fn send_command(&self, command: &str) -> Option<String> {
        self.shared.send(command).await
    }

    /// Send an [`AdminCommand`].
    pub async fn execute(&self, command: AdminCommand) -> Option<String> {
        tracing::debug!(command = command.description(), "Running admin command");
        self.shared.send(&command.build()).await
    }

    pub async fn save(&self) -> Option<String> {
        self.execute(AdminCommand::Save).await
    }

    pub async fn say(&self, message: &str) -> Option<String> {
        self.execute(AdminCommand::Say {
            message: message.to_string(),
        })
        .await
    }

    pub async fn kick(&self, player: &str) -> Option<String> {
        self.execute(AdminCommand::Kick {
            player: player.to_string(),
        })
        .await
    }

    pub async fn ban(&self, player: &str) -> Option<String> {
        self.execute(AdminCommand::Ban {
            player: player.to_string(),
        })
        .await
    }

    pub async fn unban(&self, player: &str) -> Option<String> {
        self.execute(AdminCommand::Unban {
            player: player.to_string(),
        })
        .await
    }

    pub async fn banned(&self) -> Option<String> {
        self.execute(AdminCommand::Banned).await
    }

    /// Fetch the player list now, bypassing the poll cache.
    pub async fn list_players(&self) -> Option<Vec<String>> {
        self.execute(AdminCommand::Players)
            .await
            .map(|response| parse_player_list(&response))
    }

    pub async fn trigger_event(&self, event: &str) -> Option<String> {
        self.execute(AdminCommand::TriggerEvent {
            event: event.to_string(),
        })
        .await
    }

    pub async fn stop_event(&self) -> Option<String> {
        self.execute(AdminCommand::StopEvent).await
    }

    pub async fn skip_time(&self, seconds: u64) -> Option<String> {
        self.execute(AdminCommand::SkipTime { seconds }).await
    }

    pub async fn sleep(&self) -> Option<String> {
        self.execute(AdminCommand::Sleep).await
    }

    pub async fn set_key(&self, key: &str) -> Option<String> {
        self.execute(AdminCommand::SetKey {
            key: key.to_string(),
        })
        .await
    }

    pub async fn remove_key(&self, key: &str) -> Option<String> {
        self.execute(AdminCommand::RemoveKey {
            key: key.to_string(),
        })
        .await
    }

    pub async fn reset_keys(&self) -> Option<String> {
        self.execute(AdminCommand::ResetKeys).await
    }

    pub async fn list_keys(&self) -> Option<String> {
        self.execute(AdminCommand::ListKeys).await
    }

    pub async fn remove_drops(&self) -> Option<String> {
        self.execute(AdminCommand::RemoveDrops).await
    }
}

impl<T: Transport + 'static> Drop for RconSession<T> {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }
}
