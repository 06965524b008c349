//! RCON transport.
//!
//! [`RconClient`] speaks the Source RCON protocol over one TCP connection.
//! The [`Transport`] trait is the seam the session manager is written
//! against, so it can be driven by a mock in tests.

pub mod packet;
pub mod pending;
mod rcon;

pub use packet::{PacketBuffer, RconPacket};
pub use pending::{PendingRequests, PendingResponse};
pub use rcon::RconClient;

use crate::error::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;

/// Connection state of an RCON client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RconState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    /// A connect or authentication attempt failed; the client is torn down
    /// to `Disconnected` right after.
    Error,
}

impl fmt::Display for RconState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RconState::Disconnected => "disconnected",
            RconState::Connecting => "connecting",
            RconState::Authenticating => "authenticating",
            RconState::Connected => "connected",
            RconState::Error => "error",
        };
        f.write_str(label)
    }
}

/// Command/response channel to a game server's admin console.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the connection and authenticate.
    async fn connect(&self) -> Result<()>;

    /// Run a console command and return its output.
    async fn send(&self, command: &str) -> Result<String>;

    /// Close the connection. Idempotent.
    async fn disconnect(&self) -> Result<()>;

    /// Current connection state.
    fn state(&self) -> RconState;

    fn is_connected(&self) -> bool {
        self.state() == RconState::Connected
    }
}
