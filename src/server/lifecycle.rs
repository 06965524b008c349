use crate::server::ServerId;
use crate::server::log_parser::ParsedEvent;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;

/// Lifecycle state of a supervised server process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// No process is running
    Offline,
    /// Process spawned, server not yet accepting players
    Starting,
    /// Server reported that it is ready
    Online,
    /// Graceful termination in progress
    Stopping,
    /// Process failed to spawn or exited while it was expected to run
    Crashed,
}

impl ProcessState {
    /// Whether a new process may be started from this state.
    pub fn can_start(self) -> bool {
        matches!(self, ProcessState::Offline | ProcessState::Crashed)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProcessState::Offline => "offline",
            ProcessState::Starting => "starting",
            ProcessState::Online => "online",
            ProcessState::Stopping => "stopping",
            ProcessState::Crashed => "crashed",
        };
        f.write_str(label)
    }
}

/// Which stream a log line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
    /// Tailed from a log file (detached or attached processes)
    LogFile,
}

/// Server lifecycle event types
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEventKind {
    /// The process monitor changed state
    StateChanged { state: ProcessState },
    /// A complete line of server output
    Log { line: String, stream: OutputStream },
    /// A character entered the world
    PlayerJoined { name: String },
    /// A character left the world
    PlayerLeft { name: String },
    /// A process-level failure, reported instead of returned
    Error { message: String },
    /// Any event recognised by the log parser
    Parsed { event: ParsedEvent },
    /// The watchdog scheduled a restart after a crash
    WatchdogRestart {
        attempt: u32,
        max: u32,
        #[serde(with = "delay_ms")]
        delay: Duration,
    },
    /// The watchdog reached its restart ceiling and stopped
    WatchdogGaveUp { attempts: u32 },
}

/// Server lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerEvent {
    /// Process instance that produced the event
    pub server_id: ServerId,
    /// Event payload
    #[serde(flatten)]
    pub kind: ServerEventKind,
}

/// Sending half of the event channel shared by a process monitor and its
/// helpers. Sends never fail from the producer's point of view; a dropped
/// receiver just means nobody is listening any more.
#[derive(Debug, Clone)]
pub struct EventSender {
    server_id: ServerId,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

impl EventSender {
    pub(crate) fn new(server_id: ServerId, tx: mpsc::UnboundedSender<ServerEvent>) -> Self {
        Self { server_id, tx }
    }

    pub(crate) fn server_id(&self) -> ServerId {
        self.server_id
    }

    pub(crate) fn emit(&self, kind: ServerEventKind) {
        let event = ServerEvent {
            server_id: self.server_id,
            kind,
        };
        if self.tx.send(event).is_err() {
            tracing::trace!(server_id = %self.server_id, "Event receiver dropped");
        }
    }

    pub(crate) fn error(&self, message: impl Into<String>) {
        self.emit(ServerEventKind::Error {
            message: message.into(),
        });
    }
}

mod delay_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}
