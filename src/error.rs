/// Error handling module for Valheim Runner.
///
/// This module defines the error types used throughout the library.
/// Process supervision failures are mostly reported as events rather than
/// returned, so the variants here are what callers see from one-shot
/// operations: starting a process, reading a PID file, connecting to RCON or
/// sending a command.
///
/// # Example
///
/// ```
/// use valheim_runner::error::{Error, Result};
///
/// fn handle_error(result: Result<String>) {
///     match result {
///         Ok(response) => println!("Server replied: {}", response),
///         Err(Error::AuthFailed) => println!("Wrong RCON password"),
///         Err(Error::Disconnected) => println!("RCON is not connected"),
///         Err(Error::Timeout(msg)) => println!("Command timed out: {}", msg),
///         Err(e) => println!("Other error [{}]: {}", e.code(), e),
///     }
/// }
/// ```
use thiserror::Error;

/// Errors that can occur in the valheim-runner library.
///
/// The enum is `Clone` because a single connection failure has to be
/// delivered to every request that was waiting on that connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Failed to parse configuration from a file or string.
    ///
    /// This error occurs when:
    /// - The configuration JSON or YAML is malformed
    /// - Required fields are missing
    /// - Field types are incorrect
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// Configuration parsed but contains values the server would reject.
    ///
    /// This error occurs when:
    /// - The server name or world name is empty
    /// - The password is too short or contained in the server name
    /// - Watchdog settings are out of range
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Error when starting, stopping, or signalling the server process.
    ///
    /// This error occurs when:
    /// - The executable cannot be spawned
    /// - A signal cannot be delivered
    /// - An operation is not valid for the process mode (e.g. detaching a
    ///   process that was not started detached)
    #[error("Server process error: {0}")]
    Process(String),

    /// The server is already running.
    ///
    /// This error occurs when:
    /// - Attempting to start a process monitor that is starting, online or stopping
    #[error("Already running")]
    AlreadyRunning,

    /// The server is not running.
    ///
    /// This error occurs when:
    /// - Attaching to a PID that no longer exists
    /// - Sending a control command to a supervisor that has shut down
    #[error("Not running")]
    NotRunning,

    /// Error reading or writing the PID file.
    #[error("PID file error: {0}")]
    PidFile(String),

    /// Generic I/O failure outside the categories above.
    #[error("I/O error: {0}")]
    Io(String),

    /// The TCP connection to the RCON port could not be established in time,
    /// or failed for a reason other than an explicit refusal.
    #[error("RCON connection failed: {0}")]
    ConnectionFailed(String),

    /// The RCON port actively refused the connection.
    #[error("RCON connection refused: {0}")]
    ConnectionRefused(String),

    /// The server rejected the RCON password.
    #[error("RCON authentication failed")]
    AuthFailed,

    /// Operation timed out.
    ///
    /// This error occurs when:
    /// - An RCON command receives no response within the configured timeout
    /// - The authentication handshake does not complete in time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The RCON connection is not open, or was closed while a request was pending.
    #[error("RCON disconnected")]
    Disconnected,

    /// The RCON byte stream could not be decoded. The connection is unusable
    /// after this error.
    #[error("RCON protocol error: {0}")]
    Protocol(String),

    /// An RCON command was rejected before being sent.
    ///
    /// This error occurs when:
    /// - The command body exceeds the protocol's size limit
    ///
    /// The connection stays usable.
    #[error("Invalid RCON command: {0}")]
    InvalidCommand(String),

    /// Error in serializing or deserializing data.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Any other error not covered by the above categories.
    #[error("Other error: {0}")]
    Other(String),
}

impl Error {
    /// Stable, upper-case error code suitable for logs and exit messages.
    pub fn code(&self) -> &'static str {
        match self {
            Error::ConfigParse(_) => "CONFIG_PARSE",
            Error::ConfigInvalid(_) => "CONFIG_INVALID",
            Error::Process(_) => "PROCESS_ERROR",
            Error::AlreadyRunning => "ALREADY_RUNNING",
            Error::NotRunning => "NOT_RUNNING",
            Error::PidFile(_) => "PID_FILE",
            Error::Io(_) => "IO_ERROR",
            Error::ConnectionFailed(_) => "CONNECTION_FAILED",
            Error::ConnectionRefused(_) => "CONNECTION_REFUSED",
            Error::AuthFailed => "AUTH_FAILED",
            Error::Timeout(_) => "TIMEOUT",
            Error::Disconnected => "DISCONNECTED",
            Error::Protocol(_) => "PROTOCOL_ERROR",
            Error::InvalidCommand(_) => "INVALID_COMMAND",
            Error::Serialization(_) => "SERIALIZATION",
            Error::Other(_) => "OTHER",
        }
    }

    /// Whether this error means the RCON connection is gone and a reconnect
    /// is required before further commands can succeed.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            Error::Disconnected
                | Error::Protocol(_)
                | Error::ConnectionFailed(_)
                | Error::ConnectionRefused(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

/// Result type for valheim-runner operations.
///
/// This is a convenience type alias for `std::result::Result` with the `Error` type
/// from this module.
pub type Result<T> = std::result::Result<T, Error>;
