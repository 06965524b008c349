use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Launch parameters for one Valheim dedicated server instance.
///
/// This is produced by the surrounding CLI/config layer and is immutable for
/// the lifetime of a process instance. A watchdog restart clones it into a
/// fresh [`ServerProcess`](crate::server::ServerProcess).
///
/// # Examples
///
/// ```
/// use valheim_runner::config::ServerLaunchConfig;
///
/// let config = ServerLaunchConfig::new("Viking Hall", 2456, "Midgard", "hunter22");
/// let args = config.command_args();
/// assert!(args.contains(&"-world".to_string()));
/// assert!(args.contains(&"Midgard".to_string()));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerLaunchConfig {
    /// Server name shown in the server browser.
    pub name: String,
    /// Game port. Valheim also uses `port + 1` for Steam queries.
    pub port: u16,
    /// World name (save file stem).
    pub world: String,
    /// Join password.
    pub password: String,
    /// List the server in the public browser.
    #[serde(default)]
    pub public: bool,
    /// Enable PlayFab crossplay.
    #[serde(default)]
    pub crossplay: bool,
    /// Override for the save directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub savedir: Option<PathBuf>,
    /// Ask the server itself to write its log to this file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    /// Autosave interval in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saveinterval: Option<u32>,
    /// Number of world backups to keep.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backups: Option<u32>,
    /// Run the server detached so it outlives the supervisor.
    #[serde(default)]
    pub detached: bool,
}

impl ServerLaunchConfig {
    /// Create a config with the required fields and defaults for the rest.
    pub fn new(
        name: impl Into<String>,
        port: u16,
        world: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            port,
            world: world.into(),
            password: password.into(),
            public: false,
            crossplay: false,
            savedir: None,
            log_file: None,
            saveinterval: None,
            backups: None,
            detached: false,
        }
    }

    /// Build the dedicated server argument vector.
    pub fn command_args(&self) -> Vec<String> {
        let mut args = vec![
            "-nographics".to_string(),
            "-batchmode".to_string(),
            "-name".to_string(),
            self.name.clone(),
            "-port".to_string(),
            self.port.to_string(),
            "-world".to_string(),
            self.world.clone(),
            "-password".to_string(),
            self.password.clone(),
            "-public".to_string(),
            if self.public { "1" } else { "0" }.to_string(),
        ];

        if self.crossplay {
            args.push("-crossplay".to_string());
        }
        if let Some(savedir) = &self.savedir {
            args.push("-savedir".to_string());
            args.push(savedir.display().to_string());
        }
        if let Some(log_file) = &self.log_file {
            args.push("-logFile".to_string());
            args.push(log_file.display().to_string());
        }
        if let Some(interval) = self.saveinterval {
            args.push("-saveinterval".to_string());
            args.push(interval.to_string());
        }
        if let Some(backups) = self.backups {
            args.push("-backups".to_string());
            args.push(backups.to_string());
        }

        args
    }
}

/// Restart policy for the [`Watchdog`](crate::server::Watchdog).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WatchdogConfig {
    /// Restart crashed servers automatically.
    pub enabled: bool,
    /// Restarts allowed within one cooldown window before giving up.
    pub max_restarts: u32,
    /// Delay before the first restart.
    #[serde(with = "duration_ms")]
    pub restart_delay: Duration,
    /// Factor applied to the delay for each consecutive crash.
    pub backoff_multiplier: f64,
    /// Quiet period after which the crash counter resets.
    #[serde(with = "duration_ms")]
    pub cooldown_period: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_restarts: 5,
            restart_delay: Duration::from_millis(5_000),
            backoff_multiplier: 2.0,
            cooldown_period: Duration::from_millis(300_000),
        }
    }
}

/// Connection parameters for one RCON client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RconConfig {
    /// Host running the RCON listener.
    pub host: String,
    /// RCON port.
    pub port: u16,
    /// RCON password.
    pub password: String,
    /// Timeout for connecting, authenticating and each command.
    #[serde(default = "default_rcon_timeout", with = "duration_ms")]
    pub timeout: Duration,
}

fn default_rcon_timeout() -> Duration {
    Duration::from_millis(5_000)
}

impl RconConfig {
    /// Create a config with the default timeout.
    pub fn new(host: impl Into<String>, port: u16, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            password: password.into(),
            timeout: default_rcon_timeout(),
        }
    }

    /// `host:port` string for socket connection and logging.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Behaviour of the persistent [`RconSession`](crate::session::RconSession).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RconSessionConfig {
    /// Reconnect delay unit; attempt `n` waits `n * reconnect_base_delay`.
    #[serde(with = "duration_ms")]
    pub reconnect_base_delay: Duration,
    /// Consecutive failed connects before the session gives up.
    pub max_reconnect_attempts: u32,
    /// Interval between player list polls.
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// Command whose response lists online players.
    pub status_command: String,
}

impl Default for RconSessionConfig {
    fn default() -> Self {
        Self {
            reconnect_base_delay: Duration::from_millis(5_000),
            max_reconnect_attempts: 10,
            poll_interval: Duration::from_millis(30_000),
            status_command: "players".to_string(),
        }
    }
}

/// Main configuration for the Valheim Runner.
///
/// # JSON Schema
///
/// ```json
/// {
///   "server": {
///     "name": "Viking Hall",
///     "port": 2456,
///     "world": "Midgard",
///     "password": "hunter22",
///     "public": true,
///     "crossplay": false,
///     "saveinterval": 1800,
///     "detached": false
///   },
///   "watchdog": { "maxRestarts": 5, "restartDelay": 5000 },
///   "rcon": { "host": "127.0.0.1", "port": 25575, "password": "secret" }
/// }
/// ```
///
/// # Examples
///
/// ```
/// use valheim_runner::config::Config;
///
/// let config = Config::parse_from_str(r#"{
///     "server": { "name": "Hall", "port": 2456, "world": "Midgard", "password": "secret1" }
/// }"#).unwrap();
/// assert!(config.watchdog.enabled);
/// assert!(config.rcon.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Launch parameters of the supervised server.
    pub server: ServerLaunchConfig,
    /// Crash restart policy.
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    /// RCON endpoint, if the server has an RCON listener.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rcon: Option<RconConfig>,
    /// Persistent RCON session behaviour.
    #[serde(default)]
    pub session: RconSessionConfig,
}

impl Config {
    /// Loads a configuration from a file path.
    ///
    /// Files ending in `.yaml` or `.yml` are parsed as YAML, everything else
    /// as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// * The file cannot be read
    /// * The file contents are not valid JSON/YAML
    /// * The document does not conform to the expected schema
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigParse(format!("Failed to read config file: {}", e)))?;

        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
            .unwrap_or(false);

        if is_yaml {
            Self::parse_from_yaml_str(&content)
        } else {
            Self::parse_from_str(&content)
        }
    }

    /// Parses a configuration from a JSON string.
    pub fn parse_from_str(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| Error::ConfigParse(format!("Failed to parse JSON config: {}", e)))
    }

    /// Parses a configuration from a YAML string.
    pub fn parse_from_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| Error::ConfigParse(format!("Failed to parse YAML config: {}", e)))
    }
}

/// Serde adapter storing a `Duration` as integer milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
