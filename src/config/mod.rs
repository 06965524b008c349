//! Configuration module for Valheim Runner.
//!
//! This module holds the launch parameters of the supervised server, the
//! watchdog restart policy and the RCON connection settings. Configurations
//! can be built programmatically or loaded from JSON/YAML files.
//!
//! # Examples
//!
//! Loading a configuration from a file:
//!
//! ```no_run
//! use valheim_runner::config::Config;
//!
//! let config = Config::from_file("valheim.json").unwrap();
//! println!("Supervising world {}", config.server.world);
//! ```
//!
//! Creating a configuration programmatically:
//!
//! ```
//! use valheim_runner::config::{Config, ServerLaunchConfig, validate_config};
//!
//! let config = Config {
//!     server: ServerLaunchConfig::new("Viking Hall", 2456, "Midgard", "hunter22"),
//!     watchdog: Default::default(),
//!     rcon: None,
//!     session: Default::default(),
//! };
//! validate_config(&config).unwrap();
//! ```
mod parser;
pub mod validator;

pub use parser::{Config, RconConfig, RconSessionConfig, ServerLaunchConfig, WatchdogConfig};
pub use validator::validate_config;
