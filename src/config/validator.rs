use crate::config::{Config, RconConfig, ServerLaunchConfig, WatchdogConfig};
use crate::error::{Error, Result};

/// Minimum password length accepted by the dedicated server.
pub const MIN_PASSWORD_LEN: usize = 5;

/// Validates a server launch configuration
///
/// The dedicated server refuses to start with a short password or one that
/// appears inside the server name, and it exits immediately instead of
/// logging a useful error, so those rules are checked up front.
pub fn validate_launch_config(config: &ServerLaunchConfig) -> Result<()> {
    if config.name.trim().is_empty() {
        return Err(Error::ConfigInvalid("Server name is empty".to_string()));
    }

    if config.world.trim().is_empty() {
        return Err(Error::ConfigInvalid("World name is empty".to_string()));
    }

    if config.port == 0 {
        return Err(Error::ConfigInvalid("Server port must be non-zero".to_string()));
    }

    if config.password.chars().count() < MIN_PASSWORD_LEN {
        return Err(Error::ConfigInvalid(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }

    if config.name.contains(&config.password) {
        return Err(Error::ConfigInvalid(
            "Password must not be part of the server name".to_string(),
        ));
    }

    Ok(())
}

/// Validates watchdog settings
pub fn validate_watchdog_config(config: &WatchdogConfig) -> Result<()> {
    if !config.backoff_multiplier.is_finite() || config.backoff_multiplier < 1.0 {
        return Err(Error::ConfigInvalid(format!(
            "Backoff multiplier must be >= 1, got {}",
            config.backoff_multiplier
        )));
    }

    Ok(())
}

/// Validates RCON connection settings
pub fn validate_rcon_config(config: &RconConfig) -> Result<()> {
    if config.host.trim().is_empty() {
        return Err(Error::ConfigInvalid("RCON host is empty".to_string()));
    }

    if config.port == 0 {
        return Err(Error::ConfigInvalid("RCON port must be non-zero".to_string()));
    }

    Ok(())
}

/// Full configuration validation
pub fn validate_config(config: &Config) -> Result<()> {
    validate_launch_config(&config.server)?;
    validate_watchdog_config(&config.watchdog)?;

    if let Some(rcon) = &config.rcon {
        validate_rcon_config(rcon)?;
    }

    Ok(())
}
