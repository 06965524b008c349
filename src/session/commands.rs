//! Console commands understood by the Valheim RCON plugin.

/// Administrative command sent through an RCON session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    /// Save the world now
    Save,
    /// Broadcast a chat message
    Say { message: String },
    /// Kick a player by name or Steam id
    Kick { player: String },
    /// Ban a player by name or Steam id
    Ban { player: String },
    /// Lift a ban
    Unban { player: String },
    /// List banned players
    Banned,
    /// List online players
    Players,
    /// Start a raid event
    TriggerEvent { event: String },
    /// End the running raid event
    StopEvent,
    /// Advance the clock
    SkipTime { seconds: u64 },
    /// Skip to the next morning
    Sleep,
    /// Set a global key (boss progression)
    SetKey { key: String },
    /// Remove a global key
    RemoveKey { key: String },
    /// Clear all global keys
    ResetKeys,
    /// List global keys
    ListKeys,
    /// Remove dropped items from the world
    RemoveDrops,
}

impl AdminCommand {
    /// Build the console line
    pub fn build(&self) -> String {
        match self {
            AdminCommand::Save => "save".to_string(),
            AdminCommand::Say { message } => format!("say {}", single_line(message)),
            AdminCommand::Kick { player } => format!("kick {}", single_line(player)),
            AdminCommand::Ban { player } => format!("ban {}", single_line(player)),
            AdminCommand::Unban { player } => format!("unban {}", single_line(player)),
            AdminCommand::Banned => "banned".to_string(),
            AdminCommand::Players => "players".to_string(),
            AdminCommand::TriggerEvent { event } => format!("event {}", single_line(event)),
            AdminCommand::StopEvent => "stopevent".to_string(),
            AdminCommand::SkipTime { seconds } => format!("skiptime {}", seconds),
            AdminCommand::Sleep => "sleep".to_string(),
            AdminCommand::SetKey { key } => format!("setkey {}", single_line(key)),
            AdminCommand::RemoveKey { key } => format!("removekey {}", single_line(key)),
            AdminCommand::ResetKeys => "resetkeys".to_string(),
            AdminCommand::ListKeys => "listkeys".to_string(),
            AdminCommand::RemoveDrops => "removedrops".to_string(),
        }
    }

    /// Get a human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            AdminCommand::Save => "save world",
            AdminCommand::Say { .. } => "broadcast message",
            AdminCommand::Kick { .. } => "kick player",
            AdminCommand::Ban { .. } => "ban player",
            AdminCommand::Unban { .. } => "unban player",
            AdminCommand::Banned => "list bans",
            AdminCommand::Players => "list players",
            AdminCommand::TriggerEvent { .. } => "trigger event",
            AdminCommand::StopEvent => "stop event",
            AdminCommand::SkipTime { .. } => "skip time",
            AdminCommand::Sleep => "sleep",
            AdminCommand::SetKey { .. } => "set global key",
            AdminCommand::RemoveKey { .. } => "remove global key",
            AdminCommand::ResetKeys => "reset global keys",
            AdminCommand::ListKeys => "list global keys",
            AdminCommand::RemoveDrops => "remove drops",
        }
    }
}

// A newline would end the console line early and run the rest as a
// second command.
fn single_line(arg: &str) -> String {
    arg.replace(['\r', '\n'], " ").trim().to_string()
}
