//! Classification of dedicated server log lines.
//!
//! [`parse_log_line`] is a pure function: it looks at one line of server
//! output and returns at most one [`ParsedEvent`]. Rules are tried in a
//! fixed order and the first match wins.
//!
//! Player departures are not detected. The server only logs the socket
//! that closed, not the character behind it, so [`ParsedEvent::PlayerLeave`]
//! exists for consumers that learn about departures elsewhere (e.g. RCON
//! player list diffs) but is never produced here.

use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::LazyLock;

/// Milestones between process start and the server accepting players.
///
/// `LoadingWorld` and `GeneratingWorld` are alternatives at the same point
/// in the sequence; use [`StartupPhase::rank`] to compare progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupPhase {
    Initializing,
    LoadingWorld,
    GeneratingWorld,
    CreatingLocations,
    StartingServer,
    RegisteringLobby,
    Ready,
}

impl StartupPhase {
    /// Position in the startup sequence.
    pub fn rank(self) -> u8 {
        match self {
            StartupPhase::Initializing => 0,
            StartupPhase::LoadingWorld | StartupPhase::GeneratingWorld => 1,
            StartupPhase::CreatingLocations => 2,
            StartupPhase::StartingServer => 3,
            StartupPhase::RegisteringLobby => 4,
            StartupPhase::Ready => 5,
        }
    }

    /// Human readable label for status displays.
    pub fn label(self) -> &'static str {
        match self {
            StartupPhase::Initializing => "Initializing",
            StartupPhase::LoadingWorld => "Loading world",
            StartupPhase::GeneratingWorld => "Generating world",
            StartupPhase::CreatingLocations => "Creating locations",
            StartupPhase::StartingServer => "Starting server",
            StartupPhase::RegisteringLobby => "Registering lobby",
            StartupPhase::Ready => "Ready",
        }
    }
}

impl fmt::Display for StartupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Structured event recognised in a log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParsedEvent {
    PlayerJoin { name: String },
    PlayerLeave { name: String },
    WorldSaved,
    WorldGenerated,
    ServerReady,
    ServerShutdown,
    Error { message: String },
    StartupPhase { phase: StartupPhase },
}

// "Got character ZDOID from Ragnar : -142398:1". A zero user id is logged
// when a character dies and respawns, which is not a join.
static PLAYER_JOIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Got character ZDOID from (.+?) : (-?\d+):-?\d+")
        .expect("Invalid player join regex")
});

static WORLD_SAVED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"World saved \(").expect("Invalid world saved regex"));

static WORLD_GENERATED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)Done generating locations").expect("Invalid world generated regex")
});

static SERVER_READY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Game server connected").expect("Invalid server ready regex"));

static SERVER_SHUTDOWN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"OnApplicationQuit|Shut(?:t)?ing down").expect("Invalid shutdown regex")
});

static PHASE_RULES: LazyLock<Vec<(Regex, StartupPhase)>> = LazyLock::new(|| {
    [
        (
            r"Initialize engine version|Starting Valheim",
            StartupPhase::Initializing,
        ),
        (r"Load world: ", StartupPhase::LoadingWorld),
        (
            r"(?i)Generating new world|World does not exist",
            StartupPhase::GeneratingWorld,
        ),
        (
            r"(?i)(?:Generating|Placing) locations",
            StartupPhase::CreatingLocations,
        ),
        (
            r"(?i)Starting server|Opened Steam server",
            StartupPhase::StartingServer,
        ),
        (
            r"(?i)Registering lobby|Session .* is active",
            StartupPhase::RegisteringLobby,
        ),
    ]
    .into_iter()
    .map(|(pattern, phase)| (Regex::new(pattern).expect("Invalid startup phase regex"), phase))
    .collect()
});

static ERROR_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:\[Error\s*:?|Error:)|\w+Exception:").expect("Invalid error regex")
});

/// Classify one line of server output.
///
/// Returns `None` for lines that carry no event, including blank lines.
///
/// # Examples
///
/// ```
/// use valheim_runner::server::{parse_log_line, ParsedEvent};
///
/// let event = parse_log_line("02/19/2024 13:37:01: Got character ZDOID from Ragnar : -142398:1");
/// assert_eq!(event, Some(ParsedEvent::PlayerJoin { name: "Ragnar".to_string() }));
/// assert_eq!(parse_log_line(""), None);
/// ```
pub fn parse_log_line(line: &str) -> Option<ParsedEvent> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return None;
    }

    if let Some(caps) = PLAYER_JOIN.captures(line) {
        let user_id = caps.get(2).map(|m| m.as_str()).unwrap_or("0");
        if user_id == "0" {
            return None;
        }
        let name = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
        return Some(ParsedEvent::PlayerJoin {
            name: name.to_string(),
        });
    }

    if WORLD_SAVED.is_match(line) {
        return Some(ParsedEvent::WorldSaved);
    }

    if WORLD_GENERATED.is_match(line) {
        return Some(ParsedEvent::WorldGenerated);
    }

    if SERVER_READY.is_match(line) {
        return Some(ParsedEvent::ServerReady);
    }

    if SERVER_SHUTDOWN.is_match(line) {
        return Some(ParsedEvent::ServerShutdown);
    }

    for (pattern, phase) in PHASE_RULES.iter() {
        if pattern.is_match(line) {
            return Some(ParsedEvent::StartupPhase { phase: *phase });
        }
    }

    if ERROR_LINE.is_match(line) {
        return Some(ParsedEvent::Error {
            message: line.trim().to_string(),
        });
    }

    None
}
