//! Player names from the free-text `players` response.

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;

static HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(online players\b.*|players\s*(\(\d+\))?:?|\d+\s+players?\s+connected.*|no players\b.*)$")
        .expect("valid header regex")
});

const BULLETS: &[char] = &['-', '*', '•'];
const NAME_TERMINATORS: &[&str] = &[" (", " - ", "\t", ","];

/// Extract player names from a player list response.
///
/// Header lines such as `Online players (2):` are skipped, bullets are
/// stripped, and anything after the name (`Ragnar (76561198000000001)`,
/// `Ragnar - 42ms`) is dropped. Result is sorted and deduplicated.
pub fn parse_player_list(response: &str) -> Vec<String> {
    let names: BTreeSet<String> = response
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !HEADER.is_match(line))
        .filter_map(player_name)
        .collect();
    names.into_iter().collect()
}

fn player_name(line: &str) -> Option<String> {
    let line = line.trim_start_matches(BULLETS).trim();
    let end = NAME_TERMINATORS
        .iter()
        .filter_map(|terminator| line.find(terminator))
        .min()
        .unwrap_or(line.len());
    let name = line[..end].trim();
    (!name.is_empty()).then(|| name.to_string())
}

/// Players who appeared and disappeared between two sorted lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlayerDiff {
    pub joined: Vec<String>,
    pub left: Vec<String>,
}

impl PlayerDiff {
    pub fn between(previous: &[String], current: &[String]) -> Self {
        let before: BTreeSet<&String> = previous.iter().collect();
        let after: BTreeSet<&String> = current.iter().collect();
        Self {
            joined: after.difference(&before).map(|s| s.to_string()).collect(),
            left: before.difference(&after).map(|s| s.to_string()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.left.is_empty()
    }
}
