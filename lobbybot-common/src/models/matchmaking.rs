// lobbybot-common/src/models/matchmaking.rs

use serde::{Deserialize, Serialize};

/// One entry from the "find player in match" lookup. An empty result list
/// means the player is not currently in any tracked match; `started: None`
/// means the match exists but has not reported a start state yet.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct MatchResult {
    pub started: Option<bool>,
    pub public_players: Vec<String>,
}

/// Signal observed on a short-lived matchmaking ticket session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TicketSignal {
    /// The backend told the party to enter the match; the session is done.
    Play,
    Other(String),
}
