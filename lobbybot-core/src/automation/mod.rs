// lobbybot-core/src/automation/mod.rs

use std::sync::Arc;

use tokio::time::Duration;

use lobbybot_common::traits::{
    AccountStore, FriendsApi, MatchmakingApi, PartyApi, RewardsApi, SettingsStore, TicketFactory,
};

pub mod bot_lobby;
pub mod engine;
pub mod mission;
pub mod taxi;

pub use bot_lobby::{BotLobbyConfig, BotLobbyService};
pub use engine::{AutomationAccount, AutomationEngine};
pub use mission::{MatchmakingState, MissionMonitor, PartyPhase};
pub use taxi::{TaxiConfig, TaxiService};

pub const PURPOSE_AUTO_KICK: &str = "auto-kick";
pub const PURPOSE_TAXI: &str = "taxi";
pub const PURPOSE_BOT_LOBBY: &str = "bot-lobby";

/// Default interval between match-state polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Delay before an armed mission checker starts polling.
pub const SCHEDULE_DELAY: Duration = Duration::from_secs(10);
/// Longer arming delay used right after the account re-joins a party.
pub const REJOIN_SCHEDULE_DELAY: Duration = Duration::from_secs(20);
/// How long auto-invite waits for the account's own re-join event.
pub const INVITE_JOIN_WAIT: Duration = Duration::from_secs(20);
/// Settle time between re-joining a party and sending invites.
pub const POST_JOIN_COOLDOWN: Duration = Duration::from_secs(1);

// Well-known party meta keys.
pub const PARTY_STATE_KEY: &str = "Default:PartyState_s";
pub const PACKED_STATE_KEY: &str = "Default:PackedState_j";
pub const LOBBY_STATE_KEY: &str = "Default:LobbyState_j";
pub const READY_CHECK_KEY: &str = "Default:CreativeInGameReadyCheckStatus_s";
pub const FORT_STATS_KEY: &str = "Default:FORTStats_j";
pub const POST_MATCHMAKING_STATE: &str = "PostMatchmaking";

/// External collaborators shared by the engine and its variants.
#[derive(Clone)]
pub struct Services {
    pub party: Arc<dyn PartyApi>,
    pub matchmaking: Arc<dyn MatchmakingApi>,
    pub rewards: Arc<dyn RewardsApi>,
    pub friends: Arc<dyn FriendsApi>,
    pub accounts: Arc<dyn AccountStore>,
    pub settings: Arc<dyn SettingsStore>,
    pub tickets: Arc<dyn TicketFactory>,
}

/// Extract the reported location from a packed member-state blob.
pub(crate) fn packed_location(raw: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    value
        .get("PackedState")?
        .get("location")?
        .as_str()
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_location_reads_nested_field() {
        let raw = r#"{"PackedState":{"location":"InGame","subLocation":""}}"#;
        assert_eq!(packed_location(raw).as_deref(), Some("InGame"));
    }

    #[test]
    fn packed_location_tolerates_garbage() {
        assert_eq!(packed_location("not json"), None);
        assert_eq!(packed_location("{}"), None);
        assert_eq!(packed_location(r#"{"PackedState":{}}"#), None);
    }
}

