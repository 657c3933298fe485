// lobbybot-common/src/models/mod.rs

pub mod account;
pub mod matchmaking;
pub mod party;
pub mod settings;

pub use account::{AccessToken, AccountIdentity, AccountStatus};
pub use matchmaking::{MatchResult, TicketSignal};
pub use party::{MemberRole, PartyConfig, PartyMember, PartySnapshot};
pub use settings::{AutomationSetting, AutomationSettingUpdate};
