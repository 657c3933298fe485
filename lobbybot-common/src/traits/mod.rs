// lobbybot-common/src/traits/mod.rs

pub mod collaborators;

pub use collaborators::{
    AccountStore, FriendsApi, MatchmakingApi, PartyApi, RewardsApi, SettingsStore,
    TicketConnection, TicketFactory, TokenSupplier,
};
