// lobbybot-core/src/party/mod.rs

pub mod sync;

pub use sync::PartySynchronizer;
