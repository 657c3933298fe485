// lobbybot-core/src/lib.rs

pub mod api;
pub mod automation;
pub mod connection;
pub mod party;
pub mod stream;
pub mod tasks;
pub mod utils;

pub use lobbybot_common::error::Error;
