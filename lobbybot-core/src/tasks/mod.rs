// lobbybot-core/src/tasks/mod.rs

pub mod autostart;
pub mod token_refresh;
