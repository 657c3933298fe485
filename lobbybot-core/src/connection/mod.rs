// lobbybot-core/src/connection/mod.rs

use tokio::time::Duration;

pub mod manager;

pub use manager::{ConnectionHandle, ConnectionManager};

/// How long a single connect attempt may take before it is abandoned.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Interval at which an installed presence status is resent so the
/// backend does not let it lapse.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
