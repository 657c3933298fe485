// lobbybot-core/src/utils/mod.rs

pub mod backoff;

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber with env-filter support.
/// Intended for the host application's entrypoint; safe to call once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
