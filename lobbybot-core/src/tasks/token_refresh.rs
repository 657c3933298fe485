// lobbybot-core/src/tasks/token_refresh.rs

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{error, info};

use lobbybot_common::traits::{AccountStore, TokenSupplier};

use crate::Error;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(600);

/// Checks every known account for a token that will expire within
/// `within` and forces a refresh for each. Returns Ok(()) even when some
/// refreshes fail (logs the errors).
pub async fn refresh_expiring_tokens(
    accounts: &dyn AccountStore,
    tokens: &dyn TokenSupplier,
    within: chrono::Duration,
) -> Result<(), Error> {
    let all = accounts.all_accounts().await?;

    let mut refreshed = 0u32;
    for account in &all {
        let current = match tokens.get_token(account, true).await {
            Ok(token) => token,
            Err(e) => {
                error!(account = %account.account_id, error = %e, "token lookup failed");
                continue;
            }
        };
        if !current.expires_within(within) {
            continue;
        }

        match tokens.get_token(account, false).await {
            Ok(_) => {
                refreshed += 1;
                info!(account = %account.account_id, "refreshed expiring token");
            }
            Err(e) => {
                error!(account = %account.account_id, error = %e, "token refresh failed");
            }
        }
    }

    if refreshed > 0 {
        info!("Refreshed {} expiring token(s)", refreshed);
    }
    Ok(())
}

/// Spawn the recurring refresh sweep.
pub fn spawn_token_refresh(
    accounts: Arc<dyn AccountStore>,
    tokens: Arc<dyn TokenSupplier>,
    within: chrono::Duration,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            if let Err(e) = refresh_expiring_tokens(accounts.as_ref(), tokens.as_ref(), within).await
            {
                error!(error = %e, "token refresh sweep failed");
            }
        }
    })
}
