// lobbybot-core/src/tasks/autostart.rs

use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{error, info, warn};

use lobbybot_common::models::AutomationSetting;

use crate::automation::{AutomationEngine, Services};
use crate::Error;

/// Called at startup to load persisted automation settings and start every
/// account that still exists and has at least one flag enabled. Records
/// whose account is gone, or with nothing enabled, are dropped and the
/// pruned list is written back.
pub async fn run_autostart(
    engine: &Arc<AutomationEngine>,
    services: &Services,
) -> Result<(), Error> {
    let persisted = services.settings.load().await?;
    if persisted.is_empty() {
        info!("No automation settings persisted. Skipping autostart.");
        return Ok(());
    }

    let accounts = services.accounts.all_accounts().await?;

    let mut kept = Vec::new();
    for setting in persisted {
        let Some(account) = accounts
            .iter()
            .find(|a| a.account_id == setting.account_id)
        else {
            info!(
                account = %setting.account_id,
                "dropping automation record for a removed account"
            );
            continue;
        };
        if !setting.any_enabled() {
            info!(
                account = %setting.account_id,
                "dropping automation record with nothing enabled"
            );
            continue;
        }
        kept.push((account.clone(), setting));
    }

    let kept_settings: Vec<AutomationSetting> = kept.iter().map(|(_, s)| s.clone()).collect();
    if let Err(e) = services.settings.save(&kept_settings).await {
        warn!(error = %e, "failed to write pruned automation settings back");
    }

    info!("Autostarting automation for {} account(s)", kept.len());

    // Best-effort: one account failing to start never blocks the others.
    let starts = kept.into_iter().map(|(account, setting)| {
        let engine = engine.clone();
        async move {
            if let Err(e) = engine.start(account.clone(), setting).await {
                error!(
                    account = %account.account_id,
                    error = %e,
                    "autostart failed for account"
                );
            }
        }
    });
    join_all(starts).await;

    Ok(())
}
