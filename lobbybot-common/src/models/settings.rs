// lobbybot-common/src/models/settings.rs

use serde::{Deserialize, Serialize};

/// Per-account automation flags, persisted by the settings collaborator
/// as a JSON list keyed by account id.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AutomationSetting {
    pub account_id: String,
    pub auto_kick: bool,
    pub auto_claim: bool,
    pub auto_transfer: bool,
    pub auto_invite: bool,
    /// Seconds between match-state polls; engine default applies when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mission_check_interval_secs: Option<u64>,
}

impl AutomationSetting {
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            ..Default::default()
        }
    }

    /// True when at least one automation flag is on. Accounts with no
    /// enabled flag are dropped at startup and their poll loops tear
    /// themselves down.
    pub fn any_enabled(&self) -> bool {
        self.auto_kick || self.auto_claim || self.auto_transfer || self.auto_invite
    }
}

/// Sparse settings update; unset fields keep their current value.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AutomationSettingUpdate {
    pub auto_kick: Option<bool>,
    pub auto_claim: Option<bool>,
    pub auto_transfer: Option<bool>,
    pub auto_invite: Option<bool>,
    pub mission_check_interval_secs: Option<u64>,
}

impl AutomationSettingUpdate {
    pub fn apply(&self, setting: &mut AutomationSetting) {
        if let Some(v) = self.auto_kick {
            setting.auto_kick = v;
        }
        if let Some(v) = self.auto_claim {
            setting.auto_claim = v;
        }
        if let Some(v) = self.auto_transfer {
            setting.auto_transfer = v;
        }
        if let Some(v) = self.auto_invite {
            setting.auto_invite = v;
        }
        if let Some(v) = self.mission_check_interval_secs {
            setting.mission_check_interval_secs = Some(v);
        }
    }
}
