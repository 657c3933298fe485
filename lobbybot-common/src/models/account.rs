// lobbybot-common/src/models/account.rs

use std::fmt;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One managed game account. Immutable once loaded from the account store.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
pub struct AccountIdentity {
    pub account_id: String,
    pub display_name: String,
}

/// Bearer token returned by the token supplier.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AccessToken {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    pub fn expires_within(&self, duration: chrono::Duration) -> bool {
        self.expires_at <= Utc::now() + duration
    }
}

/// User-visible connection status of an automated account, always
/// reflecting the connection manager's view.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountStatus {
    Loading,
    Active,
    InvalidCredentials,
    Disconnected,
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountStatus::Loading => write!(f, "LOADING"),
            AccountStatus::Active => write!(f, "ACTIVE"),
            AccountStatus::InvalidCredentials => write!(f, "INVALID_CREDENTIALS"),
            AccountStatus::Disconnected => write!(f, "DISCONNECTED"),
        }
    }
}
