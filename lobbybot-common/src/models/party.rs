// lobbybot-common/src/models/party.rs

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberRole {
    Captain,
    Member,
}

impl fmt::Display for MemberRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberRole::Captain => write!(f, "CAPTAIN"),
            MemberRole::Member => write!(f, "MEMBER"),
        }
    }
}

impl FromStr for MemberRole {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "CAPTAIN" => Ok(MemberRole::Captain),
            "MEMBER" => Ok(MemberRole::Member),
            _ => Err(format!("Unknown member role: {}", s)),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PartyMember {
    pub account_id: String,
    pub display_name: Option<String>,
    pub role: MemberRole,
    #[serde(default)]
    pub meta: HashMap<String, String>,
    pub joined_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Party-level configuration mirrored from the backend.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct PartyConfig {
    pub party_type: Option<String>,
    pub sub_type: Option<String>,
    pub privacy: Option<String>,
    pub max_size: Option<u32>,
    pub invite_ttl: Option<i64>,
    pub intention_ttl: Option<i64>,
}

/// The locally cached, eventually-consistent view of one account's party.
///
/// `revision` only moves forward; deltas are applied in place and a
/// snapshot is replaced wholesale only by an authoritative re-fetch.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PartySnapshot {
    pub party_id: String,
    pub revision: i64,
    #[serde(default)]
    pub config: PartyConfig,
    #[serde(default)]
    pub meta: HashMap<String, String>,
    pub members: Vec<PartyMember>,
}

impl PartySnapshot {
    pub fn member(&self, account_id: &str) -> Option<&PartyMember> {
        self.members.iter().find(|m| m.account_id == account_id)
    }

    pub fn is_captain(&self, account_id: &str) -> bool {
        self.member(account_id)
            .map(|m| m.role == MemberRole::Captain)
            .unwrap_or(false)
    }

    /// Members other than the given account.
    pub fn other_member_ids(&self, account_id: &str) -> Vec<String> {
        self.members
            .iter()
            .filter(|m| m.account_id != account_id)
            .map(|m| m.account_id.clone())
            .collect()
    }
}
