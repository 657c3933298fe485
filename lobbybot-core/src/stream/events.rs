// lobbybot-core/src/stream/events.rs
//
// JSON envelope decode for inbound stream messages. Bodies carry a `type`
// discriminator plus a namespace; anything outside the game namespace or
// not sent by the trusted system sender is dropped before dispatch.

use std::collections::HashMap;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::trace;

/// Only messages from this sender are trusted as party notifications.
pub const TRUSTED_SENDER: &str = "xmpp-admin@prod.ol.epicgames.com";
pub const GAME_NAMESPACE: &str = "fortnite";

pub const MEMBER_CONNECTED: &str = "com.epicgames.social.party.notification.v0.MEMBER_CONNECTED";
pub const MEMBER_DISCONNECTED: &str =
    "com.epicgames.social.party.notification.v0.MEMBER_DISCONNECTED";
pub const MEMBER_EXPIRED: &str = "com.epicgames.social.party.notification.v0.MEMBER_EXPIRED";
pub const MEMBER_JOINED: &str = "com.epicgames.social.party.notification.v0.MEMBER_JOINED";
pub const MEMBER_KICKED: &str = "com.epicgames.social.party.notification.v0.MEMBER_KICKED";
pub const MEMBER_LEFT: &str = "com.epicgames.social.party.notification.v0.MEMBER_LEFT";
pub const MEMBER_STATE_UPDATED: &str =
    "com.epicgames.social.party.notification.v0.MEMBER_STATE_UPDATED";
pub const MEMBER_NEW_CAPTAIN: &str =
    "com.epicgames.social.party.notification.v0.MEMBER_NEW_CAPTAIN";
pub const PARTY_UPDATED: &str = "com.epicgames.social.party.notification.v0.PARTY_UPDATED";
pub const PARTY_PING: &str = "com.epicgames.social.party.notification.v0.PING";
pub const FRIEND_REQUEST: &str = "FRIENDSHIP_REQUEST";

/// Member-scoped party notification. The same payload shape covers joins,
/// leaves, kicks, expiries, state updates and captain promotion.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct MemberEvent {
    pub revision: i64,
    pub party_id: String,
    pub account_id: String,
    pub account_dn: Option<String>,
    pub member_state_removed: Vec<String>,
    pub member_state_updated: HashMap<String, String>,
    pub member_state_overridden: HashMap<String, String>,
    pub joined_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PartyUpdatedEvent {
    pub revision: i64,
    pub party_id: String,
    pub captain_id: String,
    pub party_state_removed: Vec<String>,
    pub party_state_updated: HashMap<String, String>,
    pub party_state_overridden: HashMap<String, String>,
    pub party_type: Option<String>,
    pub party_sub_type: Option<String>,
    pub party_privacy_type: Option<String>,
    pub max_number_of_members: Option<u32>,
    pub invite_ttl_seconds: Option<i64>,
    pub intention_ttl_seconds: Option<i64>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Party invite ping.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PartyInviteEvent {
    pub pinger_id: String,
    pub pinger_dn: Option<String>,
    pub expires: Option<DateTime<Utc>>,
    pub meta: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct FriendRequestEvent {
    pub from: String,
    pub to: String,
    pub status: String,
}

impl FriendRequestEvent {
    pub fn is_pending(&self) -> bool {
        self.status == "PENDING"
    }
}

/// Decoded inbound event, dispatched to all subscribers of a connection.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    SessionStarted,
    Connected,
    Disconnected,
    MemberConnected(MemberEvent),
    MemberDisconnected(MemberEvent),
    MemberExpired(MemberEvent),
    MemberJoined(MemberEvent),
    MemberKicked(MemberEvent),
    MemberLeft(MemberEvent),
    MemberStateUpdated(MemberEvent),
    MemberNewCaptain(MemberEvent),
    PartyUpdated(PartyUpdatedEvent),
    PartyInvite(PartyInviteEvent),
    FriendRequest(FriendRequestEvent),
}

impl StreamEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            StreamEvent::SessionStarted => "session_started",
            StreamEvent::Connected => "connected",
            StreamEvent::Disconnected => "disconnected",
            StreamEvent::MemberConnected(_) => MEMBER_CONNECTED,
            StreamEvent::MemberDisconnected(_) => MEMBER_DISCONNECTED,
            StreamEvent::MemberExpired(_) => MEMBER_EXPIRED,
            StreamEvent::MemberJoined(_) => MEMBER_JOINED,
            StreamEvent::MemberKicked(_) => MEMBER_KICKED,
            StreamEvent::MemberLeft(_) => MEMBER_LEFT,
            StreamEvent::MemberStateUpdated(_) => MEMBER_STATE_UPDATED,
            StreamEvent::MemberNewCaptain(_) => MEMBER_NEW_CAPTAIN,
            StreamEvent::PartyUpdated(_) => PARTY_UPDATED,
            StreamEvent::PartyInvite(_) => PARTY_PING,
            StreamEvent::FriendRequest(_) => FRIEND_REQUEST,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: Option<String>,
    ns: Option<String>,
    namespace: Option<String>,
}

/// Decode one inbound message body. Returns None for messages from
/// untrusted senders, foreign namespaces, or unknown discriminators.
pub fn decode_message(from: &str, body: &str) -> Option<StreamEvent> {
    if from != TRUSTED_SENDER {
        trace!("ignoring message from untrusted sender {}", from);
        return None;
    }

    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let envelope: Envelope = serde_json::from_value(value.clone()).ok()?;
    let kind = envelope.kind?;

    // Friend notifications arrive without a namespace field.
    if kind != FRIEND_REQUEST {
        let ns = envelope.ns.or(envelope.namespace)?;
        if !ns.eq_ignore_ascii_case(GAME_NAMESPACE) {
            return None;
        }
    }

    let event = match kind.as_str() {
        MEMBER_CONNECTED => StreamEvent::MemberConnected(parse(&value)?),
        MEMBER_DISCONNECTED => StreamEvent::MemberDisconnected(parse(&value)?),
        MEMBER_EXPIRED => StreamEvent::MemberExpired(parse(&value)?),
        MEMBER_JOINED => StreamEvent::MemberJoined(parse(&value)?),
        MEMBER_KICKED => StreamEvent::MemberKicked(parse(&value)?),
        MEMBER_LEFT => StreamEvent::MemberLeft(parse(&value)?),
        MEMBER_STATE_UPDATED => StreamEvent::MemberStateUpdated(parse(&value)?),
        MEMBER_NEW_CAPTAIN => StreamEvent::MemberNewCaptain(parse(&value)?),
        PARTY_UPDATED => StreamEvent::PartyUpdated(parse(&value)?),
        PARTY_PING => StreamEvent::PartyInvite(parse(&value)?),
        FRIEND_REQUEST => StreamEvent::FriendRequest(parse(&value)?),
        _ => return None,
    };
    Some(event)
}

fn parse<T: serde::de::DeserializeOwned>(value: &serde_json::Value) -> Option<T> {
    serde_json::from_value(value.clone()).ok()
}
