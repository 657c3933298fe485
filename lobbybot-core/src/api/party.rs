// lobbybot-core/src/api/party.rs

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use lobbybot_common::models::{
    AccountIdentity, MemberRole, PartyConfig, PartyMember, PartySnapshot,
};
use lobbybot_common::traits::{PartyApi, TokenSupplier};

use crate::Error;

use super::{build_client, error_from_response, ApiConfig};

const MEMBER_DISPLAY_NAME_KEY: &str = "urn:epic:member:dn_s";

pub struct HttpPartyApi {
    client: reqwest::Client,
    base: String,
    tokens: Arc<dyn TokenSupplier>,
}

/// JSON shape for `GET user/{accountId}`.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct FetchPartyResponse {
    current: Vec<WireParty>,
}

#[derive(Debug, Deserialize)]
struct WireParty {
    id: String,
    revision: i64,
    #[serde(default)]
    config: WirePartyConfig,
    #[serde(default)]
    meta: HashMap<String, String>,
    #[serde(default)]
    members: Vec<WireMember>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct WirePartyConfig {
    #[serde(rename = "type")]
    party_type: Option<String>,
    sub_type: Option<String>,
    joinability: Option<String>,
    max_size: Option<u32>,
    invite_ttl: Option<i64>,
    intention_ttl: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WireMember {
    account_id: String,
    #[serde(default)]
    meta: HashMap<String, String>,
    role: String,
    #[serde(default)]
    joined_at: Option<DateTime<Utc>>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

impl WireParty {
    fn into_snapshot(self) -> PartySnapshot {
        PartySnapshot {
            party_id: self.id,
            revision: self.revision,
            config: PartyConfig {
                party_type: self.config.party_type,
                sub_type: self.config.sub_type,
                privacy: self.config.joinability,
                max_size: self.config.max_size,
                invite_ttl: self.config.invite_ttl,
                intention_ttl: self.config.intention_ttl,
            },
            meta: self.meta,
            members: self
                .members
                .into_iter()
                .map(|m| PartyMember {
                    display_name: m.meta.get(MEMBER_DISPLAY_NAME_KEY).cloned(),
                    role: m.role.parse().unwrap_or(MemberRole::Member),
                    account_id: m.account_id,
                    meta: m.meta,
                    joined_at: m.joined_at.unwrap_or_else(Utc::now),
                    updated_at: m.updated_at.unwrap_or_else(Utc::now),
                })
                .collect(),
        }
    }
}

impl HttpPartyApi {
    pub fn new(tokens: Arc<dyn TokenSupplier>, config: &ApiConfig) -> Result<Self, Error> {
        Ok(Self {
            client: build_client()?,
            base: config.party_base.trim_end_matches('/').to_string(),
            tokens,
        })
    }

    async fn bearer(&self, account: &AccountIdentity) -> Result<String, Error> {
        Ok(self.tokens.get_token(account, true).await?.access_token)
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, Error> {
        if resp.status().is_success() {
            Ok(resp)
        } else {
            Err(error_from_response(resp).await)
        }
    }
}

#[async_trait]
impl PartyApi for HttpPartyApi {
    async fn fetch_party(
        &self,
        account: &AccountIdentity,
    ) -> Result<Option<PartySnapshot>, Error> {
        let token = self.bearer(account).await?;
        let url = format!("{}/user/{}", self.base, account.account_id);
        let resp = self.client.get(&url).bearer_auth(&token).send().await?;
        let parsed: FetchPartyResponse = Self::check(resp).await?.json().await?;
        Ok(parsed
            .current
            .into_iter()
            .next()
            .map(WireParty::into_snapshot))
    }

    async fn fetch_inviter_party(
        &self,
        account: &AccountIdentity,
        inviter_id: &str,
    ) -> Result<Option<PartySnapshot>, Error> {
        let token = self.bearer(account).await?;
        let url = format!(
            "{}/user/{}/pings/{}/parties",
            self.base, account.account_id, inviter_id
        );
        let resp = self.client.get(&url).bearer_auth(&token).send().await?;
        let parsed: Vec<WireParty> = Self::check(resp).await?.json().await?;
        Ok(parsed.into_iter().next().map(WireParty::into_snapshot))
    }

    async fn patch_party(
        &self,
        account: &AccountIdentity,
        party_id: &str,
        revision: i64,
        updates: &HashMap<String, String>,
        member: bool,
    ) -> Result<(), Error> {
        let token = self.bearer(account).await?;
        let (url, body) = if member {
            (
                format!(
                    "{}/parties/{}/members/{}/meta",
                    self.base, party_id, account.account_id
                ),
                json!({
                    "delete": [],
                    "revision": revision,
                    "update": updates,
                }),
            )
        } else {
            (
                format!("{}/parties/{}", self.base, party_id),
                json!({
                    "config": {},
                    "meta": { "delete": [], "update": updates },
                    "revision": revision,
                }),
            )
        };
        let resp = self
            .client
            .patch(&url)
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn kick_member(
        &self,
        account: &AccountIdentity,
        party_id: &str,
        target_id: &str,
    ) -> Result<(), Error> {
        let token = self.bearer(account).await?;
        let url = format!("{}/parties/{}/members/{}", self.base, party_id, target_id);
        let resp = self.client.delete(&url).bearer_auth(&token).send().await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn leave_party(&self, account: &AccountIdentity, party_id: &str) -> Result<(), Error> {
        let token = self.bearer(account).await?;
        let url = format!(
            "{}/parties/{}/members/{}",
            self.base, party_id, account.account_id
        );
        let resp = self.client.delete(&url).bearer_auth(&token).send().await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn invite_member(
        &self,
        account: &AccountIdentity,
        party_id: &str,
        target_id: &str,
    ) -> Result<(), Error> {
        let token = self.bearer(account).await?;
        let url = format!(
            "{}/parties/{}/invites/{}?sendPing=true",
            self.base, party_id, target_id
        );
        let body = json!({
            "urn:epic:invite:platformdata_s": "",
        });
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn accept_invite(
        &self,
        account: &AccountIdentity,
        party_id: &str,
        inviter_id: &str,
        connection_ref: &str,
        joining_meta: &HashMap<String, String>,
    ) -> Result<(), Error> {
        let token = self.bearer(account).await?;
        let url = format!(
            "{}/parties/{}/members/{}/join",
            self.base, party_id, account.account_id
        );

        let mut meta = joining_meta.clone();
        meta.insert(
            MEMBER_DISPLAY_NAME_KEY.to_string(),
            account.display_name.clone(),
        );

        let body = json!({
            "connection": {
                "id": connection_ref,
                "meta": {
                    "urn:epic:conn:platform_s": "WIN",
                    "urn:epic:conn:type_s": "game",
                },
                "yield_leadership": false,
            },
            "meta": meta,
        });
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await?;
        Self::check(resp).await?;

        // Consume the ping so it cannot be accepted twice.
        let ping_url = format!(
            "{}/user/{}/pings/{}",
            self.base, account.account_id, inviter_id
        );
        let _ = self
            .client
            .delete(&ping_url)
            .bearer_auth(&token)
            .send()
            .await;
        Ok(())
    }
}
