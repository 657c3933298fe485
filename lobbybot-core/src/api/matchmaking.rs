// lobbybot-core/src/api/matchmaking.rs

use std::sync::Arc;

use async_trait::async_trait;

use lobbybot_common::models::{AccountIdentity, MatchResult};
use lobbybot_common::traits::{MatchmakingApi, TokenSupplier};

use crate::Error;

use super::{build_client, error_from_response, ApiConfig};

/// Match-state lookup against the matchmaking session service. The live
/// ticket side-channel is a separate `TicketFactory` concern because it
/// rides the wire protocol, not REST.
pub struct HttpMatchmakingApi {
    client: reqwest::Client,
    base: String,
    tokens: Arc<dyn TokenSupplier>,
}

impl HttpMatchmakingApi {
    pub fn new(tokens: Arc<dyn TokenSupplier>, config: &ApiConfig) -> Result<Self, Error> {
        Ok(Self {
            client: build_client()?,
            base: config.matchmaking_base.trim_end_matches('/').to_string(),
            tokens,
        })
    }
}

#[async_trait]
impl MatchmakingApi for HttpMatchmakingApi {
    async fn find_player(
        &self,
        account: &AccountIdentity,
        target_id: &str,
    ) -> Result<Vec<MatchResult>, Error> {
        let token = self.tokens.get_token(account, true).await?.access_token;
        let url = format!("{}/findPlayer/{}", self.base, target_id);
        let resp = self.client.get(&url).bearer_auth(&token).send().await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        Ok(resp.json().await?)
    }
}
