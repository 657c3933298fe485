// lobbybot-core/src/api/mod.rs
//
// reqwest-backed implementations of the party and matchmaking REST
// collaborators. Every call authenticates with a bearer token from the
// injected TokenSupplier; error bodies are decoded into the typed API
// error envelope.

use serde::Deserialize;

use crate::Error;

pub mod matchmaking;
pub mod party;

pub use matchmaking::HttpMatchmakingApi;
pub use party::HttpPartyApi;

const USER_AGENT: &str = "lobbybot/0.1";

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub party_base: String,
    pub matchmaking_base: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            party_base: "https://party-service-prod.ol.epicgames.com/party/api/v1/Fortnite"
                .to_string(),
            matchmaking_base:
                "https://fngw-mcp-gc-livefn.ol.epicgames.com/fortnite/api/matchmaking/session"
                    .to_string(),
        }
    }
}

/// Typed API error envelope returned by the backend services.
#[derive(Debug, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct ApiErrorBody {
    error_code: String,
    error_message: String,
    message_vars: Vec<String>,
}

/// Turn a non-success response into a typed error. A stale-revision
/// rejection carries the authoritative revision in its message vars.
pub(crate) async fn error_from_response(resp: reqwest::Response) -> Error {
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    let body: ApiErrorBody = serde_json::from_str(&text).unwrap_or_default();

    if body.error_code.ends_with("stale_revision") {
        let current = body
            .message_vars
            .iter()
            .rev()
            .find_map(|v| v.parse().ok())
            .unwrap_or(0);
        return Error::StaleRevision { current };
    }

    if body.error_code.is_empty() {
        Error::Api {
            code: format!("http_{}", status.as_u16()),
            message: text,
        }
    } else {
        Error::Api {
            code: body.error_code,
            message: body.error_message,
        }
    }
}

pub(crate) fn build_client() -> Result<reqwest::Client, Error> {
    Ok(reqwest::ClientBuilder::new()
        .user_agent(USER_AGENT)
        .build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stale_revision_extracts_current_revision() {
        let body = serde_json::json!({
            "errorCode": "errors.com.epicgames.social.party.stale_revision",
            "errorMessage": "The revision is out of date",
            "messageVars": ["5", "7"]
        })
        .to_string();
        let parsed: ApiErrorBody = serde_json::from_str(&body).unwrap();
        assert!(parsed.error_code.ends_with("stale_revision"));
        assert_eq!(
            parsed.message_vars.iter().rev().find_map(|v| v.parse::<i64>().ok()),
            Some(7)
        );
    }
}
