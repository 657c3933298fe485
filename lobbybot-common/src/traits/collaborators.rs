// lobbybot-common/src/traits/collaborators.rs
//
// External collaborator seams. The engine only ever talks to these traits;
// concrete implementations live in lobbybot-core/src/api or in the host
// application.

use std::collections::HashMap;
use async_trait::async_trait;

use crate::error::Error;
use crate::models::account::{AccessToken, AccountIdentity};
use crate::models::matchmaking::{MatchResult, TicketSignal};
use crate::models::party::PartySnapshot;
use crate::models::settings::AutomationSetting;

/// Supplies a valid bearer token for an account, refreshing when expired.
/// `allow_cache = false` forces a refresh against the backend.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenSupplier: Send + Sync {
    async fn get_token(
        &self,
        account: &AccountIdentity,
        allow_cache: bool,
    ) -> Result<AccessToken, Error>;
}

/// Party/roster REST operations. All calls authenticate via the token
/// supplier internally and may fail with `Error::Api { code, .. }`;
/// a racing patch surfaces as `Error::StaleRevision`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PartyApi: Send + Sync {
    /// The account's current party, or None when it is not in one.
    async fn fetch_party(&self, account: &AccountIdentity)
        -> Result<Option<PartySnapshot>, Error>;

    /// The party an inviter pinged this account from.
    async fn fetch_inviter_party(
        &self,
        account: &AccountIdentity,
        inviter_id: &str,
    ) -> Result<Option<PartySnapshot>, Error>;

    /// Patch party metadata (`member = false`) or the account's own member
    /// metadata (`member = true`) at the given revision.
    async fn patch_party(
        &self,
        account: &AccountIdentity,
        party_id: &str,
        revision: i64,
        updates: &HashMap<String, String>,
        member: bool,
    ) -> Result<(), Error>;

    async fn kick_member(
        &self,
        account: &AccountIdentity,
        party_id: &str,
        target_id: &str,
    ) -> Result<(), Error>;

    async fn leave_party(&self, account: &AccountIdentity, party_id: &str) -> Result<(), Error>;

    async fn invite_member(
        &self,
        account: &AccountIdentity,
        party_id: &str,
        target_id: &str,
    ) -> Result<(), Error>;

    async fn accept_invite(
        &self,
        account: &AccountIdentity,
        party_id: &str,
        inviter_id: &str,
        connection_ref: &str,
        joining_meta: &HashMap<String, String>,
    ) -> Result<(), Error>;
}

/// Match-state lookup. Empty vec: not in any tracked match.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MatchmakingApi: Send + Sync {
    async fn find_player(
        &self,
        account: &AccountIdentity,
        target_id: &str,
    ) -> Result<Vec<MatchResult>, Error>;
}

/// A live matchmaking ticket session opened by a bot-lobby account while
/// the party readies up. Torn down as soon as a Play signal arrives.
#[async_trait]
pub trait TicketConnection: Send {
    /// Next signal from the session; None when the session closed remotely.
    async fn next_signal(&mut self) -> Option<TicketSignal>;

    async fn close(&mut self);
}

/// Opens ticket sessions. Separate from `MatchmakingApi` because the
/// session rides the (out of scope) wire protocol, not REST.
#[async_trait]
pub trait TicketFactory: Send + Sync {
    async fn open(
        &self,
        account: &AccountIdentity,
        party: &PartySnapshot,
    ) -> Result<Box<dyn TicketConnection>, Error>;
}

/// Reward claiming and resource transfer. Both best-effort; each may issue
/// several sub-calls internally.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RewardsApi: Send + Sync {
    async fn claim_rewards(&self, account: &AccountIdentity) -> Result<(), Error>;

    async fn transfer_resources(&self, account: &AccountIdentity) -> Result<(), Error>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FriendsApi: Send + Sync {
    async fn get_friends(&self, account: &AccountIdentity) -> Result<Vec<String>, Error>;

    /// Account ids with a pending inbound friend request.
    async fn incoming_requests(&self, account: &AccountIdentity) -> Result<Vec<String>, Error>;

    async fn accept_request(&self, account: &AccountIdentity, from_id: &str)
        -> Result<(), Error>;
}

/// Persisted automation settings. Mutations are written through on explicit
/// setting changes only, never on the hot event path.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn load(&self) -> Result<Vec<AutomationSetting>, Error>;

    async fn save(&self, settings: &[AutomationSetting]) -> Result<(), Error>;
}

/// Read access to the host application's account store.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn all_accounts(&self) -> Result<Vec<AccountIdentity>, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn mock_token_supplier_round_trip() {
        let mut supplier = MockTokenSupplier::new();
        supplier.expect_get_token().returning(|account, _| {
            let account_id = account.account_id.clone();
            Ok(AccessToken {
                access_token: format!("token-{account_id}"),
                expires_at: Utc::now() + Duration::hours(2),
            })
        });

        let account = AccountIdentity {
            account_id: "acc-1".into(),
            display_name: "Tester".into(),
        };
        let token = supplier.get_token(&account, true).await.unwrap();
        assert_eq!(token.access_token, "token-acc-1");
        assert!(!token.is_expired());
        assert!(token.expires_within(Duration::hours(3)));
    }
}
