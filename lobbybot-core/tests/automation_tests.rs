// lobbybot-core/tests/automation_tests.rs
//
// Mission monitor state machine against scripted match lookups: the exit
// sequence fires on the falling edge of `started` and never on a single
// sample, and the kick step distributes leaves across managed accounts.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::time::Duration;

use lobbybot_common::models::{
    AccountIdentity, AccountStatus, AutomationSetting, MatchResult, MemberRole, PartyMember,
    PartySnapshot,
};
use lobbybot_common::traits::{
    AccountStore, FriendsApi, MatchmakingApi, PartyApi, RewardsApi, SettingsStore,
    TicketConnection, TicketFactory,
};
use lobbybot_core::automation::{
    AutomationAccount, MissionMonitor, PartyPhase, Services,
};
use lobbybot_core::stream::events::MemberEvent;
use lobbybot_core::stream::{StreamEvent, StreamEventBus};
use lobbybot_core::Error;

fn account(id: &str) -> AccountIdentity {
    AccountIdentity {
        account_id: id.to_string(),
        display_name: format!("display-{id}"),
    }
}

fn member(id: &str, role: MemberRole) -> PartyMember {
    PartyMember {
        account_id: id.to_string(),
        display_name: None,
        role,
        meta: HashMap::new(),
        joined_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn party(id: &str, members: Vec<PartyMember>) -> PartySnapshot {
    PartySnapshot {
        party_id: id.to_string(),
        revision: 1,
        config: Default::default(),
        meta: HashMap::new(),
        members,
    }
}

fn match_sample(started: Option<bool>) -> Vec<MatchResult> {
    vec![MatchResult {
        started,
        public_players: Vec::new(),
    }]
}

#[derive(Default)]
struct FakeParty {
    current: Mutex<Option<PartySnapshot>>,
    kicks: Mutex<Vec<(String, String)>>,
    leaves: Mutex<Vec<(String, String)>>,
    invites: Mutex<Vec<(String, String)>>,
}

impl FakeParty {
    fn leaves(&self) -> Vec<(String, String)> {
        self.leaves.lock().unwrap().clone()
    }
}

#[async_trait]
impl PartyApi for FakeParty {
    async fn fetch_party(
        &self,
        _account: &AccountIdentity,
    ) -> Result<Option<PartySnapshot>, Error> {
        Ok(self.current.lock().unwrap().clone())
    }

    async fn fetch_inviter_party(
        &self,
        _account: &AccountIdentity,
        _inviter_id: &str,
    ) -> Result<Option<PartySnapshot>, Error> {
        Ok(None)
    }

    async fn patch_party(
        &self,
        _account: &AccountIdentity,
        _party_id: &str,
        _revision: i64,
        _updates: &HashMap<String, String>,
        _member: bool,
    ) -> Result<(), Error> {
        Ok(())
    }

    async fn kick_member(
        &self,
        _account: &AccountIdentity,
        party_id: &str,
        target_id: &str,
    ) -> Result<(), Error> {
        self.kicks
            .lock()
            .unwrap()
            .push((party_id.to_string(), target_id.to_string()));
        Ok(())
    }

    async fn leave_party(&self, account: &AccountIdentity, party_id: &str) -> Result<(), Error> {
        self.leaves
            .lock()
            .unwrap()
            .push((account.account_id.clone(), party_id.to_string()));
        Ok(())
    }

    async fn invite_member(
        &self,
        _account: &AccountIdentity,
        party_id: &str,
        target_id: &str,
    ) -> Result<(), Error> {
        self.invites
            .lock()
            .unwrap()
            .push((party_id.to_string(), target_id.to_string()));
        Ok(())
    }

    async fn accept_invite(
        &self,
        _account: &AccountIdentity,
        _party_id: &str,
        _inviter_id: &str,
        _connection_ref: &str,
        _joining_meta: &HashMap<String, String>,
    ) -> Result<(), Error> {
        Ok(())
    }
}

struct FakeMatchmaking {
    script: Mutex<VecDeque<Vec<MatchResult>>>,
    calls: AtomicUsize,
}

impl FakeMatchmaking {
    fn new(script: Vec<Vec<MatchResult>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl MatchmakingApi for FakeMatchmaking {
    async fn find_player(
        &self,
        _account: &AccountIdentity,
        _target_id: &str,
    ) -> Result<Vec<MatchResult>, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default())
    }
}

#[derive(Default)]
struct FakeRewards {
    claims: AtomicUsize,
    transfers: AtomicUsize,
}

#[async_trait]
impl RewardsApi for FakeRewards {
    async fn claim_rewards(&self, _account: &AccountIdentity) -> Result<(), Error> {
        self.claims.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn transfer_resources(&self, _account: &AccountIdentity) -> Result<(), Error> {
        self.transfers.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct FakeFriends {
    friends: Mutex<Vec<String>>,
}

#[async_trait]
impl FriendsApi for FakeFriends {
    async fn get_friends(&self, _account: &AccountIdentity) -> Result<Vec<String>, Error> {
        Ok(self.friends.lock().unwrap().clone())
    }

    async fn incoming_requests(&self, _account: &AccountIdentity) -> Result<Vec<String>, Error> {
        Ok(Vec::new())
    }

    async fn accept_request(
        &self,
        _account: &AccountIdentity,
        _from_id: &str,
    ) -> Result<(), Error> {
        Ok(())
    }
}

struct FakeAccounts {
    accounts: Vec<AccountIdentity>,
}

#[async_trait]
impl AccountStore for FakeAccounts {
    async fn all_accounts(&self) -> Result<Vec<AccountIdentity>, Error> {
        Ok(self.accounts.clone())
    }
}

struct FakeSettings;

#[async_trait]
impl SettingsStore for FakeSettings {
    async fn load(&self) -> Result<Vec<AutomationSetting>, Error> {
        Ok(Vec::new())
    }

    async fn save(&self, _settings: &[AutomationSetting]) -> Result<(), Error> {
        Ok(())
    }
}

struct FakeTickets;

#[async_trait]
impl TicketFactory for FakeTickets {
    async fn open(
        &self,
        _account: &AccountIdentity,
        _party: &PartySnapshot,
    ) -> Result<Box<dyn TicketConnection>, Error> {
        Err(Error::Action("no ticket sessions in this test".to_string()))
    }
}

struct Harness {
    party: Arc<FakeParty>,
    matchmaking: Arc<FakeMatchmaking>,
    rewards: Arc<FakeRewards>,
    friends: Arc<FakeFriends>,
    registry: Arc<DashMap<String, AutomationAccount>>,
    monitor: Arc<MissionMonitor>,
    bus: StreamEventBus,
}

fn harness(
    script: Vec<Vec<MatchResult>>,
    settings: AutomationSetting,
    managed: Vec<AccountIdentity>,
) -> Harness {
    let party: Arc<FakeParty> = Arc::new(FakeParty::default());
    let matchmaking = FakeMatchmaking::new(script);
    let rewards: Arc<FakeRewards> = Arc::new(FakeRewards::default());
    let friends: Arc<FakeFriends> = Arc::new(FakeFriends::default());
    let services = Services {
        party: party.clone(),
        matchmaking: matchmaking.clone(),
        rewards: rewards.clone(),
        friends: friends.clone(),
        accounts: Arc::new(FakeAccounts { accounts: managed }),
        settings: Arc::new(FakeSettings),
        tickets: Arc::new(FakeTickets),
    };

    let acc = account(&settings.account_id);
    let registry = Arc::new(DashMap::new());
    registry.insert(
        acc.account_id.clone(),
        AutomationAccount {
            status: AccountStatus::Active,
            account: acc.clone(),
            settings,
        },
    );
    let bus = StreamEventBus::new();
    let monitor = MissionMonitor::new(acc, registry.clone(), services, bus.clone());

    Harness {
        party,
        matchmaking,
        rewards,
        friends,
        registry,
        monitor,
        bus,
    }
}

fn kick_and_claim(account_id: &str) -> AutomationSetting {
    AutomationSetting {
        account_id: account_id.to_string(),
        auto_kick: true,
        auto_claim: true,
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn exit_actions_fire_on_falling_edge() {
    let h = harness(
        vec![match_sample(Some(true)), match_sample(Some(false))],
        kick_and_claim("acc-1"),
        vec![account("acc-1")],
    );
    *h.party.current.lock().unwrap() = Some(party(
        "party-1",
        vec![member("acc-1", MemberRole::Captain)],
    ));

    h.monitor.start_checker().await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(h.rewards.claims.load(Ordering::SeqCst), 1);
    assert_eq!(
        h.party.leaves(),
        vec![("acc-1".to_string(), "party-1".to_string())]
    );
    // State machine is back at rest after firing.
    let state = h.monitor.state().await;
    assert!(state.phase.is_none());
    assert!(!state.started);

    h.monitor.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn a_single_sample_never_fires() {
    // One false sample, then one true sample: neither is a falling edge.
    let h = harness(
        vec![match_sample(Some(false)), match_sample(Some(true))],
        kick_and_claim("acc-1"),
        vec![account("acc-1")],
    );
    *h.party.current.lock().unwrap() = Some(party(
        "party-1",
        vec![member("acc-1", MemberRole::Captain)],
    ));

    h.monitor.start_checker().await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(h.rewards.claims.load(Ordering::SeqCst), 0);
    assert!(h.party.leaves().is_empty());
    let state = h.monitor.state().await;
    assert_eq!(state.phase, Some(PartyPhase::PostMatchmaking));
    assert!(state.started);

    h.monitor.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn checker_rearms_and_catches_the_next_match() {
    // Two full matches back to back; the second must fire through the
    // re-armed checker without a manual restart.
    let h = harness(
        vec![
            match_sample(Some(true)),
            match_sample(Some(false)),
            match_sample(Some(true)),
            match_sample(Some(false)),
        ],
        kick_and_claim("acc-1"),
        vec![account("acc-1")],
    );
    *h.party.current.lock().unwrap() = Some(party(
        "party-1",
        vec![member("acc-1", MemberRole::Captain)],
    ));

    h.monitor.start_checker().await;
    tokio::time::sleep(Duration::from_secs(35)).await;

    assert_eq!(h.rewards.claims.load(Ordering::SeqCst), 2);
    assert_eq!(h.party.leaves().len(), 2);

    h.monitor.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn rejoin_after_firing_invites_previous_friends() {
    let h = harness(
        vec![match_sample(Some(true)), match_sample(Some(false))],
        AutomationSetting {
            account_id: "acc-1".to_string(),
            auto_kick: true,
            auto_invite: true,
            ..Default::default()
        },
        vec![account("acc-1")],
    );
    *h.friends.friends.lock().unwrap() = vec!["acc-2".to_string()];
    *h.party.current.lock().unwrap() = Some(party(
        "party-1",
        vec![
            member("acc-1", MemberRole::Captain),
            member("acc-2", MemberRole::Member),
            member("acc-3", MemberRole::Member),
        ],
    ));

    h.monitor.start_checker().await;
    // Past the falling edge; the invite step is now waiting for our own
    // re-join.
    tokio::time::sleep(Duration::from_secs(12)).await;
    assert!(h.party.invites.lock().unwrap().is_empty());

    // The fresh party the account lands in after leaving the old one.
    *h.party.current.lock().unwrap() = Some(party(
        "party-2",
        vec![member("acc-1", MemberRole::Captain)],
    ));
    h.bus
        .publish(StreamEvent::MemberJoined(MemberEvent {
            party_id: "party-2".to_string(),
            account_id: "acc-1".to_string(),
            ..Default::default()
        }))
        .await;
    // Cool-down after the join, then the invites go out.
    tokio::time::sleep(Duration::from_secs(5)).await;

    // acc-3 left the party too but is not a friend, so only acc-2 comes back.
    assert_eq!(
        h.party.invites.lock().unwrap().clone(),
        vec![("party-2".to_string(), "acc-2".to_string())]
    );

    h.monitor.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn no_invites_when_the_rejoin_never_happens() {
    let h = harness(
        vec![match_sample(Some(true)), match_sample(Some(false))],
        AutomationSetting {
            account_id: "acc-1".to_string(),
            auto_kick: true,
            auto_invite: true,
            ..Default::default()
        },
        vec![account("acc-1")],
    );
    *h.friends.friends.lock().unwrap() = vec!["acc-2".to_string()];
    *h.party.current.lock().unwrap() = Some(party(
        "party-1",
        vec![
            member("acc-1", MemberRole::Captain),
            member("acc-2", MemberRole::Member),
        ],
    ));

    h.monitor.start_checker().await;
    // The 20s re-join window elapses with no join event.
    tokio::time::sleep(Duration::from_secs(40)).await;

    assert!(h.party.invites.lock().unwrap().is_empty());

    h.monitor.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn disabled_settings_tear_the_poll_down() {
    let h = harness(
        vec![match_sample(Some(true))],
        AutomationSetting::new("acc-1"),
        vec![account("acc-1")],
    );

    h.monitor.start_checker().await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(
        h.matchmaking.calls.load(Ordering::SeqCst),
        0,
        "nothing enabled means no lookups at all"
    );
}

#[tokio::test(start_paused = true)]
async fn settings_changes_apply_between_ticks() {
    let h = harness(
        vec![match_sample(Some(true)), match_sample(Some(false))],
        kick_and_claim("acc-1"),
        vec![account("acc-1")],
    );

    h.monitor.start_checker().await;
    tokio::time::sleep(Duration::from_secs(6)).await;

    // Disable everything after the first tick; the next tick must stop
    // instead of firing.
    h.registry.alter("acc-1", |_, mut entry| {
        entry.settings = AutomationSetting::new("acc-1");
        entry
    });
    tokio::time::sleep(Duration::from_secs(24)).await;

    assert_eq!(h.rewards.claims.load(Ordering::SeqCst), 0);
    assert!(h.party.leaves().is_empty());
}

#[tokio::test(start_paused = true)]
async fn check_on_startup_seeds_the_state_machine() {
    let h = harness(
        vec![match_sample(Some(true))],
        kick_and_claim("acc-1"),
        vec![account("acc-1")],
    );

    h.monitor.check_on_startup().await;

    let state = h.monitor.state().await;
    assert_eq!(state.phase, Some(PartyPhase::PostMatchmaking));
    assert!(state.started);

    h.monitor.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn unmanaged_leader_distributes_leaves_instead_of_kicks() {
    // Leader acc-9 is not a managed account, so no kick authority exists:
    // every managed member that did not opt in leaves, this account last.
    let h = harness(
        vec![match_sample(Some(true)), match_sample(Some(false))],
        kick_and_claim("acc-1"),
        vec![account("acc-1"), account("acc-2")],
    );
    h.registry.insert(
        "acc-2".to_string(),
        AutomationAccount {
            status: AccountStatus::Active,
            account: account("acc-2"),
            settings: AutomationSetting::new("acc-2"),
        },
    );
    *h.party.current.lock().unwrap() = Some(party(
        "party-1",
        vec![
            member("acc-9", MemberRole::Captain),
            member("acc-1", MemberRole::Member),
            member("acc-2", MemberRole::Member),
        ],
    ));

    h.monitor.start_checker().await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert!(h.party.kicks.lock().unwrap().is_empty());
    assert_eq!(
        h.party.leaves(),
        vec![
            ("acc-2".to_string(), "party-1".to_string()),
            ("acc-1".to_string(), "party-1".to_string()),
        ]
    );

    h.monitor.dispose().await;
}
