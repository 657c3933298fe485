// lobbybot-core/src/automation/mission.rs
//
// Per-account mission monitor. Polls the match-state lookup on a fixed
// interval and fires the post-match action sequence on the falling edge
// of the remote "started" flag, never on a single sample.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use futures_util::future::{join_all, BoxFuture};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use lobbybot_common::models::{AccountIdentity, AutomationSetting, MemberRole, PartySnapshot};

use crate::stream::{StreamEvent, StreamEventBus};
use crate::Error;

use super::engine::AutomationAccount;
use super::{
    Services, DEFAULT_POLL_INTERVAL, INVITE_JOIN_WAIT, POST_JOIN_COOLDOWN, SCHEDULE_DELAY,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartyPhase {
    Matchmaking,
    PostMatchmaking,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MatchmakingState {
    pub phase: Option<PartyPhase>,
    pub started: bool,
}

enum TickOutcome {
    Continue,
    /// Tear the poll loop down without firing.
    Stop,
    /// Falling edge observed; run the exit actions.
    Fire,
}

#[derive(Default)]
struct MonitorTasks {
    schedule: Option<JoinHandle<()>>,
    checker: Option<JoinHandle<()>>,
}

pub struct MissionMonitor {
    weak: Weak<Self>,
    account: AccountIdentity,
    /// The engine's live registry; consulted for settings on every tick so
    /// flag changes take effect without restarting the monitor.
    registry: Arc<DashMap<String, AutomationAccount>>,
    services: Services,
    bus: StreamEventBus,
    state: Mutex<MatchmakingState>,
    tasks: Mutex<MonitorTasks>,
}

impl MissionMonitor {
    pub fn new(
        account: AccountIdentity,
        registry: Arc<DashMap<String, AutomationAccount>>,
        services: Services,
        bus: StreamEventBus,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            account,
            registry,
            services,
            bus,
            state: Mutex::new(MatchmakingState::default()),
            tasks: Mutex::new(MonitorTasks::default()),
        })
    }

    pub async fn state(&self) -> MatchmakingState {
        *self.state.lock().await
    }

    /// Arm the checker after a delay, replacing any pending arm timer.
    /// Boxed return type: the checker loop re-arms through here, so the
    /// future recurses through `start_checker` and must be type-erased.
    pub fn schedule(&self, delay: Option<Duration>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let Some(monitor) = self.weak.upgrade() else {
                return;
            };
            let mut tasks = self.tasks.lock().await;
            if let Some(pending) = tasks.schedule.take() {
                pending.abort();
            }
            let delay = delay.unwrap_or(SCHEDULE_DELAY);
            tasks.schedule = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                monitor.start_checker().await;
            }));
        })
    }

    /// Start the recurring poll immediately, replacing a running one.
    pub async fn start_checker(&self) {
        let Some(monitor) = self.weak.upgrade() else {
            return;
        };
        let mut tasks = self.tasks.lock().await;
        if let Some(running) = tasks.checker.take() {
            running.abort();
        }

        let poll = self
            .settings()
            .and_then(|s| s.mission_check_interval_secs)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_POLL_INTERVAL);
        tasks.checker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll);
            interval.tick().await;
            loop {
                interval.tick().await;
                match monitor.tick().await {
                    TickOutcome::Continue => {}
                    TickOutcome::Stop => {
                        monitor.reset_state().await;
                        break;
                    }
                    TickOutcome::Fire => {
                        info!(
                            account = %monitor.account.account_id,
                            "match ended, running exit actions"
                        );
                        monitor.reset_state().await;
                        monitor.run_exit_actions().await;
                        // Re-arm so the next match is caught without a
                        // manual restart.
                        monitor.schedule(None).await;
                        break;
                    }
                }
            }
        }));
    }

    /// Seed state from one immediate lookup when a session (re)starts, so
    /// detection does not wait out a full poll interval after reconnect.
    pub async fn check_on_startup(&self) {
        let enabled = self.settings().map(|s| s.any_enabled()).unwrap_or(false);
        if !enabled {
            return;
        }

        let results = match self
            .services
            .matchmaking
            .find_player(&self.account, &self.account.account_id)
            .await
        {
            Ok(results) => results,
            Err(e) => {
                warn!(account = %self.account.account_id, error = %e, "startup match lookup failed");
                return;
            }
        };
        let Some(started) = results.first().and_then(|r| r.started) else {
            return;
        };

        {
            let mut state = self.state.lock().await;
            state.started = started;
            state.phase = Some(if started {
                PartyPhase::PostMatchmaking
            } else {
                PartyPhase::Matchmaking
            });
        }
        self.start_checker().await;
    }

    /// Cancel the poll and the arm timer and reset the state machine.
    pub async fn dispose(&self) {
        let mut tasks = self.tasks.lock().await;
        if let Some(pending) = tasks.schedule.take() {
            pending.abort();
        }
        if let Some(running) = tasks.checker.take() {
            running.abort();
        }
        drop(tasks);
        self.reset_state().await;
    }

    async fn reset_state(&self) {
        *self.state.lock().await = MatchmakingState::default();
    }

    fn settings(&self) -> Option<AutomationSetting> {
        self.registry
            .get(&self.account.account_id)
            .map(|a| a.settings.clone())
    }

    async fn tick(&self) -> TickOutcome {
        let Some(settings) = self.settings() else {
            return TickOutcome::Stop;
        };
        if !settings.any_enabled() {
            return TickOutcome::Stop;
        }

        let results = match self
            .services
            .matchmaking
            .find_player(&self.account, &self.account.account_id)
            .await
        {
            Ok(results) => results,
            Err(e) => {
                warn!(account = %self.account.account_id, error = %e, "match lookup failed");
                return TickOutcome::Continue;
            }
        };

        let mut state = self.state.lock().await;
        let Some(data) = results.first() else {
            // Never in a match and nothing tracked: nothing to watch for.
            let was_in_match = state.phase.is_some();
            if !was_in_match {
                return TickOutcome::Stop;
            }
            return TickOutcome::Continue;
        };
        let Some(started) = data.started else {
            return TickOutcome::Continue;
        };

        if started && state.phase != Some(PartyPhase::PostMatchmaking) {
            state.phase = Some(PartyPhase::PostMatchmaking);
            state.started = true;
            return TickOutcome::Continue;
        }

        if state.phase != Some(PartyPhase::PostMatchmaking) || !state.started || started {
            state.started = started;
            return TickOutcome::Continue;
        }

        TickOutcome::Fire
    }

    /// Post-match action sequence. Each action is independently failable;
    /// a failure is logged and never blocks the siblings.
    async fn run_exit_actions(&self) {
        let Some(settings) = self.settings() else {
            return;
        };

        let party = match self.services.party.fetch_party(&self.account).await {
            Ok(Some(party)) => party,
            Ok(None) => {
                debug!(account = %self.account.account_id, "no party at exit time");
                return;
            }
            Err(e) => {
                warn!(account = %self.account.account_id, error = %e, "party fetch at exit failed");
                return;
            }
        };

        if settings.auto_kick {
            if let Err(e) = self.kick(&party).await {
                warn!(account = %self.account.account_id, error = %e, "kick sequence failed");
            }
        }

        if settings.auto_transfer {
            let rewards = self.services.rewards.clone();
            let account = self.account.clone();
            tokio::spawn(async move {
                if let Err(e) = rewards.transfer_resources(&account).await {
                    warn!(account = %account.account_id, error = %e, "resource transfer failed");
                }
            });
        }

        let others = party.other_member_ids(&self.account.account_id);
        if settings.auto_kick
            && settings.auto_invite
            && party.is_captain(&self.account.account_id)
            && !others.is_empty()
        {
            if let Some(monitor) = self.weak.upgrade() {
                tokio::spawn(async move {
                    if let Err(e) = monitor.invite_back(others).await {
                        warn!(account = %monitor.account.account_id, error = %e, "auto-invite failed");
                    }
                });
            }
        }

        if settings.auto_claim {
            if let Err(e) = self.services.rewards.claim_rewards(&self.account).await {
                warn!(account = %self.account.account_id, error = %e, "reward claim failed");
            }
        }
    }

    /// Empty the party out. If the leader is a managed account, it kicks the
    /// non-opted-in followers and this account leaves; otherwise every
    /// managed non-opted-in member leaves individually, this account last.
    async fn kick(&self, party: &PartySnapshot) -> Result<(), Error> {
        let all_accounts = self
            .services
            .accounts
            .all_accounts()
            .await
            .unwrap_or_default();

        let member_ids: Vec<String> = party.members.iter().map(|m| m.account_id.clone()).collect();
        let leader_account = party
            .members
            .iter()
            .find(|m| m.role == MemberRole::Captain)
            .and_then(|leader| {
                all_accounts
                    .iter()
                    .find(|a| a.account_id == leader.account_id)
                    .cloned()
            });

        let opted_in: HashSet<&String> = member_ids
            .iter()
            .filter(|id| {
                self.registry
                    .get(id.as_str())
                    .map(|a| a.settings.auto_kick)
                    .unwrap_or(false)
            })
            .collect();
        let not_opted_in: Vec<&String> = member_ids
            .iter()
            .filter(|id| !opted_in.contains(id))
            .collect();

        if let Some(leader) = leader_account {
            let kicks = not_opted_in
                .iter()
                .filter(|id| ***id != self.account.account_id)
                .map(|id| {
                    self.services
                        .party
                        .kick_member(&leader, &party.party_id, id)
                });
            for result in join_all(kicks).await {
                if let Err(e) = result {
                    warn!(account = %self.account.account_id, error = %e, "kick failed");
                }
            }
            self.services
                .party
                .leave_party(&self.account, &party.party_id)
                .await
        } else {
            let mut leavers: Vec<AccountIdentity> = not_opted_in
                .iter()
                .filter(|id| ***id != self.account.account_id)
                .filter_map(|id| {
                    all_accounts
                        .iter()
                        .find(|a| &a.account_id == *id)
                        .cloned()
                })
                .collect();
            leavers.push(self.account.clone());

            let leaves = leavers
                .iter()
                .map(|account| self.services.party.leave_party(account, &party.party_id));
            for result in join_all(leaves).await {
                if let Err(e) = result {
                    warn!(account = %self.account.account_id, error = %e, "leave failed");
                }
            }
            Ok(())
        }
    }

    /// Wait for the account's own re-join, then invite back every previous
    /// member that is still a friend.
    async fn invite_back(&self, previous_members: Vec<String>) -> Result<(), Error> {
        let me = self.account.account_id.clone();
        self.bus
            .wait_for(
                move |e| matches!(e, StreamEvent::MemberJoined(evt) if evt.account_id == me),
                INVITE_JOIN_WAIT,
            )
            .await?;
        tokio::time::sleep(POST_JOIN_COOLDOWN).await;

        let (party, friends) = tokio::join!(
            self.services.party.fetch_party(&self.account),
            self.services.friends.get_friends(&self.account),
        );
        let Some(party) = party? else {
            return Ok(());
        };
        let friends = friends.unwrap_or_default();
        if friends.is_empty() {
            return Ok(());
        }

        let invites = previous_members
            .iter()
            .filter(|id| friends.contains(id))
            .map(|id| {
                self.services
                    .party
                    .invite_member(&self.account, &party.party_id, id)
            });
        for result in join_all(invites).await {
            if let Err(e) = result {
                warn!(account = %self.account.account_id, error = %e, "invite failed");
            }
        }
        Ok(())
    }
}
