// lobbybot-core/src/automation/engine.rs
//
// Per-account automation registry. Owns one mission monitor and one event
// listener per automated account, mirrors settings changes to persistent
// storage, and exposes the live status list through a watch channel.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use lobbybot_common::models::{
    AccountIdentity, AccountStatus, AutomationSetting, AutomationSettingUpdate,
};
use lobbybot_common::traits::TokenSupplier;

use crate::connection::ConnectionManager;
use crate::party::PartySynchronizer;
use crate::stream::{StreamEvent, TransportFactory};
use crate::tasks;
use crate::Error;

use super::mission::{MissionMonitor, PartyPhase};
use super::{Services, PARTY_STATE_KEY, POST_MATCHMAKING_STATE, PURPOSE_AUTO_KICK, REJOIN_SCHEDULE_DELAY};

#[derive(Clone)]
pub struct AutomationAccount {
    pub status: AccountStatus,
    pub account: AccountIdentity,
    pub settings: AutomationSetting,
}

pub struct AutomationEngine {
    weak: Weak<Self>,
    connections: Arc<ConnectionManager>,
    parties: Arc<PartySynchronizer>,
    services: Services,
    registry: Arc<DashMap<String, AutomationAccount>>,
    monitors: DashMap<String, Arc<MissionMonitor>>,
    listeners: DashMap<String, JoinHandle<()>>,
    status_tx: watch::Sender<Vec<AutomationAccount>>,
}

impl AutomationEngine {
    pub fn new(
        connections: Arc<ConnectionManager>,
        parties: Arc<PartySynchronizer>,
        services: Services,
    ) -> Arc<Self> {
        let (status_tx, _) = watch::channel(Vec::new());
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            connections,
            parties,
            services,
            registry: Arc::new(DashMap::new()),
            monitors: DashMap::new(),
            listeners: DashMap::new(),
            status_tx,
        })
    }

    /// Wire a complete engine from its external collaborators, autostart
    /// every persisted account, and install the recurring token refresh
    /// sweep. This is the library entrypoint for a host application.
    pub async fn bootstrap(
        tokens: Arc<dyn TokenSupplier>,
        factory: Arc<dyn TransportFactory>,
        services: Services,
    ) -> Result<(Arc<Self>, JoinHandle<()>), Error> {
        let connections = ConnectionManager::new(tokens.clone(), factory);
        let parties = PartySynchronizer::new(services.party.clone());
        let engine = Self::new(connections, parties, services.clone());

        tasks::autostart::run_autostart(&engine, &services).await?;
        let refresh = tasks::token_refresh::spawn_token_refresh(
            services.accounts.clone(),
            tokens,
            chrono::Duration::minutes(30),
            tasks::token_refresh::DEFAULT_SWEEP_INTERVAL,
        );
        Ok((engine, refresh))
    }

    /// Observe the live status list. Receives a fresh copy on every status
    /// or settings change.
    pub fn status_watch(&self) -> watch::Receiver<Vec<AutomationAccount>> {
        self.status_tx.subscribe()
    }

    /// The shared connection manager, for wiring the cycling services.
    pub fn connections(&self) -> Arc<ConnectionManager> {
        self.connections.clone()
    }

    /// The shared party synchronizer, for wiring the cycling services.
    pub fn parties(&self) -> Arc<PartySynchronizer> {
        self.parties.clone()
    }

    pub fn is_automated(&self, account_id: &str) -> bool {
        self.registry.contains_key(account_id)
    }

    pub fn account(&self, account_id: &str) -> Option<AutomationAccount> {
        self.registry.get(account_id).map(|a| a.value().clone())
    }

    /// Start automation for an account. A no-op if it is already running.
    pub async fn start(
        &self,
        account: AccountIdentity,
        mut settings: AutomationSetting,
    ) -> Result<(), Error> {
        if self.registry.contains_key(&account.account_id) {
            return Ok(());
        }
        settings.account_id = account.account_id.clone();
        self.registry.insert(
            account.account_id.clone(),
            AutomationAccount {
                status: AccountStatus::Loading,
                account: account.clone(),
                settings,
            },
        );
        self.persist_settings().await;
        self.publish_status();
        self.start_account(&account).await
    }

    pub async fn stop(&self, account_id: &str) {
        if let Some((_, monitor)) = self.monitors.remove(account_id) {
            monitor.dispose().await;
        }
        if let Some((_, listener)) = self.listeners.remove(account_id) {
            listener.abort();
        }
        self.connections
            .remove_purpose(account_id, PURPOSE_AUTO_KICK)
            .await;
        self.parties.untrack(account_id);
        self.registry.remove(account_id);
        self.persist_settings().await;
        self.publish_status();
        info!(account = %account_id, "automation stopped");
    }

    /// Apply a sparse settings update and write the full list through to
    /// storage.
    pub async fn update_settings(
        &self,
        account_id: &str,
        update: AutomationSettingUpdate,
    ) -> Result<(), Error> {
        {
            let mut entry = self
                .registry
                .get_mut(account_id)
                .ok_or_else(|| Error::Action(format!("{account_id} is not automated")))?;
            update.apply(&mut entry.settings);
        }
        self.persist_settings().await;
        self.publish_status();
        Ok(())
    }

    async fn start_account(&self, account: &AccountIdentity) -> Result<(), Error> {
        self.set_status(&account.account_id, AccountStatus::Loading);

        let handle = match self.connections.acquire(account, PURPOSE_AUTO_KICK).await {
            Ok(handle) => handle,
            Err(e) if e.is_auth() => {
                self.set_status(&account.account_id, AccountStatus::InvalidCredentials);
                return Err(e);
            }
            Err(e) => {
                self.set_status(&account.account_id, AccountStatus::Disconnected);
                return Err(e);
            }
        };

        if let Err(e) = self.parties.track(account).await {
            warn!(account = %account.account_id, error = %e, "initial party fetch failed");
        }

        let monitor = MissionMonitor::new(
            account.clone(),
            self.registry.clone(),
            self.services.clone(),
            handle.bus.clone(),
        );
        if let Some(old) = self
            .monitors
            .insert(account.account_id.clone(), monitor.clone())
        {
            old.dispose().await;
        }

        let rx = handle.subscribe(None).await;
        let engine = self
            .weak
            .upgrade()
            .ok_or_else(|| Error::Action("automation engine is shutting down".to_string()))?;
        let listener = tokio::spawn({
            let account = account.clone();
            let monitor = monitor.clone();
            async move { engine.listen(account, monitor, rx).await }
        });
        if let Some(old) = self.listeners.insert(account.account_id.clone(), listener) {
            old.abort();
        }

        self.set_status(&account.account_id, AccountStatus::Active);
        // The connection may already be up; do not wait for the next
        // session-started event to seed the state machine.
        monitor.check_on_startup().await;
        info!(account = %account.account_id, "automation started");
        Ok(())
    }

    async fn listen(
        self: Arc<Self>,
        account: AccountIdentity,
        monitor: Arc<MissionMonitor>,
        mut rx: mpsc::Receiver<StreamEvent>,
    ) {
        let me = account.account_id.clone();
        while let Some(event) = rx.recv().await {
            self.parties.handle_event(&event).await;

            match &event {
                StreamEvent::SessionStarted => {
                    self.set_status(&me, AccountStatus::Active);
                    monitor.check_on_startup().await;
                }
                StreamEvent::Disconnected => {
                    self.set_status(&me, AccountStatus::Disconnected);
                    monitor.dispose().await;
                }
                StreamEvent::MemberDisconnected(evt) | StreamEvent::MemberExpired(evt)
                    if evt.account_id == me =>
                {
                    monitor.dispose().await;
                }
                StreamEvent::MemberKicked(evt) if evt.account_id == me => {
                    // Kicked mid post-match: the exit poll will never fire,
                    // so claim and transfer are recovered here.
                    let state = monitor.state().await;
                    if state.phase == Some(PartyPhase::PostMatchmaking) && state.started {
                        self.recover_after_kick(&account);
                    }
                }
                StreamEvent::MemberJoined(evt) if evt.account_id == me => {
                    self.set_status(&me, AccountStatus::Active);
                    monitor.schedule(Some(REJOIN_SCHEDULE_DELAY)).await;
                }
                StreamEvent::PartyUpdated(evt) => {
                    let entered_post_match = evt
                        .party_state_updated
                        .get(PARTY_STATE_KEY)
                        .map(String::as_str)
                        == Some(POST_MATCHMAKING_STATE);
                    if entered_post_match {
                        monitor.schedule(None).await;
                    }
                }
                _ => {}
            }
        }
    }

    fn recover_after_kick(&self, account: &AccountIdentity) {
        let Some(settings) = self
            .registry
            .get(&account.account_id)
            .map(|a| a.settings.clone())
        else {
            return;
        };

        if settings.auto_transfer {
            let rewards = self.services.rewards.clone();
            let account = account.clone();
            tokio::spawn(async move {
                if let Err(e) = rewards.transfer_resources(&account).await {
                    warn!(account = %account.account_id, error = %e, "resource transfer failed");
                }
            });
        }
        if settings.auto_claim {
            let rewards = self.services.rewards.clone();
            let account = account.clone();
            tokio::spawn(async move {
                if let Err(e) = rewards.claim_rewards(&account).await {
                    warn!(account = %account.account_id, error = %e, "reward claim failed");
                }
            });
        }
    }

    async fn persist_settings(&self) {
        let all: Vec<AutomationSetting> = self
            .registry
            .iter()
            .map(|entry| entry.value().settings.clone())
            .collect();
        if let Err(e) = self.services.settings.save(&all).await {
            warn!(error = %e, "failed to persist automation settings");
        }
    }

    fn set_status(&self, account_id: &str, status: AccountStatus) {
        if let Some(mut entry) = self.registry.get_mut(account_id) {
            entry.status = status;
        }
        self.publish_status();
    }

    fn publish_status(&self) {
        let list: Vec<AutomationAccount> = self
            .registry
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.status_tx.send_replace(list);
    }
}
