// lobbybot-core/src/automation/bot_lobby.rs
//
// Bot-lobby variant of the party-cycling service. Same invite/timeout
// skeleton as the taxi, plus ready-check handling: once every other
// member reports ready, this account marks itself ready and rides a
// short-lived matchmaking ticket session until the Play signal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{info, warn};

use lobbybot_common::models::{AccountIdentity, PartySnapshot, TicketSignal};

use crate::connection::ConnectionManager;
use crate::party::PartySynchronizer;
use crate::stream::events::MemberEvent;
use crate::stream::{Availability, StreamEvent};
use crate::Error;

use super::{
    packed_location, Services, LOBBY_STATE_KEY, PACKED_STATE_KEY, PURPOSE_BOT_LOBBY, PURPOSE_TAXI,
    READY_CHECK_KEY,
};

#[derive(Clone)]
pub struct BotLobbyConfig {
    pub available_status: String,
    pub busy_status: String,
    pub auto_accept_friend_requests: bool,
    /// Force-leave timeout once a party has been joined.
    pub party_timeout: Duration,
}

impl Default for BotLobbyConfig {
    fn default() -> Self {
        Self {
            available_status: "Bot lobby ready. Send party invite to start!".to_string(),
            busy_status: "Currently in a lobby. Will be available soon.".to_string(),
            auto_accept_friend_requests: false,
            party_timeout: Duration::from_secs(180),
        }
    }
}

struct TicketSession {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct BotLobbyTasks {
    listener: Option<JoinHandle<()>>,
    leave_timer: Option<JoinHandle<()>>,
    ticket: Option<TicketSession>,
}

pub struct BotLobbyService {
    weak: Weak<Self>,
    account: AccountIdentity,
    connections: Arc<ConnectionManager>,
    parties: Arc<PartySynchronizer>,
    services: Services,
    config: BotLobbyConfig,
    active: AtomicBool,
    available: AtomicBool,
    tasks: Mutex<BotLobbyTasks>,
}

impl BotLobbyService {
    pub fn new(
        account: AccountIdentity,
        connections: Arc<ConnectionManager>,
        parties: Arc<PartySynchronizer>,
        services: Services,
        config: BotLobbyConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            account,
            connections,
            parties,
            services,
            config,
            active: AtomicBool::new(false),
            available: AtomicBool::new(false),
            tasks: Mutex::new(BotLobbyTasks::default()),
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub async fn start(&self) -> Result<(), Error> {
        let service = self
            .weak
            .upgrade()
            .ok_or_else(|| Error::Action("bot lobby service is shutting down".to_string()))?;
        // The taxi variant drives the same account differently; running
        // both would fight over presence and party membership.
        if self
            .connections
            .has_purpose(&self.account.account_id, PURPOSE_TAXI)
            .await
        {
            return Err(Error::Action(format!(
                "taxi service is already active for {}",
                self.account.account_id
            )));
        }

        let handle = self
            .connections
            .acquire(&self.account, PURPOSE_BOT_LOBBY)
            .await?;
        self.active.store(true, Ordering::SeqCst);

        let rx = handle.subscribe(None).await;
        let listener = tokio::spawn(async move { service.listen(rx).await });
        {
            let mut tasks = self.tasks.lock().await;
            if let Some(old) = tasks.listener.replace(listener) {
                old.abort();
            }
        }

        self.set_available(true).await;
        if let Err(e) = self.parties.track(&self.account).await {
            warn!(account = %self.account.account_id, error = %e, "initial party fetch failed");
        }
        if self.config.auto_accept_friend_requests {
            self.accept_pending_requests().await;
        }
        info!(account = %self.account.account_id, "bot lobby service started");
        Ok(())
    }

    pub async fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        {
            let mut tasks = self.tasks.lock().await;
            for task in [tasks.listener.take(), tasks.leave_timer.take()]
                .into_iter()
                .flatten()
            {
                task.abort();
            }
        }
        self.close_ticket().await;
        self.connections
            .remove_purpose(&self.account.account_id, PURPOSE_BOT_LOBBY)
            .await;
        self.parties.untrack(&self.account.account_id);
        info!(account = %self.account.account_id, "bot lobby service stopped");
    }

    async fn listen(self: Arc<Self>, mut rx: mpsc::Receiver<StreamEvent>) {
        let me = self.account.account_id.clone();
        while let Some(event) = rx.recv().await {
            self.parties.handle_event(&event).await;

            match &event {
                StreamEvent::PartyInvite(invite) => {
                    if let Err(e) = self.handle_invite(&invite.pinger_id).await {
                        warn!(
                            account = %me,
                            inviter = %invite.pinger_id,
                            error = %e,
                            "failed to accept party invite"
                        );
                    }
                }
                StreamEvent::FriendRequest(request) => {
                    if self.config.auto_accept_friend_requests && request.is_pending() {
                        if let Err(e) = self
                            .services
                            .friends
                            .accept_request(&self.account, &request.from)
                            .await
                        {
                            warn!(account = %me, error = %e, "friend accept failed");
                        }
                    }
                }
                StreamEvent::PartyUpdated(evt) => {
                    let ready_check_reset = evt
                        .party_state_updated
                        .get(READY_CHECK_KEY)
                        .map(String::as_str)
                        == Some("None");
                    if ready_check_reset && self.parties.snapshot(&me).is_some() {
                        self.close_ticket().await;
                        continue;
                    }
                    self.update_availability().await;
                }
                StreamEvent::MemberStateUpdated(evt) => {
                    self.handle_member_state(evt).await;
                }
                StreamEvent::MemberLeft(_) | StreamEvent::MemberKicked(_) => {
                    self.update_availability().await;
                }
                _ => {}
            }
        }
    }

    async fn handle_member_state(&self, evt: &MemberEvent) {
        let me = &self.account.account_id;
        let Some(party) = self.parties.snapshot(me) else {
            self.update_availability().await;
            return;
        };

        // A member moving into the game means the lobby is done with us.
        if let Some(raw) = evt.member_state_updated.get(PACKED_STATE_KEY) {
            if packed_location(raw).as_deref() == Some("InGame") {
                if let Err(e) = self.parties.leave(&self.account).await {
                    warn!(account = %me, error = %e, "leave on game start failed");
                }
                return;
            }
        }

        let bot_ready = party
            .member(me)
            .map(|m| game_readiness(&m.meta).as_deref() == Some("Ready"))
            .unwrap_or(false);
        let all_others_ready = party.members.len() > 1
            && party.members.iter().all(|m| {
                m.account_id == *me || game_readiness(&m.meta).as_deref() == Some("Ready")
            });

        if all_others_ready {
            if let Err(e) = self.open_ticket(&party).await {
                warn!(account = %me, error = %e, "ticket session failed to open");
            }
            if !bot_ready {
                if let Err(e) = self.send_ready_marker(&party, evt.revision).await {
                    warn!(account = %me, error = %e, "ready marker patch failed");
                }
            }
        }

        self.update_availability().await;
    }

    /// Mark this account ready, patching at the revision the triggering
    /// event carried so the marker lands exactly once.
    async fn send_ready_marker(&self, party: &PartySnapshot, revision: i64) -> Result<(), Error> {
        let mut lobby_state = party
            .member(&self.account.account_id)
            .and_then(|m| m.meta.get(LOBBY_STATE_KEY))
            .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
            .unwrap_or_else(|| serde_json::json!({}));
        if lobby_state.get("LobbyState").is_none() {
            lobby_state = serde_json::json!({ "LobbyState": {} });
        }
        lobby_state["LobbyState"]["gameReadiness"] = serde_json::json!("Ready");

        let updates = HashMap::from([(LOBBY_STATE_KEY.to_string(), lobby_state.to_string())]);
        self.services
            .party
            .patch_party(&self.account, &party.party_id, revision, &updates, true)
            .await
    }

    async fn open_ticket(&self, party: &PartySnapshot) -> Result<(), Error> {
        let mut tasks = self.tasks.lock().await;
        if let Some(session) = &tasks.ticket {
            if !session.task.is_finished() {
                return Ok(());
            }
        }

        let mut conn = self.services.tickets.open(&self.account, party).await?;
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let account_id = self.account.account_id.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    signal = conn.next_signal() => {
                        match signal {
                            Some(TicketSignal::Play) => {
                                info!(account = %account_id, "play signal, closing ticket session");
                                conn.close().await;
                                break;
                            }
                            Some(TicketSignal::Other(_)) => {}
                            None => break,
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        conn.close().await;
                        break;
                    }
                }
            }
        });
        tasks.ticket = Some(TicketSession { shutdown, task });
        Ok(())
    }

    async fn close_ticket(&self) {
        let session = self.tasks.lock().await.ticket.take();
        if let Some(session) = session {
            let _ = session.shutdown.send(true);
        }
    }

    async fn handle_invite(&self, inviter_id: &str) -> Result<(), Error> {
        if let Some(current) = self.parties.snapshot(&self.account.account_id) {
            if current.members.len() == 1 {
                self.parties.leave(&self.account).await?;
            }
        }

        let connection_ref = self
            .connections
            .connection_ref(&self.account.account_id)
            .await
            .ok_or_else(|| Error::Stream("no live session to accept the invite with".to_string()))?;

        self.parties
            .join_inviter(&self.account, inviter_id, &connection_ref, &HashMap::new())
            .await?;

        self.set_available(false).await;
        self.arm_leave_timer().await;
        // Any session from the previous lobby is meaningless now.
        self.close_ticket().await;
        Ok(())
    }

    async fn arm_leave_timer(&self) {
        let Some(service) = self.weak.upgrade() else {
            return;
        };
        let mut tasks = self.tasks.lock().await;
        if let Some(timer) = tasks.leave_timer.take() {
            timer.abort();
        }
        tasks.leave_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(service.config.party_timeout).await;
            if service.parties.snapshot(&service.account.account_id).is_some() {
                info!(account = %service.account.account_id, "party timeout reached, leaving");
                if let Err(e) = service.parties.leave(&service.account).await {
                    warn!(account = %service.account.account_id, error = %e, "timed leave failed");
                    service.parties.discard(&service.account.account_id);
                }
                service.set_available(true).await;
            }
        }));
    }

    async fn update_availability(&self) {
        let in_party = self
            .parties
            .snapshot(&self.account.account_id)
            .map(|p| p.members.len() > 1)
            .unwrap_or(false);
        if in_party {
            self.set_available(false).await;
        } else {
            self.set_available(true).await;
            let mut tasks = self.tasks.lock().await;
            if let Some(timer) = tasks.leave_timer.take() {
                timer.abort();
            }
        }
    }

    async fn set_available(&self, available: bool) {
        let result = if available {
            self.connections
                .set_status(
                    &self.account.account_id,
                    &self.config.available_status,
                    Availability::Online,
                )
                .await
        } else {
            self.connections
                .set_status(
                    &self.account.account_id,
                    &self.config.busy_status,
                    Availability::Away,
                )
                .await
        };
        if let Err(e) = result {
            warn!(account = %self.account.account_id, error = %e, "presence update failed");
        }
        self.available.store(available, Ordering::SeqCst);
    }

    async fn accept_pending_requests(&self) {
        match self.services.friends.incoming_requests(&self.account).await {
            Ok(pending) => {
                for from_id in pending {
                    if let Err(e) = self
                        .services
                        .friends
                        .accept_request(&self.account, &from_id)
                        .await
                    {
                        warn!(account = %self.account.account_id, error = %e, "friend accept failed");
                    }
                }
            }
            Err(e) => {
                warn!(account = %self.account.account_id, error = %e, "friend request lookup failed");
            }
        }
    }
}

fn game_readiness(meta: &HashMap<String, String>) -> Option<String> {
    let raw = meta.get(LOBBY_STATE_KEY)?;
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    value
        .get("LobbyState")?
        .get("gameReadiness")?
        .as_str()
        .map(str::to_string)
}
