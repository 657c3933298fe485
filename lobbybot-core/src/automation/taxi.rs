// lobbybot-core/src/automation/taxi.rs
//
// Party-cycling "taxi" service account: advertises availability through
// presence, accepts incoming party invites, rides along until the party
// naturally dissolves or a timeout force-leaves, then becomes available
// again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{info, warn};

use lobbybot_common::models::AccountIdentity;

use crate::connection::ConnectionManager;
use crate::party::PartySynchronizer;
use crate::stream::{Availability, StreamEvent};
use crate::Error;

use super::{packed_location, Services, FORT_STATS_KEY, PACKED_STATE_KEY, PURPOSE_TAXI};

const FORT_STATS_KEYS: [&str; 16] = [
    "fortitude",
    "offense",
    "resistance",
    "tech",
    "teamFortitude",
    "teamOffense",
    "teamResistance",
    "teamTech",
    "fortitude_Phoenix",
    "offense_Phoenix",
    "resistance_Phoenix",
    "tech_Phoenix",
    "teamFortitude_Phoenix",
    "teamOffense_Phoenix",
    "teamResistance_Phoenix",
    "teamTech_Phoenix",
];

#[derive(Clone)]
pub struct TaxiConfig {
    pub available_status: String,
    pub busy_status: String,
    pub auto_accept_friend_requests: bool,
    /// Force-leave timeout once a party has been joined.
    pub party_timeout: Duration,
    /// Advertised power level, spread across the member stat keys.
    pub power_level: u32,
}

impl Default for TaxiConfig {
    fn default() -> Self {
        Self {
            available_status: "Available for taxi service. Send party invite to join!".to_string(),
            busy_status: "Currently in a party. Will be available soon.".to_string(),
            auto_accept_friend_requests: false,
            party_timeout: Duration::from_secs(90),
            power_level: 145,
        }
    }
}

#[derive(Default)]
struct TaxiTasks {
    listener: Option<JoinHandle<()>>,
    leave_timer: Option<JoinHandle<()>>,
}

pub struct TaxiService {
    weak: Weak<Self>,
    account: AccountIdentity,
    connections: Arc<ConnectionManager>,
    parties: Arc<PartySynchronizer>,
    services: Services,
    config: TaxiConfig,
    active: AtomicBool,
    available: AtomicBool,
    tasks: Mutex<TaxiTasks>,
}

impl TaxiService {
    pub fn new(
        account: AccountIdentity,
        connections: Arc<ConnectionManager>,
        parties: Arc<PartySynchronizer>,
        services: Services,
        config: TaxiConfig,
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
            tasks: Mutex::new(TaxiTasks::default()),
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
            .ok_or_else(|| Error::Action("taxi service is shutting down".to_string()))?;
        self.parties.track(&self.account).await?;

        let handle = self
            .connections
            .acquire(&self.account, PURPOSE_TAXI)
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
        if self.config.auto_accept_friend_requests {
            self.accept_pending_requests().await;
        }
        info!(account = %self.account.account_id, "taxi service started");
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
        self.connections
            .remove_purpose(&self.account.account_id, PURPOSE_TAXI)
            .await;
        self.parties.untrack(&self.account.account_id);
        info!(account = %self.account.account_id, "taxi service stopped");
    }

    /// Re-advertise the configured power level on the current party.
    pub async fn set_power_level(&self) -> Result<(), Error> {
        self.parties
            .patch(&self.account, &fort_stats(self.config.power_level), true)
            .await
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
                StreamEvent::MemberNewCaptain(evt) if evt.account_id == me => {
                    // Promoted to captain means everyone else bailed; a taxi
                    // never stays to lead.
                    if let Err(e) = self.parties.leave(&self.account).await {
                        warn!(account = %me, error = %e, "leave after promotion failed");
                    }
                }
                StreamEvent::MemberJoined(evt) if evt.account_id == me => {
                    // Empty member patch right after joining keeps the seat
                    // from expiring before the first real state update.
                    if let Err(e) = self
                        .services
                        .party
                        .patch_party(&self.account, &evt.party_id, evt.revision, &HashMap::new(), true)
                        .await
                    {
                        warn!(account = %me, error = %e, "keep-alive patch failed");
                    }
                }
                StreamEvent::MemberStateUpdated(evt) => {
                    // The backend serializes booleans Python-style here.
                    let packed = evt
                        .member_state_updated
                        .get(PACKED_STATE_KEY)
                        .map(|raw| raw.replace("True", "true"));
                    if let Some(raw) = packed {
                        if packed_location(&raw).as_deref() == Some("Lobby") {
                            if let Err(e) = self.parties.leave(&self.account).await {
                                warn!(account = %me, error = %e, "leave on lobby return failed");
                            }
                            continue;
                        }
                    }
                    self.update_availability().await;
                }
                StreamEvent::MemberJoined(_)
                | StreamEvent::MemberLeft(_)
                | StreamEvent::MemberKicked(_)
                | StreamEvent::PartyUpdated(_) => {
                    self.update_availability().await;
                }
                _ => {}
            }
        }
    }

    async fn handle_invite(&self, inviter_id: &str) -> Result<(), Error> {
        // A leftover solo party blocks the join; leave it first.
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
            .join_inviter(
                &self.account,
                inviter_id,
                &connection_ref,
                &fort_stats(self.config.power_level),
            )
            .await?;

        self.set_available(false).await;
        self.arm_leave_timer().await;
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

/// Member stat payload advertising a flat power level across every stat key.
pub(crate) fn fort_stats(power_level: u32) -> HashMap<String, String> {
    let stats: serde_json::Map<String, serde_json::Value> = FORT_STATS_KEYS
        .iter()
        .map(|key| (key.to_string(), serde_json::json!(power_level)))
        .collect();
    HashMap::from([(
        FORT_STATS_KEY.to_string(),
        serde_json::json!({ "FORTStats": stats }).to_string(),
    )])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fort_stats_covers_every_key() {
        let stats = fort_stats(131);
        let raw = stats.get(FORT_STATS_KEY).unwrap();
        let value: serde_json::Value = serde_json::from_str(raw).unwrap();
        let inner = value.get("FORTStats").unwrap().as_object().unwrap();

        assert_eq!(inner.len(), FORT_STATS_KEYS.len());
        assert!(inner.values().all(|v| v.as_u64() == Some(131)));
    }
}
