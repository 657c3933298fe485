// lobbybot-core/src/connection/manager.rs
//
// Shared-ownership connection registry. Each account gets at most one
// live stream connection, reference-counted by named purposes; the
// connection survives as long as any purpose still holds it.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use lobbybot_common::models::AccountIdentity;
use lobbybot_common::traits::TokenSupplier;

use crate::stream::{
    events, Availability, ConnectionStatus, EventStreamTransport, StreamCredentials, StreamEvent,
    StreamEventBus, TransportEvent, TransportFactory,
};
use crate::utils::backoff;
use crate::Error;

use super::{CONNECT_TIMEOUT, HEARTBEAT_INTERVAL};

const TRANSPORT_CHANNEL_SIZE: usize = 256;

struct HandleState {
    purposes: HashSet<String>,
    status: ConnectionStatus,
    reconnect_attempts: u32,
    intentional_disconnect: bool,
    connected: bool,
    /// Last presence sent via `set_status`, resent by the heartbeat and
    /// after every reconnect.
    presence: Option<(String, Availability)>,
    /// Resource string of the current session, used as the connection
    /// reference when accepting party invites.
    connection_ref: Option<String>,
    heartbeat: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    dispatch: Option<JoinHandle<()>>,
}

/// One account's live stream connection plus its event fan-out bus.
pub struct ConnectionHandle {
    pub account: AccountIdentity,
    pub bus: StreamEventBus,
    transport: Arc<dyn EventStreamTransport>,
    state: Mutex<HandleState>,
}

impl ConnectionHandle {
    pub async fn status(&self) -> ConnectionStatus {
        self.state.lock().await.status.clone()
    }

    pub async fn purposes(&self) -> Vec<String> {
        let st = self.state.lock().await;
        st.purposes.iter().cloned().collect()
    }

    pub async fn connection_ref(&self) -> Option<String> {
        self.state.lock().await.connection_ref.clone()
    }

    /// Subscribe to this connection's decoded event stream.
    pub async fn subscribe(&self, buffer_size: Option<usize>) -> mpsc::Receiver<StreamEvent> {
        self.bus.subscribe(buffer_size).await
    }
}

pub struct ConnectionManager {
    tokens: Arc<dyn TokenSupplier>,
    factory: Arc<dyn TransportFactory>,
    handles: DashMap<String, Arc<ConnectionHandle>>,
    /// Per-account mutex serializing acquire/release so concurrent
    /// callers cannot race a teardown against a fresh connect.
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ConnectionManager {
    pub fn new(tokens: Arc<dyn TokenSupplier>, factory: Arc<dyn TransportFactory>) -> Arc<Self> {
        Arc::new(Self {
            tokens,
            factory,
            handles: DashMap::new(),
            locks: DashMap::new(),
        })
    }

    /// Acquire the account's connection for `purpose`, connecting it if no
    /// other purpose holds it yet. An existing connection is shared; only
    /// the purpose set grows.
    pub async fn acquire(
        &self,
        account: &AccountIdentity,
        purpose: &str,
    ) -> Result<Arc<ConnectionHandle>, Error> {
        let lock = self.account_lock(&account.account_id);
        let _guard = lock.lock().await;

        if let Some(handle) = self.handle(&account.account_id) {
            let mut st = handle.state.lock().await;
            st.purposes.insert(purpose.to_string());
            debug!(
                account = %account.account_id,
                purpose,
                "joined existing connection"
            );
            drop(st);
            return Ok(handle);
        }

        let (tx, rx) = mpsc::channel(TRANSPORT_CHANNEL_SIZE);
        let transport = self.factory.create(account, tx);
        let handle = Arc::new(ConnectionHandle {
            account: account.clone(),
            bus: StreamEventBus::new(),
            transport,
            state: Mutex::new(HandleState {
                purposes: HashSet::from([purpose.to_string()]),
                status: ConnectionStatus::Connecting,
                reconnect_attempts: 0,
                intentional_disconnect: false,
                connected: false,
                presence: None,
                connection_ref: None,
                heartbeat: None,
                reconnect: None,
                dispatch: None,
            }),
        });
        self.handles
            .insert(account.account_id.clone(), handle.clone());

        let dispatch = tokio::spawn(dispatch_loop(self.tokens.clone(), handle.clone(), rx));
        handle.state.lock().await.dispatch = Some(dispatch);

        if let Err(e) = establish(&self.tokens, &handle).await {
            if e.is_auth() {
                self.teardown(&handle).await;
                self.handles.remove(&account.account_id);
                return Err(e);
            }
            warn!(
                account = %account.account_id,
                error = %e,
                "initial connect failed, will retry"
            );
            {
                let mut st = handle.state.lock().await;
                st.reconnect_attempts = 1;
                st.status = ConnectionStatus::Reconnecting;
            }
            schedule_reconnect(&self.tokens, &handle).await;
        }
        Ok(handle)
    }

    /// Explicit (re)connect. Cancels any pending reconnect timer first so
    /// the manual attempt and the scheduled one cannot interleave.
    pub async fn connect(&self, account_id: &str) -> Result<(), Error> {
        let handle = self
            .handle(account_id)
            .ok_or_else(|| Error::Stream(format!("no connection registered for {account_id}")))?;
        {
            let mut st = handle.state.lock().await;
            st.intentional_disconnect = false;
            if let Some(task) = st.reconnect.take() {
                task.abort();
            }
        }
        establish(&self.tokens, &handle).await
    }

    /// Release `purpose`. Tears the connection down once no purpose holds
    /// it anymore; returns true if that happened.
    pub async fn remove_purpose(&self, account_id: &str, purpose: &str) -> bool {
        let lock = self.account_lock(account_id);
        let _guard = lock.lock().await;

        let Some(handle) = self.handle(account_id) else {
            return false;
        };
        let now_empty = {
            let mut st = handle.state.lock().await;
            st.purposes.remove(purpose);
            st.purposes.is_empty()
        };
        if now_empty {
            self.teardown(&handle).await;
            self.handles.remove(account_id);
        } else {
            debug!(account = %account_id, purpose, "released purpose, connection kept");
        }
        now_empty
    }

    /// Unconditional teardown regardless of remaining purposes.
    pub async fn disconnect(&self, account_id: &str) {
        let lock = self.account_lock(account_id);
        let _guard = lock.lock().await;

        if let Some(handle) = self.handle(account_id) {
            self.teardown(&handle).await;
            self.handles.remove(account_id);
        }
    }

    /// Send a presence status and keep resending it on the heartbeat
    /// interval until it is replaced or reset.
    pub async fn set_status(
        &self,
        account_id: &str,
        status: &str,
        availability: Availability,
    ) -> Result<(), Error> {
        let handle = self
            .handle(account_id)
            .ok_or_else(|| Error::Stream(format!("no connection registered for {account_id}")))?;
        handle.transport.send_presence(status, availability).await?;

        let mut st = handle.state.lock().await;
        st.presence = Some((status.to_string(), availability));
        if let Some(task) = st.heartbeat.take() {
            task.abort();
        }
        let transport = handle.transport.clone();
        let resend_status = status.to_string();
        let account = account_id.to_string();
        st.heartbeat = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = transport.send_presence(&resend_status, availability).await {
                    warn!(account = %account, error = %e, "presence heartbeat failed");
                }
            }
        }));
        Ok(())
    }

    /// Clear the stored presence and stop the heartbeat.
    pub async fn reset_status(&self, account_id: &str) -> Result<(), Error> {
        let handle = self
            .handle(account_id)
            .ok_or_else(|| Error::Stream(format!("no connection registered for {account_id}")))?;
        {
            let mut st = handle.state.lock().await;
            st.presence = None;
            if let Some(task) = st.heartbeat.take() {
                task.abort();
            }
        }
        handle.transport.send_presence("", Availability::Online).await
    }

    pub fn handle(&self, account_id: &str) -> Option<Arc<ConnectionHandle>> {
        self.handles.get(account_id).map(|h| h.value().clone())
    }

    pub fn has_connection(&self, account_id: &str) -> bool {
        self.handles.contains_key(account_id)
    }

    pub async fn has_purpose(&self, account_id: &str, purpose: &str) -> bool {
        match self.handle(account_id) {
            Some(handle) => handle.state.lock().await.purposes.contains(purpose),
            None => false,
        }
    }

    pub async fn status(&self, account_id: &str) -> Option<ConnectionStatus> {
        match self.handle(account_id) {
            Some(handle) => Some(handle.status().await),
            None => None,
        }
    }

    pub async fn connection_ref(&self, account_id: &str) -> Option<String> {
        match self.handle(account_id) {
            Some(handle) => handle.connection_ref().await,
            None => None,
        }
    }

    pub fn account_ids(&self) -> Vec<String> {
        self.handles.iter().map(|e| e.key().clone()).collect()
    }

    fn account_lock(&self, account_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(account_id.to_string())
            .or_default()
            .clone()
    }

    async fn teardown(&self, handle: &Arc<ConnectionHandle>) {
        {
            let mut st = handle.state.lock().await;
            st.intentional_disconnect = true;
            st.connected = false;
            st.status = ConnectionStatus::Disconnected;
            for task in [st.heartbeat.take(), st.reconnect.take()]
                .into_iter()
                .flatten()
            {
                task.abort();
            }
        }
        handle.transport.disconnect().await;
        handle.bus.publish(StreamEvent::Disconnected).await;
        if let Some(task) = handle.state.lock().await.dispatch.take() {
            task.abort();
        }
        info!(account = %handle.account.account_id, "connection torn down");
    }
}

/// Bring the session up: fresh token, fresh resource, bounded connect.
/// No timer manipulation here so the reconnect loop can call it too.
async fn establish(
    tokens: &Arc<dyn TokenSupplier>,
    handle: &Arc<ConnectionHandle>,
) -> Result<(), Error> {
    {
        let mut st = handle.state.lock().await;
        if st.connected {
            return Ok(());
        }
        st.status = ConnectionStatus::Connecting;
    }

    let token = tokens.get_token(&handle.account, true).await?;
    let resource = format!(
        "V2:Fortnite:WIN::{}",
        Uuid::new_v4().simple().to_string().to_uppercase()
    );
    let credentials = StreamCredentials {
        account_id: handle.account.account_id.clone(),
        access_token: token.access_token.clone(),
        resource: resource.clone(),
    };
    tokio::time::timeout(CONNECT_TIMEOUT, handle.transport.connect(&credentials)).await??;

    let presence = {
        let mut st = handle.state.lock().await;
        st.connected = true;
        st.reconnect_attempts = 0;
        st.status = ConnectionStatus::Connected;
        st.connection_ref = Some(resource);
        st.presence.clone()
    };
    // Re-assert any presence the session had before it dropped.
    if let Some((status, availability)) = presence {
        if let Err(e) = handle.transport.send_presence(&status, availability).await {
            warn!(
                account = %handle.account.account_id,
                error = %e,
                "failed to restore presence after connect"
            );
        }
    }
    info!(account = %handle.account.account_id, "stream session established");
    Ok(())
}

async fn dispatch_loop(
    tokens: Arc<dyn TokenSupplier>,
    handle: Arc<ConnectionHandle>,
    mut rx: mpsc::Receiver<TransportEvent>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            TransportEvent::SessionStarted => {
                handle.bus.publish(StreamEvent::SessionStarted).await;
            }
            TransportEvent::Connected => {
                handle.bus.publish(StreamEvent::Connected).await;
            }
            TransportEvent::Disconnected => {
                let intentional = {
                    let mut st = handle.state.lock().await;
                    st.connected = false;
                    if !st.intentional_disconnect {
                        st.status = ConnectionStatus::Reconnecting;
                    }
                    st.intentional_disconnect
                };
                handle.bus.publish(StreamEvent::Disconnected).await;
                if !intentional {
                    warn!(
                        account = %handle.account.account_id,
                        "stream dropped, scheduling reconnect"
                    );
                    schedule_reconnect(&tokens, &handle).await;
                }
            }
            TransportEvent::Message { from, body } => {
                if let Some(decoded) = events::decode_message(&from, &body) {
                    handle.bus.publish(decoded).await;
                }
            }
        }
    }
    debug!(account = %handle.account.account_id, "transport event channel closed");
}

async fn schedule_reconnect(tokens: &Arc<dyn TokenSupplier>, handle: &Arc<ConnectionHandle>) {
    let mut st = handle.state.lock().await;
    if st.intentional_disconnect {
        return;
    }
    if let Some(task) = &st.reconnect {
        if !task.is_finished() {
            return;
        }
    }
    st.reconnect = Some(tokio::spawn(reconnect_loop(
        tokens.clone(),
        handle.clone(),
    )));
}

/// Backed-off reconnect attempts. Stops on success, on an intentional
/// disconnect, on rejected credentials, or after the attempt cap.
async fn reconnect_loop(tokens: Arc<dyn TokenSupplier>, handle: Arc<ConnectionHandle>) {
    loop {
        let attempts = {
            let st = handle.state.lock().await;
            if st.intentional_disconnect {
                break;
            }
            st.reconnect_attempts
        };
        if attempts >= backoff::MAX_RECONNECT_ATTEMPTS {
            error!(
                account = %handle.account.account_id,
                attempts,
                "reconnect attempts exhausted"
            );
            handle.state.lock().await.status =
                ConnectionStatus::Error(Error::ExhaustedRetries(attempts).to_string());
            break;
        }

        tokio::time::sleep(backoff::reconnect_delay(attempts)).await;
        if handle.state.lock().await.intentional_disconnect {
            break;
        }

        match establish(&tokens, &handle).await {
            Ok(()) => break,
            Err(e) if e.is_auth() => {
                error!(
                    account = %handle.account.account_id,
                    error = %e,
                    "credentials rejected, stopping reconnects"
                );
                handle.state.lock().await.status = ConnectionStatus::Error(e.to_string());
                break;
            }
            Err(e) => {
                let mut st = handle.state.lock().await;
                st.reconnect_attempts += 1;
                st.status = ConnectionStatus::Reconnecting;
                warn!(
                    account = %handle.account.account_id,
                    attempt = st.reconnect_attempts,
                    error = %e,
                    "reconnect attempt failed"
                );
            }
        }
    }
    handle.state.lock().await.reconnect = None;
}
