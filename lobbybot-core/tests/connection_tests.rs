// lobbybot-core/tests/connection_tests.rs
//
// Connection manager behavior against a counting fake transport: purpose
// sharing, teardown on last release, reconnect scheduling, heartbeats.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::mpsc;
use tokio::time::Duration;

use lobbybot_common::models::{AccessToken, AccountIdentity};
use lobbybot_common::traits::TokenSupplier;
use lobbybot_core::connection::ConnectionManager;
use lobbybot_core::stream::{
    Availability, ConnectionStatus, EventStreamTransport, StreamCredentials, TransportEvent,
    TransportFactory,
};
use lobbybot_core::Error;

fn account(id: &str) -> AccountIdentity {
    AccountIdentity {
        account_id: id.to_string(),
        display_name: format!("display-{id}"),
    }
}

struct FakeTokens {
    calls: AtomicUsize,
    reject: bool,
}

impl FakeTokens {
    fn new(reject: bool) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            reject,
        })
    }
}

#[async_trait]
impl TokenSupplier for FakeTokens {
    async fn get_token(
        &self,
        account: &AccountIdentity,
        _allow_cache: bool,
    ) -> Result<AccessToken, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.reject {
            return Err(Error::AuthInvalid(format!(
                "credentials rejected for {}",
                account.account_id
            )));
        }
        Ok(AccessToken {
            access_token: format!("token-{}", account.account_id),
            expires_at: Utc::now() + ChronoDuration::hours(1),
        })
    }
}

struct FakeTransport {
    events: mpsc::Sender<TransportEvent>,
    /// How many connect attempts to refuse before succeeding.
    fail_connects: AtomicUsize,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    presence: Mutex<Vec<(String, Availability)>>,
}

impl FakeTransport {
    /// Simulate the remote end dropping the stream.
    async fn drop_stream(&self) {
        let _ = self.events.send(TransportEvent::Disconnected).await;
    }

    fn presence_sent(&self) -> Vec<(String, Availability)> {
        self.presence.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventStreamTransport for FakeTransport {
    async fn connect(&self, _credentials: &StreamCredentials) -> Result<(), Error> {
        if self.fail_connects.load(Ordering::SeqCst) > 0 {
            self.fail_connects.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::Stream("connection refused".to_string()));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::SessionStarted).await;
        Ok(())
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    async fn send_presence(&self, status: &str, availability: Availability) -> Result<(), Error> {
        self.presence
            .lock()
            .unwrap()
            .push((status.to_string(), availability));
        Ok(())
    }
}

struct FakeFactory {
    created: AtomicUsize,
    fail_first_connects: usize,
    transports: Mutex<Vec<Arc<FakeTransport>>>,
}

impl FakeFactory {
    fn new(fail_first_connects: usize) -> Arc<Self> {
        Arc::new(Self {
            created: AtomicUsize::new(0),
            fail_first_connects,
            transports: Mutex::new(Vec::new()),
        })
    }

    fn transport(&self, index: usize) -> Arc<FakeTransport> {
        self.transports.lock().unwrap()[index].clone()
    }
}

impl TransportFactory for FakeFactory {
    fn create(
        &self,
        _account: &AccountIdentity,
        events: mpsc::Sender<TransportEvent>,
    ) -> Arc<dyn EventStreamTransport> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let transport = Arc::new(FakeTransport {
            events,
            fail_connects: AtomicUsize::new(self.fail_first_connects),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            presence: Mutex::new(Vec::new()),
        });
        self.transports.lock().unwrap().push(transport.clone());
        transport
    }
}

#[tokio::test]
async fn concurrent_acquires_share_one_transport() {
    let factory = FakeFactory::new(0);
    let tokens = FakeTokens::new(false);
    let manager = ConnectionManager::new(tokens, factory.clone());
    let acc = account("acc-1");

    let (first, second) = tokio::join!(
        manager.acquire(&acc, "taxi"),
        manager.acquire(&acc, "auto-kick"),
    );
    let handle = first.unwrap();
    second.unwrap();

    assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    assert_eq!(handle.status().await, ConnectionStatus::Connected);

    let mut purposes = handle.purposes().await;
    purposes.sort();
    assert_eq!(purposes, vec!["auto-kick", "taxi"]);
}

#[tokio::test]
async fn connection_survives_until_last_purpose_released() {
    let factory = FakeFactory::new(0);
    let manager = ConnectionManager::new(FakeTokens::new(false), factory.clone());
    let acc = account("acc-1");

    manager.acquire(&acc, "taxi").await.unwrap();
    manager.acquire(&acc, "auto-kick").await.unwrap();

    assert!(!manager.remove_purpose("acc-1", "taxi").await);
    assert!(manager.has_connection("acc-1"));
    assert_eq!(factory.transport(0).disconnects.load(Ordering::SeqCst), 0);

    assert!(manager.remove_purpose("acc-1", "auto-kick").await);
    assert!(!manager.has_connection("acc-1"));
    assert_eq!(factory.transport(0).disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rejected_credentials_fail_the_acquire() {
    let factory = FakeFactory::new(0);
    let manager = ConnectionManager::new(FakeTokens::new(true), factory.clone());

    match manager.acquire(&account("acc-1"), "taxi").await {
        Err(e) => assert!(e.is_auth()),
        Ok(_) => panic!("acquire must fail on rejected credentials"),
    }
    assert!(!manager.has_connection("acc-1"));
}

#[tokio::test(start_paused = true)]
async fn reconnects_after_stream_drop() {
    let factory = FakeFactory::new(0);
    let tokens = FakeTokens::new(false);
    let manager = ConnectionManager::new(tokens.clone(), factory.clone());
    let acc = account("acc-1");

    let handle = manager.acquire(&acc, "taxi").await.unwrap();
    let transport = factory.transport(0);
    assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
    let tokens_before = tokens.calls.load(Ordering::SeqCst);

    transport.drop_stream().await;
    // First retry fires after the initial one-second backoff.
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(handle.status().await, ConnectionStatus::Connected);
    assert_eq!(transport.connects.load(Ordering::SeqCst), 2);
    assert!(
        tokens.calls.load(Ordering::SeqCst) > tokens_before,
        "every reconnect attempt must fetch a fresh token"
    );
    // Same transport reused; the factory is only consulted once per handle.
    assert_eq!(factory.created.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_initial_connect_keeps_retrying() {
    let factory = FakeFactory::new(2);
    let manager = ConnectionManager::new(FakeTokens::new(false), factory.clone());
    let acc = account("acc-1");

    // Acquire succeeds even though the transport refuses the first attempts.
    let handle = manager.acquire(&acc, "taxi").await.unwrap();
    assert_eq!(handle.status().await, ConnectionStatus::Reconnecting);

    // Backoff: 2s after the failed initial attempt, then 4s.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(handle.status().await, ConnectionStatus::Connected);
    assert_eq!(factory.transport(0).connects.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn reconnects_stop_at_the_attempt_cap() {
    // A transport that never accepts: the initial attempt plus the backed
    // off retries must stop at the cap, leaving the handle in place.
    let factory = FakeFactory::new(usize::MAX);
    let manager = ConnectionManager::new(FakeTokens::new(false), factory.clone());
    let acc = account("acc-1");

    let handle = manager.acquire(&acc, "taxi").await.unwrap();
    let transport = factory.transport(0);

    // Every retry backs off at most 30s; the cap is long since reached.
    tokio::time::sleep(Duration::from_secs(2000)).await;

    let attempts = usize::MAX - transport.fail_connects.load(Ordering::SeqCst);
    assert_eq!(attempts, 50, "initial attempt plus 49 retries");
    assert!(matches!(handle.status().await, ConnectionStatus::Error(_)));

    // No further attempts, ever.
    tokio::time::sleep(Duration::from_secs(4000)).await;
    assert_eq!(
        usize::MAX - transport.fail_connects.load(Ordering::SeqCst),
        50
    );
    // The handle is terminal but not destroyed; its purpose still holds it.
    assert!(manager.has_connection("acc-1"));
    assert_eq!(transport.connects.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn presence_heartbeat_resends_current_status() {
    let factory = FakeFactory::new(0);
    let manager = ConnectionManager::new(FakeTokens::new(false), factory.clone());
    let acc = account("acc-1");

    manager.acquire(&acc, "taxi").await.unwrap();
    manager
        .set_status("acc-1", "Open for business", Availability::Online)
        .await
        .unwrap();

    // Two heartbeat intervals on top of the immediate send.
    tokio::time::sleep(Duration::from_secs(31)).await;

    let sent = factory.transport(0).presence_sent();
    assert!(sent.len() >= 3, "expected heartbeat resends, got {sent:?}");
    assert!(sent
        .iter()
        .all(|(status, availability)| status == "Open for business"
            && *availability == Availability::Online));

    manager.reset_status("acc-1").await.unwrap();
    let cleared = factory.transport(0).presence_sent();
    assert_eq!(cleared.last().unwrap().0, "");
}

#[tokio::test(start_paused = true)]
async fn presence_is_restored_after_reconnect() {
    let factory = FakeFactory::new(0);
    let manager = ConnectionManager::new(FakeTokens::new(false), factory.clone());
    let acc = account("acc-1");

    manager.acquire(&acc, "taxi").await.unwrap();
    manager
        .set_status("acc-1", "Busy", Availability::Away)
        .await
        .unwrap();
    let transport = factory.transport(0);
    let before = transport.presence_sent().len();

    transport.drop_stream().await;
    tokio::time::sleep(Duration::from_secs(3)).await;

    let sent = transport.presence_sent();
    assert!(sent.len() > before);
    assert_eq!(
        sent.last().unwrap(),
        &("Busy".to_string(), Availability::Away)
    );
}
