// lobbybot-core/src/stream/mod.rs
//
// Abstract persistent event-stream transport. The wire protocol itself is
// out of scope; the connection manager only sees this contract.

use std::sync::Arc;
use async_trait::async_trait;
use tokio::sync::mpsc;

use lobbybot_common::models::AccountIdentity;
use crate::Error;

pub mod bus;
pub mod events;

pub use bus::StreamEventBus;
pub use events::StreamEvent;

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionStatus {
    Connected,
    Connecting,
    Disconnected,
    Reconnecting,
    Error(String),
}

/// Presence availability, mirroring the backend's show values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Online,
    Away,
    Chat,
    DoNotDisturb,
    ExtendedAway,
}

/// Credentials for one stream session. The resource string distinguishes
/// concurrent sessions of the same account on the backend.
#[derive(Debug, Clone)]
pub struct StreamCredentials {
    pub account_id: String,
    pub access_token: String,
    pub resource: String,
}

/// Raw events pushed by a transport into the channel handed to its factory.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    SessionStarted,
    Connected,
    Disconnected,
    /// An inbound message body with its sender identity. Domain decoding
    /// happens upstream in `events::decode_message`.
    Message { from: String, body: String },
}

#[async_trait]
pub trait EventStreamTransport: Send + Sync {
    /// Establish the stream. Resolves once the session is up; the caller
    /// applies the connect timeout.
    async fn connect(&self, credentials: &StreamCredentials) -> Result<(), Error>;

    async fn disconnect(&self);

    async fn send_presence(&self, status: &str, availability: Availability) -> Result<(), Error>;
}

/// Creates transports. Injected so tests can count instantiations and the
/// host application can plug in the real protocol client.
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        account: &AccountIdentity,
        events: mpsc::Sender<TransportEvent>,
    ) -> Arc<dyn EventStreamTransport>;
}
