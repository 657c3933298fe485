// lobbybot-core/src/stream/bus.rs
//
// Per-connection event fan-out with guaranteed delivery to every
// subscriber via bounded MPSC queues. Publishing awaits each send, so a
// slow subscriber applies backpressure instead of dropping events.

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Duration;

use crate::Error;
use super::events::StreamEvent;

const DEFAULT_BUFFER_SIZE: usize = 256;

#[derive(Clone, Default)]
pub struct StreamEventBus {
    subscribers: Arc<Mutex<Vec<mpsc::Sender<StreamEvent>>>>,
}

impl StreamEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a receiver on which all future events will be delivered.
    pub async fn subscribe(&self, buffer_size: Option<usize>) -> mpsc::Receiver<StreamEvent> {
        let size = buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE);
        let (tx, rx) = mpsc::channel(size);
        let mut subs = self.subscribers.lock().await;
        subs.push(tx);
        rx
    }

    pub async fn publish(&self, event: StreamEvent) {
        let senders = {
            let mut subs = self.subscribers.lock().await;
            // Drop subscribers whose receiver side is gone.
            subs.retain(|s| !s.is_closed());
            subs.clone()
        };
        for sender in senders {
            let _ = sender.send(event.clone()).await;
        }
    }

    /// One-shot wait for the first event matching `predicate`, bounded by
    /// `timeout`. The temporary subscription is dropped either way.
    pub async fn wait_for<F>(&self, predicate: F, timeout: Duration) -> Result<StreamEvent, Error>
    where
        F: Fn(&StreamEvent) -> bool + Send,
    {
        let mut rx = self.subscribe(Some(64)).await;
        let matched = tokio::time::timeout(timeout, async {
            while let Some(event) = rx.recv().await {
                if predicate(&event) {
                    return Some(event);
                }
            }
            None
        })
        .await?;

        matched.ok_or_else(|| Error::Stream("event bus closed while waiting".into()))
    }
}
