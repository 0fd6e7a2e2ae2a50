//! Relay lifecycle and activity notifications.

use crate::{Protocol, TargetAddr};
use tokio::sync::broadcast;
use tracing::warn;

const DEFAULT_CAPACITY: usize = 256;

/// Notification emitted by a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// Listener bound and accepting.
    Started { port: u16, protocol: Protocol },
    /// Listener closed and all connections torn down.
    Stopped,
    /// A client was connected through to `host:port`.
    Connection { host: String, port: u16 },
    /// Listener-level failure. Connection-level failures are only logged.
    Error { message: String },
}

/// Fan-out channel for [`RelayEvent`]s.
///
/// Publishing never blocks and never fails; with no subscribers the event
/// is dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RelayEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Bus buffering up to `capacity` events per slow subscriber.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: RelayEvent) {
        let _ = self.tx.send(event);
    }

    pub(crate) fn connection(&self, target: &TargetAddr) {
        self.publish(RelayEvent::Connection {
            host: target.host(),
            port: target.port(),
        });
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One listener's view of an [`EventBus`].
///
/// Dropping the subscription (or calling [`Subscription::unsubscribe`])
/// stops delivery.
#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<RelayEvent>,
}

impl Subscription {
    /// Next event, or `None` once the bus is gone.
    ///
    /// A subscriber that falls behind skips the overwritten events.
    pub async fn recv(&mut self) -> Option<RelayEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Relay event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next already-buffered event, without waiting.
    pub fn try_recv(&mut self) -> Option<RelayEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    pub fn unsubscribe(self) {}
}
