//! Typed engine events over a broadcast bus.
//!
//! Every component publishes what happened; the status monitor and the
//! application subscribe. Publishing never blocks and never fails: a bus
//! with no subscribers drops the event, and a slow subscriber sees
//! `RecvError::Lagged` instead of stalling the engine.

use tokio::sync::broadcast;
use vitalsync_core::{LinkNotice, OperationKind, RevocationReason};
use vitalsync_types::{DeviceId, ErrorClass, OperationId, PeerIdentity, SessionId};

use crate::discovery::ChannelKind;

/// Default bus capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Discovery events.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    /// First sighting of a device.
    DeviceDiscovered {
        /// What it announced.
        identity: PeerIdentity,
        /// Where to reach it.
        address: String,
        /// Channel it was heard on.
        channel: ChannelKind,
    },
    /// Re-announcement of a known device.
    DeviceUpdated {
        /// Refreshed identity.
        identity: PeerIdentity,
        /// Where to reach it.
        address: String,
    },
    /// Device not heard from within the peer TTL.
    DeviceLost {
        /// The device.
        device_id: DeviceId,
    },
    /// A channel stopped working.
    ChannelFailed {
        /// Which channel.
        channel: ChannelKind,
        /// What went wrong.
        error: String,
    },
}

/// Handshake events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeEvent {
    /// A handshake began.
    Started {
        /// The peer.
        peer: DeviceId,
        /// Session id.
        session_id: SessionId,
    },
    /// Both sides hold the session key.
    Completed {
        /// The peer.
        peer: DeviceId,
        /// Session id.
        session_id: SessionId,
    },
    /// The handshake failed, timed out or was cancelled.
    Failed {
        /// The peer.
        peer: DeviceId,
        /// Why.
        reason: String,
    },
}

/// Trust events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustEvent {
    /// A request waits for the user.
    ApprovalRequired {
        /// Requesting peer.
        peer: PeerIdentity,
        /// Its security score.
        score: u8,
    },
    /// A device became trusted.
    DeviceTrusted {
        /// The device.
        device_id: DeviceId,
        /// Whether the policy approved it without the user.
        automatic: bool,
    },
    /// A pending request was rejected or expired.
    RequestDiscarded {
        /// The device.
        device_id: DeviceId,
    },
    /// Trust was withdrawn.
    DeviceRevoked {
        /// The device.
        device_id: DeviceId,
        /// Why.
        reason: RevocationReason,
    },
}

/// Orchestrator and transfer events.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Operation accepted into the queue.
    OperationQueued {
        /// Operation id.
        id: OperationId,
        /// Target peer.
        peer: DeviceId,
        /// What it does.
        kind: OperationKind,
    },
    /// Operation handed to the executor.
    OperationStarted {
        /// Operation id.
        id: OperationId,
        /// Target peer.
        peer: DeviceId,
    },
    /// Operation finished.
    OperationCompleted {
        /// Operation id.
        id: OperationId,
        /// Target peer.
        peer: DeviceId,
        /// Bytes moved.
        bytes: u64,
    },
    /// Operation failed and will be retried.
    OperationRetrying {
        /// Operation id.
        id: OperationId,
        /// Target peer.
        peer: DeviceId,
        /// Retry number, starting at 1.
        attempt: u32,
        /// Backoff before the retry.
        delay_ms: u64,
        /// The failure.
        error: String,
    },
    /// Operation put back without using a retry.
    OperationDeferred {
        /// Operation id.
        id: OperationId,
        /// Target peer.
        peer: DeviceId,
        /// Earliest dispatch time (ms).
        until: u64,
        /// Why.
        reason: String,
    },
    /// Operation moved to the failed set.
    OperationFailed {
        /// Operation id.
        id: OperationId,
        /// Target peer.
        peer: DeviceId,
        /// What it did.
        kind: OperationKind,
        /// Error class of the final failure.
        class: ErrorClass,
        /// The failure.
        error: String,
    },
    /// A circuit breaker opened.
    BreakerOpened {
        /// Target peer.
        peer: DeviceId,
        /// Operation kind.
        kind: OperationKind,
    },
    /// In-progress operations went back to the queue.
    Requeued {
        /// How many.
        count: usize,
    },
    /// Bytes moved by an in-flight transfer.
    Progress {
        /// Peer.
        peer: DeviceId,
        /// Bytes since the last event.
        bytes: u64,
    },
    /// A conflict waits for the user.
    ConflictDeferred {
        /// Record id.
        record_id: String,
        /// Peer whose version conflicted.
        peer: DeviceId,
    },
    /// A conflict was resolved.
    ConflictResolved {
        /// Record id.
        record_id: String,
        /// Whether a person decided.
        by_user: bool,
    },
}

/// Any engine event.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// From discovery.
    Discovery(DiscoveryEvent),
    /// From the handshake coordinator.
    Handshake(HandshakeEvent),
    /// From the trust manager.
    Trust(TrustEvent),
    /// From the orchestrator or transfers.
    Sync(SyncEvent),
    /// Connectivity changes.
    Link(LinkNotice),
}

impl From<DiscoveryEvent> for EngineEvent {
    fn from(event: DiscoveryEvent) -> Self {
        EngineEvent::Discovery(event)
    }
}

impl From<HandshakeEvent> for EngineEvent {
    fn from(event: HandshakeEvent) -> Self {
        EngineEvent::Handshake(event)
    }
}

impl From<TrustEvent> for EngineEvent {
    fn from(event: TrustEvent) -> Self {
        EngineEvent::Trust(event)
    }
}

impl From<SyncEvent> for EngineEvent {
    fn from(event: SyncEvent) -> Self {
        EngineEvent::Sync(event)
    }
}

impl From<LinkNotice> for EngineEvent {
    fn from(notice: LinkNotice) -> Self {
        EngineEvent::Link(notice)
    }
}

/// Broadcast bus shared by every component.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event.
    pub fn emit(&self, event: impl Into<EngineEvent>) {
        // No subscribers is fine
        let _ = self.tx.send(event.into());
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_events_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(SyncEvent::Requeued { count: 2 });
        bus.emit(TrustEvent::RequestDiscarded {
            device_id: DeviceId::random(),
        });

        assert_eq!(
            rx.recv().await.unwrap(),
            EngineEvent::Sync(SyncEvent::Requeued { count: 2 })
        );
        assert!(matches!(
            rx.recv().await.unwrap(),
            EngineEvent::Trust(TrustEvent::RequestDiscarded { .. })
        ));
    }

    #[test]
    fn emit_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        assert_eq!(bus.subscriber_count(), 0);
        bus.emit(SyncEvent::Requeued { count: 0 });
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for count in 0..5 {
            bus.emit(SyncEvent::Requeued { count });
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }
}
