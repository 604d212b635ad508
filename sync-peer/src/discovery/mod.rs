//! Local-network peer discovery.
//!
//! Devices periodically announce their [`PeerIdentity`] on every available
//! [`DiscoveryChannel`] and listen for everyone else's. The [`Discovery`]
//! service turns sightings into [`DiscoveryEvent`]s:
//!
//! - first sighting of a device: `DeviceDiscovered`
//! - any later sighting: `DeviceUpdated` with the refreshed identity
//! - silence for longer than the peer TTL: `DeviceLost`
//!
//! Our own announcements are never reported.
//!
//! Network channels: DNS-SD service registration, UDP broadcast, a UDP
//! multicast group, and unicast signaling to configured peers where the
//! network drops broadcast traffic. The loopback channel only spans one
//! process and serves as the test harness.

mod loopback;
mod mdns;
mod udp;

pub use loopback::{LoopbackBus, LoopbackChannel};
pub use mdns::{ServiceRegistrationChannel, SERVICE_TYPE};
pub use udp::{MulticastChannel, UdpBroadcastChannel, UnicastChannel};

use async_trait::async_trait;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use vitalsync_types::{
    Announce, DeviceId, Envelope, ErrorClass, Message, MessageType, PeerIdentity, SyncError,
};

use crate::events::{DiscoveryEvent, EventBus};

/// Largest announcement datagram read from the network.
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Discovery errors.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// DNS-SD responder error.
    #[error("service registration error: {0}")]
    ServiceRegistration(#[from] mdns_sd::Error),

    /// Datagram did not decode.
    #[error("codec error: {0}")]
    Codec(#[from] SyncError),

    /// Datagram decoded to something other than an announcement.
    #[error("unexpected {0:?} on discovery channel")]
    UnexpectedMessage(MessageType),

    /// Channel cannot be used on this device.
    #[error("{0:?} channel unavailable")]
    Unavailable(ChannelKind),

    /// Channel was stopped while listening.
    #[error("channel stopped")]
    Stopped,
}

impl DiscoveryError {
    /// Classification for retry decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            DiscoveryError::Codec(_) | DiscoveryError::UnexpectedMessage(_) => {
                ErrorClass::Protocol
            }
            DiscoveryError::Unavailable(_) => ErrorClass::Permission,
            DiscoveryError::Io(_)
            | DiscoveryError::ServiceRegistration(_)
            | DiscoveryError::Stopped => ErrorClass::Network,
        }
    }
}

/// Kinds of discovery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// DNS-SD service registration and browsing.
    ServiceRegistration,
    /// UDP broadcast on the local subnet.
    Broadcast,
    /// UDP multicast service group.
    Multicast,
    /// Unicast signaling to configured peers.
    Unicast,
    /// In-process signaling bus.
    Loopback,
    /// Short-range radio. Not implemented; always unavailable.
    Proximity,
}

/// One received announcement.
#[derive(Debug, Clone, PartialEq)]
pub struct Sighting {
    /// Envelope sender.
    pub sender: DeviceId,
    /// The announcement.
    pub announce: Announce,
    /// Where the announcing device accepts sync connections.
    pub address: String,
}

/// A way of announcing and hearing devices.
#[async_trait]
pub trait DiscoveryChannel: Send + Sync {
    /// Which kind of channel this is.
    fn kind(&self) -> ChannelKind;

    /// Whether the channel works on this device right now.
    fn is_available(&self) -> bool;

    /// Announce `announce` as `sender`.
    async fn announce(&self, sender: DeviceId, announce: &Announce) -> Result<(), DiscoveryError>;

    /// Wait for the next announcement.
    ///
    /// Returns [`DiscoveryError::Stopped`] once `stop()` is called.
    async fn listen(&self) -> Result<Sighting, DiscoveryError>;

    /// Wake any pending `listen()` with `Stopped`.
    async fn stop(&self) -> Result<(), DiscoveryError>;
}

/// Encode an announcement as a datagram.
pub(crate) fn encode_announce(sender: DeviceId, announce: &Announce) -> Result<Vec<u8>, DiscoveryError> {
    let envelope = Envelope::seal(sender, None, &Message::Announce(announce.clone()))?;
    Ok(envelope.to_bytes()?)
}

/// Decode a datagram received from `source`.
pub(crate) fn decode_announce(bytes: &[u8], source: SocketAddr) -> Result<Sighting, DiscoveryError> {
    let (sender, announce) = open_announce(bytes)?;
    let port = announce.sync_port.unwrap_or(source.port());
    Ok(Sighting {
        sender,
        address: SocketAddr::new(source.ip(), port).to_string(),
        announce,
    })
}

pub(crate) fn open_announce(bytes: &[u8]) -> Result<(DeviceId, Announce), DiscoveryError> {
    let envelope = Envelope::from_bytes(bytes)?;
    match envelope.open()? {
        Message::Announce(announce) => Ok((envelope.sender_id, announce)),
        other => Err(DiscoveryError::UnexpectedMessage(other.message_type())),
    }
}

/// A device we have heard from.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredPeer {
    /// Latest announced identity.
    pub identity: PeerIdentity,
    /// Where to reach it.
    pub address: String,
    /// Channel of the latest sighting.
    pub channel: ChannelKind,
    /// When we last heard it.
    pub last_seen: Instant,
}

/// Discovery timings.
#[derive(Debug, Clone, Copy)]
pub struct DiscoverySettings {
    /// Re-announcement period.
    pub announce_interval: Duration,
    /// Silence after which a device is lost.
    pub peer_ttl: Duration,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            announce_interval: Duration::from_secs(5),
            peer_ttl: Duration::from_secs(60),
        }
    }
}

struct Shared {
    local: PeerIdentity,
    peers: DashMap<DeviceId, DiscoveredPeer>,
    events: EventBus,
}

impl Shared {
    fn on_sighting(&self, sighting: Sighting, channel: ChannelKind) {
        let identity = sighting.announce.identity;
        if identity.device_id == self.local.device_id {
            return;
        }
        if sighting.sender != identity.device_id {
            debug!(
                sender = ?sighting.sender,
                announced = ?identity.device_id,
                "Ignoring announcement relayed for another device"
            );
            return;
        }

        let peer = DiscoveredPeer {
            identity: identity.clone(),
            address: sighting.address.clone(),
            channel,
            last_seen: Instant::now(),
        };
        let event = match self.peers.insert(identity.device_id, peer) {
            None => {
                info!(peer = ?identity.device_id, name = %identity.display_name, ?channel, "Discovered device");
                DiscoveryEvent::DeviceDiscovered {
                    identity,
                    address: sighting.address,
                    channel,
                }
            }
            Some(_) => DiscoveryEvent::DeviceUpdated {
                identity,
                address: sighting.address,
            },
        };
        self.events.emit(event);
    }

    fn prune(&self, ttl: Duration) -> Vec<DeviceId> {
        let now = Instant::now();
        let stale: Vec<DeviceId> = self
            .peers
            .iter()
            .filter(|entry| now.duration_since(entry.last_seen) > ttl)
            .map(|entry| *entry.key())
            .collect();
        for id in &stale {
            self.peers.remove(id);
            info!(peer = ?id, "Lost device");
            self.events.emit(DiscoveryEvent::DeviceLost { device_id: *id });
        }
        stale
    }
}

/// Discovery service over a fixed set of channels.
pub struct Discovery {
    shared: Arc<Shared>,
    channels: Vec<Arc<dyn DiscoveryChannel>>,
    sync_port: Option<u16>,
    settings: DiscoverySettings,
    tasks: Mutex<Option<JoinSet<()>>>,
}

impl Discovery {
    /// Create a service announcing `local` on `channels`.
    pub fn new(
        local: PeerIdentity,
        sync_port: Option<u16>,
        channels: Vec<Arc<dyn DiscoveryChannel>>,
        settings: DiscoverySettings,
        events: EventBus,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                local,
                peers: DashMap::new(),
                events,
            }),
            channels,
            sync_port,
            settings,
            tasks: Mutex::new(None),
        }
    }

    /// Start listening and announcing. Calling it twice is a no-op.
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_some() {
            return;
        }

        let mut set = JoinSet::new();
        for channel in self.channels.iter().filter(|c| c.is_available()) {
            let channel = Arc::clone(channel);
            let shared = Arc::clone(&self.shared);
            set.spawn(listen_loop(channel, shared));
        }

        let channels = self.channels.clone();
        let shared = Arc::clone(&self.shared);
        let sync_port = self.sync_port;
        let settings = self.settings;
        set.spawn(async move {
            let mut timer = tokio::time::interval(settings.announce_interval);
            loop {
                timer.tick().await;
                fan_out(&channels, &shared.local, sync_port).await;
                shared.prune(settings.peer_ttl);
            }
        });

        info!(
            channels = self.channels.iter().filter(|c| c.is_available()).count(),
            "Discovery started"
        );
        *tasks = Some(set);
    }

    /// Stop every task. Calling it twice is a no-op.
    pub async fn stop(&self) {
        let Some(mut set) = self.tasks.lock().await.take() else {
            return;
        };
        for channel in &self.channels {
            if let Err(e) = channel.stop().await {
                warn!(channel = ?channel.kind(), "Failed to stop channel: {}", e);
            }
        }
        set.shutdown().await;
        info!("Discovery stopped");
    }

    /// Whether the service is running.
    pub async fn is_running(&self) -> bool {
        self.tasks.lock().await.is_some()
    }

    /// Announce once on every available channel.
    ///
    /// A failing channel is logged and skipped. Returns how many succeeded.
    pub async fn announce_now(&self) -> usize {
        fan_out(&self.channels, &self.shared.local, self.sync_port).await
    }

    /// Forget devices not heard from within the peer TTL.
    pub fn prune(&self) -> Vec<DeviceId> {
        self.shared.prune(self.settings.peer_ttl)
    }

    /// Snapshot of every known device.
    pub fn known_peers(&self) -> Vec<DiscoveredPeer> {
        self.shared
            .peers
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// A known device.
    pub fn peer(&self, id: &DeviceId) -> Option<DiscoveredPeer> {
        self.shared.peers.get(id).map(|entry| entry.value().clone())
    }

    /// Availability of each configured channel.
    pub fn capabilities(&self) -> Vec<(ChannelKind, bool)> {
        self.channels
            .iter()
            .map(|c| (c.kind(), c.is_available()))
            .collect()
    }

    /// Our own identity as announced.
    pub fn local_identity(&self) -> &PeerIdentity {
        &self.shared.local
    }
}

impl std::fmt::Debug for Discovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discovery")
            .field("local", &self.shared.local.device_id)
            .field("channels", &self.capabilities())
            .field("known_peers", &self.shared.peers.len())
            .finish()
    }
}

async fn listen_loop(channel: Arc<dyn DiscoveryChannel>, shared: Arc<Shared>) {
    let kind = channel.kind();
    loop {
        match channel.listen().await {
            Ok(sighting) => shared.on_sighting(sighting, kind),
            Err(DiscoveryError::Stopped) => break,
            Err(e @ (DiscoveryError::Codec(_) | DiscoveryError::UnexpectedMessage(_))) => {
                debug!(channel = ?kind, "Dropping datagram: {}", e);
            }
            Err(e) => {
                warn!(channel = ?kind, "Discovery channel failed: {}", e);
                shared.events.emit(DiscoveryEvent::ChannelFailed {
                    channel: kind,
                    error: e.to_string(),
                });
                break;
            }
        }
    }
}

async fn fan_out(
    channels: &[Arc<dyn DiscoveryChannel>],
    local: &PeerIdentity,
    sync_port: Option<u16>,
) -> usize {
    let mut identity = local.clone();
    identity.last_seen = vitalsync_types::unix_now();
    let announce = Announce {
        identity,
        sync_port,
    };
    let sender = local.device_id;

    let mut set = JoinSet::new();
    for channel in channels.iter().filter(|c| c.is_available()) {
        let channel = Arc::clone(channel);
        let announce = announce.clone();
        set.spawn(async move {
            let result = channel.announce(sender, &announce).await;
            (channel.kind(), result)
        });
    }

    let mut succeeded = 0;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((_, Ok(()))) => succeeded += 1,
            Ok((kind, Err(e))) => warn!(channel = ?kind, "Announcement failed: {}", e),
            Err(e) => warn!("Announcement task failed: {}", e),
        }
    }
    succeeded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EngineEvent;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::broadcast;
    use vitalsync_types::{Platform, PublicKey};

    fn identity(name: &str) -> PeerIdentity {
        PeerIdentity::new(
            DeviceId::random(),
            name,
            Platform::Desktop,
            Some(PublicKey::from_bytes([1u8; 32])),
        )
    }

    fn discovery_on(bus: &LoopbackBus, local: PeerIdentity, events: EventBus) -> Discovery {
        let channel: Arc<dyn DiscoveryChannel> =
            Arc::new(LoopbackChannel::new(bus.clone(), local.display_name.clone()));
        Discovery::new(local, None, vec![channel], DiscoverySettings::default(), events)
    }

    async fn next_discovery(rx: &mut broadcast::Receiver<EngineEvent>) -> DiscoveryEvent {
        loop {
            if let EngineEvent::Discovery(event) = rx.recv().await.unwrap() {
                return event;
            }
        }
    }

    /// Channel that always fails to announce.
    struct BrokenChannel {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl DiscoveryChannel for BrokenChannel {
        fn kind(&self) -> ChannelKind {
            ChannelKind::Multicast
        }
        fn is_available(&self) -> bool {
            true
        }
        async fn announce(&self, _: DeviceId, _: &Announce) -> Result<(), DiscoveryError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(DiscoveryError::Io(std::io::Error::other("network down")))
        }
        async fn listen(&self) -> Result<Sighting, DiscoveryError> {
            std::future::pending().await
        }
        async fn stop(&self) -> Result<(), DiscoveryError> {
            Ok(())
        }
    }

    // ===========================================
    // Sighting Tests
    // ===========================================

    #[tokio::test]
    async fn peers_discover_each_other() {
        let bus = LoopbackBus::new();
        let events = EventBus::default();
        let mut rx = events.subscribe();

        let a = discovery_on(&bus, identity("alpha"), events.clone());
        let b = discovery_on(&bus, identity("beta"), EventBus::default());
        a.start().await;

        b.announce_now().await;
        match next_discovery(&mut rx).await {
            DiscoveryEvent::DeviceDiscovered {
                identity,
                address,
                channel,
            } => {
                assert_eq!(identity.device_id, b.local_identity().device_id);
                assert_eq!(address, "beta");
                assert_eq!(channel, ChannelKind::Loopback);
            }
            other => panic!("unexpected {:?}", other),
        }

        b.announce_now().await;
        assert!(matches!(
            next_discovery(&mut rx).await,
            DiscoveryEvent::DeviceUpdated { .. }
        ));
        assert_eq!(a.known_peers().len(), 1);
        a.stop().await;
    }

    #[tokio::test]
    async fn own_announcements_are_filtered() {
        let bus = LoopbackBus::new();
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let a = discovery_on(&bus, identity("alpha"), events.clone());
        a.start().await;

        a.announce_now().await;
        // Give the listener a chance to process it
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(a.known_peers().is_empty());
        assert!(rx.try_recv().is_err());
        a.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peers_are_pruned() {
        let bus = LoopbackBus::new();
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let a = discovery_on(&bus, identity("alpha"), events.clone());
        let beta = identity("beta");
        a.shared.on_sighting(
            Sighting {
                sender: beta.device_id,
                announce: Announce {
                    identity: beta.clone(),
                    sync_port: None,
                },
                address: "beta".into(),
            },
            ChannelKind::Loopback,
        );
        next_discovery(&mut rx).await;

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(a.prune().is_empty());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(a.prune(), vec![beta.device_id]);
        assert!(a.known_peers().is_empty());
        assert!(matches!(
            next_discovery(&mut rx).await,
            DiscoveryEvent::DeviceLost { .. }
        ));
    }

    #[test]
    fn relayed_announcements_are_ignored() {
        let bus = LoopbackBus::new();
        let a = discovery_on(&bus, identity("alpha"), EventBus::default());
        a.shared.on_sighting(
            Sighting {
                sender: DeviceId::random(),
                announce: Announce {
                    identity: identity("beta"),
                    sync_port: None,
                },
                address: "beta".into(),
            },
            ChannelKind::Loopback,
        );
        assert!(a.known_peers().is_empty());
    }

    // ===========================================
    // Lifecycle Tests
    // ===========================================

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let bus = LoopbackBus::new();
        let a = discovery_on(&bus, identity("alpha"), EventBus::default());

        a.stop().await;
        a.start().await;
        a.start().await;
        assert!(a.is_running().await);

        a.stop().await;
        a.stop().await;
        assert!(!a.is_running().await);

        // Restart after stop works
        a.start().await;
        assert!(a.is_running().await);
        a.stop().await;
    }

    #[tokio::test]
    async fn failing_channel_does_not_block_others() {
        let bus = LoopbackBus::new();
        let broken = Arc::new(BrokenChannel {
            attempts: AtomicUsize::new(0),
        });
        let local = identity("alpha");
        let channels: Vec<Arc<dyn DiscoveryChannel>> = vec![
            broken.clone(),
            Arc::new(LoopbackChannel::new(bus.clone(), "alpha")),
        ];
        let a = Discovery::new(
            local,
            None,
            channels,
            DiscoverySettings::default(),
            EventBus::default(),
        );
        let heard = LoopbackChannel::new(bus.clone(), "observer");

        assert_eq!(a.announce_now().await, 1);
        assert_eq!(broken.attempts.load(Ordering::SeqCst), 1);
        let sighting = heard.listen().await.unwrap();
        assert_eq!(sighting.address, "alpha");
    }

    #[test]
    fn capabilities_report_availability() {
        let bus = LoopbackBus::new();
        let a = discovery_on(&bus, identity("alpha"), EventBus::default());
        assert_eq!(a.capabilities(), vec![(ChannelKind::Loopback, true)]);
    }

    // ===========================================
    // Codec Tests
    // ===========================================

    #[test]
    fn datagram_address_uses_announced_sync_port() {
        let local = identity("alpha");
        let announce = Announce {
            identity: local.clone(),
            sync_port: Some(47210),
        };
        let bytes = encode_announce(local.device_id, &announce).unwrap();
        let source: SocketAddr = "192.168.1.7:47211".parse().unwrap();

        let sighting = decode_announce(&bytes, source).unwrap();
        assert_eq!(sighting.address, "192.168.1.7:47210");
        assert_eq!(sighting.sender, local.device_id);
    }

    #[test]
    fn non_announcements_are_rejected() {
        let bytes = Envelope::seal(
            DeviceId::random(),
            None,
            &Message::Bye(vitalsync_types::Bye { reason: None }),
        )
        .unwrap()
        .to_bytes()
        .unwrap();
        let source: SocketAddr = "10.0.0.1:1".parse().unwrap();
        assert!(matches!(
            decode_announce(&bytes, source),
            Err(DiscoveryError::UnexpectedMessage(MessageType::Bye))
        ));
    }
}
