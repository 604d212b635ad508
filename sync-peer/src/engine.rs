//! SyncEngine - the application-facing entry point.
//!
//! The engine owns one of every component and wires them together:
//!
//! ```text
//! Discovery ──► AddressBook ──► PeerLinks ──► HandshakeCoordinator
//!                                  │                 │
//! SyncOrchestrator ──► TransmissionExecutor          ▼
//!        ▲                  │                  TrustManager
//!        │                  ▼
//!   follow-ups ◄── ConflictEngine ◄── Inbox ◄── InboundHandler
//! ```
//!
//! Everything reports on one [`EventBus`]; the [`StatusMonitor`] folds
//! those events into the view returned by [`SyncEngine::sync_status`].
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use vitalsync_peer::{EngineParts, PeerConfig, SyncEngine, TcpAcceptor, TcpConnector};
//!
//! let config = PeerConfig::from_file("vitalsync.toml")?;
//! let parts = EngineParts::in_memory(Arc::new(TcpConnector::new()))
//!     .with_network_discovery(&config.discovery)
//!     .await?;
//! let engine = SyncEngine::new(config, parts).await?;
//!
//! engine.start().await?;
//! engine.serve(Arc::new(TcpAcceptor::bind("0.0.0.0:47210").await?)).await;
//! engine.start_discovery().await;
//! ```

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vitalsync_core::{
    ConflictPolicy, ConflictResolution, DeviceStatus, DeviceSyncState, FailedOperation, FieldChoice,
    NetworkQuality, Notification, OperationDescriptor, OperationKind, Priority, Record,
    RequestOutcome, ResolutionBatch, RevocationReason, SharedSecret, TrustRecord,
};
use vitalsync_types::{DeviceId, OperationId, PeerIdentity};

use crate::config::{ConfigError, DiscoveryConfig, PeerConfig};
use crate::conflicts::ConflictEngine;
use crate::discovery::{
    DiscoveredPeer, Discovery, DiscoveryChannel, DiscoverySettings, MulticastChannel,
    ServiceRegistrationChannel, UdpBroadcastChannel, UnicastChannel,
};
use crate::error::PeerError;
use crate::events::{DiscoveryEvent, EngineEvent, EventBus};
use crate::executor::{ExecutorParts, Inbox, TransmissionExecutor};
use crate::handshake::HandshakeCoordinator;
use crate::inbound::{spawn_accept_loop, InboundHandler, InboundParts};
use crate::links::PeerLinks;
use crate::orchestrator::{OrchestratorSettings, OrchestratorStats, SyncOrchestrator};
use crate::services::{
    AeadEncryptionService, EncryptionService, KeyStore, MemoryKeyStore, MemoryStateStore,
    PendingConflict, StateStore,
};
use crate::status::{StatusMonitor, SyncStatus};
use crate::transmission::Transmitter;
use crate::transport::{Acceptor, Connector};
use crate::trust::{spawn_sweep_task, TrustManager};

/// Platform services and channels the engine runs on.
pub struct EngineParts {
    /// Identity key pair and per-peer secrets.
    pub key_store: Arc<dyn KeyStore>,
    /// Durable queue, trust records and local records.
    pub state_store: Arc<dyn StateStore>,
    /// Payload encryption.
    pub encryption: Arc<dyn EncryptionService>,
    /// How peers are dialed.
    pub connector: Arc<dyn Connector>,
    /// Discovery channels to announce and listen on.
    pub channels: Vec<Arc<dyn DiscoveryChannel>>,
}

impl EngineParts {
    /// Fresh identity, in-memory state and no discovery channels.
    pub fn in_memory(connector: Arc<dyn Connector>) -> Self {
        let key_store: Arc<dyn KeyStore> = Arc::new(MemoryKeyStore::generate());
        Self {
            encryption: Arc::new(AeadEncryptionService::new(key_store.clone())),
            key_store,
            state_store: Arc::new(MemoryStateStore::new()),
            connector,
            channels: Vec::new(),
        }
    }

    /// Add a discovery channel.
    pub fn with_channel(mut self, channel: Arc<dyn DiscoveryChannel>) -> Self {
        self.channels.push(channel);
        self
    }

    /// Start the network discovery channels enabled in `config`.
    ///
    /// A channel that cannot start is skipped with a warning; discovery
    /// runs on whatever is left. Malformed addresses in `config` are errors.
    pub async fn with_network_discovery(
        mut self,
        config: &DiscoveryConfig,
    ) -> Result<Self, PeerError> {
        let signaling_peers = config.signaling_addresses()?;
        if config.enable_service_registration {
            match ServiceRegistrationChannel::start() {
                Ok(channel) => self.channels.push(Arc::new(channel)),
                Err(e) => warn!("Service registration unavailable: {}", e),
            }
        }
        if config.enable_multicast {
            let group: Ipv4Addr =
                config
                    .multicast_group
                    .parse()
                    .map_err(|_| ConfigError::Invalid {
                        field: "discovery.multicast_group",
                        reason: format!("not an IPv4 address: {}", config.multicast_group),
                    })?;
            match MulticastChannel::join(group, config.port).await {
                Ok(channel) => self.channels.push(Arc::new(channel)),
                Err(e) => warn!("Multicast discovery unavailable: {}", e),
            }
        }
        if config.enable_broadcast {
            match UdpBroadcastChannel::bind(config.port).await {
                Ok(channel) => self.channels.push(Arc::new(channel)),
                Err(e) => warn!("Broadcast discovery unavailable: {}", e),
            }
        }
        if !signaling_peers.is_empty() {
            match UnicastChannel::bind(config.signaling_port, signaling_peers).await {
                Ok(channel) => self.channels.push(Arc::new(channel)),
                Err(e) => warn!("Unicast signaling unavailable: {}", e),
            }
        }
        Ok(self)
    }
}

/// The offline-first sync engine.
pub struct SyncEngine {
    config: PeerConfig,
    identity: PeerIdentity,
    events: EventBus,
    state_store: Arc<dyn StateStore>,
    discovery: Arc<Discovery>,
    trust: Arc<TrustManager>,
    handshake: Arc<HandshakeCoordinator>,
    links: Arc<PeerLinks>,
    conflicts: Arc<ConflictEngine>,
    orchestrator: Arc<SyncOrchestrator>,
    status: Arc<StatusMonitor>,
    inbound: Arc<InboundHandler>,
    follow_ups: Mutex<Option<mpsc::UnboundedReceiver<OperationDescriptor>>>,
    tasks: Mutex<Option<Vec<JoinHandle<()>>>>,
}

impl SyncEngine {
    /// Build an engine from `config`.
    ///
    /// The device id is derived from the identity public key, so it stays
    /// the same for as long as the key store keeps its key.
    pub async fn new(config: PeerConfig, parts: EngineParts) -> Result<Self, PeerError> {
        config.validate()?;

        let public_key = parts.key_store.identity_public_key().await?;
        let device_id = DeviceId::from_array(*public_key.as_bytes());
        let identity = PeerIdentity::new(
            device_id,
            config.device.name.clone(),
            config.device.platform,
            Some(public_key),
        );
        let events = EventBus::default();

        let discovery = Arc::new(Discovery::new(
            identity.clone(),
            Some(config.device.sync_port),
            parts.channels,
            DiscoverySettings {
                announce_interval: Duration::from_secs(config.discovery.announce_interval_secs),
                peer_ttl: Duration::from_secs(config.discovery.peer_ttl_secs),
            },
            events.clone(),
        ));
        let trust = Arc::new(TrustManager::new(
            config.trust.policy(),
            parts.key_store.clone(),
            parts.state_store.clone(),
            events.clone(),
        ));
        let handshake = Arc::new(HandshakeCoordinator::new(
            device_id,
            parts.key_store.clone(),
            public_key.fingerprint(),
            Duration::from_secs(config.handshake.timeout_secs),
            trust.clone(),
            events.clone(),
        ));
        let links = Arc::new(PeerLinks::new(
            device_id,
            parts.connector,
            discovery.clone(),
            handshake.clone(),
            trust.clone(),
            parts.key_store.clone(),
        ));
        trust.set_notifier(links.clone()).await;

        let conflicts = Arc::new(ConflictEngine::new(
            ConflictPolicy::default(),
            parts.state_store.clone(),
            events.clone(),
        ));
        let inbox = Arc::new(Inbox::new());
        let (follow_tx, follow_rx) = mpsc::unbounded_channel();

        let transmitter = Transmitter::new(
            device_id,
            config.transfer.chunk_size,
            config.transfer.max_chunk_retransmits,
            Duration::from_secs(config.transfer.ack_timeout_secs),
            events.clone(),
        );
        let executor = Arc::new(TransmissionExecutor::new(
            ExecutorParts {
                trust: trust.clone(),
                links: links.clone(),
                encryption: parts.encryption.clone(),
                store: parts.state_store.clone(),
                conflicts: conflicts.clone(),
                inbox: inbox.clone(),
                follow_ups: follow_tx.clone(),
            },
            transmitter,
        ));
        let orchestrator = Arc::new(SyncOrchestrator::new(
            OrchestratorSettings::from(&config.sync),
            executor,
            parts.state_store.clone(),
            events.clone(),
        ));
        let status = Arc::new(StatusMonitor::new(
            &config.status,
            orchestrator.clone(),
            trust.clone(),
        ));
        let inbound = Arc::new(InboundHandler::new(InboundParts {
            local: device_id,
            handshake: handshake.clone(),
            trust: trust.clone(),
            keys: parts.key_store,
            encryption: parts.encryption,
            links: links.clone(),
            inbox,
            follow_ups: follow_tx,
            max_chunks: config.transfer.max_chunks(),
        }));

        info!(device = ?device_id, name = %identity.display_name, "Sync engine created");
        Ok(Self {
            config,
            identity,
            events,
            state_store: parts.state_store,
            discovery,
            trust,
            handshake,
            links,
            conflicts,
            orchestrator,
            status,
            inbound,
            follow_ups: Mutex::new(Some(follow_rx)),
            tasks: Mutex::new(None),
        })
    }

    /// Restore persisted state and start the background tasks.
    ///
    /// Calling it again while running is a no-op.
    pub async fn start(&self) -> Result<(), PeerError> {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_some() {
            return Ok(());
        }

        let trusted = self.trust.load().await?;
        let queued = self.orchestrator.load().await?;

        let mut handles = vec![
            self.status.clone().spawn(&self.events),
            self.orchestrator.clone().spawn(),
            spawn_sweep_task(
                self.trust.clone(),
                Duration::from_secs(self.config.trust.sweep_interval_secs),
            ),
            spawn_identity_watch(self.trust.clone(), self.events.subscribe()),
        ];
        if let Some(rx) = self.follow_ups.lock().await.take() {
            handles.push(spawn_follow_up_forwarder(self.orchestrator.clone(), rx));
        }
        *tasks = Some(handles);

        info!(trusted, queued, "Sync engine started");
        Ok(())
    }

    /// Accept peer connections from `acceptor` until it closes.
    pub async fn serve(&self, acceptor: Arc<dyn Acceptor>) {
        let handle = spawn_accept_loop(acceptor, self.inbound.clone());
        self.tasks
            .lock()
            .await
            .get_or_insert_with(Vec::new)
            .push(handle);
    }

    /// Stop every task, discovery and link. The engine cannot be restarted.
    pub async fn shutdown(&self) {
        if let Some(handles) = self.tasks.lock().await.take() {
            for handle in handles {
                handle.abort();
            }
        }
        self.discovery.stop().await;
        self.links.close_all().await;
        info!("Sync engine shut down");
    }

    // ----- discovery -----

    /// Start announcing and listening. Idempotent.
    pub async fn start_discovery(&self) {
        self.discovery.start().await;
    }

    /// Stop announcing and listening. Idempotent.
    pub async fn stop_discovery(&self) {
        self.discovery.stop().await;
    }

    /// Announce right away instead of waiting for the next tick.
    pub async fn announce_now(&self) -> usize {
        self.discovery.announce_now().await
    }

    /// Devices currently visible on the network.
    pub fn discovered_devices(&self) -> Vec<DiscoveredPeer> {
        self.discovery.known_peers()
    }

    // ----- trust -----

    /// Ask to trust a discovered device.
    pub async fn request_device_trust(&self, id: &DeviceId) -> Result<RequestOutcome, PeerError> {
        let peer = self
            .discovery
            .peer(id)
            .ok_or(PeerError::UnknownPeer(*id))?;
        self.trust.request_device_trust(peer.identity).await
    }

    /// Approve a pending trust request.
    pub async fn approve_device_trust(
        &self,
        id: &DeviceId,
        secret: Option<SharedSecret>,
    ) -> Result<TrustRecord, PeerError> {
        self.trust.approve_device_trust(id, secret).await
    }

    /// Discard a pending trust request.
    pub async fn reject_device_trust(&self, id: &DeviceId) -> Result<(), PeerError> {
        self.trust.reject_device_trust(id).await
    }

    /// Revoke a device, tell it so, and drop every piece of work for it.
    pub async fn revoke_device_trust(
        &self,
        id: &DeviceId,
        reason: RevocationReason,
    ) -> Result<TrustRecord, PeerError> {
        let record = self.trust.revoke_device_trust(id, reason, true).await?;
        self.handshake.cancel(id);
        self.links.disconnect(id, Some("revoked")).await;
        let dropped = self.orchestrator.forget_peer(id).await;
        debug!(peer = ?id, dropped = dropped.len(), "Revoked device's work dropped");
        Ok(record)
    }

    /// Devices currently trusted.
    pub async fn trusted_devices(&self) -> Vec<TrustRecord> {
        self.trust.trusted_devices().await
    }

    /// Requests waiting for approval.
    pub async fn pending_requests(&self) -> Vec<TrustRecord> {
        self.trust.pending_requests().await
    }

    // ----- records and sync -----

    /// Store a local record so it can be uploaded.
    pub async fn save_record(&self, record: &Record) -> Result<(), PeerError> {
        Ok(self.state_store.save_record(record).await?)
    }

    /// The local version of a record.
    pub async fn record(&self, id: &str) -> Result<Option<Record>, PeerError> {
        Ok(self.state_store.load_record(id).await?)
    }

    /// Queue sync work.
    pub async fn queue_operation(
        &self,
        descriptor: OperationDescriptor,
    ) -> Result<OperationId, PeerError> {
        self.orchestrator.queue_operation(descriptor).await
    }

    /// Give a failed operation a fresh set of retries.
    pub async fn resubmit_failed(&self, id: &OperationId) -> Result<(), PeerError> {
        self.orchestrator.resubmit_failed(id).await
    }

    /// Operations that gave up.
    pub async fn failed_operations(&self) -> Vec<FailedOperation> {
        self.orchestrator.failed_operations().await
    }

    /// Queue and breaker counters.
    pub async fn orchestrator_stats(&self) -> OrchestratorStats {
        self.orchestrator.stats().await
    }

    /// The network went away.
    pub async fn on_connectivity_lost(&self, reason: impl Into<String>) {
        self.orchestrator.on_connectivity_lost(reason).await;
    }

    /// The network came back. Returns how many operations were requeued.
    pub async fn on_connectivity_restored(&self, quality: NetworkQuality) -> usize {
        self.orchestrator.on_connectivity_restored(quality).await
    }

    // ----- conflicts -----

    /// Conflicts waiting for the user.
    pub async fn pending_conflicts(&self) -> Result<Vec<PendingConflict>, PeerError> {
        self.conflicts.pending_conflicts().await
    }

    /// Settle a parked conflict and send the result back to the peer.
    pub async fn resolve_conflict(
        &self,
        record_id: &str,
        choices: &BTreeMap<String, FieldChoice>,
    ) -> Result<ConflictResolution, PeerError> {
        let (resolution, peer) = self.conflicts.resolve_conflict(record_id, choices).await?;
        self.orchestrator
            .queue_operation(OperationDescriptor {
                kind: OperationKind::ConflictResolution,
                peer,
                data_type: resolution.merged.data_type.clone(),
                priority: Priority::High,
                payload_ref: resolution.record_id.clone(),
                max_retries: None,
            })
            .await?;
        Ok(resolution)
    }

    /// Re-run automatic resolution over parked conflicts.
    pub async fn retry_parked_conflicts(&self) -> Result<ResolutionBatch, PeerError> {
        self.conflicts.retry_parked().await
    }

    /// Resolutions applied since startup.
    pub async fn conflict_history(&self) -> Vec<ConflictResolution> {
        self.conflicts.history().await
    }

    // ----- status -----

    /// Aggregate sync status.
    pub async fn sync_status(&self) -> SyncStatus {
        self.status.sync_status().await
    }

    /// Per-device sync state.
    pub async fn device_states(&self) -> std::collections::HashMap<DeviceId, DeviceSyncState> {
        self.status.device_states().await
    }

    /// Full status of one device.
    pub async fn device_status(&self, id: &DeviceId) -> Option<DeviceStatus> {
        self.status.device_status(id).await
    }

    /// Visible notifications, newest first.
    pub async fn notifications(&self) -> Vec<Notification> {
        self.status.notifications().await
    }

    /// Dismiss one notification. Returns false if it was already gone.
    pub async fn dismiss_notification(&self, id: u64) -> bool {
        self.status.dismiss_notification(id).await
    }

    /// Dismiss every notification.
    pub async fn clear_notifications(&self) {
        self.status.clear_notifications().await;
    }

    /// Receive every engine event from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// This device as announced to peers.
    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    /// This device's id.
    pub fn device_id(&self) -> DeviceId {
        self.identity.device_id
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("device", &self.identity.device_id)
            .field("discovery", &self.discovery)
            .field("links", &self.links)
            .finish_non_exhaustive()
    }
}

fn spawn_follow_up_forwarder(
    orchestrator: Arc<SyncOrchestrator>,
    mut rx: mpsc::UnboundedReceiver<OperationDescriptor>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(descriptor) = rx.recv().await {
            let kind = descriptor.kind;
            if let Err(e) = orchestrator.queue_operation(descriptor).await {
                warn!(%kind, "Could not queue follow-up operation: {}", e);
            }
        }
    })
}

/// Re-check every sighting against the trust registry so a trusted device
/// that starts announcing a different key is revoked.
fn spawn_identity_watch(
    trust: Arc<TrustManager>,
    mut rx: broadcast::Receiver<EngineEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let identity = match rx.recv().await {
                Ok(EngineEvent::Discovery(
                    DiscoveryEvent::DeviceDiscovered { identity, .. }
                    | DiscoveryEvent::DeviceUpdated { identity, .. },
                )) => identity,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Identity watch lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            match trust.observe(&identity).await {
                Ok(Some(reason)) => {
                    warn!(peer = ?identity.device_id, %reason, "Announced identity rejected")
                }
                Ok(None) => {}
                Err(e) => warn!(peer = ?identity.device_id, "Identity check failed: {}", e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::ChannelKind;
    use crate::transport::MemoryNetwork;

    async fn engine(name: &str) -> SyncEngine {
        let mut config = PeerConfig::default();
        config.device.name = name.to_string();
        let parts = EngineParts::in_memory(Arc::new(MemoryNetwork::new()));
        SyncEngine::new(config, parts).await.unwrap()
    }

    // ===========================================
    // Construction
    // ===========================================

    #[tokio::test]
    async fn network_discovery_starts_the_enabled_channels() {
        let mut config = DiscoveryConfig::default();
        config.enable_service_registration = false;
        config.enable_multicast = false;
        config.port = 0;
        config.signaling_port = 0;
        config.signaling_peers = vec!["127.0.0.1:47212".to_string()];

        let parts = EngineParts::in_memory(Arc::new(MemoryNetwork::new()))
            .with_network_discovery(&config)
            .await
            .unwrap();
        let kinds: Vec<_> = parts.channels.iter().map(|c| c.kind()).collect();
        assert_eq!(kinds, vec![ChannelKind::Broadcast, ChannelKind::Unicast]);
    }

    #[tokio::test]
    async fn malformed_signaling_peer_fails_discovery_setup() {
        let mut config = DiscoveryConfig::default();
        config.signaling_peers = vec!["nowhere".to_string()];

        let result = EngineParts::in_memory(Arc::new(MemoryNetwork::new()))
            .with_network_discovery(&config)
            .await;
        assert!(matches!(result, Err(PeerError::Config(_))));
    }

    #[tokio::test]
    async fn device_id_follows_the_identity_key() {
        let keys: Arc<dyn KeyStore> = Arc::new(MemoryKeyStore::generate());
        let public_key = keys.identity_public_key().await.unwrap();
        let parts = EngineParts {
            encryption: Arc::new(AeadEncryptionService::new(keys.clone())),
            key_store: keys,
            state_store: Arc::new(MemoryStateStore::new()),
            connector: Arc::new(MemoryNetwork::new()),
            channels: Vec::new(),
        };
        let engine = SyncEngine::new(PeerConfig::default(), parts).await.unwrap();

        assert_eq!(engine.device_id().as_bytes(), public_key.as_bytes());
        assert_eq!(engine.identity().public_key, Some(public_key));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let mut config = PeerConfig::default();
        config.transfer.chunk_size = 0;
        let parts = EngineParts::in_memory(Arc::new(MemoryNetwork::new()));

        let result = SyncEngine::new(config, parts).await;
        assert!(matches!(result, Err(PeerError::Config(_))));
    }

    // ===========================================
    // Lifecycle
    // ===========================================

    #[tokio::test]
    async fn start_twice_is_harmless() {
        let engine = engine("phone").await;
        engine.start().await.unwrap();
        engine.start().await.unwrap();
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn trust_request_needs_a_discovered_device() {
        let engine = engine("phone").await;
        let stranger = DeviceId::random();

        let result = engine.request_device_trust(&stranger).await;
        assert!(matches!(result, Err(PeerError::UnknownPeer(id)) if id == stranger));
    }

    #[tokio::test]
    async fn queued_work_shows_up_in_status() {
        let engine = engine("phone").await;
        engine.on_connectivity_lost("airplane mode").await;

        let peer = DeviceId::random();
        engine
            .queue_operation(OperationDescriptor {
                kind: OperationKind::Upload,
                peer,
                data_type: "daily_log".into(),
                priority: Priority::Medium,
                payload_ref: "log-1".into(),
                max_retries: None,
            })
            .await
            .unwrap();

        let stats = engine.orchestrator_stats().await;
        assert_eq!(stats.queue.medium, 1);
        assert!(!stats.online);
        assert_eq!(engine.orchestrator.pending_operations().await[0].peer, peer);
    }
}
