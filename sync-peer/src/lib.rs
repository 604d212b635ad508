//! # vitalsync-peer
//!
//! Offline-first peer sync engine for vitalsync.
//!
//! Devices on the same network find each other, establish trust once,
//! authenticate every connection with a fresh handshake, and exchange
//! encrypted records. Work queued while offline is delivered when the
//! network comes back.
//!
//! ## Features
//!
//! - **Discovery**: DNS-SD service registration, UDP broadcast and multicast, unicast signaling
//! - **Trust**: Scored requests, manual or automatic approval, expiry and revocation
//! - **Handshake**: Ephemeral X25519 key agreement with challenge/response
//! - **Transfer**: Checksummed chunks, per-chunk retransmission, XChaCha20-Poly1305 payloads
//! - **Conflicts**: Field-level three-way merge with user decisions for health data
//! - **Orchestration**: Priority queue, backoff, retry budget, circuit breakers
//! - **Pure Core**: Protocol logic lives in vitalsync-core and never touches I/O
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use vitalsync_peer::{EngineParts, PeerConfig, SyncEngine, TcpConnector};
//!
//! let engine = SyncEngine::new(
//!     PeerConfig::default(),
//!     EngineParts::in_memory(Arc::new(TcpConnector::new())),
//! )
//! .await?;
//! engine.start().await?;
//! engine.start_discovery().await;
//!
//! let mut events = engine.subscribe();
//! while let Ok(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod conflicts;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod handshake;
pub mod inbound;
pub mod links;
pub mod logging;
pub mod orchestrator;
pub mod services;
pub mod status;
pub mod transmission;
pub mod transport;
pub mod trust;

pub use config::{ConfigError, PeerConfig};
pub use conflicts::{ApplyOutcome, ConflictEngine};
pub use discovery::{
    ChannelKind, DiscoveredPeer, Discovery, DiscoveryChannel, DiscoveryError, DiscoverySettings,
    LoopbackBus, LoopbackChannel, MulticastChannel, ServiceRegistrationChannel,
    UdpBroadcastChannel, UnicastChannel,
};
pub use engine::{EngineParts, SyncEngine};
pub use error::PeerError;
pub use events::{
    DiscoveryEvent, EngineEvent, EventBus, HandshakeEvent, SyncEvent, TrustEvent,
};
pub use executor::{Inbox, TransmissionExecutor, RECORD_LABEL};
pub use handshake::HandshakeCoordinator;
pub use links::{AddressBook, PeerLinks};
pub use orchestrator::{OperationExecutor, OrchestratorSettings, OrchestratorStats, SyncOrchestrator};
pub use services::{
    AeadEncryptionService, CipherEnvelope, EncryptionContext, EncryptionService, KeyId, KeyStore,
    MemoryKeyStore, MemoryStateStore, PendingConflict, ServiceError, StateStore,
};
pub use status::{StatusMonitor, SyncStatus};
pub use transmission::{TransferReport, TransmissionError, Transmitter};
pub use transport::{
    Acceptor, Connector, MemoryNetwork, MemoryTransport, MockTransport, TcpAcceptor, TcpConnector,
    TcpTransport, Transport, TransportError,
};
pub use trust::{RevocationNotifier, TrustManager};
