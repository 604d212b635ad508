//! # sync-core
//!
//! Pure logic for vitalsync (no I/O, instant tests).
//!
//! This crate implements the state machines and algorithms for peer sync
//! without any network or disk I/O, enabling fast unit tests.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about state transitions
//!
//! Time is always passed in by the caller. The actual I/O (network, disk,
//! timers) is performed by `vitalsync-peer`, which interprets the results
//! produced here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod breaker;
pub mod chunking;
pub mod conflict;
pub mod handshake;
pub mod link;
pub mod network;
pub mod queue;
pub mod retry;
pub mod status;
pub mod trust;

pub use breaker::{BreakerRegistry, BreakerState, CircuitBreaker};
pub use chunking::{split_into_chunks, ChunkAssembler, ChunkError, ChunkOutcome, DEFAULT_CHUNK_SIZE};
pub use conflict::{
    ConflictError, ConflictPolicy, ConflictResolution, ConflictResolver, DataConflict,
    DeferReason, FieldChoice, Record, ResolutionBatch, ResolutionHistory, ResolutionStrategy,
    Severity,
};
pub use handshake::{
    diffie_hellman, HandshakeError, HandshakeSession, HandshakeState, HandshakeTable, Role, SessionKey,
    DEFAULT_HANDSHAKE_TIMEOUT,
};
pub use link::{LinkAction, LinkEvent, LinkNotice, LinkPolicy, LinkState};
pub use network::{ConnectionKind, NetworkQuality};
pub use queue::{
    FailedOperation, OperationDescriptor, OperationKind, OperationQueue, Priority, QueueError,
    QueueStats, SyncOperation, DEFAULT_MAX_RETRIES,
};
pub use retry::{BackoffPolicy, RetryBudget};
pub use status::{
    check_consistency, ConsistencyIssue, ConsistencyReport, DeviceStatus, DeviceStatusBoard,
    DeviceSyncState, Notification, NotificationCenter, NotificationLevel, SyncProgress,
};
pub use trust::{
    RegistryStats, RequestOutcome, RevocationReason, SharedSecret, SweepReport, TrustError,
    TrustPolicy, TrustRecord, TrustRegistry, TrustState,
};
