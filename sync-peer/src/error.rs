//! Error types for vitalsync-peer.

use vitalsync_core::{ChunkError, ConflictError, HandshakeError, QueueError, TrustError};
use vitalsync_types::{DeviceId, ErrorClass, SyncError};

use crate::config::ConfigError;
use crate::discovery::DiscoveryError;
use crate::services::ServiceError;
use crate::transmission::TransmissionError;
use crate::transport::TransportError;

/// Main error type for vitalsync-peer operations.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Wire codec error.
    #[error("codec error: {0}")]
    Codec(#[from] SyncError),

    /// Handshake error.
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// Trust error.
    #[error("trust error: {0}")]
    Trust(#[from] TrustError),

    /// Chunk reassembly error.
    #[error("chunk error: {0}")]
    Chunk(#[from] ChunkError),

    /// Transmission error.
    #[error("transmission error: {0}")]
    Transmission(#[from] TransmissionError),

    /// Conflict engine error.
    #[error("conflict error: {0}")]
    Conflict(#[from] ConflictError),

    /// Queue error.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Discovery error.
    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    /// External service error.
    #[error("service error: {0}")]
    Service(#[from] ServiceError),

    /// Device has not been discovered, so there is no address to dial.
    #[error("device {0:?} not discovered")]
    UnknownPeer(DeviceId),

    /// Referenced item does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Work was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// A deadline passed.
    #[error("timed out")]
    Timeout,

    /// An open circuit breaker refused the operation.
    #[error("circuit breaker open")]
    BreakerOpen,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PeerError {
    /// Classification for retry decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            PeerError::Config(_) => ErrorClass::Data,
            PeerError::Transport(e) => e.class(),
            PeerError::Codec(e) => e.class(),
            PeerError::Handshake(e) => e.class(),
            PeerError::Trust(e) => e.class(),
            PeerError::Chunk(e) => e.class(),
            PeerError::Transmission(e) => e.class(),
            PeerError::Conflict(e) => e.class(),
            PeerError::Queue(_) => ErrorClass::Data,
            PeerError::Discovery(e) => e.class(),
            PeerError::Service(e) => e.class(),
            PeerError::NotFound(_) => ErrorClass::Data,
            PeerError::BreakerOpen => ErrorClass::Permission,
            PeerError::UnknownPeer(_)
            | PeerError::Cancelled
            | PeerError::Timeout
            | PeerError::Io(_) => ErrorClass::Network,
        }
    }

    /// Whether the orchestrator may retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_follow_the_source_error() {
        let id = DeviceId::random();
        assert_eq!(
            PeerError::from(TrustError::NotTrusted(id)).class(),
            ErrorClass::Trust
        );
        assert_eq!(
            PeerError::from(TransportError::ConnectionClosed).class(),
            ErrorClass::Network
        );
        assert_eq!(
            PeerError::from(ServiceError::Decryption).class(),
            ErrorClass::Crypto
        );
        assert_eq!(
            PeerError::from(HandshakeError::FingerprintMismatch).class(),
            ErrorClass::Trust
        );
    }

    #[test]
    fn only_transient_errors_retry() {
        assert!(PeerError::Timeout.is_retryable());
        assert!(PeerError::UnknownPeer(DeviceId::random()).is_retryable());
        assert!(!PeerError::from(TrustError::NotTrusted(DeviceId::random())).is_retryable());
        assert!(!PeerError::NotFound("record r1".into()).is_retryable());
        assert!(!PeerError::BreakerOpen.is_retryable());
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PeerError>();
    }
}
