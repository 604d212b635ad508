//! Error types for vitalsync.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse error taxonomy shared by every layer.
///
/// The orchestrator decides whether to retry based on the class alone,
/// so every concrete error type maps onto one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    /// Connectivity loss or timeout.
    Network,
    /// Handshake or encryption failure.
    Crypto,
    /// Malformed or out-of-sequence message.
    Protocol,
    /// Policy violation or revoked peer.
    Trust,
    /// Checksum/integrity failure or a conflict needing the user.
    Data,
    /// The local side is not permitted to perform the operation.
    Permission,
}

impl ErrorClass {
    /// Whether errors of this class may be retried automatically.
    ///
    /// Crypto, trust and permission errors surface to the user instead.
    /// Data errors are retried below this level (chunk retransmission) or
    /// need a user decision, so they never retry a whole operation.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Network | ErrorClass::Protocol)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorClass::Network => "network",
            ErrorClass::Crypto => "crypto",
            ErrorClass::Protocol => "protocol",
            ErrorClass::Trust => "trust",
            ErrorClass::Data => "data",
            ErrorClass::Permission => "permission",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while encoding or decoding wire messages.
#[derive(Debug, Error)]
pub enum SyncError {
    /// MessagePack serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] rmp_serde::encode::Error),

    /// MessagePack deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] rmp_serde::decode::Error),

    /// Invalid message type discriminator
    #[error("invalid message type: {0}")]
    InvalidMessageType(u8),

    /// Invalid protocol version
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    /// Envelope discriminator does not match the decoded payload
    #[error("message type mismatch: envelope says {expected}, payload is {actual}")]
    TypeMismatch {
        /// Discriminator carried by the envelope.
        expected: u8,
        /// Discriminator of the decoded message.
        actual: u8,
    },

    /// Invalid data format
    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl SyncError {
    /// Every codec failure is a protocol error.
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Protocol
    }
}
