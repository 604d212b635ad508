//! # sync-types
//!
//! Wire format types for the vitalsync peer synchronization protocol.
//!
//! This crate provides the foundational types used across all vitalsync crates:
//! - [`DeviceId`], [`OperationId`], [`SessionId`], [`TransferId`] - Identity types
//! - [`PeerIdentity`] - What a device announces about itself on the local network
//! - [`Envelope`] - Message wrapper with routing metadata
//! - [`Message`] - Protocol messages (Announce, handshake, chunks, revocation)
//! - [`TransferChunk`] - A checksummed slice of an encrypted transfer
//! - [`SyncError`], [`ErrorClass`] - Error types and the shared error taxonomy

#![warn(missing_docs)]
#![warn(clippy::all)]

mod chunk;
mod envelope;
mod error;
mod identity;
mod ids;
mod messages;

pub use chunk::{checksum, TransferChunk, CHECKSUM_SIZE};
pub use envelope::Envelope;
pub use error::{ErrorClass, SyncError};
pub use identity::{Fingerprint, PeerIdentity, Platform, PublicKey, PROTOCOL_VERSION};
pub use ids::{DeviceId, OperationId, SessionId, TransferId};
pub use messages::{
    Announce, Bye, ChunkAck, HandshakeAbort, HandshakeChallenge, HandshakeConfirm, HandshakeInit,
    HandshakeResponse, Message, MessageType, RevocationNotice,
};

/// Current unix time in seconds.
///
/// Informational only: peers never trust each other's clocks for ordering.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
