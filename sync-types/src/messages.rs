//! Protocol messages for vitalsync.
//!
//! These are the payloads that get wrapped in an [`Envelope`](crate::Envelope).
//! Handshake messages only carry ephemeral public keys and MAC values; data
//! messages only carry ciphertext chunks.

use serde::{Deserialize, Serialize};

use crate::{Fingerprint, PeerIdentity, SessionId, SyncError, TransferChunk, TransferId};

/// Message type discriminator for envelope routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Device announcement
    Announce = 1,
    /// Initiator sends its ephemeral key
    HandshakeInit = 2,
    /// Responder sends its ephemeral key and a challenge
    HandshakeChallenge = 3,
    /// Initiator answers and counter-challenges
    HandshakeResponse = 4,
    /// Responder answers the counter-challenge
    HandshakeConfirm = 5,
    /// Either side gives up on a handshake
    HandshakeAbort = 6,
    /// A slice of an encrypted transfer
    Chunk = 7,
    /// Receiver verdict on a chunk
    ChunkAck = 8,
    /// Trust was revoked by the sender
    RevocationNotice = 9,
    /// Graceful disconnect
    Bye = 10,
}

impl TryFrom<u8> for MessageType {
    type Error = SyncError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Announce),
            2 => Ok(MessageType::HandshakeInit),
            3 => Ok(MessageType::HandshakeChallenge),
            4 => Ok(MessageType::HandshakeResponse),
            5 => Ok(MessageType::HandshakeConfirm),
            6 => Ok(MessageType::HandshakeAbort),
            7 => Ok(MessageType::Chunk),
            8 => Ok(MessageType::ChunkAck),
            9 => Ok(MessageType::RevocationNotice),
            10 => Ok(MessageType::Bye),
            _ => Err(SyncError::InvalidMessageType(value)),
        }
    }
}

/// All possible protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// Device announcement
    Announce(Announce),
    /// Handshake step 1
    HandshakeInit(HandshakeInit),
    /// Handshake step 2
    HandshakeChallenge(HandshakeChallenge),
    /// Handshake step 3
    HandshakeResponse(HandshakeResponse),
    /// Handshake step 4
    HandshakeConfirm(HandshakeConfirm),
    /// Handshake abandoned
    HandshakeAbort(HandshakeAbort),
    /// Transfer chunk
    Chunk(TransferChunk),
    /// Chunk verdict
    ChunkAck(ChunkAck),
    /// Trust revoked
    RevocationNotice(RevocationNotice),
    /// Graceful disconnect
    Bye(Bye),
}

impl Message {
    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        rmp_serde::to_vec(self).map_err(SyncError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        rmp_serde::from_slice(bytes).map_err(SyncError::Deserialization)
    }

    /// Discriminator for this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Announce(_) => MessageType::Announce,
            Message::HandshakeInit(_) => MessageType::HandshakeInit,
            Message::HandshakeChallenge(_) => MessageType::HandshakeChallenge,
            Message::HandshakeResponse(_) => MessageType::HandshakeResponse,
            Message::HandshakeConfirm(_) => MessageType::HandshakeConfirm,
            Message::HandshakeAbort(_) => MessageType::HandshakeAbort,
            Message::Chunk(_) => MessageType::Chunk,
            Message::ChunkAck(_) => MessageType::ChunkAck,
            Message::RevocationNotice(_) => MessageType::RevocationNotice,
            Message::Bye(_) => MessageType::Bye,
        }
    }

    /// Handshake session this message belongs to, if it is a handshake message.
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            Message::HandshakeInit(m) => Some(m.session_id),
            Message::HandshakeChallenge(m) => Some(m.session_id),
            Message::HandshakeResponse(m) => Some(m.session_id),
            Message::HandshakeConfirm(m) => Some(m.session_id),
            Message::HandshakeAbort(m) => Some(m.session_id),
            _ => None,
        }
    }
}

/// Periodic announcement of a device's public identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announce {
    /// The announcing device.
    pub identity: PeerIdentity,
    /// TCP port the device accepts sync connections on.
    pub sync_port: Option<u16>,
}

/// Initiator's opening handshake message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeInit {
    /// Handshake attempt id.
    pub session_id: SessionId,
    /// Initiator's ephemeral X25519 public key.
    pub ephemeral_public: [u8; 32],
    /// Fingerprint of the initiator's long-lived key.
    pub fingerprint: Fingerprint,
}

/// Responder's ephemeral key plus a nonce challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeChallenge {
    /// Handshake attempt id.
    pub session_id: SessionId,
    /// Responder's ephemeral X25519 public key.
    pub ephemeral_public: [u8; 32],
    /// Random nonce the initiator must MAC with the shared secret.
    pub challenge: [u8; 32],
    /// Fingerprint of the responder's long-lived key.
    pub fingerprint: Fingerprint,
}

/// Initiator's proof of the shared secret and its counter-challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// Handshake attempt id.
    pub session_id: SessionId,
    /// MAC of the responder's challenge.
    pub response: [u8; 32],
    /// Random nonce the responder must MAC in turn.
    pub counter_challenge: [u8; 32],
}

/// Responder's answer to the counter-challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeConfirm {
    /// Handshake attempt id.
    pub session_id: SessionId,
    /// MAC of the initiator's counter-challenge.
    pub counter_response: [u8; 32],
}

/// Either side abandoning a handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeAbort {
    /// Handshake attempt id.
    pub session_id: SessionId,
    /// Why the handshake was abandoned.
    pub reason: String,
}

/// Receiver's verdict on a single chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkAck {
    /// Transfer the chunk belongs to.
    pub transfer_id: TransferId,
    /// Sequence number being acknowledged.
    pub sequence: u32,
    /// False when the chunk failed its checksum and must be resent.
    pub accepted: bool,
}

/// Notice that the sender revoked trust in the recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationNotice {
    /// Human-readable reason.
    pub reason: String,
}

/// Graceful disconnect message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bye {
    /// Optional reason for disconnect
    pub reason: Option<String>,
}
