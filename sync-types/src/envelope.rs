//! Envelope - the wire format wrapper for all peer messages.

use serde::{Deserialize, Serialize};

use crate::{DeviceId, Message, MessageType, SyncError, PROTOCOL_VERSION};

/// The envelope wraps every protocol message with routing metadata.
///
/// The payload is the MessagePack encoding of a [`Message`]. Data messages
/// inside it only ever carry ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version
    pub version: u16,
    /// Message type discriminator
    pub msg_type: u8,
    /// Sender's device ID
    pub sender_id: DeviceId,
    /// Intended recipient (None for broadcast announcements)
    pub recipient_id: Option<DeviceId>,
    /// Unix timestamp (seconds) - informational only, not trusted
    pub timestamp: u64,
    /// MessagePack-encoded inner message
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Wrap a message for sending.
    pub fn seal(
        sender_id: DeviceId,
        recipient_id: Option<DeviceId>,
        message: &Message,
    ) -> Result<Self, SyncError> {
        Ok(Self {
            version: PROTOCOL_VERSION,
            msg_type: message.message_type() as u8,
            sender_id,
            recipient_id,
            timestamp: crate::unix_now(),
            payload: message.to_bytes()?,
        })
    }

    /// Decode the inner message, checking version and discriminator.
    pub fn open(&self) -> Result<Message, SyncError> {
        if self.version > PROTOCOL_VERSION {
            return Err(SyncError::UnsupportedVersion(self.version));
        }
        let expected = self.message_type()?;
        let message = Message::from_bytes(&self.payload)?;
        let actual = message.message_type();
        if actual != expected {
            return Err(SyncError::TypeMismatch {
                expected: expected as u8,
                actual: actual as u8,
            });
        }
        Ok(message)
    }

    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        rmp_serde::to_vec(self).map_err(SyncError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        rmp_serde::from_slice(bytes).map_err(SyncError::Deserialization)
    }

    /// Get the message type as an enum.
    pub fn message_type(&self) -> Result<MessageType, SyncError> {
        MessageType::try_from(self.msg_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Bye, RevocationNotice};

    #[test]
    fn envelope_seal_open_roundtrip() {
        let sender = DeviceId::random();
        let msg = Message::RevocationNotice(RevocationNotice {
            reason: "user revoked".into(),
        });

        let envelope = Envelope::seal(sender, Some(DeviceId::random()), &msg).unwrap();
        let bytes = envelope.to_bytes().unwrap();
        let restored = Envelope::from_bytes(&bytes).unwrap();

        assert_eq!(restored.sender_id, sender);
        assert_eq!(restored.open().unwrap(), msg);
    }

    #[test]
    fn envelope_rejects_future_version() {
        let msg = Message::Bye(Bye { reason: None });
        let mut envelope = Envelope::seal(DeviceId::random(), None, &msg).unwrap();
        envelope.version = PROTOCOL_VERSION + 1;

        assert!(matches!(
            envelope.open(),
            Err(SyncError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn envelope_rejects_discriminator_mismatch() {
        let msg = Message::Bye(Bye { reason: None });
        let mut envelope = Envelope::seal(DeviceId::random(), None, &msg).unwrap();
        envelope.msg_type = MessageType::Chunk as u8;

        assert!(matches!(
            envelope.open(),
            Err(SyncError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn envelope_new_sets_timestamp() {
        let msg = Message::Bye(Bye { reason: None });
        let envelope = Envelope::seal(DeviceId::random(), None, &msg).unwrap();
        // Timestamp should be recent (within last minute)
        let now = crate::unix_now();
        assert!(envelope.timestamp <= now);
        assert!(envelope.timestamp >= now - 60);
    }
}
