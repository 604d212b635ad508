//! Inbound connections.
//!
//! A peer that dials us opens with a handshake. Once it completes, every
//! chunk is acked, reassembled, decrypted under the inbound session key
//! and parked in the [`Inbox`] with a download operation queued to apply
//! it. The connection ends on `Bye`, on a revocation notice or when the
//! transport closes.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vitalsync_core::{OperationDescriptor, OperationKind, Priority, Record, RevocationReason};
use vitalsync_types::{DeviceId, Message, TransferChunk};

use crate::error::PeerError;
use crate::executor::{FollowUps, Inbox, RECORD_LABEL};
use crate::handshake::HandshakeCoordinator;
use crate::links::PeerLinks;
use crate::services::{
    CipherEnvelope, Direction, EncryptionContext, EncryptionService, KeyId, KeyStore, ServiceError,
};
use crate::transmission::{Receiver, SyncSession, TransferDirection};
use crate::transport::{recv_message, send_message, Acceptor, Transport, TransportError};
use crate::trust::TrustManager;

/// Collaborators of an [`InboundHandler`].
pub struct InboundParts {
    /// This device.
    pub local: DeviceId,
    /// Answers handshakes.
    pub handshake: Arc<HandshakeCoordinator>,
    /// Trust checks and revocations.
    pub trust: Arc<TrustManager>,
    /// Inbound session keys.
    pub keys: Arc<dyn KeyStore>,
    /// Payload decryption.
    pub encryption: Arc<dyn EncryptionService>,
    /// Registers inbound connections for revocation notices.
    pub links: Arc<PeerLinks>,
    /// Received records.
    pub inbox: Arc<Inbox>,
    /// Where downloads are queued.
    pub follow_ups: FollowUps,
    /// Most chunks one inbound transfer may announce.
    pub max_chunks: u32,
}

/// Serves connections that peers open to us.
pub struct InboundHandler {
    parts: InboundParts,
}

impl InboundHandler {
    /// Create a handler.
    pub fn new(parts: InboundParts) -> Self {
        Self { parts }
    }

    /// Serve one connection until it ends.
    pub async fn handle(&self, transport: Arc<dyn Transport>) -> Result<(), PeerError> {
        let (peer, message) = recv_message(transport.as_ref()).await?;
        let Message::HandshakeInit(init) = message else {
            debug!(peer = ?peer, "Connection did not open with a handshake");
            let _ = transport.close().await;
            return Ok(());
        };

        let key = match self
            .parts
            .handshake
            .respond(peer, transport.as_ref(), init)
            .await
        {
            Ok(key) => key,
            Err(e) => {
                let _ = transport.close().await;
                return Err(e);
            }
        };
        let key_id = KeyId::session(&peer, Direction::Inbound);
        self.parts
            .keys
            .put(key_id.clone(), key.as_bytes().to_vec())
            .await?;
        self.parts.trust.install_session_secret(&peer, &key).await?;
        self.parts.links.register_inbound(peer, transport.clone());
        info!(peer = ?peer, "Inbound connection authenticated");

        let session = SyncSession::new(peer, TransferDirection::Receive);
        let result = self.serve(peer, transport.as_ref(), &session).await;

        self.parts.links.unregister_inbound(&peer);
        if let Err(e) = self.parts.keys.delete(&key_id).await {
            warn!(peer = ?peer, "Could not drop inbound session key: {}", e);
        }
        let _ = transport.close().await;

        let stats = session.stats();
        debug!(
            peer = ?peer,
            bytes = stats.bytes,
            chunks = stats.chunks,
            "Inbound connection ended"
        );
        result
    }

    async fn serve(
        &self,
        peer: DeviceId,
        transport: &dyn Transport,
        session: &SyncSession,
    ) -> Result<(), PeerError> {
        let mut receiver = Receiver::new(self.parts.max_chunks);
        loop {
            let (sender, message) = match recv_message(transport).await {
                Ok(received) => received,
                Err(TransportError::ConnectionClosed) => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            if sender != peer {
                warn!(peer = ?peer, claimed = ?sender, "Dropping message with wrong sender");
                continue;
            }

            match message {
                Message::Chunk(chunk) => {
                    if !self.parts.trust.is_device_trusted(&peer).await {
                        info!(peer = ?peer, "Peer no longer trusted, closing");
                        return Ok(());
                    }
                    self.on_chunk(peer, transport, &mut receiver, session, chunk)
                        .await?;
                }
                Message::RevocationNotice(notice) => {
                    warn!(peer = ?peer, reason = %notice.reason, "Peer revoked us");
                    self.parts
                        .trust
                        .revoke_device_trust(&peer, RevocationReason::PeerRevoked, false)
                        .await?;
                    return Ok(());
                }
                Message::Bye(bye) => {
                    debug!(peer = ?peer, reason = ?bye.reason, "Peer said goodbye");
                    return Ok(());
                }
                other => {
                    debug!(peer = ?peer, kind = ?other.message_type(), "Ignoring message");
                }
            }
        }
    }

    async fn on_chunk(
        &self,
        peer: DeviceId,
        transport: &dyn Transport,
        receiver: &mut Receiver,
        session: &SyncSession,
        chunk: TransferChunk,
    ) -> Result<(), PeerError> {
        let len = chunk.payload.len() as u64;
        let (ack, payload) = match receiver.on_chunk(chunk) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(peer = ?peer, "Malformed chunk: {}", e);
                return Ok(());
            }
        };
        let accepted = ack.accepted;
        send_message(transport, self.parts.local, Some(peer), &Message::ChunkAck(ack)).await?;
        if accepted {
            session.record_chunk(len);
        }

        let Some(payload) = payload else {
            return Ok(());
        };
        match self.open(peer, &payload).await {
            Ok(record) => self.park(peer, record, payload.len() as u64),
            Err(e) => warn!(peer = ?peer, "Dropping undecryptable payload: {}", e),
        }
        Ok(())
    }

    async fn open(&self, peer: DeviceId, payload: &[u8]) -> Result<Record, ServiceError> {
        let envelope = CipherEnvelope::from_bytes(payload)?;
        let context =
            EncryptionContext::new(KeyId::session(&peer, Direction::Inbound), RECORD_LABEL);
        let plaintext = self.parts.encryption.decrypt(&envelope, &context).await?;
        serde_json::from_slice(&plaintext).map_err(|e| ServiceError::Serialization(e.to_string()))
    }

    fn park(&self, peer: DeviceId, record: Record, bytes: u64) {
        let data_type = record.data_type.clone();
        let payload_ref = self.parts.inbox.put(peer, record, bytes);
        debug!(peer = ?peer, %payload_ref, "Record received");
        let download = OperationDescriptor {
            kind: OperationKind::Download,
            peer,
            data_type,
            priority: Priority::Medium,
            payload_ref: payload_ref.clone(),
            max_retries: None,
        };
        if self.parts.follow_ups.send(download).is_err() {
            warn!(peer = ?peer, "Follow-up channel closed, dropping received record");
            self.parts.inbox.remove(&payload_ref);
        }
    }
}

impl std::fmt::Debug for InboundHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundHandler")
            .field("local", &self.parts.local)
            .finish_non_exhaustive()
    }
}

/// Spawn a task accepting connections from `acceptor`.
///
/// Each connection is served on its own task. The loop ends when the
/// acceptor closes.
pub fn spawn_accept_loop(
    acceptor: Arc<dyn Acceptor>,
    handler: Arc<InboundHandler>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Accepting inbound connections");
        loop {
            match acceptor.accept().await {
                Ok(transport) => {
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handler.handle(transport).await {
                            warn!("Inbound connection failed: {}", e);
                        }
                    });
                }
                Err(TransportError::ConnectionClosed) => {
                    info!("Acceptor closed");
                    break;
                }
                Err(e) => warn!("Accept failed: {}", e),
            }
        }
    })
}
