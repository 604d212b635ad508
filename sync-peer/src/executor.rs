//! Operation executor backed by peer links.
//!
//! Uploads and conflict resolutions read the local record, encrypt it
//! under the outbound session key and send it as chunks. Downloads apply
//! a record that the inbound handler parked in the [`Inbox`].

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use vitalsync_core::{
    OperationDescriptor, OperationKind, Priority, Record, SyncOperation, TrustError,
};
use vitalsync_types::{DeviceId, ErrorClass};

use crate::conflicts::{ApplyOutcome, ConflictEngine};
use crate::error::PeerError;
use crate::links::PeerLinks;
use crate::orchestrator::OperationExecutor;
use crate::services::{
    Direction, EncryptionContext, EncryptionService, KeyId, ServiceError, StateStore,
};
use crate::transmission::{SyncSession, TransferDirection, Transmitter};
use crate::trust::TrustManager;

/// Encryption label for record payloads.
pub const RECORD_LABEL: &str = "vitalsync-record";

/// Channel for work discovered while executing or receiving.
pub type FollowUps = mpsc::UnboundedSender<OperationDescriptor>;

/// A decrypted record waiting to be applied.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundRecord {
    /// Sender.
    pub peer: DeviceId,
    /// The record.
    pub record: Record,
    /// Ciphertext bytes it arrived as.
    pub bytes: u64,
}

/// Received records keyed by the payload ref of their download operation.
#[derive(Debug, Default)]
pub struct Inbox {
    entries: DashMap<String, InboundRecord>,
    next: AtomicU64,
}

impl Inbox {
    /// Create an empty inbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a record and return its payload ref.
    pub fn put(&self, peer: DeviceId, record: Record, bytes: u64) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        let key = format!("inbox:{}:{}", record.id, n);
        self.entries
            .insert(key.clone(), InboundRecord { peer, record, bytes });
        key
    }

    /// Look up a parked record.
    pub fn get(&self, key: &str) -> Option<InboundRecord> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    /// Drop a record once applied.
    pub fn remove(&self, key: &str) -> Option<InboundRecord> {
        self.entries.remove(key).map(|(_, v)| v)
    }

    /// Records waiting.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing waits.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Collaborators of a [`TransmissionExecutor`].
pub struct ExecutorParts {
    /// Trust checks and sync bookkeeping.
    pub trust: Arc<TrustManager>,
    /// Outbound links.
    pub links: Arc<PeerLinks>,
    /// Payload encryption.
    pub encryption: Arc<dyn EncryptionService>,
    /// Local records.
    pub store: Arc<dyn StateStore>,
    /// Applies downloads.
    pub conflicts: Arc<ConflictEngine>,
    /// Received records.
    pub inbox: Arc<Inbox>,
    /// Where send-backs are queued.
    pub follow_ups: FollowUps,
}

/// Runs orchestrator operations against real peers.
pub struct TransmissionExecutor {
    parts: ExecutorParts,
    transmitter: Transmitter,
}

impl TransmissionExecutor {
    /// Create an executor.
    pub fn new(parts: ExecutorParts, transmitter: Transmitter) -> Self {
        Self { parts, transmitter }
    }

    async fn send_record(&self, op: &SyncOperation) -> Result<u64, PeerError> {
        let record = self
            .parts
            .store
            .load_record(&op.payload_ref)
            .await?
            .ok_or_else(|| PeerError::NotFound(format!("record {}", op.payload_ref)))?;
        let plaintext =
            serde_json::to_vec(&record).map_err(|e| ServiceError::Serialization(e.to_string()))?;

        // Connecting installs the session key the payload is sealed with
        let link = self.parts.links.connect(op.peer).await?;
        let context =
            EncryptionContext::new(KeyId::session(&op.peer, Direction::Outbound), RECORD_LABEL);
        let sealed = self
            .parts
            .encryption
            .encrypt(&plaintext, &context)
            .await?
            .to_bytes()?;

        let session = SyncSession::new(op.peer, TransferDirection::Send);
        let sent = {
            let guard = link.lock().await;
            self.transmitter
                .send_payload(op.peer, &*guard, &sealed, Some(&session))
                .await
        };
        let report = match sent {
            Ok(report) => report,
            Err(e) => {
                if e.class() == ErrorClass::Network {
                    self.parts.links.invalidate(&op.peer).await;
                }
                return Err(e);
            }
        };

        self.parts.store.save_base_record(&record).await?;
        self.parts.trust.record_sync(&op.peer).await?;
        debug!(
            peer = ?op.peer,
            record = %record.id,
            chunks = report.chunks,
            retransmits = report.retransmits,
            "Record sent"
        );
        Ok(report.bytes)
    }

    async fn apply_download(&self, op: &SyncOperation) -> Result<u64, PeerError> {
        let inbound = self
            .parts
            .inbox
            .get(&op.payload_ref)
            .ok_or_else(|| PeerError::NotFound(format!("inbox entry {}", op.payload_ref)))?;
        let record_id = inbound.record.id.clone();
        let data_type = inbound.record.data_type.clone();

        let outcome = self
            .parts
            .conflicts
            .apply_remote(inbound.peer, inbound.record)
            .await?;
        if let ApplyOutcome::Merged {
            send_back: true, ..
        } = outcome
        {
            info!(peer = ?op.peer, record = %record_id, "Sending merged record back");
            let follow_up = OperationDescriptor {
                kind: OperationKind::ConflictResolution,
                peer: op.peer,
                data_type,
                priority: Priority::High,
                payload_ref: record_id,
                max_retries: None,
            };
            if self.parts.follow_ups.send(follow_up).is_err() {
                warn!(peer = ?op.peer, "Follow-up channel closed, merged record not queued");
            }
        }

        self.parts.inbox.remove(&op.payload_ref);
        self.parts.trust.record_sync(&op.peer).await?;
        Ok(inbound.bytes)
    }
}

#[async_trait]
impl OperationExecutor for TransmissionExecutor {
    async fn execute(&self, op: &SyncOperation) -> Result<u64, PeerError> {
        if !self.parts.trust.is_device_trusted(&op.peer).await {
            return Err(TrustError::NotTrusted(op.peer).into());
        }
        match op.kind {
            OperationKind::Upload | OperationKind::ConflictResolution => self.send_record(op).await,
            OperationKind::Download => self.apply_download(op).await,
        }
    }
}

impl std::fmt::Debug for TransmissionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransmissionExecutor")
            .field("inbox", &self.parts.inbox.len())
            .finish_non_exhaustive()
    }
}
