//! Chunked transfer of encrypted payloads.
//!
//! The [`Transmitter`] splits ciphertext into checksummed chunks and sends
//! them one at a time, waiting for each `ChunkAck`. Only a chunk the
//! receiver nacks for integrity is sent again. The [`Receiver`] feeds
//! chunks into per-transfer assemblers and hands back the payload once it
//! is complete. Nothing here encrypts or decrypts.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};
use vitalsync_core::{split_into_chunks, ChunkAssembler, ChunkError, ChunkOutcome};
use vitalsync_types::{
    ChunkAck, DeviceId, ErrorClass, Message, MessageType, SessionId, TransferChunk, TransferId,
};

use crate::error::PeerError;
use crate::events::{EventBus, SyncEvent};
use crate::transport::{recv_message, send_message, Transport};

/// Completed transfers remembered so late retransmits are not delivered twice.
const COMPLETED_MEMORY: usize = 256;

/// Transmission errors.
#[derive(Debug, Error)]
pub enum TransmissionError {
    /// A chunk kept failing its integrity check at the receiver.
    #[error("chunk {sequence} of {transfer_id} rejected {attempts} times")]
    RetransmitLimit {
        /// Transfer id.
        transfer_id: TransferId,
        /// Offending chunk.
        sequence: u32,
        /// Sends of that chunk.
        attempts: u32,
    },

    /// No ack arrived in time.
    #[error("no ack for chunk {sequence} within {timeout:?}")]
    AckTimeout {
        /// Chunk awaiting its ack.
        sequence: u32,
        /// Configured ack timeout.
        timeout: Duration,
    },

    /// The peer sent something other than an ack mid-transfer.
    #[error("unexpected {0:?} during transfer")]
    UnexpectedMessage(MessageType),

    /// The peer revoked our trust mid-transfer.
    #[error("peer revoked trust: {0}")]
    Revoked(String),

    /// The peer hung up.
    #[error("peer closed the transfer")]
    PeerClosed,

    /// The sync session was cancelled.
    #[error("transfer cancelled")]
    Cancelled,
}

impl TransmissionError {
    /// Classification for retry decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            TransmissionError::RetransmitLimit { .. } => ErrorClass::Data,
            TransmissionError::UnexpectedMessage(_) => ErrorClass::Protocol,
            TransmissionError::Revoked(_) => ErrorClass::Trust,
            TransmissionError::AckTimeout { .. }
            | TransmissionError::PeerClosed
            | TransmissionError::Cancelled => ErrorClass::Network,
        }
    }
}

/// Which way data flows in a [`SyncSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// We send.
    Send,
    /// We receive.
    Receive,
    /// Both.
    Bidirectional,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStats {
    /// Peer.
    pub peer: DeviceId,
    /// Direction.
    pub direction: TransferDirection,
    /// Bytes moved.
    pub bytes: u64,
    /// Chunks moved.
    pub chunks: u64,
    /// Conflicts detected while applying received data.
    pub conflicts: u64,
    /// Time since the session started.
    pub elapsed: Duration,
    /// Bytes per second since the session started.
    pub throughput: f64,
}

/// One sync exchange with a peer.
///
/// Counters are shared between the transfer and observers; `cancel()` can
/// be called from any task.
#[derive(Debug)]
pub struct SyncSession {
    id: SessionId,
    peer: DeviceId,
    direction: TransferDirection,
    started: Instant,
    bytes: AtomicU64,
    chunks: AtomicU64,
    conflicts: AtomicU64,
    cancel: watch::Sender<bool>,
}

impl SyncSession {
    /// Start a session.
    pub fn new(peer: DeviceId, direction: TransferDirection) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            id: SessionId::new(),
            peer,
            direction,
            started: Instant::now(),
            bytes: AtomicU64::new(0),
            chunks: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
            cancel,
        }
    }

    /// Session id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Peer.
    pub fn peer(&self) -> DeviceId {
        self.peer
    }

    /// Direction.
    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    /// Count one chunk of `bytes`.
    pub fn record_chunk(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        self.chunks.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one detected conflict.
    pub fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    /// Bytes moved so far.
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Cancel the session.
    ///
    /// Returns true on the first call only.
    pub fn cancel(&self) -> bool {
        !self.cancel.send_replace(true)
    }

    /// Whether the session was cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once the session is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.subscribe();
        // The sender lives as long as self, so this only returns on cancel
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Current counters.
    pub fn stats(&self) -> SessionStats {
        let elapsed = self.started.elapsed();
        let bytes = self.bytes_transferred();
        let secs = elapsed.as_secs_f64();
        SessionStats {
            peer: self.peer,
            direction: self.direction,
            bytes,
            chunks: self.chunks.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            elapsed,
            throughput: if secs > 0.0 { bytes as f64 / secs } else { 0.0 },
        }
    }
}

/// Outcome of a finished send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    /// Transfer id.
    pub transfer_id: TransferId,
    /// Chunks in the transfer.
    pub chunks: u32,
    /// Ciphertext bytes delivered.
    pub bytes: u64,
    /// Chunks sent again after a nack.
    pub retransmits: u32,
}

/// Sends chunked payloads and waits for acks.
#[derive(Debug, Clone)]
pub struct Transmitter {
    local: DeviceId,
    chunk_size: usize,
    max_retransmits: u32,
    ack_timeout: Duration,
    events: EventBus,
}

impl Transmitter {
    /// Create a transmitter.
    pub fn new(
        local: DeviceId,
        chunk_size: usize,
        max_retransmits: u32,
        ack_timeout: Duration,
        events: EventBus,
    ) -> Self {
        Self {
            local,
            chunk_size,
            max_retransmits,
            ack_timeout,
            events,
        }
    }

    /// Send `ciphertext` to `peer`.
    ///
    /// Chunks go out in sequence order and each waits for its ack. A nacked
    /// chunk is resent up to the retransmit limit.
    pub async fn send_payload(
        &self,
        peer: DeviceId,
        transport: &dyn Transport,
        ciphertext: &[u8],
        session: Option<&SyncSession>,
    ) -> Result<TransferReport, PeerError> {
        let transfer_id = TransferId::new();
        let chunks = split_into_chunks(transfer_id, ciphertext, self.chunk_size)?;
        let total = chunks.len() as u32;
        let mut report = TransferReport {
            transfer_id,
            chunks: total,
            bytes: 0,
            retransmits: 0,
        };
        debug!(peer = ?peer, %transfer_id, chunks = total, "Sending payload");

        for chunk in chunks {
            let sequence = chunk.sequence;
            let len = chunk.payload.len() as u64;
            let message = Message::Chunk(chunk);
            let mut attempts = 0u32;

            loop {
                if session.is_some_and(SyncSession::is_cancelled) {
                    return Err(TransmissionError::Cancelled.into());
                }
                send_message(transport, self.local, Some(peer), &message).await?;
                attempts += 1;

                let accepted = match session {
                    Some(session) => tokio::select! {
                        ack = self.await_ack(transport, transfer_id, sequence) => ack?,
                        _ = session.cancelled() => return Err(TransmissionError::Cancelled.into()),
                    },
                    None => self.await_ack(transport, transfer_id, sequence).await?,
                };
                if accepted {
                    break;
                }
                if attempts > self.max_retransmits {
                    return Err(TransmissionError::RetransmitLimit {
                        transfer_id,
                        sequence,
                        attempts,
                    }
                    .into());
                }
                report.retransmits += 1;
                warn!(peer = ?peer, %transfer_id, sequence, "Chunk nacked, resending");
            }

            report.bytes += len;
            if let Some(session) = session {
                session.record_chunk(len);
            }
            self.events.emit(SyncEvent::Progress { peer, bytes: len });
        }

        Ok(report)
    }

    /// Wait for the ack of one chunk. Returns whether it was accepted.
    async fn await_ack(
        &self,
        transport: &dyn Transport,
        transfer_id: TransferId,
        sequence: u32,
    ) -> Result<bool, PeerError> {
        let wait = async {
            loop {
                let (_, message) = recv_message(transport).await?;
                match message {
                    Message::ChunkAck(ack)
                        if ack.transfer_id == transfer_id && ack.sequence == sequence =>
                    {
                        return Ok(ack.accepted);
                    }
                    Message::ChunkAck(ack) => {
                        debug!(sequence = ack.sequence, "Ignoring stale chunk ack");
                    }
                    Message::RevocationNotice(notice) => {
                        return Err(TransmissionError::Revoked(notice.reason).into());
                    }
                    Message::Bye(_) => return Err(TransmissionError::PeerClosed.into()),
                    other => {
                        return Err(
                            TransmissionError::UnexpectedMessage(other.message_type()).into()
                        );
                    }
                }
            }
        };

        tokio::time::timeout(self.ack_timeout, wait)
            .await
            .unwrap_or_else(|_| {
                Err(TransmissionError::AckTimeout {
                    sequence,
                    timeout: self.ack_timeout,
                }
                .into())
            })
    }
}

/// Reassembles inbound transfers.
#[derive(Debug)]
pub struct Receiver {
    max_chunks: u32,
    transfers: HashMap<TransferId, ChunkAssembler>,
    completed: HashSet<TransferId>,
    completed_order: VecDeque<TransferId>,
}

impl Receiver {
    /// Create an empty receiver that refuses transfers of more than
    /// `max_chunks` chunks.
    pub fn new(max_chunks: u32) -> Self {
        Self {
            max_chunks,
            transfers: HashMap::new(),
            completed: HashSet::new(),
            completed_order: VecDeque::new(),
        }
    }

    /// Offer one chunk.
    ///
    /// Returns the ack to send and, when this chunk completed its transfer,
    /// the reassembled ciphertext. A checksum mismatch is answered with a
    /// nack so the sender resends it; other malformed chunks are errors.
    pub fn on_chunk(
        &mut self,
        chunk: TransferChunk,
    ) -> Result<(ChunkAck, Option<Vec<u8>>), ChunkError> {
        let transfer_id = chunk.transfer_id;
        let sequence = chunk.sequence;
        let ack = |accepted| ChunkAck {
            transfer_id,
            sequence,
            accepted,
        };

        if self.completed.contains(&transfer_id) {
            return Ok((ack(true), None));
        }
        if chunk.total > self.max_chunks && !self.transfers.contains_key(&transfer_id) {
            return Err(ChunkError::TooManyChunks {
                total: chunk.total,
                limit: self.max_chunks,
            });
        }

        let assembler = self
            .transfers
            .entry(transfer_id)
            .or_insert_with(|| ChunkAssembler::new(transfer_id, chunk.total));

        match assembler.accept(chunk) {
            Ok(ChunkOutcome::Accepted) | Ok(ChunkOutcome::Duplicate) => Ok((ack(true), None)),
            Ok(ChunkOutcome::Completed) => {
                let payload = self
                    .transfers
                    .remove(&transfer_id)
                    .and_then(ChunkAssembler::into_payload);
                self.remember(transfer_id);
                Ok((ack(true), payload))
            }
            Err(ChunkError::Integrity { .. }) => {
                warn!(%transfer_id, sequence, "Chunk failed integrity check");
                Ok((ack(false), None))
            }
            Err(e) => Err(e),
        }
    }

    /// Sequences still missing from an unfinished transfer.
    pub fn missing(&self, transfer_id: &TransferId) -> Option<Vec<u32>> {
        self.transfers.get(transfer_id).map(ChunkAssembler::missing)
    }

    /// Transfers still being assembled.
    pub fn in_flight(&self) -> usize {
        self.transfers.len()
    }

    fn remember(&mut self, transfer_id: TransferId) {
        if self.completed.insert(transfer_id) {
            self.completed_order.push_back(transfer_id);
        }
        while self.completed_order.len() > COMPLETED_MEMORY {
            if let Some(oldest) = self.completed_order.pop_front() {
                self.completed.remove(&oldest);
            }
        }
    }
}
