//! Chunk splitting and reassembly.
//!
//! Payloads handed to this module are already ciphertext. The assembler
//! applies chunks strictly in sequence order, buffering any that arrive
//! early, and treats a repeat of an accepted chunk as a no-op.

use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use vitalsync_types::{ErrorClass, TransferChunk, TransferId, CHECKSUM_SIZE};

/// Default chunk payload size (64 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Chunk errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkError {
    /// Payload does not match its checksum.
    #[error("chunk {sequence} of {transfer_id} failed integrity check")]
    Integrity {
        /// Transfer id.
        transfer_id: TransferId,
        /// Offending chunk.
        sequence: u32,
    },

    /// A different payload arrived for an already accepted sequence.
    #[error("conflicting payload for accepted chunk {sequence}")]
    Conflicting {
        /// Offending chunk.
        sequence: u32,
    },

    /// Chunk belongs to another transfer.
    #[error("chunk for transfer {actual}, expected {expected}")]
    WrongTransfer {
        /// Transfer this assembler handles.
        expected: TransferId,
        /// Transfer the chunk names.
        actual: TransferId,
    },

    /// Chunk disagrees with the transfer's total count.
    #[error("chunk claims {actual} chunks, transfer has {expected}")]
    TotalMismatch {
        /// Total known to the assembler.
        expected: u32,
        /// Total in the chunk.
        actual: u32,
    },

    /// Sequence number past the end of the transfer.
    #[error("sequence {sequence} out of range for {total} chunks")]
    OutOfRange {
        /// Offending sequence.
        sequence: u32,
        /// Total chunks.
        total: u32,
    },

    /// Chunk size of zero.
    #[error("chunk size must be non-zero")]
    ZeroChunkSize,

    /// Payload needs more chunks than a u32 can count.
    #[error("payload too large to chunk")]
    TooLarge,

    /// A transfer announces more chunks than the receiver accepts.
    #[error("transfer of {total} chunks exceeds the limit of {limit}")]
    TooManyChunks {
        /// Total in the chunk.
        total: u32,
        /// Receiver's limit.
        limit: u32,
    },
}

impl ChunkError {
    /// Classification for retry decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            ChunkError::Integrity { .. } | ChunkError::Conflicting { .. } => ErrorClass::Data,
            _ => ErrorClass::Protocol,
        }
    }
}

/// Split ciphertext into checksummed chunks.
///
/// An empty payload produces a single empty final chunk.
pub fn split_into_chunks(
    transfer_id: TransferId,
    ciphertext: &[u8],
    chunk_size: usize,
) -> Result<Vec<TransferChunk>, ChunkError> {
    if chunk_size == 0 {
        return Err(ChunkError::ZeroChunkSize);
    }
    if ciphertext.is_empty() {
        return Ok(vec![TransferChunk::new(transfer_id, 0, 1, Vec::new())]);
    }

    let total = u32::try_from(ciphertext.len().div_ceil(chunk_size))
        .map_err(|_| ChunkError::TooLarge)?;
    Ok(ciphertext
        .chunks(chunk_size)
        .enumerate()
        .map(|(i, slice)| TransferChunk::new(transfer_id, i as u32, total, slice.to_vec()))
        .collect())
}

/// What happened to an offered chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// New chunk stored.
    Accepted,
    /// Same chunk seen before; nothing changed.
    Duplicate,
    /// Chunk stored and the transfer is now complete.
    Completed,
}

/// Reassembles one transfer.
#[derive(Debug)]
pub struct ChunkAssembler {
    transfer_id: TransferId,
    total: u32,
    /// Checksums of every accepted sequence.
    accepted: HashMap<u32, [u8; CHECKSUM_SIZE]>,
    /// Chunks that arrived ahead of `next`.
    early: BTreeMap<u32, Vec<u8>>,
    /// Next sequence to append.
    next: u32,
    assembled: Vec<u8>,
}

impl ChunkAssembler {
    /// Create an assembler for a transfer of `total` chunks.
    pub fn new(transfer_id: TransferId, total: u32) -> Self {
        Self {
            transfer_id,
            total,
            accepted: HashMap::new(),
            early: BTreeMap::new(),
            next: 0,
            assembled: Vec::new(),
        }
    }

    /// Offer a chunk.
    pub fn accept(&mut self, chunk: TransferChunk) -> Result<ChunkOutcome, ChunkError> {
        if chunk.transfer_id != self.transfer_id {
            return Err(ChunkError::WrongTransfer {
                expected: self.transfer_id,
                actual: chunk.transfer_id,
            });
        }
        if chunk.total != self.total {
            return Err(ChunkError::TotalMismatch {
                expected: self.total,
                actual: chunk.total,
            });
        }
        if chunk.sequence >= self.total {
            return Err(ChunkError::OutOfRange {
                sequence: chunk.sequence,
                total: self.total,
            });
        }
        if !chunk.verify() {
            return Err(ChunkError::Integrity {
                transfer_id: self.transfer_id,
                sequence: chunk.sequence,
            });
        }

        if let Some(existing) = self.accepted.get(&chunk.sequence) {
            return if *existing == chunk.checksum {
                Ok(ChunkOutcome::Duplicate)
            } else {
                Err(ChunkError::Conflicting {
                    sequence: chunk.sequence,
                })
            };
        }

        self.accepted.insert(chunk.sequence, chunk.checksum);
        self.early.insert(chunk.sequence, chunk.payload);
        while let Some(payload) = self.early.remove(&self.next) {
            self.assembled.extend_from_slice(&payload);
            self.next += 1;
        }

        if self.is_complete() {
            Ok(ChunkOutcome::Completed)
        } else {
            Ok(ChunkOutcome::Accepted)
        }
    }

    /// Whether every chunk has been applied.
    pub fn is_complete(&self) -> bool {
        self.next == self.total
    }

    /// Sequences not yet received, ascending.
    pub fn missing(&self) -> Vec<u32> {
        (0..self.total)
            .filter(|seq| !self.accepted.contains_key(seq))
            .collect()
    }

    /// Bytes applied so far.
    pub fn bytes_applied(&self) -> usize {
        self.assembled.len()
    }

    /// Chunks received so far.
    pub fn received(&self) -> u32 {
        self.accepted.len() as u32
    }

    /// Total chunks in the transfer.
    pub fn total(&self) -> u32 {
        self.total
    }

    /// Transfer id.
    pub fn transfer_id(&self) -> TransferId {
        self.transfer_id
    }

    /// Take the reassembled payload once complete.
    pub fn into_payload(self) -> Option<Vec<u8>> {
        if self.is_complete() {
            Some(self.assembled)
        } else {
            None
        }
    }
}
