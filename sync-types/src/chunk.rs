//! Transfer chunks - checksummed slices of an encrypted payload.

use serde::{Deserialize, Serialize};

use crate::TransferId;

/// Size of a chunk checksum in bytes (BLAKE3, 256 bits).
pub const CHECKSUM_SIZE: usize = 32;

/// BLAKE3 checksum of a chunk payload.
pub fn checksum(payload: &[u8]) -> [u8; CHECKSUM_SIZE] {
    *blake3::hash(payload).as_bytes()
}

/// One bounded-size unit of a larger encrypted transfer.
///
/// The payload is ciphertext; it is never decrypted at this layer.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferChunk {
    /// Transfer this chunk belongs to.
    pub transfer_id: TransferId,
    /// Zero-based position within the transfer.
    pub sequence: u32,
    /// Total number of chunks in the transfer.
    pub total: u32,
    /// Ciphertext bytes.
    pub payload: Vec<u8>,
    /// BLAKE3 checksum of `payload`.
    pub checksum: [u8; CHECKSUM_SIZE],
    /// Set on the final chunk.
    pub is_last: bool,
}

impl TransferChunk {
    /// Build a chunk, computing its checksum.
    pub fn new(transfer_id: TransferId, sequence: u32, total: u32, payload: Vec<u8>) -> Self {
        let checksum = checksum(&payload);
        Self {
            transfer_id,
            sequence,
            total,
            payload,
            checksum,
            is_last: sequence + 1 == total,
        }
    }

    /// Whether the payload still matches its checksum.
    pub fn verify(&self) -> bool {
        checksum(&self.payload) == self.checksum
    }
}

impl std::fmt::Debug for TransferChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferChunk")
            .field("transfer_id", &self.transfer_id)
            .field("sequence", &self.sequence)
            .field("total", &self.total)
            .field(
                "payload",
                &format!("[{} bytes REDACTED]", self.payload.len()),
            )
            .field("is_last", &self.is_last)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_chunk_verifies() {
        let chunk = TransferChunk::new(TransferId::new(), 0, 1, vec![1, 2, 3]);
        assert!(chunk.verify());
        assert!(chunk.is_last);
    }

    #[test]
    fn tampered_chunk_fails_verification() {
        let mut chunk = TransferChunk::new(TransferId::new(), 0, 2, vec![1, 2, 3]);
        chunk.payload[0] ^= 0xFF;
        assert!(!chunk.verify());
        assert!(!chunk.is_last);
    }

    #[test]
    fn chunk_debug_redacts_payload() {
        let chunk = TransferChunk::new(TransferId::new(), 0, 1, vec![0xDE, 0xAD]);
        let debug = format!("{:?}", chunk);
        assert!(debug.contains("[2 bytes REDACTED]"));
        assert!(!debug.contains("222, 173"), "raw payload bytes must not appear");
    }
}
