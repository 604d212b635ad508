//! External collaborators the engine depends on.
//!
//! The engine never encrypts, stores keys or persists state itself; it
//! goes through these traits. Each has an in-process default so the
//! engine runs out of the box and tests need no platform services.

mod crypto;
mod keystore;
mod state;

pub use crypto::{AeadEncryptionService, KEY_SIZE, NONCE_SIZE};
pub use keystore::{IdentityKeyPair, MemoryKeyStore};
pub use state::{MemoryStateStore, PendingConflict};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use vitalsync_core::{Record, SyncOperation, TrustRecord};
use vitalsync_types::{DeviceId, ErrorClass, PublicKey};
use zeroize::Zeroizing;

/// Errors raised by service implementations.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Encryption failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption failed (authentication error).
    #[error("decryption failed: authentication error")]
    Decryption,

    /// No key stored under this id.
    #[error("key not found: {0}")]
    KeyNotFound(KeyId),

    /// Stored key has the wrong length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },

    /// Persisted item does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Encoding or decoding persisted state failed.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Backend storage failed.
    #[error("storage failed: {0}")]
    Storage(String),
}

impl ServiceError {
    /// Storage hiccups are transient; everything else needs attention.
    pub fn class(&self) -> ErrorClass {
        match self {
            ServiceError::Encryption(_)
            | ServiceError::Decryption
            | ServiceError::KeyNotFound(_)
            | ServiceError::InvalidKeyLength { .. } => ErrorClass::Crypto,
            ServiceError::NotFound(_) | ServiceError::Serialization(_) => ErrorClass::Data,
            ServiceError::Storage(_) => ErrorClass::Network,
        }
    }
}

/// Direction of a session key relative to this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Connection we dialed.
    Outbound,
    /// Connection the peer dialed.
    Inbound,
}

/// Opaque key identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyId(String);

impl KeyId {
    /// Long-lived secret shared with a trusted peer.
    pub fn trust(peer: &DeviceId) -> Self {
        Self(format!("trust:{}", peer))
    }

    /// Session key of the live connection with a peer.
    pub fn session(peer: &DeviceId, direction: Direction) -> Self {
        let dir = match direction {
            Direction::Outbound => "out",
            Direction::Inbound => "in",
        };
        Self(format!("session:{}:{}", dir, peer))
    }

    /// Arbitrary key name.
    pub fn named(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a payload is being encrypted for.
///
/// The key id picks the secret; the label is mixed into subkey derivation
/// and bound as associated data, so a ciphertext made for one purpose does
/// not decrypt under another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionContext {
    /// Key to derive from.
    pub key_id: KeyId,
    /// Purpose label, e.g. the data type.
    pub label: String,
}

impl EncryptionContext {
    /// Create a context.
    pub fn new(key_id: KeyId, label: impl Into<String>) -> Self {
        Self {
            key_id,
            label: label.into(),
        }
    }
}

/// Encrypted payload as produced by an [`EncryptionService`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherEnvelope {
    /// Key the payload was sealed with.
    pub key_id: KeyId,
    /// Nonce.
    pub nonce: Vec<u8>,
    /// Ciphertext including the tag.
    pub ciphertext: Vec<u8>,
}

impl CipherEnvelope {
    /// Serialize to MessagePack bytes for transmission.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ServiceError> {
        rmp_serde::to_vec(self).map_err(|e| ServiceError::Serialization(e.to_string()))
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ServiceError> {
        rmp_serde::from_slice(bytes).map_err(|e| ServiceError::Serialization(e.to_string()))
    }
}

impl fmt::Debug for CipherEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherEnvelope")
            .field("key_id", &self.key_id)
            .field("ciphertext_len", &self.ciphertext.len())
            .finish_non_exhaustive()
    }
}

/// Payload encryption.
#[async_trait]
pub trait EncryptionService: Send + Sync {
    /// Encrypt a plaintext for the given context.
    async fn encrypt(
        &self,
        plaintext: &[u8],
        context: &EncryptionContext,
    ) -> Result<CipherEnvelope, ServiceError>;

    /// Decrypt an envelope produced for the given context.
    async fn decrypt(
        &self,
        envelope: &CipherEnvelope,
        context: &EncryptionContext,
    ) -> Result<Vec<u8>, ServiceError>;
}

/// Secure key storage.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// This device's long-lived public key.
    async fn identity_public_key(&self) -> Result<PublicKey, ServiceError>;

    /// X25519 of the identity secret with `public`. The secret stays in the store.
    async fn identity_agreement(
        &self,
        public: &[u8; 32],
    ) -> Result<Zeroizing<[u8; 32]>, ServiceError>;

    /// Store a secret.
    async fn put(&self, id: KeyId, secret: Vec<u8>) -> Result<(), ServiceError>;

    /// Fetch a secret.
    async fn get(&self, id: &KeyId) -> Result<Option<Vec<u8>>, ServiceError>;

    /// Delete a secret. Deleting a missing key is not an error.
    async fn delete(&self, id: &KeyId) -> Result<(), ServiceError>;
}

/// Durable engine state.
///
/// Operations and trust records are stored as MessagePack blobs; records
/// and conflicts are keyed by record id.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Replace the persisted operation queue.
    async fn save_operations(&self, ops: &[SyncOperation]) -> Result<(), ServiceError>;

    /// Load the persisted operation queue.
    async fn load_operations(&self) -> Result<Vec<SyncOperation>, ServiceError>;

    /// Replace the persisted trust records.
    async fn save_trust_records(&self, records: &[TrustRecord]) -> Result<(), ServiceError>;

    /// Load the persisted trust records.
    async fn load_trust_records(&self) -> Result<Vec<TrustRecord>, ServiceError>;

    /// Store the local version of a record.
    async fn save_record(&self, record: &Record) -> Result<(), ServiceError>;

    /// Load the local version of a record.
    async fn load_record(&self, id: &str) -> Result<Option<Record>, ServiceError>;

    /// Store the last version both sides agreed on.
    async fn save_base_record(&self, record: &Record) -> Result<(), ServiceError>;

    /// Load the last version both sides agreed on.
    async fn load_base_record(&self, id: &str) -> Result<Option<Record>, ServiceError>;

    /// Park a conflict until the user decides.
    async fn save_conflict(&self, conflict: &PendingConflict) -> Result<(), ServiceError>;

    /// Conflicts waiting for the user.
    async fn load_conflicts(&self) -> Result<Vec<PendingConflict>, ServiceError>;

    /// Remove a parked conflict.
    async fn remove_conflict(&self, record_id: &str) -> Result<Option<PendingConflict>, ServiceError>;
}
