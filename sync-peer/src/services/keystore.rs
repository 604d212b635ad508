//! In-memory key store.

use async_trait::async_trait;
use curve25519_dalek::{montgomery::MontgomeryPoint, scalar::Scalar};
use std::collections::HashMap;
use tokio::sync::RwLock;
use vitalsync_core::diffie_hellman;
use vitalsync_types::PublicKey;
use zeroize::Zeroizing;

use super::{KeyId, KeyStore, ServiceError};

/// This device's long-lived X25519 key pair.
pub struct IdentityKeyPair {
    secret: Zeroizing<[u8; 32]>,
    public: PublicKey,
}

impl IdentityKeyPair {
    /// Generate a fresh key pair.
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        getrandom::getrandom(&mut secret).expect("getrandom failed");
        Self::from_secret(secret)
    }

    /// Rebuild a key pair from its secret half.
    pub fn from_secret(secret: [u8; 32]) -> Self {
        let scalar = Scalar::from_bytes_mod_order(secret);
        let public = PublicKey::from_bytes(MontgomeryPoint::mul_base(&scalar).to_bytes());
        Self {
            secret: Zeroizing::new(secret),
            public,
        }
    }

    /// The public half.
    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// X25519 of the secret half with a peer's public point.
    pub fn agree(&self, public: &[u8; 32]) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(diffie_hellman(&self.secret, public))
    }

    /// The secret half, for export to platform storage.
    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret
    }
}

// Don't leak secret in debug output
impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public", &self.public.fingerprint())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Keys held in process memory. Secrets are zeroized when replaced,
/// deleted or dropped.
pub struct MemoryKeyStore {
    identity: IdentityKeyPair,
    secrets: RwLock<HashMap<KeyId, Zeroizing<Vec<u8>>>>,
}

impl MemoryKeyStore {
    /// Create a store around an existing identity.
    pub fn new(identity: IdentityKeyPair) -> Self {
        Self {
            identity,
            secrets: RwLock::new(HashMap::new()),
        }
    }

    /// Create a store with a freshly generated identity.
    pub fn generate() -> Self {
        Self::new(IdentityKeyPair::generate())
    }

    /// Number of stored secrets.
    pub async fn len(&self) -> usize {
        self.secrets.read().await.len()
    }

    /// Whether no secrets are stored.
    pub async fn is_empty(&self) -> bool {
        self.secrets.read().await.is_empty()
    }
}

impl std::fmt::Debug for MemoryKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryKeyStore")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn identity_public_key(&self) -> Result<PublicKey, ServiceError> {
        Ok(self.identity.public_key())
    }

    async fn identity_agreement(
        &self,
        public: &[u8; 32],
    ) -> Result<Zeroizing<[u8; 32]>, ServiceError> {
        Ok(self.identity.agree(public))
    }

    async fn put(&self, id: KeyId, secret: Vec<u8>) -> Result<(), ServiceError> {
        self.secrets.write().await.insert(id, Zeroizing::new(secret));
        Ok(())
    }

    async fn get(&self, id: &KeyId) -> Result<Option<Vec<u8>>, ServiceError> {
        Ok(self
            .secrets
            .read()
            .await
            .get(id)
            .map(|secret| secret.to_vec()))
    }

    async fn delete(&self, id: &KeyId) -> Result<(), ServiceError> {
        self.secrets.write().await.remove(id);
        Ok(())
    }
}
