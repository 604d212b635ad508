//! Default payload encryption.
//!
//! - XChaCha20-Poly1305 with random 192-bit nonces
//! - One subkey per (key id, label), derived with HKDF-SHA256
//! - The label is bound as associated data

use async_trait::async_trait;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use sha2::Sha256;
use std::sync::Arc;
use zeroize::Zeroizing;

use super::{CipherEnvelope, EncryptionContext, EncryptionService, KeyStore, ServiceError};

/// Nonce size for XChaCha20-Poly1305 (192 bits = 24 bytes).
pub const NONCE_SIZE: usize = 24;

/// Key size for XChaCha20-Poly1305 (256 bits = 32 bytes).
pub const KEY_SIZE: usize = 32;

const SUBKEY_SALT: &[u8] = b"vitalsync-payload-v1";

/// XChaCha20-Poly1305 over secrets held in a [`KeyStore`].
pub struct AeadEncryptionService {
    keys: Arc<dyn KeyStore>,
}

impl AeadEncryptionService {
    /// Create a service reading secrets from `keys`.
    pub fn new(keys: Arc<dyn KeyStore>) -> Self {
        Self { keys }
    }

    async fn cipher(&self, context: &EncryptionContext) -> Result<XChaCha20Poly1305, ServiceError> {
        let secret = Zeroizing::new(
            self.keys
                .get(&context.key_id)
                .await?
                .ok_or_else(|| ServiceError::KeyNotFound(context.key_id.clone()))?,
        );
        if secret.len() != KEY_SIZE {
            return Err(ServiceError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: secret.len(),
            });
        }

        let hkdf = Hkdf::<Sha256>::new(Some(SUBKEY_SALT), &secret[..]);
        let mut subkey = Zeroizing::new([0u8; KEY_SIZE]);
        hkdf.expand(context.label.as_bytes(), &mut subkey[..])
            .map_err(|e| ServiceError::Encryption(e.to_string()))?;

        XChaCha20Poly1305::new_from_slice(&subkey[..])
            .map_err(|e| ServiceError::Encryption(e.to_string()))
    }
}

impl std::fmt::Debug for AeadEncryptionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AeadEncryptionService").finish_non_exhaustive()
    }
}

#[async_trait]
impl EncryptionService for AeadEncryptionService {
    async fn encrypt(
        &self,
        plaintext: &[u8],
        context: &EncryptionContext,
    ) -> Result<CipherEnvelope, ServiceError> {
        let cipher = self.cipher(context).await?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        getrandom::getrandom(&mut nonce_bytes).expect("getrandom failed");
        let nonce = XNonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: context.label.as_bytes(),
                },
            )
            .map_err(|_| ServiceError::Encryption("aead encrypt failed".into()))?;

        Ok(CipherEnvelope {
            key_id: context.key_id.clone(),
            nonce: nonce_bytes.to_vec(),
            ciphertext,
        })
    }

    async fn decrypt(
        &self,
        envelope: &CipherEnvelope,
        context: &EncryptionContext,
    ) -> Result<Vec<u8>, ServiceError> {
        if envelope.nonce.len() != NONCE_SIZE {
            return Err(ServiceError::Decryption);
        }
        let cipher = self.cipher(context).await?;
        cipher
            .decrypt(
                XNonce::from_slice(&envelope.nonce),
                Payload {
                    msg: &envelope.ciphertext,
                    aad: context.label.as_bytes(),
                },
            )
            .map_err(|_| ServiceError::Decryption)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{KeyId, MemoryKeyStore};

    async fn service_with_key(id: &KeyId, byte: u8) -> (AeadEncryptionService, Arc<MemoryKeyStore>) {
        let keys = Arc::new(MemoryKeyStore::generate());
        keys.put(id.clone(), vec![byte; KEY_SIZE]).await.unwrap();
        (AeadEncryptionService::new(keys.clone()), keys)
    }

    // ===========================================
    // XChaCha20-Poly1305 Tests (192-bit nonces)
    // ===========================================

    #[tokio::test]
    async fn encrypt_decrypt_roundtrip() {
        let id = KeyId::named("k");
        let (service, _) = service_with_key(&id, 7).await;
        let context = EncryptionContext::new(id, "daily_log");

        let envelope = service.encrypt(b"heart rate 62", &context).await.unwrap();
        assert_eq!(envelope.nonce.len(), NONCE_SIZE);
        assert_ne!(envelope.ciphertext, b"heart rate 62".to_vec());

        let plaintext = service.decrypt(&envelope, &context).await.unwrap();
        assert_eq!(plaintext, b"heart rate 62");
    }

    #[tokio::test]
    async fn random_nonces_differ() {
        let id = KeyId::named("k");
        let (service, _) = service_with_key(&id, 7).await;
        let context = EncryptionContext::new(id, "daily_log");

        let a = service.encrypt(b"same", &context).await.unwrap();
        let b = service.encrypt(b"same", &context).await.unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[tokio::test]
    async fn wrong_label_fails_decryption() {
        let id = KeyId::named("k");
        let (service, _) = service_with_key(&id, 7).await;

        let envelope = service
            .encrypt(b"secret", &EncryptionContext::new(id.clone(), "mood"))
            .await
            .unwrap();
        let result = service
            .decrypt(&envelope, &EncryptionContext::new(id, "medication"))
            .await;
        assert!(matches!(result, Err(ServiceError::Decryption)));
    }

    #[tokio::test]
    async fn corrupted_ciphertext_fails_decryption() {
        let id = KeyId::named("k");
        let (service, _) = service_with_key(&id, 7).await;
        let context = EncryptionContext::new(id, "daily_log");

        let mut envelope = service.encrypt(b"secret", &context).await.unwrap();
        envelope.ciphertext[0] ^= 0xFF;
        assert!(matches!(
            service.decrypt(&envelope, &context).await,
            Err(ServiceError::Decryption)
        ));
    }

    #[tokio::test]
    async fn missing_key_is_reported() {
        let keys = Arc::new(MemoryKeyStore::generate());
        let service = AeadEncryptionService::new(keys);
        let context = EncryptionContext::new(KeyId::named("absent"), "x");

        let err = service.encrypt(b"data", &context).await.unwrap_err();
        assert!(matches!(err, ServiceError::KeyNotFound(_)));
        assert_eq!(err.class(), vitalsync_types::ErrorClass::Crypto);
    }

    #[tokio::test]
    async fn short_key_is_rejected() {
        let keys = Arc::new(MemoryKeyStore::generate());
        keys.put(KeyId::named("short"), vec![1, 2, 3]).await.unwrap();
        let service = AeadEncryptionService::new(keys);

        let err = service
            .encrypt(b"data", &EncryptionContext::new(KeyId::named("short"), "x"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::InvalidKeyLength {
                expected: 32,
                actual: 3
            }
        ));
    }

    #[test]
    fn envelope_debug_hides_ciphertext() {
        let envelope = CipherEnvelope {
            key_id: KeyId::named("k"),
            nonce: vec![0; NONCE_SIZE],
            ciphertext: vec![0xAB; 16],
        };
        let debug = format!("{:?}", envelope);
        assert!(debug.contains("ciphertext_len: 16"));
        assert!(!debug.contains("171"));
    }
}
