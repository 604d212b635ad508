//! Peer identity as announced on the local network.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::DeviceId;

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: u16 = 1;

/// Platform tag a device announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// iPhone / iPad.
    Ios,
    /// Android phone or tablet.
    Android,
    /// Browser build.
    Web,
    /// Desktop build.
    Desktop,
    /// Anything else.
    Unknown,
}

impl Platform {
    /// Whether this is a platform we ship builds for.
    pub fn is_known(self) -> bool {
        !matches!(self, Platform::Unknown)
    }
}

/// A device's long-lived public key (32 bytes).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// SHA-256 fingerprint of this key, used in handshake messages.
    pub fn fingerprint(&self) -> Fingerprint {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(b"vitalsync-fingerprint-v1");
        hasher.update(self.0);
        let result = hasher.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&result);
        Fingerprint(bytes)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(&self.0[..4]))
    }
}

/// Fingerprint of a long-lived public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short groups are easier to compare by eye during pairing
        let hex = hex::encode(&self.0[..8]);
        let groups: Vec<&str> = hex
            .as_bytes()
            .chunks(4)
            .map(|c| std::str::from_utf8(c).unwrap_or(""))
            .collect();
        write!(f, "{}", groups.join(":"))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self)
    }
}

/// What a device tells the local network about itself.
///
/// Created on first discovery and refreshed on re-announcement. Remote
/// parties never edit it; only the owning device announces new values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    /// Stable device id.
    pub device_id: DeviceId,
    /// Human-readable name.
    pub display_name: String,
    /// Platform tag.
    pub platform: Platform,
    /// Protocol version the device speaks.
    pub protocol_version: u16,
    /// Long-lived public key, absent for devices that cannot prove identity.
    pub public_key: Option<PublicKey>,
    /// Unix seconds when this identity was last observed.
    pub last_seen: u64,
}

impl PeerIdentity {
    /// Create an identity for the current protocol version, observed now.
    pub fn new(
        device_id: DeviceId,
        display_name: impl Into<String>,
        platform: Platform,
        public_key: Option<PublicKey>,
    ) -> Self {
        Self {
            device_id,
            display_name: display_name.into(),
            platform,
            protocol_version: PROTOCOL_VERSION,
            public_key,
            last_seen: crate::unix_now(),
        }
    }

    /// Fingerprint of the announced key, if any.
    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.public_key.as_ref().map(PublicKey::fingerprint)
    }

    /// A record is well formed when it has a key and a non-empty name.
    pub fn is_well_formed(&self) -> bool {
        self.public_key.is_some() && !self.display_name.trim().is_empty()
    }

    /// Whether the announced fields (ignoring `last_seen`) differ from `other`.
    pub fn differs_from(&self, other: &PeerIdentity) -> bool {
        self.display_name != other.display_name
            || self.platform != other.platform
            || self.protocol_version != other.protocol_version
            || self.public_key != other.public_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> PeerIdentity {
        PeerIdentity::new(
            DeviceId::random(),
            "Kitchen iPad",
            Platform::Ios,
            Some(PublicKey::from_bytes([7u8; 32])),
        )
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let key = PublicKey::from_bytes([1u8; 32]);
        assert_eq!(key.fingerprint(), key.fingerprint());
        assert_ne!(key.fingerprint(), PublicKey::from_bytes([2u8; 32]).fingerprint());
    }

    #[test]
    fn fingerprint_display_is_grouped() {
        let display = PublicKey::from_bytes([1u8; 32]).fingerprint().to_string();
        assert_eq!(display.split(':').count(), 4);
    }

    #[test]
    fn well_formed_requires_key_and_name() {
        let mut peer = identity();
        assert!(peer.is_well_formed());

        peer.display_name = "  ".into();
        assert!(!peer.is_well_formed());

        let mut keyless = identity();
        keyless.public_key = None;
        assert!(!keyless.is_well_formed());
    }

    #[test]
    fn last_seen_alone_is_not_a_difference() {
        let peer = identity();
        let mut later = peer.clone();
        later.last_seen += 60;
        assert!(!later.differs_from(&peer));

        later.display_name = "Renamed".into();
        assert!(later.differs_from(&peer));
    }

    #[test]
    fn platform_serializes_lowercase() {
        let json = serde_json::to_string(&Platform::Android).unwrap();
        assert_eq!(json, "\"android\"");
        assert!(!Platform::Unknown.is_known());
    }

    #[test]
    fn identity_roundtrip() {
        let peer = identity();
        let bytes = rmp_serde::to_vec(&peer).unwrap();
        let restored: PeerIdentity = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(peer, restored);
    }
}
