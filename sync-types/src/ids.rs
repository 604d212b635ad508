//! Identity types for vitalsync.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A unique identifier for a device in the sync network.
///
/// 32 bytes of random data, displayed as URL-safe base64.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId([u8; 32]);

impl DeviceId {
    /// Create a new random DeviceId.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        getrandom::getrandom(&mut bytes).expect("getrandom failed");
        Self(bytes)
    }

    /// Wrap 32 raw bytes, e.g. an identity public key.
    pub const fn from_array(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Create a DeviceId from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() == 32 {
            let mut arr = [0u8; 32];
            arr.copy_from_slice(bytes);
            Some(Self(arr))
        } else {
            None
        }
    }

    /// Parse a DeviceId from its base64 display form.
    pub fn parse(encoded: &str) -> Option<Self> {
        let bytes = URL_SAFE_NO_PAD.decode(encoded).ok()?;
        Self::from_bytes(&bytes)
    }

    /// Get the raw bytes of this DeviceId.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", URL_SAFE_NO_PAD.encode(self.0))
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", &self.to_string()[..8])
    }
}

/// Declares a UUID v4 backed identifier.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(uuid::Uuid);

        impl $name {
            /// Create a new random identifier.
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4())
            }

            /// Create an identifier from raw bytes.
            pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
                uuid::Uuid::from_slice(bytes).ok().map(Self)
            }

            /// Get the raw bytes of this identifier.
            pub fn as_bytes(&self) -> &[u8] {
                self.0.as_bytes()
            }

            /// Get the inner UUID.
            pub fn as_uuid(&self) -> &uuid::Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }
    };
}

uuid_id!(
    /// Identifies a queued sync operation.
    OperationId
);

uuid_id!(
    /// Identifies one handshake attempt.
    SessionId
);

uuid_id!(
    /// Identifies one chunked transfer.
    TransferId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_roundtrip() {
        let original = DeviceId::random();
        let bytes = original.as_bytes();
        let restored = DeviceId::from_bytes(bytes).unwrap();
        assert_eq!(original, restored);
    }

    #[test]
    fn device_id_base64_display() {
        let id = DeviceId::random();
        let display = id.to_string();
        assert_eq!(display.len(), 43); // 32 bytes = 43 base64 chars (no padding)
    }

    #[test]
    fn device_id_parses_its_display_form() {
        let id = DeviceId::random();
        assert_eq!(DeviceId::parse(&id.to_string()), Some(id));
        assert_eq!(DeviceId::parse("not base64!"), None);
    }

    #[test]
    fn device_id_from_invalid_length_fails() {
        assert!(DeviceId::from_bytes(&[0u8; 16]).is_none());
        assert!(DeviceId::from_bytes(&[0u8; 64]).is_none());
    }

    #[test]
    fn device_id_debug_is_truncated() {
        let id = DeviceId::random();
        let debug = format!("{:?}", id);
        assert!(debug.starts_with("DeviceId("));
        assert!(debug.len() < id.to_string().len());
    }

    #[test]
    fn operation_id_is_uuid_v4() {
        let id = OperationId::new();
        assert_eq!(id.as_bytes().len(), 16);
        assert_eq!(id.as_uuid().get_version_num(), 4);
    }

    #[test]
    fn uuid_ids_are_unique() {
        assert_ne!(TransferId::new(), TransferId::new());
        assert_ne!(SessionId::new(), SessionId::new());
    }

    #[test]
    fn uuid_id_debug_names_the_type() {
        let id = SessionId::new();
        assert!(format!("{:?}", id).starts_with("SessionId("));
    }
}
