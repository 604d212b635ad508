//! In-memory state store.
//!
//! Everything is kept as MessagePack blobs, exactly as a disk-backed
//! store would write it, so encoding problems show up in tests too.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use vitalsync_core::{DataConflict, Record, SyncOperation, TrustRecord};
use vitalsync_types::DeviceId;

use super::{ServiceError, StateStore};

/// A conflict waiting for a user decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingConflict {
    /// Peer whose version conflicted with ours.
    pub peer: DeviceId,
    /// The conflict.
    pub conflict: DataConflict,
    /// When it was parked (unix seconds).
    pub detected_at: u64,
}

#[derive(Default)]
struct Tables {
    operations: Vec<u8>,
    trust_records: Vec<u8>,
    records: BTreeMap<String, Vec<u8>>,
    base_records: BTreeMap<String, Vec<u8>>,
    conflicts: BTreeMap<String, Vec<u8>>,
}

/// State held in process memory.
#[derive(Default)]
pub struct MemoryStateStore {
    tables: RwLock<Tables>,
}

impl MemoryStateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub async fn record_count(&self) -> usize {
        self.tables.read().await.records.len()
    }
}

impl std::fmt::Debug for MemoryStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStateStore").finish_non_exhaustive()
    }
}

fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, ServiceError> {
    rmp_serde::to_vec(value).map_err(|e| ServiceError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ServiceError> {
    rmp_serde::from_slice(bytes).map_err(|e| ServiceError::Serialization(e.to_string()))
}

fn decode_list<T: DeserializeOwned>(bytes: &[u8]) -> Result<Vec<T>, ServiceError> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    decode(bytes)
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn save_operations(&self, ops: &[SyncOperation]) -> Result<(), ServiceError> {
        let blob = encode(ops)?;
        self.tables.write().await.operations = blob;
        Ok(())
    }

    async fn load_operations(&self) -> Result<Vec<SyncOperation>, ServiceError> {
        decode_list(&self.tables.read().await.operations)
    }

    async fn save_trust_records(&self, records: &[TrustRecord]) -> Result<(), ServiceError> {
        let blob = encode(records)?;
        self.tables.write().await.trust_records = blob;
        Ok(())
    }

    async fn load_trust_records(&self) -> Result<Vec<TrustRecord>, ServiceError> {
        decode_list(&self.tables.read().await.trust_records)
    }

    async fn save_record(&self, record: &Record) -> Result<(), ServiceError> {
        let blob = encode(record)?;
        self.tables
            .write()
            .await
            .records
            .insert(record.id.clone(), blob);
        Ok(())
    }

    async fn load_record(&self, id: &str) -> Result<Option<Record>, ServiceError> {
        self.tables
            .read()
            .await
            .records
            .get(id)
            .map(|blob| decode(blob))
            .transpose()
    }

    async fn save_base_record(&self, record: &Record) -> Result<(), ServiceError> {
        let blob = encode(record)?;
        self.tables
            .write()
            .await
            .base_records
            .insert(record.id.clone(), blob);
        Ok(())
    }

    async fn load_base_record(&self, id: &str) -> Result<Option<Record>, ServiceError> {
        self.tables
            .read()
            .await
            .base_records
            .get(id)
            .map(|blob| decode(blob))
            .transpose()
    }

    async fn save_conflict(&self, conflict: &PendingConflict) -> Result<(), ServiceError> {
        let blob = encode(conflict)?;
        self.tables
            .write()
            .await
            .conflicts
            .insert(conflict.conflict.record_id.clone(), blob);
        Ok(())
    }

    async fn load_conflicts(&self) -> Result<Vec<PendingConflict>, ServiceError> {
        self.tables
            .read()
            .await
            .conflicts
            .values()
            .map(|blob| decode(blob))
            .collect()
    }

    async fn remove_conflict(
        &self,
        record_id: &str,
    ) -> Result<Option<PendingConflict>, ServiceError> {
        self.tables
            .write()
            .await
            .conflicts
            .remove(record_id)
            .map(|blob| decode(&blob))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vitalsync_core::{
        OperationDescriptor, OperationKind, Priority, TrustPolicy, TrustRegistry,
    };
    use vitalsync_types::{PeerIdentity, Platform, PublicKey};

    fn record(id: &str) -> Record {
        Record::new(id, "daily_log", 100)
            .with_field("mood", json!("calm"))
            .with_field("activities", json!(["walk", "yoga"]))
    }

    #[tokio::test]
    async fn empty_store_loads_nothing() {
        let store = MemoryStateStore::new();
        assert!(store.load_operations().await.unwrap().is_empty());
        assert!(store.load_trust_records().await.unwrap().is_empty());
        assert!(store.load_record("r1").await.unwrap().is_none());
        assert!(store.load_conflicts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn operations_roundtrip() {
        let store = MemoryStateStore::new();
        let op = SyncOperation::new(
            OperationDescriptor {
                kind: OperationKind::Upload,
                peer: DeviceId::random(),
                data_type: "daily_log".into(),
                priority: Priority::High,
                payload_ref: "r1".into(),
                max_retries: None,
            },
            5,
        );
        store.save_operations(&[op.clone()]).await.unwrap();
        assert_eq!(store.load_operations().await.unwrap(), vec![op]);
    }

    #[tokio::test]
    async fn trust_records_roundtrip_without_secret() {
        let store = MemoryStateStore::new();
        let mut registry = TrustRegistry::new(TrustPolicy::default());
        let peer = PeerIdentity::new(
            DeviceId::random(),
            "Phone",
            Platform::Android,
            Some(PublicKey::from_bytes([4u8; 32])),
        );
        registry.request(peer, 10).unwrap();

        store.save_trust_records(&registry.records()).await.unwrap();
        let loaded = store.load_trust_records().await.unwrap();
        assert_eq!(loaded, registry.records());
        assert!(loaded[0].shared_secret.is_none());
    }

    #[tokio::test]
    async fn records_and_base_are_separate() {
        let store = MemoryStateStore::new();
        let local = record("r1");
        let mut base = record("r1");
        base.version = 0;

        store.save_record(&local).await.unwrap();
        store.save_base_record(&base).await.unwrap();

        assert_eq!(store.load_record("r1").await.unwrap(), Some(local));
        assert_eq!(store.load_base_record("r1").await.unwrap(), Some(base));
        assert_eq!(store.record_count().await, 1);
    }

    #[tokio::test]
    async fn conflicts_park_and_remove() {
        let store = MemoryStateStore::new();
        let resolver = vitalsync_core::ConflictResolver::default();
        let local = record("r1");
        let remote = record("r1").with_field("mood", json!("tired"));
        let conflict = resolver.detect(&local, &remote, None).unwrap().unwrap();
        let pending = PendingConflict {
            peer: DeviceId::random(),
            conflict,
            detected_at: 1,
        };

        store.save_conflict(&pending).await.unwrap();
        assert_eq!(store.load_conflicts().await.unwrap(), vec![pending.clone()]);
        assert_eq!(store.remove_conflict("r1").await.unwrap(), Some(pending));
        assert!(store.remove_conflict("r1").await.unwrap().is_none());
    }
}
