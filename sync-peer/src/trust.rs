//! Trust manager.
//!
//! Serializes every trust transition behind one mutex and carries out the
//! side effects the pure [`TrustRegistry`] only describes: secrets go to
//! the [`KeyStore`], records to the [`StateStore`], transitions to the
//! [`EventBus`], and immediate revocations to the peer.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use vitalsync_core::{
    RegistryStats, RequestOutcome, RevocationReason, SessionKey, SharedSecret, SweepReport,
    TrustError, TrustPolicy, TrustRecord, TrustRegistry,
};
use vitalsync_types::{unix_now, DeviceId, Fingerprint, PeerIdentity, PublicKey};

use crate::error::PeerError;
use crate::events::{EventBus, TrustEvent};
use crate::services::{Direction, KeyId, KeyStore, StateStore};

/// Tells a peer we no longer trust it.
#[async_trait]
pub trait RevocationNotifier: Send + Sync {
    /// Deliver a revocation notice to `peer`.
    async fn notify_revoked(&self, peer: DeviceId, reason: RevocationReason)
        -> Result<(), PeerError>;
}

/// Owner of the trust registry.
pub struct TrustManager {
    registry: Mutex<TrustRegistry>,
    keys: Arc<dyn KeyStore>,
    state: Arc<dyn StateStore>,
    notifier: RwLock<Option<Arc<dyn RevocationNotifier>>>,
    events: EventBus,
}

impl TrustManager {
    /// Create a manager with an empty registry.
    pub fn new(
        policy: TrustPolicy,
        keys: Arc<dyn KeyStore>,
        state: Arc<dyn StateStore>,
        events: EventBus,
    ) -> Self {
        Self {
            registry: Mutex::new(TrustRegistry::new(policy)),
            keys,
            state,
            notifier: RwLock::new(None),
            events,
        }
    }

    /// Install the component that delivers revocation notices.
    pub async fn set_notifier(&self, notifier: Arc<dyn RevocationNotifier>) {
        *self.notifier.write().await = Some(notifier);
    }

    /// Restore persisted records and reattach secrets from the key store.
    ///
    /// Returns how many records were loaded.
    pub async fn load(&self) -> Result<usize, PeerError> {
        let records = self.state.load_trust_records().await?;
        let count = records.len();
        let mut registry = self.registry.lock().await;
        let policy = registry.policy().clone();
        *registry = TrustRegistry::restore(policy, records);

        for record in registry.trusted() {
            let id = record.device_id();
            if let Some(bytes) = self.keys.get(&KeyId::trust(&id)).await? {
                if let Ok(bytes) = <[u8; 32]>::try_from(bytes.as_slice()) {
                    registry.set_shared_secret(&id, SharedSecret::from_bytes(bytes))?;
                }
            }
        }
        info!(records = count, "Trust records loaded");
        Ok(count)
    }

    /// Ask to trust a discovered peer.
    pub async fn request_device_trust(&self, peer: PeerIdentity) -> Result<RequestOutcome, PeerError> {
        let mut registry = self.registry.lock().await;
        let id = peer.device_id;
        let outcome = registry.request(peer.clone(), unix_now())?;
        self.persist(&registry).await?;
        drop(registry);

        match outcome {
            RequestOutcome::Pending { score } => {
                info!(peer = ?id, score, "Trust request awaiting approval");
                self.events
                    .emit(TrustEvent::ApprovalRequired { peer, score });
            }
            RequestOutcome::AutoApproved { score } => {
                info!(peer = ?id, score, "Trust request auto-approved");
                self.events.emit(TrustEvent::DeviceTrusted {
                    device_id: id,
                    automatic: true,
                });
            }
        }
        Ok(outcome)
    }

    /// Approve a pending request, optionally with a pre-shared secret.
    ///
    /// Without one, the first completed handshake supplies it.
    pub async fn approve_device_trust(
        &self,
        id: &DeviceId,
        secret: Option<SharedSecret>,
    ) -> Result<TrustRecord, PeerError> {
        let mut registry = self.registry.lock().await;
        registry.approve(id, unix_now())?;
        if let Some(secret) = secret {
            self.keys
                .put(KeyId::trust(id), secret.as_bytes().to_vec())
                .await?;
            registry.set_shared_secret(id, secret)?;
        }
        self.persist(&registry).await?;
        let record = registry
            .get(id)
            .map(TrustRecord::snapshot)
            .ok_or(TrustError::NotFound(*id))?;
        drop(registry);

        info!(peer = ?id, "Device trusted");
        self.events.emit(TrustEvent::DeviceTrusted {
            device_id: *id,
            automatic: false,
        });
        Ok(record)
    }

    /// Discard a pending request.
    pub async fn reject_device_trust(&self, id: &DeviceId) -> Result<(), PeerError> {
        let mut registry = self.registry.lock().await;
        registry.reject(id)?;
        self.persist(&registry).await?;
        drop(registry);

        info!(peer = ?id, "Trust request rejected");
        self.events
            .emit(TrustEvent::RequestDiscarded { device_id: *id });
        Ok(())
    }

    /// Withdraw trust.
    ///
    /// The secret is zeroized and deleted before this returns. With
    /// `immediate`, the peer is told right away; a failed notice is logged
    /// but does not undo the revocation.
    pub async fn revoke_device_trust(
        &self,
        id: &DeviceId,
        reason: RevocationReason,
        immediate: bool,
    ) -> Result<TrustRecord, PeerError> {
        let mut registry = self.registry.lock().await;
        let record = registry.revoke(id, reason, unix_now())?;
        self.delete_keys(id).await?;
        self.persist(&registry).await?;
        drop(registry);

        warn!(peer = ?id, %reason, "Device trust revoked");
        self.events.emit(TrustEvent::DeviceRevoked {
            device_id: *id,
            reason,
        });

        if immediate {
            let notifier = self.notifier.read().await.clone();
            match notifier {
                Some(notifier) => {
                    if let Err(e) = notifier.notify_revoked(*id, reason).await {
                        warn!(peer = ?id, "Failed to deliver revocation notice: {}", e);
                    }
                }
                None => debug!(peer = ?id, "No revocation notifier installed"),
            }
        }
        Ok(record)
    }

    /// Drop every trace of a device so it can enroll again.
    pub async fn forget_device(&self, id: &DeviceId) -> Result<Option<TrustRecord>, PeerError> {
        let mut registry = self.registry.lock().await;
        let forgotten = registry.forget(id);
        if forgotten.is_some() {
            self.delete_keys(id).await?;
            self.persist(&registry).await?;
            info!(peer = ?id, "Device forgotten");
        }
        Ok(forgotten)
    }

    /// Adopt a handshake's session key as the trust secret if none is set yet.
    ///
    /// Returns true when the secret was installed.
    pub async fn install_session_secret(
        &self,
        id: &DeviceId,
        key: &SessionKey,
    ) -> Result<bool, PeerError> {
        let mut registry = self.registry.lock().await;
        if !registry.is_trusted(id) || registry.shared_secret(id).is_some() {
            return Ok(false);
        }
        self.keys
            .put(KeyId::trust(id), key.as_bytes().to_vec())
            .await?;
        registry.set_shared_secret(id, SharedSecret::from_bytes(*key.as_bytes()))?;
        self.persist(&registry).await?;
        debug!(peer = ?id, "Trust secret installed from handshake");
        Ok(true)
    }

    /// Refresh a known peer's identity after a re-announcement.
    ///
    /// A trusted peer announcing a different key is revoked.
    pub async fn observe(&self, peer: &PeerIdentity) -> Result<Option<RevocationReason>, PeerError> {
        let mut registry = self.registry.lock().await;
        let id = peer.device_id;
        let revoked = registry.observe(peer, unix_now());
        if let Some(reason) = revoked {
            self.delete_keys(&id).await?;
            self.persist(&registry).await?;
            drop(registry);
            warn!(peer = ?id, %reason, "Trusted device changed its key");
            self.events.emit(TrustEvent::DeviceRevoked {
                device_id: id,
                reason,
            });
        }
        Ok(revoked)
    }

    /// Expire old requests and grants and revoke malformed records.
    pub async fn sweep(&self) -> Result<SweepReport, PeerError> {
        let mut registry = self.registry.lock().await;
        let report = registry.sweep(unix_now());
        if report.is_empty() {
            return Ok(report);
        }
        for id in report.expired_trust.iter().chain(&report.policy_violations) {
            self.delete_keys(id).await?;
        }
        self.persist(&registry).await?;
        drop(registry);

        for id in &report.expired_requests {
            self.events
                .emit(TrustEvent::RequestDiscarded { device_id: *id });
        }
        for id in &report.expired_trust {
            self.events.emit(TrustEvent::DeviceRevoked {
                device_id: *id,
                reason: RevocationReason::Expired,
            });
        }
        for id in &report.policy_violations {
            self.events.emit(TrustEvent::DeviceRevoked {
                device_id: *id,
                reason: RevocationReason::PolicyViolation,
            });
        }
        Ok(report)
    }

    /// Note a successful sync with a trusted device.
    pub async fn record_sync(&self, id: &DeviceId) -> Result<(), PeerError> {
        let mut registry = self.registry.lock().await;
        registry.record_sync(id, unix_now())?;
        Ok(())
    }

    /// Whether `id` is currently trusted.
    pub async fn is_device_trusted(&self, id: &DeviceId) -> bool {
        self.registry.lock().await.is_trusted(id)
    }

    /// Snapshots of every trusted device.
    pub async fn trusted_devices(&self) -> Vec<TrustRecord> {
        self.registry.lock().await.trusted()
    }

    /// Snapshots of every pending request, oldest first.
    pub async fn pending_requests(&self) -> Vec<TrustRecord> {
        self.registry.lock().await.pending()
    }

    /// Snapshot of one record.
    pub async fn get(&self, id: &DeviceId) -> Option<TrustRecord> {
        self.registry.lock().await.get(id).map(TrustRecord::snapshot)
    }

    /// Counts per state.
    pub async fn registry_stats(&self) -> RegistryStats {
        self.registry.lock().await.stats()
    }

    /// Whether a trusted device has a secret attached.
    pub async fn has_shared_secret(&self, id: &DeviceId) -> bool {
        self.registry.lock().await.shared_secret(id).is_some()
    }

    /// Identity key a trusted device must prove it holds in a handshake.
    pub async fn trusted_key(&self, id: &DeviceId) -> Option<PublicKey> {
        let registry = self.registry.lock().await;
        registry
            .get(id)
            .filter(|_| registry.is_trusted(id))
            .and_then(|r| r.peer.public_key)
    }

    /// Key fingerprint a trusted device must present in a handshake.
    pub async fn expected_fingerprint(&self, id: &DeviceId) -> Option<Fingerprint> {
        self.trusted_key(id).await.map(|key| key.fingerprint())
    }

    async fn delete_keys(&self, id: &DeviceId) -> Result<(), PeerError> {
        self.keys.delete(&KeyId::trust(id)).await?;
        self.keys
            .delete(&KeyId::session(id, Direction::Outbound))
            .await?;
        self.keys
            .delete(&KeyId::session(id, Direction::Inbound))
            .await?;
        Ok(())
    }

    async fn persist(&self, registry: &TrustRegistry) -> Result<(), PeerError> {
        self.state.save_trust_records(&registry.records()).await?;
        Ok(())
    }
}

impl std::fmt::Debug for TrustManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustManager").finish_non_exhaustive()
    }
}

/// Spawn the background trust sweep.
///
/// Returns a handle that can be used to abort the task.
pub fn spawn_sweep_task(
    manager: Arc<TrustManager>,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!("Trust sweep started (interval: {}s)", period.as_secs());
        let mut timer = interval(period);

        loop {
            timer.tick().await;

            match manager.sweep().await {
                Ok(report) if report.is_empty() => debug!("Trust sweep: nothing to do"),
                Ok(report) => info!(
                    expired_requests = report.expired_requests.len(),
                    expired_trust = report.expired_trust.len(),
                    policy_violations = report.policy_violations.len(),
                    "Trust sweep"
                ),
                Err(e) => error!("Trust sweep error: {}", e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{MemoryKeyStore, MemoryStateStore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vitalsync_core::TrustState;
    use vitalsync_types::{Platform, PublicKey};

    fn peer(key: u8) -> PeerIdentity {
        PeerIdentity::new(
            DeviceId::random(),
            "Phone",
            Platform::Android,
            Some(PublicKey::from_bytes([key; 32])),
        )
    }

    struct Fixture {
        manager: TrustManager,
        keys: Arc<MemoryKeyStore>,
        state: Arc<MemoryStateStore>,
        events: EventBus,
    }

    fn fixture(policy: TrustPolicy) -> Fixture {
        let keys = Arc::new(MemoryKeyStore::generate());
        let state = Arc::new(MemoryStateStore::new());
        let events = EventBus::default();
        Fixture {
            manager: TrustManager::new(policy, keys.clone(), state.clone(), events.clone()),
            keys,
            state,
            events,
        }
    }

    #[derive(Default)]
    struct CountingNotifier {
        sent: AtomicUsize,
    }

    #[async_trait]
    impl RevocationNotifier for CountingNotifier {
        async fn notify_revoked(
            &self,
            _peer: DeviceId,
            _reason: RevocationReason,
        ) -> Result<(), PeerError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    // ===========================================
    // Request / Approve Tests
    // ===========================================

    #[tokio::test]
    async fn manual_request_waits_for_approval() {
        let f = fixture(TrustPolicy::default());
        let mut rx = f.events.subscribe();
        let phone = peer(1);

        let outcome = f.manager.request_device_trust(phone.clone()).await.unwrap();
        assert!(matches!(outcome, RequestOutcome::Pending { .. }));
        assert!(!f.manager.is_device_trusted(&phone.device_id).await);
        assert_eq!(f.manager.pending_requests().await.len(), 1);
        assert!(matches!(
            rx.recv().await.unwrap(),
            crate::events::EngineEvent::Trust(TrustEvent::ApprovalRequired { .. })
        ));
    }

    #[tokio::test]
    async fn approval_stores_secret_and_persists() {
        let f = fixture(TrustPolicy::default());
        let phone = peer(1);
        let id = phone.device_id;
        f.manager.request_device_trust(phone).await.unwrap();

        let record = f
            .manager
            .approve_device_trust(&id, Some(SharedSecret::from_bytes([9u8; 32])))
            .await
            .unwrap();

        assert_eq!(record.state, TrustState::Trusted);
        assert!(record.shared_secret.is_none(), "snapshots never carry secrets");
        assert!(f.manager.is_device_trusted(&id).await);
        assert!(f.manager.has_shared_secret(&id).await);
        assert_eq!(
            f.keys.get(&KeyId::trust(&id)).await.unwrap(),
            Some(vec![9u8; 32])
        );
        let persisted = f.state.load_trust_records().await.unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].state, TrustState::Trusted);
    }

    #[tokio::test]
    async fn auto_approval_when_policy_allows() {
        let f = fixture(TrustPolicy {
            require_manual_approval: false,
            ..TrustPolicy::default()
        });
        let phone = peer(1);
        let outcome = f.manager.request_device_trust(phone.clone()).await.unwrap();
        assert!(matches!(outcome, RequestOutcome::AutoApproved { .. }));
        assert!(f.manager.is_device_trusted(&phone.device_id).await);
    }

    #[tokio::test]
    async fn reject_discards_request() {
        let f = fixture(TrustPolicy::default());
        let phone = peer(1);
        f.manager.request_device_trust(phone.clone()).await.unwrap();
        f.manager.reject_device_trust(&phone.device_id).await.unwrap();

        assert!(f.manager.pending_requests().await.is_empty());
        assert!(f.manager.get(&phone.device_id).await.is_none());
    }

    // ===========================================
    // Revocation Tests
    // ===========================================

    #[tokio::test]
    async fn revoke_clears_secret_and_notifies() {
        let f = fixture(TrustPolicy::default());
        let notifier = Arc::new(CountingNotifier::default());
        f.manager.set_notifier(notifier.clone()).await;

        let phone = peer(1);
        let id = phone.device_id;
        f.manager.request_device_trust(phone).await.unwrap();
        f.manager
            .approve_device_trust(&id, Some(SharedSecret::from_bytes([9u8; 32])))
            .await
            .unwrap();
        f.keys
            .put(KeyId::session(&id, Direction::Outbound), vec![1; 32])
            .await
            .unwrap();

        let record = f
            .manager
            .revoke_device_trust(&id, RevocationReason::UserRequested, true)
            .await
            .unwrap();

        assert_eq!(record.state, TrustState::Revoked);
        assert!(!f.manager.is_device_trusted(&id).await);
        assert!(!f.manager.has_shared_secret(&id).await);
        assert!(f.keys.is_empty().await);
        assert_eq!(notifier.sent.load(Ordering::SeqCst), 1);

        // Revoking twice is an error and sends nothing more
        assert!(f
            .manager
            .revoke_device_trust(&id, RevocationReason::UserRequested, true)
            .await
            .is_err());
        assert_eq!(notifier.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn revoked_device_reenrolls_after_forget() {
        let f = fixture(TrustPolicy::default());
        let phone = peer(1);
        let id = phone.device_id;
        f.manager.request_device_trust(phone.clone()).await.unwrap();
        f.manager.approve_device_trust(&id, None).await.unwrap();
        f.manager
            .revoke_device_trust(&id, RevocationReason::Compromised, false)
            .await
            .unwrap();

        assert!(matches!(
            f.manager.request_device_trust(phone.clone()).await,
            Err(PeerError::Trust(TrustError::Revoked(_)))
        ));
        assert!(f.manager.forget_device(&id).await.unwrap().is_some());
        assert!(f.manager.request_device_trust(phone).await.is_ok());
    }

    #[tokio::test]
    async fn key_change_revokes_trusted_peer() {
        let f = fixture(TrustPolicy::default());
        let phone = peer(1);
        let id = phone.device_id;
        f.manager.request_device_trust(phone.clone()).await.unwrap();
        f.manager.approve_device_trust(&id, None).await.unwrap();

        let mut impostor = phone.clone();
        impostor.public_key = Some(PublicKey::from_bytes([2u8; 32]));
        assert_eq!(
            f.manager.observe(&impostor).await.unwrap(),
            Some(RevocationReason::PolicyViolation)
        );
        assert!(!f.manager.is_device_trusted(&id).await);

        // Same key again is harmless
        assert_eq!(f.manager.observe(&phone).await.unwrap(), None);
    }

    // ===========================================
    // Handshake Secret Tests
    // ===========================================

    #[tokio::test]
    async fn session_key_becomes_secret_only_once() {
        let f = fixture(TrustPolicy::default());
        let phone = peer(1);
        let id = phone.device_id;
        f.manager.request_device_trust(phone).await.unwrap();

        let key = SessionKey::from_bytes([5u8; 32]);
        assert!(!f.manager.install_session_secret(&id, &key).await.unwrap());

        f.manager.approve_device_trust(&id, None).await.unwrap();
        assert!(f.manager.install_session_secret(&id, &key).await.unwrap());
        assert!(!f
            .manager
            .install_session_secret(&id, &SessionKey::from_bytes([6u8; 32]))
            .await
            .unwrap());
        assert_eq!(
            f.keys.get(&KeyId::trust(&id)).await.unwrap(),
            Some(vec![5u8; 32])
        );
    }

    #[tokio::test]
    async fn expected_fingerprint_only_for_trusted() {
        let f = fixture(TrustPolicy::default());
        let phone = peer(1);
        let id = phone.device_id;
        f.manager.request_device_trust(phone.clone()).await.unwrap();
        assert!(f.manager.expected_fingerprint(&id).await.is_none());

        f.manager.approve_device_trust(&id, None).await.unwrap();
        assert_eq!(
            f.manager.expected_fingerprint(&id).await,
            phone.fingerprint()
        );
        assert_eq!(f.manager.trusted_key(&id).await, phone.public_key);
    }

    // ===========================================
    // Persistence Tests
    // ===========================================

    #[tokio::test]
    async fn load_restores_records_and_secrets() {
        let f = fixture(TrustPolicy::default());
        let phone = peer(1);
        let id = phone.device_id;
        f.manager.request_device_trust(phone).await.unwrap();
        f.manager
            .approve_device_trust(&id, Some(SharedSecret::from_bytes([7u8; 32])))
            .await
            .unwrap();

        let restarted = TrustManager::new(
            TrustPolicy::default(),
            f.keys.clone(),
            f.state.clone(),
            EventBus::default(),
        );
        assert_eq!(restarted.load().await.unwrap(), 1);
        assert!(restarted.is_device_trusted(&id).await);
        assert!(restarted.has_shared_secret(&id).await);
        assert_eq!(restarted.registry_stats().await.trusted, 1);
    }

    #[tokio::test]
    async fn sweep_revokes_expired_trust() {
        let f = fixture(TrustPolicy {
            max_trust_age_secs: 0,
            ..TrustPolicy::default()
        });
        let phone = peer(1);
        let id = phone.device_id;
        f.manager.request_device_trust(phone).await.unwrap();
        f.manager.approve_device_trust(&id, None).await.unwrap();

        // Trust granted "now" is only expired once a second has passed
        tokio::time::sleep(Duration::from_millis(1100)).await;
        let report = f.manager.sweep().await.unwrap();
        assert_eq!(report.expired_trust, vec![id]);
        assert!(!f.manager.is_device_trusted(&id).await);
    }
}
