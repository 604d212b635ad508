//! Handshake coordinator.
//!
//! Drives [`HandshakeSession`]s over a [`Transport`]. Each attempt runs
//! under the configured timeout and can be cancelled from another task;
//! whatever ends it, the session leaves the table and the peer gets a
//! best-effort `HandshakeAbort`.
//!
//! Both ends must hold the identity secret behind the key on record in
//! the trust registry. The [`KeyStore`] performs the identity half of the
//! key agreement so the secret never reaches this module.

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use vitalsync_core::{HandshakeError, HandshakeSession, HandshakeTable, Role, SessionKey, TrustError};
use vitalsync_types::{
    DeviceId, Fingerprint, HandshakeAbort, HandshakeChallenge, HandshakeInit, Message, PublicKey,
    SessionId,
};

use crate::error::PeerError;
use crate::events::{EventBus, HandshakeEvent};
use crate::services::KeyStore;
use crate::transport::{recv_message, send_message, Transport};
use crate::trust::TrustManager;

fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

fn unexpected(state: &'static str) -> PeerError {
    HandshakeError::UnexpectedMessage { state }.into()
}

/// Runs handshakes for the local device.
pub struct HandshakeCoordinator {
    local: DeviceId,
    keys: Arc<dyn KeyStore>,
    fingerprint: Fingerprint,
    timeout: Duration,
    table: Mutex<HandshakeTable>,
    trust: Arc<TrustManager>,
    cancels: DashMap<(DeviceId, Role), watch::Sender<bool>>,
    events: EventBus,
}

impl HandshakeCoordinator {
    /// Create a coordinator.
    ///
    /// `fingerprint` identifies the long-lived key held by `keys`.
    pub fn new(
        local: DeviceId,
        keys: Arc<dyn KeyStore>,
        fingerprint: Fingerprint,
        timeout: Duration,
        trust: Arc<TrustManager>,
        events: EventBus,
    ) -> Self {
        Self {
            local,
            keys,
            fingerprint,
            timeout,
            table: Mutex::new(HandshakeTable::new()),
            trust,
            cancels: DashMap::new(),
            events,
        }
    }

    /// Handshake with `peer` over an open transport, as initiator.
    ///
    /// Only trusted peers are contacted.
    pub async fn initiate(
        &self,
        peer: DeviceId,
        transport: &dyn Transport,
    ) -> Result<SessionKey, PeerError> {
        let peer_key = self.peer_key(&peer).await?;
        let (session, init) =
            HandshakeSession::initiate(peer, self.fingerprint, peer_key, self.timeout, now());
        let session_id = session.id();
        self.table.lock().await.insert(session)?;

        let exchange = async {
            send_message(transport, self.local, Some(peer), &Message::HandshakeInit(init)).await?;

            let challenge = match self.recv_from(peer, transport).await? {
                Message::HandshakeChallenge(msg) => msg,
                _ => return Err(unexpected("initiated")),
            };
            let share = self
                .keys
                .identity_agreement(&challenge.ephemeral_public)
                .await?;
            let response = {
                let mut table = self.table.lock().await;
                let session = table
                    .get_mut(&peer, Role::Initiator)
                    .ok_or(HandshakeError::UnknownSession(session_id))?;
                session.on_challenge(&challenge, &share, now())?
            };
            send_message(
                transport,
                self.local,
                Some(peer),
                &Message::HandshakeResponse(response),
            )
            .await?;

            let confirm = match self.recv_from(peer, transport).await? {
                Message::HandshakeConfirm(msg) => msg,
                _ => return Err(unexpected("verified")),
            };
            let mut table = self.table.lock().await;
            let session = table
                .get_mut(&peer, Role::Initiator)
                .ok_or(HandshakeError::UnknownSession(session_id))?;
            session.on_confirm(&confirm, now())?;
            completed_key(session)
        };

        self.drive(peer, Role::Initiator, session_id, transport, exchange)
            .await
    }

    /// Answer a `HandshakeInit` received from `peer`, as responder.
    pub async fn respond(
        &self,
        peer: DeviceId,
        transport: &dyn Transport,
        init: HandshakeInit,
    ) -> Result<SessionKey, PeerError> {
        let session_id = init.session_id;
        let started = self.start_responder(peer, &init).await;
        let challenge = match started {
            Ok(challenge) => challenge,
            Err(e) => {
                self.abort(peer, session_id, transport, &e).await;
                self.events.emit(HandshakeEvent::Failed {
                    peer,
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };

        let exchange = async {
            send_message(
                transport,
                self.local,
                Some(peer),
                &Message::HandshakeChallenge(challenge),
            )
            .await?;

            let response = match self.recv_from(peer, transport).await? {
                Message::HandshakeResponse(msg) => msg,
                _ => return Err(unexpected("challenged")),
            };
            let (confirm, key) = {
                let mut table = self.table.lock().await;
                let session = table
                    .get_mut(&peer, Role::Responder)
                    .ok_or(HandshakeError::UnknownSession(session_id))?;
                let confirm = session.on_response(&response, now())?;
                (confirm, completed_key(session)?)
            };
            send_message(
                transport,
                self.local,
                Some(peer),
                &Message::HandshakeConfirm(confirm),
            )
            .await?;
            Ok(key)
        };

        self.drive(peer, Role::Responder, session_id, transport, exchange)
            .await
    }

    async fn start_responder(
        &self,
        peer: DeviceId,
        init: &HandshakeInit,
    ) -> Result<HandshakeChallenge, PeerError> {
        let peer_key = self.peer_key(&peer).await?;
        let share = self.keys.identity_agreement(&init.ephemeral_public).await?;
        let (session, challenge) = HandshakeSession::respond(
            peer,
            self.fingerprint,
            init,
            peer_key,
            &share,
            self.timeout,
            now(),
        )?;
        self.table.lock().await.insert(session)?;
        Ok(challenge)
    }

    /// Identity key on record for a trusted `peer`.
    async fn peer_key(&self, peer: &DeviceId) -> Result<PublicKey, PeerError> {
        if !self.trust.is_device_trusted(peer).await {
            return Err(TrustError::NotTrusted(*peer).into());
        }
        self.trust
            .trusted_key(peer)
            .await
            .ok_or_else(|| HandshakeError::UnknownPeerKey(*peer).into())
    }

    /// Run one exchange under the timeout and the cancel signal, then clean up.
    async fn drive<F>(
        &self,
        peer: DeviceId,
        role: Role,
        session_id: SessionId,
        transport: &dyn Transport,
        exchange: F,
    ) -> Result<SessionKey, PeerError>
    where
        F: Future<Output = Result<SessionKey, PeerError>>,
    {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        self.cancels.insert((peer, role), cancel_tx);
        self.events.emit(HandshakeEvent::Started { peer, session_id });
        debug!(peer = ?peer, ?role, "Handshake started");

        let result = tokio::select! {
            outcome = tokio::time::timeout(self.timeout, exchange) => {
                outcome.unwrap_or_else(|_| Err(HandshakeError::Expired.into()))
            }
            _ = cancel_rx.wait_for(|cancelled| *cancelled) => Err(PeerError::Cancelled),
        };
        self.cancels.remove(&(peer, role));

        let session = self.table.lock().await.remove(&peer, role);
        match result {
            Ok(key) => {
                info!(peer = ?peer, ?role, "Handshake completed");
                self.events
                    .emit(HandshakeEvent::Completed { peer, session_id });
                Ok(key)
            }
            Err(e) => {
                if let Some(mut session) = session {
                    session.fail(e.to_string());
                }
                warn!(peer = ?peer, ?role, "Handshake failed: {}", e);
                self.abort(peer, session_id, transport, &e).await;
                self.events.emit(HandshakeEvent::Failed {
                    peer,
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Receive the next handshake message from `peer`.
    ///
    /// A `HandshakeAbort` from the peer ends the attempt.
    async fn recv_from(
        &self,
        peer: DeviceId,
        transport: &dyn Transport,
    ) -> Result<Message, PeerError> {
        let (sender, message) = recv_message(transport).await?;
        if sender != peer {
            return Err(HandshakeError::SessionMismatch.into());
        }
        match message {
            Message::HandshakeAbort(abort) => Err(HandshakeError::Aborted(abort.reason).into()),
            other => Ok(other),
        }
    }

    async fn abort(
        &self,
        peer: DeviceId,
        session_id: SessionId,
        transport: &dyn Transport,
        error: &PeerError,
    ) {
        // Never answer an abort with an abort
        if matches!(error, PeerError::Handshake(HandshakeError::Aborted(_))) {
            return;
        }
        let abort = Message::HandshakeAbort(HandshakeAbort {
            session_id,
            reason: error.to_string(),
        });
        if let Err(e) = send_message(transport, self.local, Some(peer), &abort).await {
            debug!(peer = ?peer, "Could not deliver handshake abort: {}", e);
        }
    }

    /// Cancel any running handshake with `peer`.
    ///
    /// Returns false when there was nothing to cancel.
    pub fn cancel(&self, peer: &DeviceId) -> bool {
        let mut cancelled = false;
        for role in [Role::Initiator, Role::Responder] {
            if let Some(tx) = self.cancels.get(&(*peer, role)) {
                tx.send_replace(true);
                cancelled = true;
            }
        }
        cancelled
    }

    /// Whether a handshake with `peer` is in flight.
    pub async fn is_active(&self, peer: &DeviceId) -> bool {
        let table = self.table.lock().await;
        table.is_active(peer, Role::Initiator) || table.is_active(peer, Role::Responder)
    }

    /// Drop sessions whose deadline passed without a driver noticing.
    pub async fn sweep_expired(&self) -> usize {
        let expired = self.table.lock().await.expire(now());
        for (_, peer, _) in &expired {
            self.events.emit(HandshakeEvent::Failed {
                peer: *peer,
                reason: HandshakeError::Expired.to_string(),
            });
        }
        expired.len()
    }

    /// Our device id.
    pub fn local_id(&self) -> DeviceId {
        self.local
    }
}

impl std::fmt::Debug for HandshakeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeCoordinator")
            .field("local", &self.local)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

fn completed_key(session: &HandshakeSession) -> Result<SessionKey, PeerError> {
    session
        .session_key()
        .cloned()
        .ok_or_else(|| HandshakeError::KeyDerivation("session not completed".into()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{KeyStore, MemoryKeyStore, MemoryStateStore};
    use crate::transport::MemoryTransport;
    use vitalsync_core::TrustPolicy;
    use vitalsync_types::{PeerIdentity, Platform, PublicKey};

    struct Device {
        identity: PeerIdentity,
        trust: Arc<TrustManager>,
        coordinator: Arc<HandshakeCoordinator>,
    }

    async fn device(name: &str) -> Device {
        let keys = Arc::new(MemoryKeyStore::generate());
        let public_key = keys.identity_public_key().await.unwrap();
        let identity = PeerIdentity::new(DeviceId::random(), name, Platform::Ios, Some(public_key));
        let events = EventBus::default();
        let trust = Arc::new(TrustManager::new(
            TrustPolicy::default(),
            keys.clone(),
            Arc::new(MemoryStateStore::new()),
            events.clone(),
        ));
        let coordinator = Arc::new(HandshakeCoordinator::new(
            identity.device_id,
            keys.clone(),
            public_key.fingerprint(),
            Duration::from_secs(5),
            trust.clone(),
            events,
        ));
        Device {
            identity,
            trust,
            coordinator,
        }
    }

    async fn trust(who: &Device, whom: &PeerIdentity) {
        who.trust.request_device_trust(whom.clone()).await.unwrap();
        who.trust
            .approve_device_trust(&whom.device_id, None)
            .await
            .unwrap();
    }

    async fn paired() -> (Device, Device) {
        let a = device("Phone").await;
        let b = device("Tablet").await;
        trust(&a, &b.identity).await;
        trust(&b, &a.identity).await;
        (a, b)
    }

    fn spawn_responder(
        b: &Device,
        transport: MemoryTransport,
    ) -> tokio::task::JoinHandle<Result<SessionKey, PeerError>> {
        let coordinator = b.coordinator.clone();
        tokio::spawn(async move {
            let (sender, message) = recv_message(&transport).await?;
            match message {
                Message::HandshakeInit(init) => coordinator.respond(sender, &transport, init).await,
                _ => Err(unexpected("idle")),
            }
        })
    }

    // ===========================================
    // Happy Path Tests
    // ===========================================

    #[tokio::test]
    async fn both_sides_derive_the_same_key() {
        let (a, b) = paired().await;
        let (ta, tb) = MemoryTransport::pair();
        let responder = spawn_responder(&b, tb);

        let initiator_key = a
            .coordinator
            .initiate(b.identity.device_id, &ta)
            .await
            .unwrap();
        let responder_key = responder.await.unwrap().unwrap();

        assert_eq!(initiator_key.as_bytes(), responder_key.as_bytes());
        assert!(!a.coordinator.is_active(&b.identity.device_id).await);
        assert!(!b.coordinator.is_active(&a.identity.device_id).await);
    }

    #[tokio::test]
    async fn fresh_keys_per_handshake() {
        let (a, b) = paired().await;

        let mut keys = Vec::new();
        for _ in 0..2 {
            let (ta, tb) = MemoryTransport::pair();
            let responder = spawn_responder(&b, tb);
            keys.push(
                a.coordinator
                    .initiate(b.identity.device_id, &ta)
                    .await
                    .unwrap(),
            );
            responder.await.unwrap().unwrap();
        }
        assert_ne!(keys[0].as_bytes(), keys[1].as_bytes());
    }

    // ===========================================
    // Failure Tests
    // ===========================================

    #[tokio::test]
    async fn untrusted_peer_is_never_contacted() {
        let a = device("Phone").await;
        let b = device("Tablet").await;
        let (ta, _tb) = MemoryTransport::pair();

        let result = a.coordinator.initiate(b.identity.device_id, &ta).await;
        assert!(matches!(
            result,
            Err(PeerError::Trust(TrustError::NotTrusted(_)))
        ));
    }

    #[tokio::test]
    async fn fingerprint_mismatch_aborts_both_sides() {
        let a = device("Phone").await;
        let b = device("Tablet").await;
        trust(&a, &b.identity).await;

        // b believes a holds a different key
        let mut stale = a.identity.clone();
        stale.public_key = Some(PublicKey::from_bytes([42u8; 32]));
        trust(&b, &stale).await;

        let (ta, tb) = MemoryTransport::pair();
        let responder = spawn_responder(&b, tb);

        let initiator = a.coordinator.initiate(b.identity.device_id, &ta).await;
        assert!(matches!(
            responder.await.unwrap(),
            Err(PeerError::Handshake(HandshakeError::FingerprintMismatch))
        ));
        assert!(matches!(
            initiator,
            Err(PeerError::Handshake(HandshakeError::Aborted(_)))
        ));
    }

    #[tokio::test]
    async fn impostor_with_a_trusted_id_is_refused() {
        let (a, b) = paired().await;
        let (a_id, b_id) = (a.identity.device_id, b.identity.device_id);
        let a_key = a.identity.public_key.unwrap();
        let b_key = b.identity.public_key.unwrap();
        let mallory = MemoryKeyStore::generate();

        let (tm, tb) = MemoryTransport::pair();
        let responder = spawn_responder(&b, tb);

        // Everything a announces is public; its identity secret is not
        let (mut spoof, init) = HandshakeSession::initiate(
            b_id,
            a_key.fingerprint(),
            b_key,
            Duration::from_secs(5),
            now(),
        );
        send_message(&tm, a_id, Some(b_id), &Message::HandshakeInit(init))
            .await
            .unwrap();
        let challenge = match recv_message(&tm).await.unwrap().1 {
            Message::HandshakeChallenge(challenge) => challenge,
            other => panic!("expected a challenge, got {:?}", other),
        };
        let share = mallory
            .identity_agreement(&challenge.ephemeral_public)
            .await
            .unwrap();
        let response = spoof.on_challenge(&challenge, &share, now()).unwrap();
        send_message(&tm, a_id, Some(b_id), &Message::HandshakeResponse(response))
            .await
            .unwrap();

        assert!(matches!(
            responder.await.unwrap(),
            Err(PeerError::Handshake(HandshakeError::ChallengeFailed))
        ));
        assert!(!b.coordinator.is_active(&a_id).await);
        assert!(matches!(
            recv_message(&tm).await.unwrap().1,
            Message::HandshakeAbort(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out() {
        let (a, b) = paired().await;
        let (ta, _tb) = MemoryTransport::pair();

        let result = a.coordinator.initiate(b.identity.device_id, &ta).await;
        assert!(matches!(
            result,
            Err(PeerError::Handshake(HandshakeError::Expired))
        ));
        assert!(!a.coordinator.is_active(&b.identity.device_id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_a_running_handshake() {
        let (a, b) = paired().await;
        let peer = b.identity.device_id;
        let (ta, _tb) = MemoryTransport::pair();

        assert!(!a.coordinator.cancel(&peer));

        let running = {
            let coordinator = a.coordinator.clone();
            tokio::spawn(async move { coordinator.initiate(peer, &ta).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(a.coordinator.is_active(&peer).await);

        // A second attempt while the first runs is refused
        let (other, _keep) = MemoryTransport::pair();
        assert!(matches!(
            a.coordinator.initiate(peer, &other).await,
            Err(PeerError::Handshake(HandshakeError::AlreadyActive { .. }))
        ));

        assert!(a.coordinator.cancel(&peer));
        assert!(a.coordinator.cancel(&peer));
        assert!(matches!(running.await.unwrap(), Err(PeerError::Cancelled)));
        assert!(!a.coordinator.is_active(&peer).await);
        assert!(!a.coordinator.cancel(&peer));
    }

    #[tokio::test]
    async fn failure_is_published() {
        let a = device("Phone").await;
        let b = device("Tablet").await;
        trust(&a, &b.identity).await;
        let mut events = a.coordinator.events.subscribe();

        let (ta, tb) = MemoryTransport::pair();
        // b does not trust a and refuses
        let responder = spawn_responder(&b, tb);
        assert!(a
            .coordinator
            .initiate(b.identity.device_id, &ta)
            .await
            .is_err());
        assert!(responder.await.unwrap().is_err());

        let mut saw_started = false;
        let mut saw_failed = false;
        while let Ok(event) = events.try_recv() {
            match event {
                crate::events::EngineEvent::Handshake(HandshakeEvent::Started { .. }) => {
                    saw_started = true
                }
                crate::events::EngineEvent::Handshake(HandshakeEvent::Failed { .. }) => {
                    saw_failed = true
                }
                _ => {}
            }
        }
        assert!(saw_started && saw_failed);
    }
}
