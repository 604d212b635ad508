//! Handshake state machine for vitalsync.
//!
//! Turns a discovered peer into a live session key using an ephemeral
//! X25519 exchange plus mutual challenge-response:
//!
//! ```text
//! initiator                               responder
//!   initiate()  ── HandshakeInit ──────►  respond()        [challenged]
//!   on_challenge() ◄─ HandshakeChallenge ─
//!   [verified]  ── HandshakeResponse ──►  on_response()    [completed]
//!   on_confirm() ◄─ HandshakeConfirm ────
//!   [completed]
//! ```
//!
//! The key schedule mixes three X25519 results: ephemeral with ephemeral,
//! initiator ephemeral with responder identity, and initiator identity with
//! responder ephemeral. Only the holders of both trusted identity secrets
//! can answer the challenges, and a device that merely copies a peer's id
//! and fingerprint fails at `on_response`.
//!
//! Ephemeral secrets never leave the session and are zeroized on drop, so
//! a later compromise of a device's long-lived key does not expose past
//! session keys. Like the rest of this crate the module does no I/O: time
//! is passed in and the caller moves messages over the network.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use curve25519_dalek::{montgomery::MontgomeryPoint, scalar::Scalar};
use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;
use vitalsync_types::{
    DeviceId, ErrorClass, Fingerprint, HandshakeChallenge, HandshakeConfirm, HandshakeInit,
    HandshakeResponse, PublicKey, SessionId,
};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Default deadline for a whole handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Size of the derived session key in bytes.
pub const SESSION_KEY_SIZE: usize = 32;

const HKDF_SALT: &[u8] = b"vitalsync-handshake-v1";
const RESPONSE_LABEL: &[u8] = b"challenge-response";
const COUNTER_LABEL: &[u8] = b"counter-response";

/// Handshake errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    /// A session for this peer and role is already in flight.
    #[error("handshake already active for {peer:?} as {role:?}")]
    AlreadyActive {
        /// Peer the session targets.
        peer: DeviceId,
        /// Local role.
        role: Role,
    },

    /// No session with this id.
    #[error("unknown handshake session {0:?}")]
    UnknownSession(SessionId),

    /// Message belongs to another session.
    #[error("session id mismatch")]
    SessionMismatch,

    /// Message arrived in the wrong state.
    #[error("unexpected handshake message in state {state}")]
    UnexpectedMessage {
        /// State the session was in.
        state: &'static str,
    },

    /// Peer's long-lived key fingerprint is not the one we trust.
    #[error("peer fingerprint does not match the trusted key")]
    FingerprintMismatch,

    /// Peer sent a low-order ephemeral key.
    #[error("peer ephemeral key is invalid")]
    InvalidPeerKey,

    /// No identity key is on record for the peer.
    #[error("no identity key on record for {0:?}")]
    UnknownPeerKey(DeviceId),

    /// Challenge answer did not verify.
    #[error("challenge response did not verify")]
    ChallengeFailed,

    /// Deadline passed before completion.
    #[error("handshake deadline exceeded")]
    Expired,

    /// Peer or caller abandoned the handshake.
    #[error("handshake aborted: {0}")]
    Aborted(String),

    /// Key derivation failed.
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
}

impl HandshakeError {
    /// Classification for retry decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            HandshakeError::AlreadyActive { .. }
            | HandshakeError::UnknownSession(_)
            | HandshakeError::SessionMismatch
            | HandshakeError::UnexpectedMessage { .. } => ErrorClass::Protocol,
            HandshakeError::Expired | HandshakeError::Aborted(_) => ErrorClass::Network,
            HandshakeError::FingerprintMismatch | HandshakeError::UnknownPeerKey(_) => {
                ErrorClass::Trust
            }
            HandshakeError::InvalidPeerKey
            | HandshakeError::ChallengeFailed
            | HandshakeError::KeyDerivation(_) => ErrorClass::Crypto,
        }
    }
}

/// Which side of the handshake this device plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Sent the first message.
    Initiator,
    /// Answered an incoming HandshakeInit.
    Responder,
}

/// Handshake progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    /// Ephemeral key sent, waiting for the challenge.
    Initiated,
    /// Challenge issued, waiting for the answer.
    Challenged,
    /// Challenge answered, waiting for the counter-answer.
    Verified,
    /// Both sides proved possession of the shared secret.
    Completed,
    /// Terminal failure.
    Failed {
        /// What went wrong.
        reason: String,
    },
}

impl HandshakeState {
    fn name(&self) -> &'static str {
        match self {
            HandshakeState::Initiated => "initiated",
            HandshakeState::Challenged => "challenged",
            HandshakeState::Verified => "verified",
            HandshakeState::Completed => "completed",
            HandshakeState::Failed { .. } => "failed",
        }
    }

    /// Whether the session can make no further progress.
    pub fn is_terminal(&self) -> bool {
        matches!(self, HandshakeState::Completed | HandshakeState::Failed { .. })
    }
}

/// The symmetric key both ends hold after a completed handshake.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; SESSION_KEY_SIZE]);

impl SessionKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; SESSION_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.0
    }
}

// Don't leak keys in debug output
impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionKey([REDACTED])")
    }
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct EphemeralSecret([u8; 32]);

impl EphemeralSecret {
    fn generate() -> Self {
        Self(random_32())
    }

    fn scalar(&self) -> Scalar {
        Scalar::from_bytes_mod_order(self.0)
    }

    fn public(&self) -> [u8; 32] {
        MontgomeryPoint::mul_base(&self.scalar()).to_bytes()
    }

    fn agree(&self, public: &[u8; 32]) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(diffie_hellman(&self.0, public))
    }
}

/// X25519 between a secret scalar and a peer's public point.
///
/// An all-zero result means the public point had low order.
pub fn diffie_hellman(secret: &[u8; 32], public: &[u8; 32]) -> [u8; 32] {
    (Scalar::from_bytes_mod_order(*secret) * MontgomeryPoint(*public)).to_bytes()
}

/// One handshake attempt. Never persisted.
pub struct HandshakeSession {
    id: SessionId,
    peer: DeviceId,
    role: Role,
    state: HandshakeState,
    ephemeral: EphemeralSecret,
    ephemeral_public: [u8; 32],
    local_fingerprint: Fingerprint,
    peer_key: PublicKey,
    peer_fingerprint: Option<Fingerprint>,
    session_key: Option<SessionKey>,
    mac_key: Option<SessionKey>,
    issued_challenge: Option<[u8; 32]>,
    deadline: Instant,
}

impl std::fmt::Debug for HandshakeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeSession")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl HandshakeSession {
    /// Start a handshake as initiator.
    ///
    /// `peer_key` is the identity key the trust manager holds for `peer`.
    /// Returns the session and the `HandshakeInit` to send to the peer.
    pub fn initiate(
        peer: DeviceId,
        local_fingerprint: Fingerprint,
        peer_key: PublicKey,
        timeout: Duration,
        now: Instant,
    ) -> (Self, HandshakeInit) {
        let session = Self::new(
            SessionId::new(),
            peer,
            Role::Initiator,
            HandshakeState::Initiated,
            local_fingerprint,
            peer_key,
            now + timeout,
        );
        let init = HandshakeInit {
            session_id: session.id,
            ephemeral_public: session.ephemeral_public,
            fingerprint: local_fingerprint,
        };
        (session, init)
    }

    /// Answer an incoming `HandshakeInit` as responder.
    ///
    /// `peer_key` is the identity key the trust manager holds for this
    /// peer; an init naming another key aborts the handshake.
    /// `identity_share` is X25519 of our identity secret with
    /// `init.ephemeral_public`, computed by whoever holds the secret.
    pub fn respond(
        peer: DeviceId,
        local_fingerprint: Fingerprint,
        init: &HandshakeInit,
        peer_key: PublicKey,
        identity_share: &[u8; 32],
        timeout: Duration,
        now: Instant,
    ) -> Result<(Self, HandshakeChallenge), HandshakeError> {
        if peer_key.fingerprint() != init.fingerprint {
            return Err(HandshakeError::FingerprintMismatch);
        }

        let mut session = Self::new(
            init.session_id,
            peer,
            Role::Responder,
            HandshakeState::Challenged,
            local_fingerprint,
            peer_key,
            now + timeout,
        );
        session.peer_fingerprint = Some(init.fingerprint);
        session.derive_keys(&init.ephemeral_public, identity_share)?;

        let challenge = random_32();
        session.issued_challenge = Some(challenge);

        let msg = HandshakeChallenge {
            session_id: session.id,
            ephemeral_public: session.ephemeral_public,
            challenge,
            fingerprint: local_fingerprint,
        };
        Ok((session, msg))
    }

    fn new(
        id: SessionId,
        peer: DeviceId,
        role: Role,
        state: HandshakeState,
        local_fingerprint: Fingerprint,
        peer_key: PublicKey,
        deadline: Instant,
    ) -> Self {
        let ephemeral = EphemeralSecret::generate();
        let ephemeral_public = ephemeral.public();
        Self {
            id,
            peer,
            role,
            state,
            ephemeral,
            ephemeral_public,
            local_fingerprint,
            peer_key,
            peer_fingerprint: None,
            session_key: None,
            mac_key: None,
            issued_challenge: None,
            deadline,
        }
    }

    /// Initiator: process the responder's challenge.
    ///
    /// `identity_share` is X25519 of our identity secret with
    /// `msg.ephemeral_public`.
    pub fn on_challenge(
        &mut self,
        msg: &HandshakeChallenge,
        identity_share: &[u8; 32],
        now: Instant,
    ) -> Result<HandshakeResponse, HandshakeError> {
        let result = self.handle_challenge(msg, identity_share, now);
        self.fail_on_error(result)
    }

    fn handle_challenge(
        &mut self,
        msg: &HandshakeChallenge,
        identity_share: &[u8; 32],
        now: Instant,
    ) -> Result<HandshakeResponse, HandshakeError> {
        self.check(msg.session_id, HandshakeState::Initiated, now)?;
        if self.peer_key.fingerprint() != msg.fingerprint {
            return Err(HandshakeError::FingerprintMismatch);
        }
        self.peer_fingerprint = Some(msg.fingerprint);
        self.derive_keys(&msg.ephemeral_public, identity_share)?;

        let response = self.mac(RESPONSE_LABEL, &msg.challenge)?;
        let counter_challenge = random_32();
        self.issued_challenge = Some(counter_challenge);
        self.state = HandshakeState::Verified;

        Ok(HandshakeResponse {
            session_id: self.id,
            response,
            counter_challenge,
        })
    }

    /// Responder: validate the initiator's answer and answer its counter-challenge.
    pub fn on_response(
        &mut self,
        msg: &HandshakeResponse,
        now: Instant,
    ) -> Result<HandshakeConfirm, HandshakeError> {
        let result = self.handle_response(msg, now);
        self.fail_on_error(result)
    }

    fn handle_response(
        &mut self,
        msg: &HandshakeResponse,
        now: Instant,
    ) -> Result<HandshakeConfirm, HandshakeError> {
        self.check(msg.session_id, HandshakeState::Challenged, now)?;
        let challenge = self
            .issued_challenge
            .ok_or(HandshakeError::UnexpectedMessage { state: "challenged" })?;
        self.verify(RESPONSE_LABEL, &challenge, &msg.response)?;

        let counter_response = self.mac(COUNTER_LABEL, &msg.counter_challenge)?;
        self.issued_challenge = None;
        self.state = HandshakeState::Completed;

        Ok(HandshakeConfirm {
            session_id: self.id,
            counter_response,
        })
    }

    /// Initiator: validate the responder's counter-answer.
    pub fn on_confirm(&mut self, msg: &HandshakeConfirm, now: Instant) -> Result<(), HandshakeError> {
        let result = self.handle_confirm(msg, now);
        self.fail_on_error(result)
    }

    fn handle_confirm(&mut self, msg: &HandshakeConfirm, now: Instant) -> Result<(), HandshakeError> {
        self.check(msg.session_id, HandshakeState::Verified, now)?;
        let challenge = self
            .issued_challenge
            .ok_or(HandshakeError::UnexpectedMessage { state: "verified" })?;
        self.verify(COUNTER_LABEL, &challenge, &msg.counter_response)?;
        self.issued_challenge = None;
        self.state = HandshakeState::Completed;
        Ok(())
    }

    /// Force the session into `Failed`.
    ///
    /// Key material is dropped immediately.
    pub fn fail(&mut self, reason: impl Into<String>) {
        if !matches!(self.state, HandshakeState::Failed { .. }) {
            self.state = HandshakeState::Failed {
                reason: reason.into(),
            };
        }
        self.session_key = None;
        self.mac_key = None;
        self.issued_challenge = None;
    }

    /// Whether the deadline has passed without completing.
    pub fn is_expired(&self, now: Instant) -> bool {
        !self.state.is_terminal() && now >= self.deadline
    }

    /// Session id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Peer device.
    pub fn peer(&self) -> DeviceId {
        self.peer
    }

    /// Local role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current state.
    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    /// Deadline for completion.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Our long-lived key fingerprint.
    pub fn local_fingerprint(&self) -> Fingerprint {
        self.local_fingerprint
    }

    /// Identity key the peer must prove it holds.
    pub fn peer_key(&self) -> PublicKey {
        self.peer_key
    }

    /// Peer's long-lived key fingerprint, once seen.
    pub fn peer_fingerprint(&self) -> Option<Fingerprint> {
        self.peer_fingerprint
    }

    /// The derived session key, only available once completed.
    pub fn session_key(&self) -> Option<&SessionKey> {
        match self.state {
            HandshakeState::Completed => self.session_key.as_ref(),
            _ => None,
        }
    }

    fn check(
        &mut self,
        session_id: SessionId,
        expected: HandshakeState,
        now: Instant,
    ) -> Result<(), HandshakeError> {
        if session_id != self.id {
            return Err(HandshakeError::SessionMismatch);
        }
        if self.is_expired(now) {
            return Err(HandshakeError::Expired);
        }
        if self.state != expected {
            return Err(HandshakeError::UnexpectedMessage {
                state: self.state.name(),
            });
        }
        Ok(())
    }

    fn fail_on_error<T>(
        &mut self,
        result: Result<T, HandshakeError>,
    ) -> Result<T, HandshakeError> {
        if let Err(e) = &result {
            // A stray message for another session must not kill this one
            if !matches!(e, HandshakeError::SessionMismatch) {
                self.fail(e.to_string());
            }
        }
        result
    }

    fn derive_keys(
        &mut self,
        peer_ephemeral: &[u8; 32],
        identity_share: &[u8; 32],
    ) -> Result<(), HandshakeError> {
        let ephemeral_share = self.ephemeral.agree(peer_ephemeral);
        let static_share = self.ephemeral.agree(self.peer_key.as_bytes());

        // Input keying material is ee || e(initiator)s(responder) || s(initiator)e(responder)
        let mut ikm = [0u8; 96];
        ikm[..32].copy_from_slice(ephemeral_share.as_slice());
        match self.role {
            Role::Initiator => {
                ikm[32..64].copy_from_slice(static_share.as_slice());
                ikm[64..].copy_from_slice(identity_share);
            }
            Role::Responder => {
                ikm[32..64].copy_from_slice(identity_share);
                ikm[64..].copy_from_slice(static_share.as_slice());
            }
        }
        let low_order = ikm.chunks(32).any(|share| share == [0u8; 32]);
        if low_order {
            ikm.zeroize();
            return Err(HandshakeError::InvalidPeerKey);
        }

        // Info binds both ephemeral keys in initiator-then-responder order
        let (initiator_pub, responder_pub) = match self.role {
            Role::Initiator => (self.ephemeral_public, *peer_ephemeral),
            Role::Responder => (*peer_ephemeral, self.ephemeral_public),
        };
        let mut info = Vec::with_capacity(64 + 16);
        info.extend_from_slice(&initiator_pub);
        info.extend_from_slice(&responder_pub);
        info.extend_from_slice(self.id.as_bytes());

        let hkdf = Hkdf::<Sha256>::new(Some(HKDF_SALT), &ikm);
        ikm.zeroize();

        let mut session_key = [0u8; SESSION_KEY_SIZE];
        let mut mac_key = [0u8; SESSION_KEY_SIZE];
        let mut session_info = info.clone();
        session_info.extend_from_slice(b"session");
        info.extend_from_slice(b"mac");
        hkdf.expand(&session_info, &mut session_key)
            .map_err(|e| HandshakeError::KeyDerivation(e.to_string()))?;
        hkdf.expand(&info, &mut mac_key)
            .map_err(|e| HandshakeError::KeyDerivation(e.to_string()))?;

        self.session_key = Some(SessionKey(session_key));
        self.mac_key = Some(SessionKey(mac_key));
        session_key.zeroize();
        mac_key.zeroize();
        Ok(())
    }

    fn mac(&self, label: &[u8], challenge: &[u8; 32]) -> Result<[u8; 32], HandshakeError> {
        let key = self
            .mac_key
            .as_ref()
            .ok_or(HandshakeError::UnexpectedMessage {
                state: self.state.name(),
            })?;
        let mut hasher = blake3::Hasher::new_keyed(key.as_bytes());
        hasher.update(label);
        hasher.update(challenge);
        Ok(*hasher.finalize().as_bytes())
    }

    fn verify(
        &self,
        label: &[u8],
        challenge: &[u8; 32],
        answer: &[u8; 32],
    ) -> Result<(), HandshakeError> {
        let expected = blake3::Hash::from(self.mac(label, challenge)?);
        // blake3::Hash equality is constant time
        if expected == blake3::Hash::from(*answer) {
            Ok(())
        } else {
            Err(HandshakeError::ChallengeFailed)
        }
    }
}

/// Arena of in-flight handshakes, at most one per (peer, role).
#[derive(Debug, Default)]
pub struct HandshakeTable {
    sessions: HashMap<(DeviceId, Role), HandshakeSession>,
}

impl HandshakeTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new session.
    ///
    /// Rejected if a non-terminal session for the same peer and role exists.
    /// Terminal leftovers are replaced.
    pub fn insert(&mut self, session: HandshakeSession) -> Result<(), HandshakeError> {
        let key = (session.peer(), session.role());
        if let Some(existing) = self.sessions.get(&key) {
            if !existing.state().is_terminal() {
                return Err(HandshakeError::AlreadyActive {
                    peer: key.0,
                    role: key.1,
                });
            }
        }
        self.sessions.insert(key, session);
        Ok(())
    }

    /// Whether a non-terminal session exists for this peer and role.
    pub fn is_active(&self, peer: &DeviceId, role: Role) -> bool {
        self.sessions
            .get(&(*peer, role))
            .map(|s| !s.state().is_terminal())
            .unwrap_or(false)
    }

    /// Look up a session.
    pub fn get(&self, peer: &DeviceId, role: Role) -> Option<&HandshakeSession> {
        self.sessions.get(&(*peer, role))
    }

    /// Look up a session mutably.
    pub fn get_mut(&mut self, peer: &DeviceId, role: Role) -> Option<&mut HandshakeSession> {
        self.sessions.get_mut(&(*peer, role))
    }

    /// Find the session for a peer by session id, whatever its role.
    pub fn find_mut(
        &mut self,
        peer: &DeviceId,
        session_id: SessionId,
    ) -> Option<&mut HandshakeSession> {
        self.sessions
            .values_mut()
            .find(|s| s.peer() == *peer && s.id() == session_id)
    }

    /// Remove and return a session.
    pub fn remove(&mut self, peer: &DeviceId, role: Role) -> Option<HandshakeSession> {
        self.sessions.remove(&(*peer, role))
    }

    /// Fail and remove every session whose deadline has passed.
    ///
    /// Returns the expired `(session id, peer, role)` triples.
    pub fn expire(&mut self, now: Instant) -> Vec<(SessionId, DeviceId, Role)> {
        let expired: Vec<(DeviceId, Role)> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.is_expired(now))
            .map(|(k, _)| *k)
            .collect();

        expired
            .into_iter()
            .filter_map(|key| {
                self.sessions.remove(&key).map(|mut s| {
                    s.fail("deadline exceeded");
                    (s.id(), key.0, key.1)
                })
            })
            .collect()
    }

    /// Number of sessions in the table, terminal or not.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

fn random_32() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    getrandom::getrandom(&mut bytes).expect("getrandom failed");
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A long-lived key pair as the key store would hold it.
    struct Identity {
        secret: [u8; 32],
        key: PublicKey,
    }

    impl Identity {
        fn new(byte: u8) -> Self {
            let secret = [byte; 32];
            let point = MontgomeryPoint::mul_base(&Scalar::from_bytes_mod_order(secret));
            Self {
                secret,
                key: PublicKey::from_bytes(point.to_bytes()),
            }
        }

        fn fp(&self) -> Fingerprint {
            self.key.fingerprint()
        }

        fn share(&self, peer_ephemeral: &[u8; 32]) -> [u8; 32] {
            diffie_hellman(&self.secret, peer_ephemeral)
        }
    }

    struct Pair {
        initiator: HandshakeSession,
        responder: HandshakeSession,
    }

    fn start(
        a: &Identity,
        b: &Identity,
        timeout: Duration,
        now: Instant,
    ) -> (HandshakeSession, HandshakeSession, HandshakeChallenge) {
        let (initiator, init) =
            HandshakeSession::initiate(DeviceId::random(), a.fp(), b.key, timeout, now);
        let (responder, challenge) = HandshakeSession::respond(
            DeviceId::random(),
            b.fp(),
            &init,
            a.key,
            &b.share(&init.ephemeral_public),
            timeout,
            now,
        )
        .unwrap();
        (initiator, responder, challenge)
    }

    fn complete_pair(now: Instant) -> Pair {
        let (a, b) = (Identity::new(1), Identity::new(2));
        let (mut initiator, mut responder, challenge) =
            start(&a, &b, DEFAULT_HANDSHAKE_TIMEOUT, now);
        let response = initiator
            .on_challenge(&challenge, &a.share(&challenge.ephemeral_public), now)
            .unwrap();
        let confirm = responder.on_response(&response, now).unwrap();
        initiator.on_confirm(&confirm, now).unwrap();

        Pair {
            initiator,
            responder,
        }
    }

    // ===========================================
    // Happy Path
    // ===========================================

    #[test]
    fn completed_handshake_yields_identical_keys() {
        let pair = complete_pair(Instant::now());

        assert_eq!(pair.initiator.state(), &HandshakeState::Completed);
        assert_eq!(pair.responder.state(), &HandshakeState::Completed);
        assert_eq!(
            pair.initiator.session_key().unwrap(),
            pair.responder.session_key().unwrap()
        );
    }

    #[test]
    fn each_handshake_derives_a_fresh_key() {
        let now = Instant::now();
        let first = complete_pair(now);
        let second = complete_pair(now);
        assert_ne!(
            first.initiator.session_key().unwrap(),
            second.initiator.session_key().unwrap()
        );
    }

    #[test]
    fn states_progress_in_order() {
        let now = Instant::now();
        let (a, b) = (Identity::new(1), Identity::new(2));
        let (mut initiator, mut responder, challenge) =
            start(&a, &b, DEFAULT_HANDSHAKE_TIMEOUT, now);
        assert_eq!(initiator.state(), &HandshakeState::Initiated);
        assert!(initiator.session_key().is_none());
        assert_eq!(responder.state(), &HandshakeState::Challenged);

        let response = initiator
            .on_challenge(&challenge, &a.share(&challenge.ephemeral_public), now)
            .unwrap();
        assert_eq!(initiator.state(), &HandshakeState::Verified);
        assert!(initiator.session_key().is_none(), "key only after completion");

        responder.on_response(&response, now).unwrap();
        assert_eq!(responder.state(), &HandshakeState::Completed);
        assert_eq!(responder.peer_fingerprint(), Some(a.fp()));
        assert_eq!(responder.peer_key(), a.key);
    }

    // ===========================================
    // Failure Paths
    // ===========================================

    #[test]
    fn tampered_response_fails_session() {
        let now = Instant::now();
        let (a, b) = (Identity::new(1), Identity::new(2));
        let (mut initiator, mut responder, challenge) =
            start(&a, &b, DEFAULT_HANDSHAKE_TIMEOUT, now);
        let mut response = initiator
            .on_challenge(&challenge, &a.share(&challenge.ephemeral_public), now)
            .unwrap();
        response.response[0] ^= 0xFF;

        let result = responder.on_response(&response, now);
        assert_eq!(result, Err(HandshakeError::ChallengeFailed));
        assert!(matches!(responder.state(), HandshakeState::Failed { .. }));
        assert!(responder.session_key().is_none());
    }

    #[test]
    fn tampered_confirm_fails_initiator() {
        let now = Instant::now();
        let (a, b) = (Identity::new(1), Identity::new(2));
        let (mut initiator, mut responder, challenge) =
            start(&a, &b, DEFAULT_HANDSHAKE_TIMEOUT, now);
        let response = initiator
            .on_challenge(&challenge, &a.share(&challenge.ephemeral_public), now)
            .unwrap();
        let mut confirm = responder.on_response(&response, now).unwrap();
        confirm.counter_response[31] ^= 0x01;

        assert_eq!(
            initiator.on_confirm(&confirm, now),
            Err(HandshakeError::ChallengeFailed)
        );
        assert!(matches!(initiator.state(), HandshakeState::Failed { .. }));
    }

    #[test]
    fn initiator_without_the_identity_secret_is_refused() {
        let now = Instant::now();
        let (a, b) = (Identity::new(1), Identity::new(2));
        let mallory = Identity::new(3);

        // Claims to be a: right fingerprint, wrong secret
        let (mut spoof, init) = HandshakeSession::initiate(
            DeviceId::random(),
            a.fp(),
            b.key,
            DEFAULT_HANDSHAKE_TIMEOUT,
            now,
        );
        let (mut responder, challenge) = HandshakeSession::respond(
            DeviceId::random(),
            b.fp(),
            &init,
            a.key,
            &b.share(&init.ephemeral_public),
            DEFAULT_HANDSHAKE_TIMEOUT,
            now,
        )
        .unwrap();
        let response = spoof
            .on_challenge(&challenge, &mallory.share(&challenge.ephemeral_public), now)
            .unwrap();

        assert_eq!(
            responder.on_response(&response, now),
            Err(HandshakeError::ChallengeFailed)
        );
        assert!(responder.session_key().is_none());
    }

    #[test]
    fn responder_without_the_identity_secret_is_refused() {
        let now = Instant::now();
        let (a, b) = (Identity::new(1), Identity::new(2));
        let mallory = Identity::new(3);

        let (mut initiator, init) = HandshakeSession::initiate(
            DeviceId::random(),
            a.fp(),
            b.key,
            DEFAULT_HANDSHAKE_TIMEOUT,
            now,
        );
        let (mut spoof, challenge) = HandshakeSession::respond(
            DeviceId::random(),
            b.fp(),
            &init,
            a.key,
            &mallory.share(&init.ephemeral_public),
            DEFAULT_HANDSHAKE_TIMEOUT,
            now,
        )
        .unwrap();
        let response = initiator
            .on_challenge(&challenge, &a.share(&challenge.ephemeral_public), now)
            .unwrap();

        // The spoofed responder cannot verify the real initiator either
        assert_eq!(
            spoof.on_response(&response, now),
            Err(HandshakeError::ChallengeFailed)
        );
        assert!(initiator.session_key().is_none());
    }

    #[test]
    fn responder_rejects_unexpected_fingerprint() {
        let now = Instant::now();
        let (a, b) = (Identity::new(1), Identity::new(2));
        let (_, init) = HandshakeSession::initiate(
            DeviceId::random(),
            a.fp(),
            b.key,
            DEFAULT_HANDSHAKE_TIMEOUT,
            now,
        );
        let result = HandshakeSession::respond(
            DeviceId::random(),
            b.fp(),
            &init,
            Identity::new(9).key,
            &b.share(&init.ephemeral_public),
            DEFAULT_HANDSHAKE_TIMEOUT,
            now,
        );
        assert!(matches!(result, Err(HandshakeError::FingerprintMismatch)));
    }

    #[test]
    fn initiator_rejects_unexpected_fingerprint() {
        let now = Instant::now();
        let (a, b) = (Identity::new(1), Identity::new(2));
        let (mut initiator, _, mut challenge) = start(&a, &b, DEFAULT_HANDSHAKE_TIMEOUT, now);
        challenge.fingerprint = Identity::new(9).fp();

        assert_eq!(
            initiator.on_challenge(&challenge, &a.share(&challenge.ephemeral_public), now),
            Err(HandshakeError::FingerprintMismatch)
        );
        assert!(matches!(initiator.state(), HandshakeState::Failed { .. }));
    }

    #[test]
    fn low_order_peer_key_is_rejected() {
        let now = Instant::now();
        let (a, b) = (Identity::new(1), Identity::new(2));
        let init = HandshakeInit {
            session_id: SessionId::new(),
            ephemeral_public: [0u8; 32],
            fingerprint: a.fp(),
        };
        let result = HandshakeSession::respond(
            DeviceId::random(),
            b.fp(),
            &init,
            a.key,
            &b.share(&init.ephemeral_public),
            DEFAULT_HANDSHAKE_TIMEOUT,
            now,
        );
        assert!(matches!(result, Err(HandshakeError::InvalidPeerKey)));
    }

    #[test]
    fn expired_session_fails_on_next_message() {
        let now = Instant::now();
        let (a, b) = (Identity::new(1), Identity::new(2));
        let (mut initiator, _, challenge) = start(&a, &b, Duration::from_secs(5), now);

        let later = now + Duration::from_secs(6);
        assert!(initiator.is_expired(later));
        assert_eq!(
            initiator.on_challenge(&challenge, &a.share(&challenge.ephemeral_public), later),
            Err(HandshakeError::Expired)
        );
        assert!(!initiator.is_expired(later), "failed sessions are terminal");
    }

    #[test]
    fn out_of_order_message_fails() {
        let now = Instant::now();
        let b = Identity::new(2);
        let (mut initiator, _) = HandshakeSession::initiate(
            DeviceId::random(),
            Identity::new(1).fp(),
            b.key,
            DEFAULT_HANDSHAKE_TIMEOUT,
            now,
        );
        let confirm = HandshakeConfirm {
            session_id: initiator.id(),
            counter_response: [0u8; 32],
        };
        assert!(matches!(
            initiator.on_confirm(&confirm, now),
            Err(HandshakeError::UnexpectedMessage { state: "initiated" })
        ));
    }

    #[test]
    fn mismatched_session_id_does_not_kill_session() {
        let now = Instant::now();
        let b = Identity::new(2);
        let (mut initiator, _) = HandshakeSession::initiate(
            DeviceId::random(),
            Identity::new(1).fp(),
            b.key,
            DEFAULT_HANDSHAKE_TIMEOUT,
            now,
        );
        let stray = HandshakeConfirm {
            session_id: SessionId::new(),
            counter_response: [0u8; 32],
        };
        assert_eq!(
            initiator.on_confirm(&stray, now),
            Err(HandshakeError::SessionMismatch)
        );
        assert_eq!(initiator.state(), &HandshakeState::Initiated);
    }

    #[test]
    fn session_key_debug_is_redacted() {
        let pair = complete_pair(Instant::now());
        let debug = format!("{:?}", pair.initiator.session_key().unwrap());
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn error_classes() {
        assert_eq!(HandshakeError::ChallengeFailed.class(), ErrorClass::Crypto);
        assert_eq!(HandshakeError::FingerprintMismatch.class(), ErrorClass::Trust);
        assert_eq!(
            HandshakeError::UnknownPeerKey(DeviceId::random()).class(),
            ErrorClass::Trust
        );
        assert_eq!(HandshakeError::Expired.class(), ErrorClass::Network);
    }

    // ===========================================
    // Session Table
    // ===========================================

    fn outbound(peer: DeviceId, timeout: Duration, now: Instant) -> HandshakeSession {
        let (session, _) = HandshakeSession::initiate(
            peer,
            Identity::new(1).fp(),
            Identity::new(2).key,
            timeout,
            now,
        );
        session
    }

    #[test]
    fn table_rejects_second_active_session_per_peer_and_role() {
        let now = Instant::now();
        let peer = DeviceId::random();
        let mut table = HandshakeTable::new();

        table
            .insert(outbound(peer, DEFAULT_HANDSHAKE_TIMEOUT, now))
            .unwrap();
        assert!(matches!(
            table.insert(outbound(peer, DEFAULT_HANDSHAKE_TIMEOUT, now)),
            Err(HandshakeError::AlreadyActive { .. })
        ));
        assert!(table.is_active(&peer, Role::Initiator));
        assert!(!table.is_active(&peer, Role::Responder));
    }

    #[test]
    fn table_replaces_terminal_session() {
        let now = Instant::now();
        let peer = DeviceId::random();
        let mut table = HandshakeTable::new();

        let mut first = outbound(peer, DEFAULT_HANDSHAKE_TIMEOUT, now);
        first.fail("cancelled");
        table.insert(first).unwrap();

        let second = outbound(peer, DEFAULT_HANDSHAKE_TIMEOUT, now);
        let second_id = second.id();
        table.insert(second).unwrap();
        assert_eq!(table.get(&peer, Role::Initiator).unwrap().id(), second_id);
    }

    #[test]
    fn table_expires_overdue_sessions() {
        let now = Instant::now();
        let peer = DeviceId::random();
        let mut table = HandshakeTable::new();
        let session = outbound(peer, Duration::from_secs(10), now);
        let id = session.id();
        table.insert(session).unwrap();

        assert!(table.expire(now + Duration::from_secs(5)).is_empty());
        let expired = table.expire(now + Duration::from_secs(11));
        assert_eq!(expired, vec![(id, peer, Role::Initiator)]);
        assert!(table.is_empty());
    }
}
