//! Trust registry for vitalsync.
//!
//! Decides which peers may ever reach the handshake and transfer stages.
//! Every device goes through:
//!
//! 1. `request()` - policy checks, security score, `pending` record
//! 2. `approve()` / `reject()` - manual decision (or auto-approval)
//! 3. `revoke()` - irreversible for this trust instance
//!
//! A revoked device needs `forget()` followed by a fresh `request()` to be
//! trusted again. Time is passed in as unix seconds.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use vitalsync_types::{DeviceId, ErrorClass, PeerIdentity, Platform, PROTOCOL_VERSION};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Base security score before adjustments.
pub const BASE_SECURITY_SCORE: i32 = 50;

/// Trust errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrustError {
    /// Device is already trusted.
    #[error("device {0:?} is already trusted")]
    AlreadyTrusted(DeviceId),

    /// Device was revoked and must be forgotten first.
    #[error("device {0:?} is revoked")]
    Revoked(DeviceId),

    /// Trusted device limit reached.
    #[error("trusted device limit reached ({max})")]
    LimitReached {
        /// Configured maximum.
        max: usize,
    },

    /// Cross-platform trust is disabled.
    #[error("cross-platform trust disabled, peer platform {0:?}")]
    PlatformMismatch(Platform),

    /// Peer did not announce a public key.
    #[error("peer has no verifiable public key")]
    MissingPublicKey,

    /// No record for this device.
    #[error("no trust record for {0:?}")]
    NotFound(DeviceId),

    /// Operation needs a pending record.
    #[error("device {0:?} has no pending request")]
    NotPending(DeviceId),

    /// Operation needs a trusted record.
    #[error("device {0:?} is not trusted")]
    NotTrusted(DeviceId),

    /// Pending request outlived its TTL.
    #[error("trust request for {0:?} expired")]
    RequestExpired(DeviceId),
}

impl TrustError {
    /// Classification for retry decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            TrustError::LimitReached { .. } | TrustError::PlatformMismatch(_) => {
                ErrorClass::Permission
            }
            _ => ErrorClass::Trust,
        }
    }
}

/// Trust state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustState {
    /// Waiting for approval.
    Pending,
    /// Allowed to handshake and sync.
    Trusted,
    /// Trust withdrawn.
    Revoked,
}

/// Why trust was withdrawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
    /// The user revoked the device.
    UserRequested,
    /// Device reported lost or compromised.
    Compromised,
    /// Trust outlived the maximum age.
    Expired,
    /// Record failed a policy check.
    PolicyViolation,
    /// The peer revoked us.
    PeerRevoked,
}

impl std::fmt::Display for RevocationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RevocationReason::UserRequested => "user requested",
            RevocationReason::Compromised => "compromised",
            RevocationReason::Expired => "expired",
            RevocationReason::PolicyViolation => "policy violation",
            RevocationReason::PeerRevoked => "revoked by peer",
        };
        write!(f, "{}", s)
    }
}

/// Secret shared with a trusted peer.
///
/// Zeroized when revoked and when dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

// Intentionally opaque debug to avoid logging secrets
impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedSecret([REDACTED])")
    }
}

/// Trust record for one device.
///
/// The shared secret is never serialized; it lives in the key store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustRecord {
    /// The peer as last announced.
    pub peer: PeerIdentity,
    /// Current state.
    pub state: TrustState,
    /// Present only while trusted.
    #[serde(skip)]
    pub shared_secret: Option<SharedSecret>,
    /// When the request was made.
    pub requested_at: u64,
    /// When trust was granted.
    pub trusted_at: Option<u64>,
    /// When trust was revoked.
    pub revoked_at: Option<u64>,
    /// Why trust was revoked.
    pub revocation_reason: Option<RevocationReason>,
    /// Security score at request time, 0..=100.
    pub security_score: u8,
    /// Bumped on every transition.
    pub sync_version: u64,
    /// Last successful sync with this peer.
    pub last_sync: Option<u64>,
}

impl TrustRecord {
    /// Device id of the peer.
    pub fn device_id(&self) -> DeviceId {
        self.peer.device_id
    }

    /// Copy without the shared secret, for handing to other components.
    pub fn snapshot(&self) -> TrustRecord {
        TrustRecord {
            shared_secret: None,
            ..self.clone()
        }
    }
}

/// Tunable policy for trust decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustPolicy {
    /// Maximum number of simultaneously trusted devices.
    pub max_trusted_devices: usize,
    /// Whether peers on other platforms may be trusted.
    pub allow_cross_platform: bool,
    /// Whether every request waits for a manual decision.
    pub require_manual_approval: bool,
    /// Minimum score for auto-approval.
    pub auto_approve_threshold: u8,
    /// Lifetime of a pending request.
    pub request_ttl_secs: u64,
    /// Lifetime of a trust grant.
    pub max_trust_age_secs: u64,
}

impl Default for TrustPolicy {
    fn default() -> Self {
        Self {
            max_trusted_devices: 10,
            allow_cross_platform: true,
            require_manual_approval: true,
            auto_approve_threshold: 80,
            request_ttl_secs: 300,
            max_trust_age_secs: 90 * 24 * 3600,
        }
    }
}

/// Score a peer's announced identity, bounded to 0..=100.
pub fn security_score(peer: &PeerIdentity) -> u8 {
    let mut score = BASE_SECURITY_SCORE;
    if peer.public_key.is_some() {
        score += 20;
    }
    if peer.protocol_version >= PROTOCOL_VERSION {
        score += 15;
    } else {
        score -= 20;
    }
    if peer.platform.is_known() {
        score += 10;
    } else {
        score -= 10;
    }
    score.clamp(0, 100) as u8
}

/// Result of a trust request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Waiting for a manual decision.
    Pending {
        /// Computed score.
        score: u8,
    },
    /// Score cleared the threshold and manual approval is off.
    AutoApproved {
        /// Computed score.
        score: u8,
    },
}

/// Devices touched by a sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Pending requests discarded for age.
    pub expired_requests: Vec<DeviceId>,
    /// Trust grants revoked for age.
    pub expired_trust: Vec<DeviceId>,
    /// Records revoked as malformed.
    pub policy_violations: Vec<DeviceId>,
}

impl SweepReport {
    /// Whether the sweep changed anything.
    pub fn is_empty(&self) -> bool {
        self.expired_requests.is_empty()
            && self.expired_trust.is_empty()
            && self.policy_violations.is_empty()
    }
}

/// Counts per trust state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistryStats {
    /// Pending requests.
    pub pending: usize,
    /// Trusted devices.
    pub trusted: usize,
    /// Revoked devices still remembered.
    pub revoked: usize,
    /// Mean security score over all records.
    pub average_score: f32,
}

/// Owner of every trust record.
#[derive(Debug, Default)]
pub struct TrustRegistry {
    records: HashMap<DeviceId, TrustRecord>,
    policy: TrustPolicy,
    version: u64,
}

impl TrustRegistry {
    /// Create an empty registry.
    pub fn new(policy: TrustPolicy) -> Self {
        Self {
            records: HashMap::new(),
            policy,
            version: 0,
        }
    }

    /// Rebuild from persisted records.
    ///
    /// Secrets are not persisted and must be reattached from the key store.
    pub fn restore(policy: TrustPolicy, records: Vec<TrustRecord>) -> Self {
        let version = records.iter().map(|r| r.sync_version).max().unwrap_or(0);
        let records = records
            .into_iter()
            .map(|r| (r.device_id(), r))
            .collect();
        Self {
            records,
            policy,
            version,
        }
    }

    /// Active policy.
    pub fn policy(&self) -> &TrustPolicy {
        &self.policy
    }

    /// Ask to trust a peer.
    pub fn request(
        &mut self,
        peer: PeerIdentity,
        now: u64,
    ) -> Result<RequestOutcome, TrustError> {
        let id = peer.device_id;
        match self.records.get(&id).map(|r| r.state) {
            Some(TrustState::Trusted) => return Err(TrustError::AlreadyTrusted(id)),
            Some(TrustState::Revoked) => return Err(TrustError::Revoked(id)),
            Some(TrustState::Pending) | None => {}
        }

        if self.trusted_count() >= self.policy.max_trusted_devices {
            return Err(TrustError::LimitReached {
                max: self.policy.max_trusted_devices,
            });
        }
        if !self.policy.allow_cross_platform
            && self
                .records
                .values()
                .any(|r| r.state == TrustState::Trusted && r.peer.platform != peer.platform)
        {
            return Err(TrustError::PlatformMismatch(peer.platform));
        }
        if peer.public_key.is_none() {
            return Err(TrustError::MissingPublicKey);
        }

        let score = security_score(&peer);
        let version = self.next_version();
        self.records.insert(
            id,
            TrustRecord {
                peer,
                state: TrustState::Pending,
                shared_secret: None,
                requested_at: now,
                trusted_at: None,
                revoked_at: None,
                revocation_reason: None,
                security_score: score,
                sync_version: version,
                last_sync: None,
            },
        );

        if !self.policy.require_manual_approval && score >= self.policy.auto_approve_threshold {
            self.approve(&id, now)?;
            Ok(RequestOutcome::AutoApproved { score })
        } else {
            Ok(RequestOutcome::Pending { score })
        }
    }

    /// Move a pending request to trusted.
    pub fn approve(&mut self, id: &DeviceId, now: u64) -> Result<&TrustRecord, TrustError> {
        let requested_at = match self.records.get(id) {
            None => return Err(TrustError::NotFound(*id)),
            Some(r) if r.state != TrustState::Pending => return Err(TrustError::NotPending(*id)),
            Some(r) => r.requested_at,
        };
        if now.saturating_sub(requested_at) > self.policy.request_ttl_secs {
            self.records.remove(id);
            return Err(TrustError::RequestExpired(*id));
        }
        if self.trusted_count() >= self.policy.max_trusted_devices {
            return Err(TrustError::LimitReached {
                max: self.policy.max_trusted_devices,
            });
        }

        let version = self.next_version();
        let record = self
            .records
            .get_mut(id)
            .ok_or(TrustError::NotFound(*id))?;
        record.state = TrustState::Trusted;
        record.trusted_at = Some(now);
        record.sync_version = version;
        Ok(record)
    }

    /// Attach the secret negotiated with a trusted peer.
    pub fn set_shared_secret(
        &mut self,
        id: &DeviceId,
        secret: SharedSecret,
    ) -> Result<(), TrustError> {
        let version = self.version + 1;
        let record = self.records.get_mut(id).ok_or(TrustError::NotFound(*id))?;
        if record.state != TrustState::Trusted {
            return Err(TrustError::NotTrusted(*id));
        }
        record.shared_secret = Some(secret);
        record.sync_version = version;
        self.version = version;
        Ok(())
    }

    /// Discard a pending request.
    pub fn reject(&mut self, id: &DeviceId) -> Result<TrustRecord, TrustError> {
        match self.records.get(id).map(|r| r.state) {
            None => Err(TrustError::NotFound(*id)),
            Some(TrustState::Pending) => self
                .records
                .remove(id)
                .ok_or(TrustError::NotFound(*id)),
            Some(_) => Err(TrustError::NotPending(*id)),
        }
    }

    /// Withdraw trust.
    ///
    /// Zeroizes the secret. Revoking twice is an error so callers never
    /// send a second revocation notice.
    pub fn revoke(
        &mut self,
        id: &DeviceId,
        reason: RevocationReason,
        now: u64,
    ) -> Result<TrustRecord, TrustError> {
        let version = self.version + 1;
        let record = self.records.get_mut(id).ok_or(TrustError::NotFound(*id))?;
        if record.state == TrustState::Revoked {
            return Err(TrustError::Revoked(*id));
        }
        if let Some(mut secret) = record.shared_secret.take() {
            secret.zeroize();
        }
        record.state = TrustState::Revoked;
        record.revoked_at = Some(now);
        record.revocation_reason = Some(reason);
        record.sync_version = version;
        self.version = version;
        Ok(record.snapshot())
    }

    /// Drop every trace of a device so it can re-enroll.
    pub fn forget(&mut self, id: &DeviceId) -> Option<TrustRecord> {
        self.records.remove(id).map(|r| r.snapshot())
    }

    /// Expire old requests and grants and revoke malformed records.
    pub fn sweep(&mut self, now: u64) -> SweepReport {
        let mut report = SweepReport::default();
        let ttl = self.policy.request_ttl_secs;
        let max_age = self.policy.max_trust_age_secs;

        let mut to_revoke = Vec::new();
        for record in self.records.values() {
            let id = record.device_id();
            match record.state {
                TrustState::Pending if now.saturating_sub(record.requested_at) > ttl => {
                    report.expired_requests.push(id);
                }
                TrustState::Trusted if !record.peer.is_well_formed() => {
                    to_revoke.push((id, RevocationReason::PolicyViolation));
                }
                TrustState::Trusted
                    if record
                        .trusted_at
                        .map(|at| now.saturating_sub(at) > max_age)
                        .unwrap_or(false) =>
                {
                    to_revoke.push((id, RevocationReason::Expired));
                }
                _ => {}
            }
        }

        for id in &report.expired_requests {
            self.records.remove(id);
        }
        for (id, reason) in to_revoke {
            if self.revoke(&id, reason, now).is_ok() {
                match reason {
                    RevocationReason::PolicyViolation => report.policy_violations.push(id),
                    _ => report.expired_trust.push(id),
                }
            }
        }
        report
    }

    /// Refresh the stored identity after a re-announcement.
    ///
    /// Returns `Some(reason)` when the refresh caused a revocation: a
    /// trusted peer that starts announcing a different key is revoked.
    pub fn observe(&mut self, peer: &PeerIdentity, now: u64) -> Option<RevocationReason> {
        let id = peer.device_id;
        let (state, key_changed) = self
            .records
            .get(&id)
            .map(|r| (r.state, r.peer.public_key != peer.public_key))?;
        match state {
            TrustState::Revoked => return None,
            TrustState::Trusted if key_changed => {
                return self
                    .revoke(&id, RevocationReason::PolicyViolation, now)
                    .ok()
                    .map(|_| RevocationReason::PolicyViolation);
            }
            _ => {}
        }

        let record = self.records.get_mut(&id)?;
        record.peer.display_name = peer.display_name.clone();
        record.peer.protocol_version = peer.protocol_version;
        record.peer.last_seen = peer.last_seen;
        None
    }

    /// Note a successful sync.
    pub fn record_sync(&mut self, id: &DeviceId, now: u64) -> Result<(), TrustError> {
        let record = self.records.get_mut(id).ok_or(TrustError::NotFound(*id))?;
        if record.state != TrustState::Trusted {
            return Err(TrustError::NotTrusted(*id));
        }
        record.last_sync = Some(now);
        Ok(())
    }

    /// Whether a device may handshake and sync.
    pub fn is_trusted(&self, id: &DeviceId) -> bool {
        self.records
            .get(id)
            .map(|r| r.state == TrustState::Trusted)
            .unwrap_or(false)
    }

    /// Look up a record.
    pub fn get(&self, id: &DeviceId) -> Option<&TrustRecord> {
        self.records.get(id)
    }

    /// Secret for a trusted device.
    pub fn shared_secret(&self, id: &DeviceId) -> Option<&SharedSecret> {
        self.records
            .get(id)
            .filter(|r| r.state == TrustState::Trusted)
            .and_then(|r| r.shared_secret.as_ref())
    }

    /// Snapshots of all trusted devices.
    pub fn trusted(&self) -> Vec<TrustRecord> {
        self.snapshots(TrustState::Trusted)
    }

    /// Snapshots of all pending requests, oldest first.
    pub fn pending(&self) -> Vec<TrustRecord> {
        let mut pending = self.snapshots(TrustState::Pending);
        pending.sort_by_key(|r| r.requested_at);
        pending
    }

    /// Snapshots of every record, for persistence.
    pub fn records(&self) -> Vec<TrustRecord> {
        self.records.values().map(TrustRecord::snapshot).collect()
    }

    /// Counts per state.
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        let mut total_score = 0u32;
        for record in self.records.values() {
            match record.state {
                TrustState::Pending => stats.pending += 1,
                TrustState::Trusted => stats.trusted += 1,
                TrustState::Revoked => stats.revoked += 1,
            }
            total_score += u32::from(record.security_score);
        }
        if !self.records.is_empty() {
            stats.average_score = total_score as f32 / self.records.len() as f32;
        }
        stats
    }

    /// Highest sync version issued so far.
    pub fn sync_version(&self) -> u64 {
        self.version
    }

    fn trusted_count(&self) -> usize {
        self.records
            .values()
            .filter(|r| r.state == TrustState::Trusted)
            .count()
    }

    fn snapshots(&self, state: TrustState) -> Vec<TrustRecord> {
        self.records
            .values()
            .filter(|r| r.state == state)
            .map(TrustRecord::snapshot)
            .collect()
    }

    fn next_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }
}
