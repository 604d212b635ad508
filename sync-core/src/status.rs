//! Derived sync status: per-device state, progress, notifications and
//! consistency checks.
//!
//! These are pure aggregations. The status monitor in `vitalsync-peer`
//! feeds them from events; nothing here reaches back into the queue or
//! the trust registry.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use vitalsync_types::{DeviceId, OperationId};

use crate::queue::SyncOperation;

/// Sync state of one peer, as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceSyncState {
    /// Not reachable.
    Offline,
    /// Work queued, nothing running.
    Pending,
    /// Work running.
    Syncing,
    /// Up to date.
    Synced,
    /// Last operation failed terminally.
    Error,
}

/// Per-device counters behind a [`DeviceSyncState`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Whether the peer is currently reachable.
    pub online: bool,
    /// Queued operations.
    pub pending: usize,
    /// Running operations.
    pub in_flight: usize,
    /// Last successful operation (unix seconds).
    pub last_sync: Option<u64>,
    /// Last terminal error.
    pub last_error: Option<String>,
}

impl DeviceStatus {
    /// Collapse the counters into one state.
    pub fn state(&self) -> DeviceSyncState {
        if !self.online {
            DeviceSyncState::Offline
        } else if self.in_flight > 0 {
            DeviceSyncState::Syncing
        } else if self.last_error.is_some() {
            DeviceSyncState::Error
        } else if self.pending > 0 {
            DeviceSyncState::Pending
        } else {
            DeviceSyncState::Synced
        }
    }
}

/// Tracks [`DeviceStatus`] for every known peer.
#[derive(Debug, Default)]
pub struct DeviceStatusBoard {
    devices: HashMap<DeviceId, DeviceStatus>,
}

impl DeviceStatusBoard {
    /// Create an empty board.
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, peer: DeviceId) -> &mut DeviceStatus {
        self.devices.entry(peer).or_default()
    }

    /// Peer became reachable.
    pub fn peer_online(&mut self, peer: DeviceId) {
        self.entry(peer).online = true;
    }

    /// Peer went away.
    pub fn peer_offline(&mut self, peer: DeviceId) {
        self.entry(peer).online = false;
    }

    /// Peer is no longer tracked.
    pub fn remove(&mut self, peer: &DeviceId) {
        self.devices.remove(peer);
    }

    /// Operation queued for a peer.
    pub fn operation_queued(&mut self, peer: DeviceId) {
        self.entry(peer).pending += 1;
    }

    /// Operation dispatched.
    pub fn operation_started(&mut self, peer: DeviceId) {
        let status = self.entry(peer);
        status.pending = status.pending.saturating_sub(1);
        status.in_flight += 1;
    }

    /// Operation returned to the queue (retry or requeue).
    pub fn operation_requeued(&mut self, peer: DeviceId) {
        let status = self.entry(peer);
        status.in_flight = status.in_flight.saturating_sub(1);
        status.pending += 1;
    }

    /// Operation succeeded.
    pub fn operation_succeeded(&mut self, peer: DeviceId, now: u64) {
        let status = self.entry(peer);
        status.in_flight = status.in_flight.saturating_sub(1);
        status.last_sync = Some(now);
        status.last_error = None;
        status.online = true;
    }

    /// Operation failed terminally.
    pub fn operation_failed(&mut self, peer: DeviceId, error: impl Into<String>) {
        let status = self.entry(peer);
        status.in_flight = status.in_flight.saturating_sub(1);
        status.last_error = Some(error.into());
    }

    /// Operation failed terminally before it was dispatched.
    pub fn operation_rejected(&mut self, peer: DeviceId, error: impl Into<String>) {
        let status = self.entry(peer);
        status.pending = status.pending.saturating_sub(1);
        status.last_error = Some(error.into());
    }

    /// Status of one peer.
    pub fn get(&self, peer: &DeviceId) -> Option<&DeviceStatus> {
        self.devices.get(peer)
    }

    /// State of every tracked peer.
    pub fn states(&self) -> HashMap<DeviceId, DeviceSyncState> {
        self.devices.iter().map(|(id, s)| (*id, s.state())).collect()
    }

    /// Overwrite queue counters from a queue snapshot.
    ///
    /// `counts` maps a peer to its (pending, in flight) operations; peers
    /// missing from it have none.
    pub fn reconcile(&mut self, counts: &HashMap<DeviceId, (usize, usize)>) {
        for status in self.devices.values_mut() {
            status.pending = 0;
            status.in_flight = 0;
        }
        for (peer, &(pending, in_flight)) in counts {
            let status = self.entry(*peer);
            status.pending = pending;
            status.in_flight = in_flight;
        }
    }
}

/// Live progress of the current sync run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncProgress {
    /// Operations finished, successfully or not.
    pub completed_ops: u64,
    /// Operations known for this run.
    pub total_ops: u64,
    /// Payload bytes moved.
    pub bytes_transferred: u64,
    /// Run start (ms).
    pub started_at: Option<u64>,
    /// Last update (ms).
    pub updated_at: Option<u64>,
}

impl SyncProgress {
    /// A new operation joined the run.
    pub fn add_total(&mut self, n: u64, now: u64) {
        if self.started_at.is_none() || self.is_done() {
            // A finished run restarts when new work arrives
            *self = SyncProgress {
                started_at: Some(now),
                ..SyncProgress::default()
            };
        }
        self.total_ops += n;
        self.updated_at = Some(now);
    }

    /// An operation finished.
    pub fn complete_one(&mut self, now: u64) {
        self.completed_ops = (self.completed_ops + 1).min(self.total_ops.max(1));
        self.updated_at = Some(now);
    }

    /// Bytes moved.
    pub fn add_bytes(&mut self, n: u64, now: u64) {
        self.bytes_transferred += n;
        self.updated_at = Some(now);
    }

    /// Whether every known operation finished.
    pub fn is_done(&self) -> bool {
        self.total_ops > 0 && self.completed_ops >= self.total_ops
    }

    /// Completed share, 0.0..=1.0.
    pub fn fraction(&self) -> f64 {
        if self.total_ops == 0 {
            return 1.0;
        }
        self.completed_ops as f64 / self.total_ops as f64
    }

    /// Bytes per second since the run started.
    pub fn speed_bps(&self, now: u64) -> f64 {
        match self.started_at {
            Some(start) if now > start => {
                self.bytes_transferred as f64 * 1000.0 / (now - start) as f64
            }
            _ => 0.0,
        }
    }

    /// Estimated time to finish from the average time per operation.
    pub fn eta(&self, now: u64) -> Option<Duration> {
        let start = self.started_at?;
        if self.completed_ops == 0 || now <= start {
            return None;
        }
        let remaining = self.total_ops.saturating_sub(self.completed_ops);
        let per_op = (now - start) as f64 / self.completed_ops as f64;
        Some(Duration::from_millis((per_op * remaining as f64) as u64))
    }
}

/// Notification severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    /// Something finished; auto-hides.
    Success,
    /// Informational.
    Info,
    /// Degraded but recovering.
    Warning,
    /// Unrecoverable; stays until dismissed.
    Error,
}

/// A user-facing notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Id for dismissal.
    pub id: u64,
    /// Severity.
    pub level: NotificationLevel,
    /// Short title.
    pub title: String,
    /// Detail text. Never contains record contents.
    pub message: String,
    /// Creation time (ms).
    pub created_at: u64,
    /// Related operation, if any.
    pub operation: Option<OperationId>,
}

impl Notification {
    /// Errors stay until the user dismisses them.
    pub fn is_persistent(&self) -> bool {
        self.level == NotificationLevel::Error
    }
}

/// Bounded list of notifications.
#[derive(Debug)]
pub struct NotificationCenter {
    max: usize,
    success_ttl_ms: u64,
    items: VecDeque<Notification>,
    next_id: u64,
}

impl NotificationCenter {
    /// Keep at most `max` notifications, hiding successes after `success_ttl`.
    pub fn new(max: usize, success_ttl: Duration) -> Self {
        Self {
            max: max.max(1),
            success_ttl_ms: success_ttl.as_millis() as u64,
            items: VecDeque::new(),
            next_id: 1,
        }
    }

    /// Add a notification, evicting the oldest non-persistent one when full.
    pub fn push(
        &mut self,
        level: NotificationLevel,
        title: impl Into<String>,
        message: impl Into<String>,
        operation: Option<OperationId>,
        now: u64,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.items.push_back(Notification {
            id,
            level,
            title: title.into(),
            message: message.into(),
            created_at: now,
            operation,
        });

        while self.items.len() > self.max {
            let victim = self
                .items
                .iter()
                .position(|n| !n.is_persistent())
                .unwrap_or(0);
            self.items.remove(victim);
        }
        id
    }

    /// Hide successes older than the TTL. Returns how many were removed.
    pub fn expire(&mut self, now: u64) -> usize {
        let before = self.items.len();
        let ttl = self.success_ttl_ms;
        self.items.retain(|n| {
            n.level != NotificationLevel::Success || now.saturating_sub(n.created_at) < ttl
        });
        before - self.items.len()
    }

    /// Dismiss one notification.
    pub fn dismiss(&mut self, id: u64) -> bool {
        let before = self.items.len();
        self.items.retain(|n| n.id != id);
        before != self.items.len()
    }

    /// Dismiss everything.
    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Current notifications, oldest first.
    pub fn list(&self) -> Vec<Notification> {
        self.items.iter().cloned().collect()
    }

    /// Number of notifications.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Something the consistency check found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConsistencyIssue {
    /// Queued work targets a peer that is not trusted.
    UntrustedTarget {
        /// Operation.
        operation: OperationId,
        /// Peer.
        peer: DeviceId,
    },
    /// Operation has been in progress too long.
    Stalled {
        /// Operation.
        operation: OperationId,
        /// Enqueue time (ms).
        since: u64,
    },
    /// Terminal failures waiting for attention.
    FailedOperations {
        /// How many.
        count: usize,
    },
}

/// Result of a consistency check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    /// When the check ran (ms).
    pub checked_at: u64,
    /// Operations inspected.
    pub operations_checked: usize,
    /// Findings.
    pub issues: Vec<ConsistencyIssue>,
}

impl ConsistencyReport {
    /// Whether nothing was found.
    pub fn is_consistent(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Compare the queue's view with the trust registry's view.
pub fn check_consistency(
    pending: &[SyncOperation],
    in_progress: &[SyncOperation],
    failed_count: usize,
    trusted: &HashSet<DeviceId>,
    stall_after: Duration,
    now: u64,
) -> ConsistencyReport {
    let mut issues = Vec::new();
    for op in pending.iter().chain(in_progress) {
        if !trusted.contains(&op.peer) {
            issues.push(ConsistencyIssue::UntrustedTarget {
                operation: op.id,
                peer: op.peer,
            });
        }
    }
    let stall_ms = stall_after.as_millis() as u64;
    for op in in_progress {
        if now.saturating_sub(op.not_before) > stall_ms {
            issues.push(ConsistencyIssue::Stalled {
                operation: op.id,
                since: op.enqueued_at,
            });
        }
    }
    if failed_count > 0 {
        issues.push(ConsistencyIssue::FailedOperations {
            count: failed_count,
        });
    }

    ConsistencyReport {
        checked_at: now,
        operations_checked: pending.len() + in_progress.len(),
        issues,
    }
}
