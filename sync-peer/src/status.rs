//! Status monitor.
//!
//! Folds engine events into per-device states, run progress and
//! notifications, and periodically cross-checks the queue against the
//! trust registry. It only reads other components.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};
use vitalsync_core::{
    check_consistency, ConsistencyReport, DeviceStatus, DeviceStatusBoard, DeviceSyncState,
    LinkNotice, Notification, NotificationCenter, NotificationLevel, QueueStats, SyncProgress,
};
use vitalsync_types::{unix_now, DeviceId};

use crate::config::StatusConfig;
use crate::events::{DiscoveryEvent, EngineEvent, EventBus, SyncEvent, TrustEvent};
use crate::orchestrator::{SyncOrchestrator, BREAKER_OPEN};
use crate::trust::TrustManager;

/// Overall sync status.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncStatus {
    /// Progress of the current run.
    pub progress: SyncProgress,
    /// Bytes per second since the run started.
    pub speed_bps: f64,
    /// Estimated time to finish.
    pub eta: Option<Duration>,
    /// Queue counts.
    pub queue: QueueStats,
    /// Whether the network is up.
    pub online: bool,
    /// Latest consistency check.
    pub consistency: ConsistencyReport,
}

struct View {
    board: DeviceStatusBoard,
    progress: SyncProgress,
    notifications: NotificationCenter,
    consistency: ConsistencyReport,
}

/// Observes the engine and keeps user-facing views current.
pub struct StatusMonitor {
    view: Mutex<View>,
    orchestrator: Arc<SyncOrchestrator>,
    trust: Arc<TrustManager>,
    refresh_interval: Duration,
    stall_after: Duration,
}

impl StatusMonitor {
    /// Create a monitor reading from `orchestrator` and `trust`.
    pub fn new(
        config: &StatusConfig,
        orchestrator: Arc<SyncOrchestrator>,
        trust: Arc<TrustManager>,
    ) -> Self {
        Self {
            view: Mutex::new(View {
                board: DeviceStatusBoard::new(),
                progress: SyncProgress::default(),
                notifications: NotificationCenter::new(
                    config.max_notifications,
                    Duration::from_secs(config.success_autohide_secs),
                ),
                consistency: ConsistencyReport::default(),
            }),
            orchestrator,
            trust,
            refresh_interval: Duration::from_millis(config.refresh_interval_ms),
            stall_after: Duration::from_secs(config.stall_after_secs),
        }
    }

    /// Fold one event into the views.
    pub async fn apply(&self, event: &EngineEvent) {
        let now = self.orchestrator.now_ms();
        let mut view = self.view.lock().await;
        match event {
            EngineEvent::Discovery(event) => match event {
                DiscoveryEvent::DeviceDiscovered { identity, .. }
                | DiscoveryEvent::DeviceUpdated { identity, .. } => {
                    view.board.peer_online(identity.device_id);
                }
                DiscoveryEvent::DeviceLost { device_id } => view.board.peer_offline(*device_id),
                DiscoveryEvent::ChannelFailed { .. } => {}
            },
            EngineEvent::Link(LinkNotice::WentOffline { reason }) => {
                let peers: Vec<DeviceId> = view.board.states().into_keys().collect();
                for peer in peers {
                    view.board.peer_offline(peer);
                }
                view.notifications.push(
                    NotificationLevel::Warning,
                    "Offline",
                    format!("Sync paused: {}", reason),
                    None,
                    now,
                );
            }
            EngineEvent::Link(LinkNotice::CameOnline { .. }) => {
                view.notifications.push(
                    NotificationLevel::Info,
                    "Back online",
                    "Sync resumed",
                    None,
                    now,
                );
            }
            EngineEvent::Sync(event) => self.apply_sync(&mut view, event, now),
            EngineEvent::Trust(event) => match event {
                TrustEvent::ApprovalRequired { peer, .. } => {
                    view.notifications.push(
                        NotificationLevel::Info,
                        "Approval needed",
                        format!("{} wants to sync", peer.display_name),
                        None,
                        now,
                    );
                }
                TrustEvent::DeviceTrusted { device_id, .. } => {
                    view.board.peer_online(*device_id);
                }
                TrustEvent::DeviceRevoked { device_id, reason } => {
                    view.board.remove(device_id);
                    view.notifications.push(
                        NotificationLevel::Warning,
                        "Device removed",
                        format!("Trust revoked: {}", reason),
                        None,
                        now,
                    );
                }
                TrustEvent::RequestDiscarded { .. } => {}
            },
            EngineEvent::Handshake(_) => {}
        }
    }

    fn apply_sync(&self, view: &mut View, event: &SyncEvent, now: u64) {
        match event {
            SyncEvent::OperationQueued { peer, .. } => {
                view.board.operation_queued(*peer);
                view.progress.add_total(1, now);
            }
            SyncEvent::OperationStarted { peer, .. } => view.board.operation_started(*peer),
            SyncEvent::OperationCompleted { peer, bytes, .. } => {
                view.board.operation_succeeded(*peer, unix_now());
                view.progress.add_bytes(*bytes, now);
                view.progress.complete_one(now);
                if view.progress.is_done() {
                    let done = view.progress.completed_ops;
                    view.notifications.push(
                        NotificationLevel::Success,
                        "Sync complete",
                        format!("{} operations finished", done),
                        None,
                        now,
                    );
                }
            }
            SyncEvent::OperationRetrying { peer, .. } => view.board.operation_requeued(*peer),
            SyncEvent::OperationDeferred { peer, .. } => view.board.operation_requeued(*peer),
            SyncEvent::OperationFailed {
                id,
                peer,
                kind,
                error,
                ..
            } => {
                // Breaker rejections happen before dispatch
                if error == BREAKER_OPEN {
                    view.board.operation_rejected(*peer, error.clone());
                } else {
                    view.board.operation_failed(*peer, error.clone());
                }
                view.progress.complete_one(now);
                view.notifications.push(
                    NotificationLevel::Error,
                    "Sync failed",
                    format!("{} to {:?} failed: {}", kind, peer, error),
                    Some(*id),
                    now,
                );
            }
            SyncEvent::BreakerOpened { peer, kind } => {
                view.notifications.push(
                    NotificationLevel::Warning,
                    "Device unreachable",
                    format!("Pausing {} to {:?} after repeated failures", kind, peer),
                    None,
                    now,
                );
            }
            SyncEvent::ConflictDeferred { record_id, .. } => {
                view.notifications.push(
                    NotificationLevel::Warning,
                    "Conflict needs review",
                    format!("Record {} was edited on both devices", record_id),
                    None,
                    now,
                );
            }
            SyncEvent::ConflictResolved { by_user: true, record_id } => {
                view.notifications.push(
                    NotificationLevel::Success,
                    "Conflict resolved",
                    format!("Record {} updated", record_id),
                    None,
                    now,
                );
            }
            SyncEvent::ConflictResolved { by_user: false, .. }
            | SyncEvent::Requeued { .. }
            | SyncEvent::Progress { .. } => {}
        }
    }

    /// Recompute derived views from component snapshots.
    ///
    /// Expires old successes, resyncs device counters with the queue and
    /// runs the consistency check.
    pub async fn refresh(&self) -> ConsistencyReport {
        let now = self.orchestrator.now_ms();
        let pending = self.orchestrator.pending_operations().await;
        let in_progress = self.orchestrator.in_progress_operations().await;
        let failed = self.orchestrator.failed_operations().await.len();
        let trusted: HashSet<DeviceId> = self
            .trust
            .trusted_devices()
            .await
            .iter()
            .map(|r| r.device_id())
            .collect();

        let mut counts: HashMap<DeviceId, (usize, usize)> = HashMap::new();
        for op in &pending {
            counts.entry(op.peer).or_default().0 += 1;
        }
        for op in &in_progress {
            counts.entry(op.peer).or_default().1 += 1;
        }

        let report = check_consistency(
            &pending,
            &in_progress,
            failed,
            &trusted,
            self.stall_after,
            now,
        );
        if !report.is_consistent() {
            debug!(issues = report.issues.len(), "Consistency check found issues");
        }

        let mut view = self.view.lock().await;
        view.notifications.expire(now);
        view.board.reconcile(&counts);
        view.consistency = report.clone();
        report
    }

    /// Overall status.
    pub async fn sync_status(&self) -> SyncStatus {
        let now = self.orchestrator.now_ms();
        let stats = self.orchestrator.stats().await;
        let view = self.view.lock().await;
        SyncStatus {
            progress: view.progress.clone(),
            speed_bps: view.progress.speed_bps(now),
            eta: view.progress.eta(now),
            queue: stats.queue,
            online: stats.online,
            consistency: view.consistency.clone(),
        }
    }

    /// State of every tracked device.
    pub async fn device_states(&self) -> HashMap<DeviceId, DeviceSyncState> {
        self.view.lock().await.board.states()
    }

    /// Detailed status of one device.
    pub async fn device_status(&self, peer: &DeviceId) -> Option<DeviceStatus> {
        self.view.lock().await.board.get(peer).cloned()
    }

    /// Current notifications, oldest first.
    pub async fn notifications(&self) -> Vec<Notification> {
        self.view.lock().await.notifications.list()
    }

    /// Dismiss one notification.
    pub async fn dismiss_notification(&self, id: u64) -> bool {
        self.view.lock().await.notifications.dismiss(id)
    }

    /// Dismiss every notification.
    pub async fn clear_notifications(&self) {
        self.view.lock().await.notifications.clear();
    }

    /// Spawn the observer task.
    ///
    /// Applies every event from `events` and refreshes on the configured
    /// interval. A lagging subscription triggers an immediate refresh.
    pub fn spawn(self: Arc<Self>, events: &EventBus) -> JoinHandle<()> {
        let mut rx = events.subscribe();
        tokio::spawn(async move {
            let mut timer = interval(self.refresh_interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    received = rx.recv() => match received {
                        Ok(event) => self.apply(&event).await,
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed, "Status monitor lagged, refreshing");
                            self.refresh().await;
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = timer.tick() => {
                        self.refresh().await;
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for StatusMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusMonitor")
            .field("refresh_interval", &self.refresh_interval)
            .finish_non_exhaustive()
    }
}
