//! Sync orchestrator.
//!
//! Owns the operation queue, the circuit breakers and the retry budget,
//! and feeds ready operations to an [`OperationExecutor`]. Connectivity
//! changes go through the [`LinkState`] machine; the orchestrator carries
//! out whatever actions it returns.
//!
//! Failure handling:
//!
//! | Error                        | Outcome                                  |
//! |------------------------------|------------------------------------------|
//! | breaker open                 | failed set, no retry used                |
//! | not retryable                | failed set                               |
//! | retryable, retries left      | backoff, then retried                    |
//! | retryable, budget exhausted  | deferred to the budget window end        |
//! | retryable, no retries left   | failed set                               |

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinSet;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use vitalsync_core::{
    BackoffPolicy, BreakerRegistry, FailedOperation, LinkAction, LinkEvent,
    LinkPolicy, LinkState, NetworkQuality, OperationDescriptor, OperationKind, OperationQueue,
    QueueStats, RetryBudget, SyncOperation,
};
use vitalsync_types::{unix_now, DeviceId, ErrorClass, OperationId};

use crate::config::SyncConfig;
use crate::error::PeerError;
use crate::events::{EventBus, SyncEvent};
use crate::services::StateStore;

/// Rejection reason when a breaker is open.
pub const BREAKER_OPEN: &str = "circuit breaker open";

/// Performs one operation.
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    /// Run `op`. Returns the number of bytes moved.
    async fn execute(&self, op: &SyncOperation) -> Result<u64, PeerError>;
}

/// Orchestrator tuning.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Queue capacity.
    pub max_queue_size: usize,
    /// Retry limit for descriptors that do not set one.
    pub default_max_retries: u32,
    /// Reconnect burst and batch sizing.
    pub link: LinkPolicy,
    /// Retry delays.
    pub backoff: BackoffPolicy,
    /// Consecutive failures that open a breaker.
    pub breaker_threshold: u32,
    /// How long an open breaker rejects.
    pub breaker_cooldown: Duration,
    /// Retries per device per window.
    pub retry_budget: u32,
    /// Retry budget window.
    pub retry_window: Duration,
    /// Dispatch tick.
    pub batch_interval: Duration,
}

impl From<&SyncConfig> for OrchestratorSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            max_queue_size: config.max_queue_size,
            default_max_retries: config.max_retries,
            link: config.link_policy(),
            backoff: config.backoff(),
            breaker_threshold: config.breaker_failure_threshold,
            breaker_cooldown: Duration::from_secs(config.breaker_cooldown_secs),
            retry_budget: config.retry_budget_per_device,
            retry_window: Duration::from_secs(config.retry_budget_window_secs),
            batch_interval: Duration::from_millis(config.batch_interval_ms),
        }
    }
}

/// Snapshot of orchestrator state.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorStats {
    /// Queue counts.
    pub queue: QueueStats,
    /// Breakers currently rejecting.
    pub open_breakers: Vec<(DeviceId, OperationKind)>,
    /// Whether the link is up.
    pub online: bool,
    /// Whether dispatch is paused.
    pub paused: bool,
    /// Current batch size.
    pub batch_size: usize,
}

/// Wall-clock milliseconds that follow tokio's clock, so paused-time tests
/// see backoff elapse.
#[derive(Debug, Clone, Copy)]
struct Clock {
    epoch: Instant,
    epoch_ms: u64,
}

impl Clock {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
            epoch_ms: unix_now().saturating_mul(1000),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch_ms + self.epoch.elapsed().as_millis() as u64
    }
}

#[derive(Debug)]
struct State {
    queue: OperationQueue,
    breakers: BreakerRegistry,
    budget: RetryBudget,
    link: LinkState,
    batch_size: usize,
    paused: bool,
}

/// Drives the operation queue.
pub struct SyncOrchestrator {
    state: Mutex<State>,
    executor: Arc<dyn OperationExecutor>,
    store: Arc<dyn StateStore>,
    events: EventBus,
    settings: OrchestratorSettings,
    clock: Clock,
    wake: Notify,
}

impl SyncOrchestrator {
    /// Create an orchestrator with an empty queue, online.
    pub fn new(
        settings: OrchestratorSettings,
        executor: Arc<dyn OperationExecutor>,
        store: Arc<dyn StateStore>,
        events: EventBus,
    ) -> Self {
        let link = LinkState::default();
        let batch_size = link
            .quality()
            .map(|q| q.batch_size(settings.link.max_batch))
            .unwrap_or(1);
        Self {
            state: Mutex::new(State {
                queue: OperationQueue::new(settings.max_queue_size),
                breakers: BreakerRegistry::new(
                    settings.breaker_threshold,
                    settings.breaker_cooldown,
                ),
                budget: RetryBudget::new(settings.retry_budget, settings.retry_window),
                link,
                batch_size,
                paused: false,
            }),
            executor,
            store,
            events,
            settings,
            clock: Clock::new(),
            wake: Notify::new(),
        }
    }

    /// Restore persisted operations. Returns how many came back.
    pub async fn load(&self) -> Result<usize, PeerError> {
        let ops = self.store.load_operations().await?;
        let count = ops.len();
        let mut state = self.state.lock().await;
        state.queue = OperationQueue::restore(self.settings.max_queue_size, ops);
        info!(operations = count, "Operation queue restored");
        Ok(count)
    }

    /// Accept an operation.
    pub async fn queue_operation(
        &self,
        mut descriptor: OperationDescriptor,
    ) -> Result<OperationId, PeerError> {
        descriptor
            .max_retries
            .get_or_insert(self.settings.default_max_retries);
        let op = SyncOperation::new(descriptor, self.clock.now_ms());
        let (id, peer, kind) = (op.id, op.peer, op.kind);

        let mut state = self.state.lock().await;
        state.queue.enqueue(op)?;
        self.store
            .save_operations(&state.queue.snapshot())
            .await?;
        drop(state);

        debug!(%id, peer = ?peer, %kind, "Operation queued");
        self.events
            .emit(SyncEvent::OperationQueued { id, peer, kind });
        self.wake.notify_one();
        Ok(id)
    }

    /// Dispatch one batch of ready operations and settle the results.
    ///
    /// Returns how many operations were handed to the executor.
    pub async fn run_once(&self) -> usize {
        let batch = {
            let mut state = self.state.lock().await;
            if state.paused || !state.link.is_online() {
                return 0;
            }
            let size = state.batch_size;
            state.queue.next_batch(size, self.clock.now_ms())
        };
        self.dispatch(batch).await
    }

    /// The network went away.
    pub async fn on_connectivity_lost(&self, reason: impl Into<String>) {
        self.apply_link_event(LinkEvent::ConnectivityLost {
            reason: reason.into(),
        })
        .await;
    }

    /// The network came back. Returns how many burst operations ran.
    pub async fn on_connectivity_restored(&self, quality: NetworkQuality) -> usize {
        self.apply_link_event(LinkEvent::ConnectivityRestored { quality })
            .await
    }

    /// The link quality changed while online.
    pub async fn on_quality_changed(&self, quality: NetworkQuality) {
        self.apply_link_event(LinkEvent::QualityChanged { quality })
            .await;
    }

    async fn apply_link_event(&self, event: LinkEvent) -> usize {
        let burst = {
            let mut state = self.state.lock().await;
            let (link, actions) = state.link.on_event(event, &self.settings.link);
            state.link = link;

            let mut burst = Vec::new();
            for action in actions {
                match action {
                    LinkAction::PauseDispatch => state.paused = true,
                    LinkAction::RequeueInProgress => {
                        let count = state.queue.requeue_in_progress();
                        if count > 0 {
                            info!(count, "Requeued in-flight operations");
                            self.events.emit(SyncEvent::Requeued { count });
                        }
                    }
                    LinkAction::PriorityBurst { max } => {
                        burst = state.queue.next_priority_burst(max, self.clock.now_ms());
                    }
                    LinkAction::ResumeDispatch { batch_size } => {
                        state.paused = false;
                        state.batch_size = batch_size;
                    }
                    LinkAction::Notify(notice) => {
                        info!(?notice, "Connectivity changed");
                        self.events.emit(notice);
                    }
                }
            }
            burst
        };

        if burst.is_empty() {
            self.wake.notify_one();
            return 0;
        }
        info!(count = burst.len(), "Dispatching high-priority burst");
        let ran = self.dispatch(burst).await;
        self.wake.notify_one();
        ran
    }

    /// Run operations concurrently and settle each outcome.
    async fn dispatch(&self, batch: Vec<SyncOperation>) -> usize {
        if batch.is_empty() {
            return 0;
        }

        let mut tasks = JoinSet::new();
        let mut outstanding = HashSet::new();
        {
            let mut state = self.state.lock().await;
            let now = self.clock.now_ms();
            for op in batch {
                if !state.breakers.allow(op.peer, op.kind, now) {
                    debug!(id = %op.id, peer = ?op.peer, "Rejected: {}", BREAKER_OPEN);
                    self.fail(&mut state, &op, &PeerError::BreakerOpen, now);
                    continue;
                }

                self.events.emit(SyncEvent::OperationStarted {
                    id: op.id,
                    peer: op.peer,
                });
                outstanding.insert(op.id);
                let executor = self.executor.clone();
                tasks.spawn(async move {
                    let result = executor.execute(&op).await;
                    (op, result)
                });
            }
        }

        let started = outstanding.len();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((op, result)) => {
                    outstanding.remove(&op.id);
                    self.settle(op, result).await;
                }
                Err(e) => error!("Executor task failed: {}", e),
            }
        }

        // Anything left here panicked inside the executor
        if !outstanding.is_empty() {
            let mut state = self.state.lock().await;
            let now = self.clock.now_ms();
            for id in outstanding {
                if let Ok(failed) = state.queue.fail(&id, "executor panicked", now) {
                    let op = failed.operation.clone();
                    self.events.emit(SyncEvent::OperationFailed {
                        id,
                        peer: op.peer,
                        kind: op.kind,
                        class: ErrorClass::Data,
                        error: "executor panicked".into(),
                    });
                }
            }
        }

        self.persist().await;
        started
    }

    async fn settle(&self, op: SyncOperation, result: Result<u64, PeerError>) {
        let mut state = self.state.lock().await;
        let now = self.clock.now_ms();

        let error = match result {
            Ok(bytes) => {
                state.breakers.on_success(op.peer, op.kind);
                match state.queue.complete(&op.id) {
                    Ok(_) => {
                        debug!(id = %op.id, bytes, "Operation completed");
                        self.events.emit(SyncEvent::OperationCompleted {
                            id: op.id,
                            peer: op.peer,
                            bytes,
                        });
                    }
                    Err(e) => debug!(id = %op.id, "Completed after requeue: {}", e),
                }
                return;
            }
            Err(e) => e,
        };

        if !state.queue.is_in_progress(&op.id) {
            debug!(id = %op.id, "Failure after requeue ignored: {}", error);
            return;
        }

        if state.breakers.on_failure(op.peer, op.kind, now) {
            warn!(peer = ?op.peer, kind = %op.kind, "Circuit breaker opened");
            self.events.emit(SyncEvent::BreakerOpened {
                peer: op.peer,
                kind: op.kind,
            });
        }

        let message = error.to_string();
        if !error.is_retryable() || !op.can_retry() {
            self.fail(&mut state, &op, &error, now);
        } else if !state.budget.try_acquire(&op.peer, now) {
            let until = state.budget.window_end(&op.peer, now);
            warn!(peer = ?op.peer, "Retry budget exhausted, deferring");
            self.defer(&mut state, &op, until, "retry budget exhausted");
        } else {
            let delay = self.settings.backoff.delay(op.retry_count);
            let delay_ms = delay.as_millis() as u64;
            if let Err(e) = state.queue.retry(&op.id, message.clone(), now + delay_ms) {
                debug!(id = %op.id, "Retry skipped: {}", e);
                return;
            }
            warn!(
                id = %op.id,
                attempt = op.attempts(),
                delay_ms,
                "Operation failed, retrying: {}",
                message
            );
            self.events.emit(SyncEvent::OperationRetrying {
                id: op.id,
                peer: op.peer,
                attempt: op.retry_count + 1,
                delay_ms,
                error: message,
            });
        }
    }

    fn fail(&self, state: &mut State, op: &SyncOperation, error: &PeerError, now: u64) {
        let message = error.to_string();
        match state.queue.fail(&op.id, message.clone(), now) {
            Ok(_) => {
                error!(
                    id = %op.id,
                    peer = ?op.peer,
                    kind = %op.kind,
                    attempts = op.attempts(),
                    "Operation failed: {}",
                    message
                );
                self.events.emit(SyncEvent::OperationFailed {
                    id: op.id,
                    peer: op.peer,
                    kind: op.kind,
                    class: error.class(),
                    error: message,
                });
            }
            Err(e) => debug!(id = %op.id, "Fail skipped: {}", e),
        }
    }

    fn defer(&self, state: &mut State, op: &SyncOperation, until: u64, reason: &str) {
        if let Err(e) = state.queue.defer(&op.id, until) {
            debug!(id = %op.id, "Defer skipped: {}", e);
            return;
        }
        self.events.emit(SyncEvent::OperationDeferred {
            id: op.id,
            peer: op.peer,
            until,
            reason: reason.to_string(),
        });
    }

    async fn persist(&self) {
        let snapshot = self.state.lock().await.queue.snapshot();
        if let Err(e) = self.store.save_operations(&snapshot).await {
            warn!("Failed to persist operation queue: {}", e);
        }
    }

    /// Close a breaker by hand.
    pub async fn reset_breaker(&self, peer: DeviceId, kind: OperationKind) {
        self.state.lock().await.breakers.reset(peer, kind);
        info!(peer = ?peer, %kind, "Circuit breaker reset");
        self.wake.notify_one();
    }

    /// Give a failed operation a fresh set of retries.
    pub async fn resubmit_failed(&self, id: &OperationId) -> Result<(), PeerError> {
        let mut state = self.state.lock().await;
        state.queue.resubmit_failed(id, self.clock.now_ms())?;
        self.store
            .save_operations(&state.queue.snapshot())
            .await?;
        drop(state);
        self.wake.notify_one();
        Ok(())
    }

    /// Drop everything queued for a peer, e.g. after revocation.
    pub async fn forget_peer(&self, peer: &DeviceId) -> Vec<SyncOperation> {
        let removed = {
            let mut state = self.state.lock().await;
            state.breakers.remove_peer(peer);
            state.budget.reset(peer);
            state.queue.remove_peer(peer)
        };
        if !removed.is_empty() {
            info!(peer = ?peer, count = removed.len(), "Dropped queued operations");
            self.persist().await;
        }
        removed
    }

    /// Terminal failures.
    pub async fn failed_operations(&self) -> Vec<FailedOperation> {
        self.state.lock().await.queue.failed().to_vec()
    }

    /// Pending operations in dispatch order.
    pub async fn pending_operations(&self) -> Vec<SyncOperation> {
        self.state.lock().await.queue.pending()
    }

    /// Operations currently with the executor.
    pub async fn in_progress_operations(&self) -> Vec<SyncOperation> {
        self.state.lock().await.queue.in_progress()
    }

    /// Current counts and link state.
    pub async fn stats(&self) -> OrchestratorStats {
        let state = self.state.lock().await;
        OrchestratorStats {
            queue: state.queue.stats(),
            open_breakers: state.breakers.open_breakers(),
            online: state.link.is_online(),
            paused: state.paused,
            batch_size: state.batch_size,
        }
    }

    /// Current time on the orchestrator clock, in ms.
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Spawn the dispatch loop.
    ///
    /// Runs a batch on every tick and whenever new work arrives. Returns a
    /// handle that can be used to abort the task.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.settings.batch_interval;
            info!("Orchestrator started (interval: {}ms)", period.as_millis());
            let mut timer = interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = timer.tick() => {}
                    _ = self.wake.notified() => {}
                }
                let ran = self.run_once().await;
                if ran > 0 {
                    debug!(ran, "Dispatched batch");
                }
            }
        })
    }
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
