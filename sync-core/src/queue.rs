//! Operation queue for vitalsync.
//!
//! Operations flow through the queue in this order:
//! 1. `enqueue()` - add to the lane for its priority
//! 2. `next_ready()` / `next_batch()` - move to in-progress
//! 3. `complete()`, `retry()` or `fail()` - leave in-progress
//!
//! High lanes drain before medium before low; each lane is FIFO. When
//! connectivity drops, `requeue_in_progress()` puts every in-flight
//! operation back at the front of its lane in the original order. Times
//! are milliseconds on a caller-supplied clock.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use vitalsync_types::{DeviceId, OperationId};

/// Default retry limit for new operations.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Error type for queue operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Queue is at capacity.
    Full {
        /// Current queue capacity.
        capacity: usize,
    },
    /// Operation id already queued.
    Duplicate(OperationId),
    /// Operation is not in progress.
    NotInProgress(OperationId),
    /// Operation is not in the failed set.
    NotFailed(OperationId),
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueError::Full { capacity } => {
                write!(f, "operation queue full (capacity: {})", capacity)
            }
            QueueError::Duplicate(id) => write!(f, "operation {} already queued", id),
            QueueError::NotInProgress(id) => write!(f, "operation {} is not in progress", id),
            QueueError::NotFailed(id) => write!(f, "operation {} is not in the failed set", id),
        }
    }
}

impl std::error::Error for QueueError {}

/// What an operation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Send local data to the peer.
    Upload,
    /// Apply data received from the peer.
    Download,
    /// Push a user's conflict decision to the peer.
    ConflictResolution,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OperationKind::Upload => "upload",
            OperationKind::Download => "download",
            OperationKind::ConflictResolution => "conflict-resolution",
        };
        write!(f, "{}", s)
    }
}

/// Dispatch priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Dispatched first.
    High,
    /// Default.
    Medium,
    /// Dispatched last.
    Low,
}

impl Priority {
    const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    fn lane(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }
}

/// What a producer asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationDescriptor {
    /// What to do.
    pub kind: OperationKind,
    /// Target peer.
    pub peer: DeviceId,
    /// Logical data type.
    pub data_type: String,
    /// Dispatch priority.
    pub priority: Priority,
    /// Opaque reference to the payload, never the payload itself.
    pub payload_ref: String,
    /// Retry limit; `None` uses the default.
    pub max_retries: Option<u32>,
}

/// A queued unit of sync work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOperation {
    /// Unique id.
    pub id: OperationId,
    /// What to do.
    pub kind: OperationKind,
    /// Target peer.
    pub peer: DeviceId,
    /// Logical data type.
    pub data_type: String,
    /// Dispatch priority.
    pub priority: Priority,
    /// Opaque payload reference.
    pub payload_ref: String,
    /// Retries used so far.
    pub retry_count: u32,
    /// Retry limit.
    pub max_retries: u32,
    /// Enqueue time (ms).
    pub enqueued_at: u64,
    /// Not dispatched before this time (ms).
    pub not_before: u64,
    /// Most recent failure.
    pub last_error: Option<String>,
}

impl SyncOperation {
    /// Build an operation from a descriptor.
    pub fn new(descriptor: OperationDescriptor, now: u64) -> Self {
        Self {
            id: OperationId::new(),
            kind: descriptor.kind,
            peer: descriptor.peer,
            data_type: descriptor.data_type,
            priority: descriptor.priority,
            payload_ref: descriptor.payload_ref,
            retry_count: 0,
            max_retries: descriptor.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            enqueued_at: now,
            not_before: now,
            last_error: None,
        }
    }

    /// Number of attempts made so far, counting the current one.
    pub fn attempts(&self) -> u32 {
        self.retry_count + 1
    }

    /// Whether another retry is allowed.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// An operation that will not be retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedOperation {
    /// The operation as it last ran.
    pub operation: SyncOperation,
    /// Final error.
    pub error: String,
    /// When it failed (ms).
    pub failed_at: u64,
}

/// Counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Pending high.
    pub high: usize,
    /// Pending medium.
    pub medium: usize,
    /// Pending low.
    pub low: usize,
    /// In progress.
    pub in_progress: usize,
    /// Completed since creation.
    pub completed: u64,
    /// Terminal failures.
    pub failed: usize,
}

impl QueueStats {
    /// All pending operations.
    pub fn pending(&self) -> usize {
        self.high + self.medium + self.low
    }
}

/// Priority queue with in-progress tracking.
#[derive(Debug)]
pub struct OperationQueue {
    /// Maximum number of operations (pending + in progress).
    max_size: usize,
    /// One FIFO lane per priority.
    lanes: [VecDeque<SyncOperation>; 3],
    /// Dispatched but not finished.
    in_progress: HashMap<OperationId, SyncOperation>,
    /// Terminal failures, oldest first.
    failed: Vec<FailedOperation>,
    completed: u64,
}

impl OperationQueue {
    /// Create a queue with the given capacity.
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            lanes: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            in_progress: HashMap::new(),
            failed: Vec::new(),
            completed: 0,
        }
    }

    /// Add an operation to the back of its lane.
    pub fn enqueue(&mut self, op: SyncOperation) -> Result<OperationId, QueueError> {
        if self.total_count() >= self.max_size {
            return Err(QueueError::Full {
                capacity: self.max_size,
            });
        }
        if self.contains(&op.id) {
            return Err(QueueError::Duplicate(op.id));
        }
        let id = op.id;
        self.lanes[op.priority.lane()].push_back(op);
        Ok(id)
    }

    /// Take the next ready operation, highest priority first.
    ///
    /// Within a lane the first operation whose `not_before` has passed
    /// wins, so a backing-off operation never blocks the ones behind it.
    pub fn next_ready(&mut self, now: u64) -> Option<SyncOperation> {
        Priority::ALL
            .iter()
            .find_map(|p| self.take_from_lane(p.lane(), now))
    }

    /// Take up to `max` ready operations.
    pub fn next_batch(&mut self, max: usize, now: u64) -> Vec<SyncOperation> {
        let mut batch = Vec::new();
        while batch.len() < max {
            match self.next_ready(now) {
                Some(op) => batch.push(op),
                None => break,
            }
        }
        batch
    }

    /// Take up to `max` ready high-priority operations.
    pub fn next_priority_burst(&mut self, max: usize, now: u64) -> Vec<SyncOperation> {
        let mut burst = Vec::new();
        while burst.len() < max {
            match self.take_from_lane(Priority::High.lane(), now) {
                Some(op) => burst.push(op),
                None => break,
            }
        }
        burst
    }

    fn take_from_lane(&mut self, lane: usize, now: u64) -> Option<SyncOperation> {
        let pos = self.lanes[lane].iter().position(|op| op.not_before <= now)?;
        let op = self.lanes[lane].remove(pos)?;
        self.in_progress.insert(op.id, op.clone());
        Some(op)
    }

    /// Mark an in-progress operation done.
    pub fn complete(&mut self, id: &OperationId) -> Result<SyncOperation, QueueError> {
        let op = self
            .in_progress
            .remove(id)
            .ok_or(QueueError::NotInProgress(*id))?;
        self.completed += 1;
        Ok(op)
    }

    /// Count a retry and put the operation back at the front of its lane.
    pub fn retry(
        &mut self,
        id: &OperationId,
        error: impl Into<String>,
        not_before: u64,
    ) -> Result<&SyncOperation, QueueError> {
        let mut op = self
            .in_progress
            .remove(id)
            .ok_or(QueueError::NotInProgress(*id))?;
        op.retry_count += 1;
        op.last_error = Some(error.into());
        op.not_before = not_before;
        let lane = op.priority.lane();
        self.lanes[lane].push_front(op);
        self.lanes[lane].front().ok_or(QueueError::NotInProgress(*id))
    }

    /// Put an operation back without counting a retry.
    pub fn defer(&mut self, id: &OperationId, not_before: u64) -> Result<(), QueueError> {
        let mut op = self
            .in_progress
            .remove(id)
            .ok_or(QueueError::NotInProgress(*id))?;
        op.not_before = not_before;
        self.lanes[op.priority.lane()].push_front(op);
        Ok(())
    }

    /// Move an in-progress operation to the failed set.
    pub fn fail(
        &mut self,
        id: &OperationId,
        error: impl Into<String>,
        now: u64,
    ) -> Result<&FailedOperation, QueueError> {
        let mut op = self
            .in_progress
            .remove(id)
            .ok_or(QueueError::NotInProgress(*id))?;
        let error = error.into();
        op.last_error = Some(error.clone());
        self.failed.push(FailedOperation {
            operation: op,
            error,
            failed_at: now,
        });
        self.failed.last().ok_or(QueueError::NotInProgress(*id))
    }

    /// Return every in-progress operation to the front of its lane.
    ///
    /// Original enqueue order is preserved. Returns how many moved.
    pub fn requeue_in_progress(&mut self) -> usize {
        let mut ops: Vec<SyncOperation> = self.in_progress.drain().map(|(_, op)| op).collect();
        let moved = ops.len();
        // Push newest first so the oldest ends up at the front
        ops.sort_by(|a, b| b.enqueued_at.cmp(&a.enqueued_at));
        for op in ops {
            self.lanes[op.priority.lane()].push_front(op);
        }
        moved
    }

    /// Give a failed operation a fresh set of retries.
    pub fn resubmit_failed(&mut self, id: &OperationId, now: u64) -> Result<(), QueueError> {
        let pos = self
            .failed
            .iter()
            .position(|f| f.operation.id == *id)
            .ok_or(QueueError::NotFailed(*id))?;
        let mut op = self.failed.remove(pos).operation;
        op.retry_count = 0;
        op.not_before = now;
        self.lanes[op.priority.lane()].push_back(op);
        Ok(())
    }

    /// Drop pending operations for a peer. In-progress ones are left alone.
    pub fn remove_peer(&mut self, peer: &DeviceId) -> Vec<SyncOperation> {
        let mut removed = Vec::new();
        for lane in &mut self.lanes {
            let (gone, kept): (VecDeque<_>, VecDeque<_>) =
                lane.drain(..).partition(|op| op.peer == *peer);
            *lane = kept;
            removed.extend(gone);
        }
        removed
    }

    /// Whether an operation is pending or in progress.
    pub fn contains(&self, id: &OperationId) -> bool {
        self.in_progress.contains_key(id) || self.lanes.iter().flatten().any(|op| op.id == *id)
    }

    /// Whether an operation is in progress.
    pub fn is_in_progress(&self, id: &OperationId) -> bool {
        self.in_progress.contains_key(id)
    }

    /// Earliest `not_before` among pending operations.
    pub fn next_ready_at(&self) -> Option<u64> {
        self.lanes.iter().flatten().map(|op| op.not_before).min()
    }

    /// Pending operations in dispatch order.
    pub fn pending(&self) -> Vec<SyncOperation> {
        self.lanes.iter().flatten().cloned().collect()
    }

    /// Operations in progress.
    pub fn in_progress(&self) -> Vec<SyncOperation> {
        self.in_progress.values().cloned().collect()
    }

    /// Terminal failures.
    pub fn failed(&self) -> &[FailedOperation] {
        &self.failed
    }

    /// Pending plus in-progress, for persistence.
    pub fn snapshot(&self) -> Vec<SyncOperation> {
        let mut ops = self.pending();
        ops.extend(self.in_progress());
        ops
    }

    /// Rebuild from persisted operations.
    ///
    /// In-progress state does not survive a restart; everything comes back
    /// pending and immediately ready.
    pub fn restore(max_size: usize, mut ops: Vec<SyncOperation>) -> Self {
        let mut queue = Self::new(max_size);
        ops.sort_by_key(|op| op.enqueued_at);
        for mut op in ops {
            op.not_before = 0;
            queue.lanes[op.priority.lane()].push_back(op);
        }
        queue
    }

    /// Counts by state.
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            high: self.lanes[0].len(),
            medium: self.lanes[1].len(),
            low: self.lanes[2].len(),
            in_progress: self.in_progress.len(),
            completed: self.completed,
            failed: self.failed.len(),
        }
    }

    /// Number of pending operations.
    pub fn len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.lanes.iter().all(VecDeque::is_empty)
    }

    /// Pending plus in progress.
    pub fn total_count(&self) -> usize {
        self.len() + self.in_progress.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(priority: Priority, at: u64) -> SyncOperation {
        SyncOperation::new(
            OperationDescriptor {
                kind: OperationKind::Upload,
                peer: DeviceId::from_bytes(&[1u8; 32]).unwrap(),
                data_type: "daily_log".into(),
                priority,
                payload_ref: format!("record-{}", at),
                max_retries: Some(2),
            },
            at,
        )
    }

    #[test]
    fn queue_respects_max_size() {
        let mut queue = OperationQueue::new(2);
        queue.enqueue(op(Priority::Low, 0)).unwrap();
        queue.enqueue(op(Priority::Low, 1)).unwrap();

        assert_eq!(
            queue.enqueue(op(Priority::Low, 2)),
            Err(QueueError::Full { capacity: 2 })
        );
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut queue = OperationQueue::new(10);
        let first = op(Priority::Low, 0);
        queue.enqueue(first.clone()).unwrap();
        assert_eq!(queue.enqueue(first.clone()), Err(QueueError::Duplicate(first.id)));
    }

    #[test]
    fn higher_priority_dispatches_first() {
        let mut queue = OperationQueue::new(10);
        let low = op(Priority::Low, 0);
        let medium = op(Priority::Medium, 1);
        let high = op(Priority::High, 2);
        queue.enqueue(low.clone()).unwrap();
        queue.enqueue(medium.clone()).unwrap();
        queue.enqueue(high.clone()).unwrap();

        let order: Vec<OperationId> = queue.next_batch(10, 10).iter().map(|o| o.id).collect();
        assert_eq!(order, vec![high.id, medium.id, low.id]);
    }

    #[test]
    fn equal_priority_is_fifo() {
        let mut queue = OperationQueue::new(10);
        let ids: Vec<OperationId> = (0..4)
            .map(|i| queue.enqueue(op(Priority::Medium, i)).unwrap())
            .collect();

        let order: Vec<OperationId> = queue.next_batch(10, 10).iter().map(|o| o.id).collect();
        assert_eq!(order, ids);
    }

    #[test]
    fn backing_off_operation_does_not_block_lane() {
        let mut queue = OperationQueue::new(10);
        let first = queue.enqueue(op(Priority::High, 0)).unwrap();
        let second = queue.enqueue(op(Priority::High, 1)).unwrap();

        queue.next_ready(5).unwrap();
        queue.retry(&first, "timeout", 1_000).unwrap();

        assert_eq!(queue.next_ready(5).map(|o| o.id), Some(second));
        assert!(queue.next_ready(5).is_none());
        assert_eq!(queue.next_ready(1_000).map(|o| o.id), Some(first));
    }

    #[test]
    fn retry_counts_and_returns_to_front() {
        let mut queue = OperationQueue::new(10);
        let first = queue.enqueue(op(Priority::Low, 0)).unwrap();
        queue.enqueue(op(Priority::Low, 1)).unwrap();

        queue.next_ready(0).unwrap();
        let retried = queue.retry(&first, "network down", 0).unwrap();
        assert_eq!(retried.retry_count, 1);
        assert_eq!(retried.last_error.as_deref(), Some("network down"));

        assert_eq!(queue.next_ready(0).unwrap().id, first);
    }

    #[test]
    fn can_retry_honours_limit() {
        let mut operation = op(Priority::Low, 0);
        assert!(operation.can_retry());
        operation.retry_count = 2;
        assert!(!operation.can_retry());
        assert_eq!(operation.attempts(), 3);
    }

    #[test]
    fn fail_moves_to_failed_set() {
        let mut queue = OperationQueue::new(10);
        let id = queue.enqueue(op(Priority::Low, 0)).unwrap();
        queue.next_ready(0).unwrap();

        let failed = queue.fail(&id, "revoked", 50).unwrap();
        assert_eq!(failed.error, "revoked");
        assert_eq!(queue.failed().len(), 1);
        assert!(!queue.contains(&id));
        assert_eq!(queue.stats().failed, 1);
    }

    #[test]
    fn finishing_unknown_operation_errors() {
        let mut queue = OperationQueue::new(10);
        let id = OperationId::new();
        assert_eq!(queue.complete(&id), Err(QueueError::NotInProgress(id)));
        assert!(queue.fail(&id, "x", 0).is_err());
    }

    #[test]
    fn requeue_in_progress_preserves_order_at_front() {
        let mut queue = OperationQueue::new(10);
        let a = queue.enqueue(op(Priority::Medium, 0)).unwrap();
        let b = queue.enqueue(op(Priority::Medium, 1)).unwrap();
        let c = queue.enqueue(op(Priority::Medium, 2)).unwrap();

        queue.next_ready(10).unwrap();
        queue.next_ready(10).unwrap();
        assert_eq!(queue.requeue_in_progress(), 2);

        let order: Vec<OperationId> = queue.next_batch(10, 10).iter().map(|o| o.id).collect();
        assert_eq!(order, vec![a, b, c]);
    }

    #[test]
    fn priority_burst_only_takes_high() {
        let mut queue = OperationQueue::new(10);
        queue.enqueue(op(Priority::Low, 0)).unwrap();
        for i in 1..=5 {
            queue.enqueue(op(Priority::High, i)).unwrap();
        }

        let burst = queue.next_priority_burst(3, 10);
        assert_eq!(burst.len(), 3);
        assert!(burst.iter().all(|o| o.priority == Priority::High));
        assert_eq!(queue.stats().high, 2);
        assert_eq!(queue.stats().low, 1);
    }

    #[test]
    fn resubmit_failed_resets_retries() {
        let mut queue = OperationQueue::new(10);
        let id = queue.enqueue(op(Priority::Low, 0)).unwrap();
        queue.next_ready(0).unwrap();
        queue.retry(&id, "x", 0).unwrap();
        queue.next_ready(0).unwrap();
        queue.fail(&id, "gave up", 0).unwrap();

        queue.resubmit_failed(&id, 100).unwrap();
        assert!(queue.failed().is_empty());
        assert_eq!(queue.next_ready(100).unwrap().retry_count, 0);
        assert_eq!(
            queue.resubmit_failed(&id, 100),
            Err(QueueError::NotFailed(id))
        );
    }

    #[test]
    fn remove_peer_drops_pending_only() {
        let mut queue = OperationQueue::new(10);
        let mut other = op(Priority::Low, 0);
        other.peer = DeviceId::from_bytes(&[2u8; 32]).unwrap();
        let other_id = queue.enqueue(other).unwrap();
        queue.enqueue(op(Priority::Low, 1)).unwrap();
        queue.enqueue(op(Priority::High, 2)).unwrap();

        let removed = queue.remove_peer(&DeviceId::from_bytes(&[1u8; 32]).unwrap());
        assert_eq!(removed.len(), 2);
        assert_eq!(queue.pending().iter().map(|o| o.id).collect::<Vec<_>>(), vec![other_id]);
    }

    #[test]
    fn restore_makes_everything_pending() {
        let mut queue = OperationQueue::new(10);
        let a = queue.enqueue(op(Priority::Low, 0)).unwrap();
        let b = queue.enqueue(op(Priority::Low, 1)).unwrap();
        queue.next_ready(0).unwrap();
        queue.retry(&b, "x", 0).ok();

        let restored = OperationQueue::restore(10, queue.snapshot());
        assert_eq!(restored.stats().in_progress, 0);
        assert_eq!(
            restored.pending().iter().map(|o| o.id).collect::<Vec<_>>(),
            vec![a, b]
        );
    }

    #[test]
    fn operation_serialization_roundtrip() {
        let operation = op(Priority::High, 42);
        let json = serde_json::to_string(&operation).unwrap();
        let restored: SyncOperation = serde_json::from_str(&json).unwrap();
        assert_eq!(operation, restored);
    }
}
