//! Applying remote records to the local store.
//!
//! Every inbound record is compared against the local copy and the last
//! version both sides agreed on (the base). Fast-forwards are taken
//! directly; real divergence goes to the [`ConflictResolver`], and
//! anything it will not settle is parked for the user.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use vitalsync_core::{
    ConflictPolicy, ConflictResolution, ConflictResolver, DataConflict, DeferReason, FieldChoice,
    Record, ResolutionBatch, ResolutionHistory,
};
use vitalsync_types::{unix_now, DeviceId};

use crate::error::PeerError;
use crate::events::{EventBus, SyncEvent};
use crate::services::{PendingConflict, StateStore};

/// What happened to an inbound record.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// No local copy existed; the remote one was stored.
    Stored,
    /// Local had no unshared edits; the remote version replaced it.
    FastForwarded,
    /// Both sides already agree.
    Unchanged,
    /// The peer is behind; the local version stays.
    KeptLocal,
    /// The resolver merged both versions.
    Merged {
        /// The resolution applied.
        resolution: ConflictResolution,
        /// Whether the peer needs the merged record.
        send_back: bool,
    },
    /// Parked for a user decision.
    Deferred {
        /// Why it was not merged.
        reason: DeferReason,
    },
}

/// Conflict detection and resolution against the state store.
pub struct ConflictEngine {
    resolver: ConflictResolver,
    history: Mutex<ResolutionHistory>,
    store: Arc<dyn StateStore>,
    events: EventBus,
}

impl ConflictEngine {
    /// Create an engine resolving under `policy`.
    pub fn new(policy: ConflictPolicy, store: Arc<dyn StateStore>, events: EventBus) -> Self {
        Self {
            resolver: ConflictResolver::new(policy),
            history: Mutex::new(ResolutionHistory::new()),
            store,
            events,
        }
    }

    /// Apply a record received from `peer`.
    pub async fn apply_remote(
        &self,
        peer: DeviceId,
        remote: Record,
    ) -> Result<ApplyOutcome, PeerError> {
        let Some(local) = self.store.load_record(&remote.id).await? else {
            self.store.save_record(&remote).await?;
            self.store.save_base_record(&remote).await?;
            debug!(record = %remote.id, "Stored new record");
            return Ok(ApplyOutcome::Stored);
        };
        let base = self.store.load_base_record(&remote.id).await?;

        if local.fields == remote.fields {
            self.store.save_base_record(&remote).await?;
            // Same content at a newer version, e.g. a user resolution sent back
            if remote.version > local.version {
                self.store.save_record(&remote).await?;
                debug!(record = %remote.id, version = remote.version, "Adopted newer version");
                return Ok(ApplyOutcome::FastForwarded);
            }
            return Ok(ApplyOutcome::Unchanged);
        }
        if let Some(base) = &base {
            if local.fields == base.fields {
                self.store.save_record(&remote).await?;
                self.store.save_base_record(&remote).await?;
                debug!(record = %remote.id, "Fast-forwarded");
                return Ok(ApplyOutcome::FastForwarded);
            }
            if remote.fields == base.fields {
                return Ok(ApplyOutcome::KeptLocal);
            }
        }

        let Some(conflict) = self.resolver.detect(&local, &remote, base.as_ref())? else {
            return Ok(ApplyOutcome::Unchanged);
        };

        match self.resolver.resolve(&conflict, unix_now()) {
            Ok(resolution) => {
                let send_back = resolution.merged.fields != remote.fields;
                if let Err(e) = self.history.lock().await.record(resolution.clone()) {
                    debug!(record = %conflict.record_id, "Resolution already applied: {}", e);
                }
                self.store.save_record(&resolution.merged).await?;
                self.store.save_base_record(&remote).await?;
                info!(
                    record = %conflict.record_id,
                    strategy = ?resolution.strategy,
                    "Conflict resolved automatically"
                );
                self.events.emit(SyncEvent::ConflictResolved {
                    record_id: conflict.record_id.clone(),
                    by_user: false,
                });
                Ok(ApplyOutcome::Merged {
                    resolution,
                    send_back,
                })
            }
            Err(reason) => {
                self.park(peer, conflict, &reason).await?;
                Ok(ApplyOutcome::Deferred { reason })
            }
        }
    }

    async fn park(
        &self,
        peer: DeviceId,
        conflict: DataConflict,
        reason: &DeferReason,
    ) -> Result<(), PeerError> {
        let record_id = conflict.record_id.clone();
        warn!(record = %record_id, ?reason, "Conflict needs a user decision");
        self.store
            .save_conflict(&PendingConflict {
                peer,
                conflict,
                detected_at: unix_now(),
            })
            .await?;
        self.events
            .emit(SyncEvent::ConflictDeferred { record_id, peer });
        Ok(())
    }

    /// Settle a parked conflict with the user's per-field choices.
    ///
    /// Returns the resolution and the peer that must receive the result.
    pub async fn resolve_conflict(
        &self,
        record_id: &str,
        choices: &BTreeMap<String, FieldChoice>,
    ) -> Result<(ConflictResolution, DeviceId), PeerError> {
        let pending = self
            .store
            .load_conflicts()
            .await?
            .into_iter()
            .find(|p| p.conflict.record_id == record_id)
            .ok_or_else(|| PeerError::NotFound(format!("conflict {}", record_id)))?;

        let resolution =
            self.resolver
                .resolve_with_choice(&pending.conflict, choices, unix_now())?;
        self.history.lock().await.record(resolution.clone())?;
        self.store.save_record(&resolution.merged).await?;
        self.store.save_base_record(&pending.conflict.remote).await?;
        self.store.remove_conflict(record_id).await?;

        info!(record = %record_id, "Conflict resolved by user");
        self.events.emit(SyncEvent::ConflictResolved {
            record_id: record_id.to_string(),
            by_user: true,
        });
        Ok((resolution, pending.peer))
    }

    /// Re-run the resolver over every parked conflict.
    ///
    /// Conflicts it now settles are applied and leave the parked set.
    pub async fn retry_parked(&self) -> Result<ResolutionBatch, PeerError> {
        let parked = self.store.load_conflicts().await?;
        let conflicts = parked.iter().map(|p| p.conflict.clone()).collect();
        let batch = {
            let mut history = self.history.lock().await;
            self.resolver
                .resolve_batch(conflicts, &mut history, unix_now())
        };

        for resolution in &batch.auto_resolved {
            self.store.save_record(&resolution.merged).await?;
            if let Some(pending) = parked
                .iter()
                .find(|p| p.conflict.record_id == resolution.record_id)
            {
                self.store.save_base_record(&pending.conflict.remote).await?;
            }
            self.store.remove_conflict(&resolution.record_id).await?;
            self.events.emit(SyncEvent::ConflictResolved {
                record_id: resolution.record_id.clone(),
                by_user: false,
            });
        }
        Ok(batch)
    }

    /// Conflicts waiting for the user.
    pub async fn pending_conflicts(&self) -> Result<Vec<PendingConflict>, PeerError> {
        Ok(self.store.load_conflicts().await?)
    }

    /// Resolutions applied since startup, oldest first.
    pub async fn history(&self) -> Vec<ConflictResolution> {
        self.history.lock().await.entries().to_vec()
    }
}

impl std::fmt::Debug for ConflictEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictEngine").finish_non_exhaustive()
    }
}
