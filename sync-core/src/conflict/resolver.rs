//! Conflict detection and resolution logic

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use super::{
    content_hash, ChangeSide, ConflictError, ConflictPolicy, ConflictResolution, ConflictType,
    DataConflict, FieldCategory, FieldConflict, Provenance, Record, ResolutionHistory,
    ResolutionStrategy, ResolvedBy, Severity,
};

/// Why a conflict needs a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferReason {
    /// Severity is high or critical.
    Severity(Severity),
    /// A field's category is always a user decision.
    AlwaysUserDecision {
        /// First such field.
        field: String,
    },
    /// Competing fields with no policy default.
    NoPolicyDefault {
        /// The fields.
        fields: Vec<String>,
    },
}

/// A conflict left for the user.
#[derive(Debug, Clone, PartialEq)]
pub struct Deferred {
    /// The conflict.
    pub conflict: DataConflict,
    /// Why it was not merged.
    pub reason: DeferReason,
}

/// Result of resolving many conflicts at once.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolutionBatch {
    /// Merged without a user, already appended to history.
    pub auto_resolved: Vec<ConflictResolution>,
    /// Waiting for a user decision.
    pub requires_user: Vec<Deferred>,
    /// Conflicts whose resolution was already in history.
    pub duplicates: usize,
}

/// A user's decision for one field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldChoice {
    /// Keep the local value.
    Local,
    /// Take the remote value.
    Remote,
    /// Use a value the user entered.
    Custom(Value),
}

/// Detects and resolves conflicts under a policy.
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    policy: ConflictPolicy,
}

impl ConflictResolver {
    /// Create a resolver.
    pub fn new(policy: ConflictPolicy) -> Self {
        Self { policy }
    }

    /// The active policy.
    pub fn policy(&self) -> &ConflictPolicy {
        &self.policy
    }

    /// Compare two versions of a record.
    ///
    /// `base` is the last version both sides agreed on. Without it every
    /// differing field counts as changed by both sides.
    ///
    /// Returns `Ok(None)` when the records agree on every field.
    pub fn detect(
        &self,
        local: &Record,
        remote: &Record,
        base: Option<&Record>,
    ) -> Result<Option<DataConflict>, ConflictError> {
        if local.id != remote.id {
            return Err(ConflictError::RecordMismatch {
                local: local.id.clone(),
                remote: remote.id.clone(),
            });
        }
        if local.data_type != remote.data_type {
            return Err(ConflictError::DataTypeMismatch(local.id.clone()));
        }

        let names: BTreeSet<&String> = local.fields.keys().chain(remote.fields.keys()).collect();
        let mut fields = Vec::new();
        for name in names {
            let l = local.fields.get(name);
            let r = remote.fields.get(name);
            if l == r {
                continue;
            }
            let changed_by = match base.map(|b| b.fields.get(name)) {
                Some(b) if b == l => ChangeSide::Remote,
                Some(b) if b == r => ChangeSide::Local,
                _ => ChangeSide::Both,
            };
            fields.push(FieldConflict {
                field: name.clone(),
                category: self.policy.category_of(name),
                conflict_type: ConflictType::of(l, r),
                changed_by,
                local: l.cloned(),
                remote: r.cloned(),
            });
        }

        if fields.is_empty() {
            return Ok(None);
        }

        let severity = fields
            .iter()
            .map(|f| f.category.severity())
            .max()
            .unwrap_or(Severity::Low);

        let mut conflict = DataConflict {
            record_id: local.id.clone(),
            data_type: local.data_type.clone(),
            fields,
            local: local.clone(),
            remote: remote.clone(),
            base: base.cloned(),
            severity,
            auto_resolvable: false,
        };
        conflict.auto_resolvable = self.plan(&conflict).is_ok();
        Ok(Some(conflict))
    }

    /// Try to resolve a conflict without a user.
    pub fn resolve(
        &self,
        conflict: &DataConflict,
        now: u64,
    ) -> Result<ConflictResolution, DeferReason> {
        let (strategy, values) = self.plan(conflict)?;
        Ok(build_resolution(
            conflict,
            strategy,
            values,
            now,
            ResolvedBy::Automatic,
        ))
    }

    /// Resolve many conflicts, appending automatic resolutions to `history`.
    pub fn resolve_batch(
        &self,
        conflicts: Vec<DataConflict>,
        history: &mut ResolutionHistory,
        now: u64,
    ) -> ResolutionBatch {
        let mut batch = ResolutionBatch::default();
        for conflict in conflicts {
            match self.resolve(&conflict, now) {
                Ok(resolution) => match history.record(resolution.clone()) {
                    Ok(()) => batch.auto_resolved.push(resolution),
                    Err(_) => batch.duplicates += 1,
                },
                Err(reason) => batch.requires_user.push(Deferred { conflict, reason }),
            }
        }
        batch
    }

    /// Apply a user's per-field choices.
    ///
    /// Every conflicting field needs a choice.
    pub fn resolve_with_choice(
        &self,
        conflict: &DataConflict,
        choices: &BTreeMap<String, FieldChoice>,
        now: u64,
    ) -> Result<ConflictResolution, ConflictError> {
        if let Some(unknown) = choices
            .keys()
            .find(|name| !conflict.fields.iter().any(|f| &f.field == *name))
        {
            return Err(ConflictError::UnknownField(unknown.clone()));
        }

        let mut values = BTreeMap::new();
        for field in &conflict.fields {
            let choice = choices
                .get(&field.field)
                .ok_or_else(|| ConflictError::MissingChoice(field.field.clone()))?;
            let picked = match choice {
                FieldChoice::Local => (field.local.clone(), Provenance::Local),
                FieldChoice::Remote => (field.remote.clone(), Provenance::Remote),
                FieldChoice::Custom(v) => (Some(v.clone()), Provenance::Merged),
            };
            values.insert(field.field.clone(), picked);
        }

        Ok(build_resolution(
            conflict,
            ResolutionStrategy::UserChoice,
            values,
            now,
            ResolvedBy::User,
        ))
    }

    /// Decide a strategy and a value per conflicting field.
    fn plan(&self, conflict: &DataConflict) -> Result<(ResolutionStrategy, FieldValues), DeferReason> {
        if conflict.severity >= Severity::High {
            return Err(DeferReason::Severity(conflict.severity));
        }
        if let Some(field) = conflict
            .fields
            .iter()
            .find(|f| self.policy.is_always_user(f.category))
        {
            return Err(DeferReason::AlwaysUserDecision {
                field: field.field.clone(),
            });
        }

        let mut values = FieldValues::new();
        let mut competing = Vec::new();
        let mut local_categories = BTreeSet::new();
        let mut remote_categories = BTreeSet::new();

        for field in &conflict.fields {
            match field.changed_by {
                ChangeSide::Local => {
                    local_categories.insert(field.category);
                    values.insert(field.field.clone(), (field.local.clone(), Provenance::Local));
                }
                ChangeSide::Remote => {
                    remote_categories.insert(field.category);
                    values.insert(
                        field.field.clone(),
                        (field.remote.clone(), Provenance::Remote),
                    );
                }
                ChangeSide::Both => {
                    local_categories.insert(field.category);
                    remote_categories.insert(field.category);
                    let allowed = self
                        .policy
                        .rule_for(&field.field)
                        .map(|rule| rule.allows(field.conflict_type))
                        .unwrap_or(false);
                    match non_competing_merge(field) {
                        Some(merged) if allowed => {
                            values.insert(field.field.clone(), merged);
                        }
                        _ => competing.push(field),
                    }
                }
            }
        }

        if competing.is_empty() {
            let strategy = if categories_disjoint(&local_categories, &remote_categories)
                && !local_categories.is_empty()
                && !remote_categories.is_empty()
            {
                ResolutionStrategy::CategoryMerge
            } else {
                ResolutionStrategy::FieldMerge
            };
            return Ok((strategy, values));
        }

        let undefaulted: Vec<String> = competing
            .iter()
            .filter(|f| self.policy.rule_for(&f.field).is_none())
            .map(|f| f.field.clone())
            .collect();
        if !undefaulted.is_empty() {
            return Err(DeferReason::NoPolicyDefault {
                fields: undefaulted,
            });
        }

        Ok((ResolutionStrategy::LastWriterWins, newer_side(conflict)))
    }
}

type FieldValues = BTreeMap<String, (Option<Value>, Provenance)>;

fn categories_disjoint(a: &BTreeSet<FieldCategory>, b: &BTreeSet<FieldCategory>) -> bool {
    a.is_disjoint(b)
}

/// Merge a field both sides edited when the edits do not compete.
fn non_competing_merge(field: &FieldConflict) -> Option<(Option<Value>, Provenance)> {
    let (local, remote) = (field.local.as_ref(), field.remote.as_ref());
    match field.conflict_type {
        ConflictType::Text => {
            let (l, r) = (local?.as_str()?, remote?.as_str()?);
            if l.contains(r) {
                Some((field.local.clone(), Provenance::Local))
            } else if r.contains(l) {
                Some((field.remote.clone(), Provenance::Remote))
            } else {
                None
            }
        }
        ConflictType::Set => {
            let (l, r) = (local?.as_array()?, remote?.as_array()?);
            if r.iter().all(|v| l.contains(v)) {
                Some((field.local.clone(), Provenance::Local))
            } else if l.iter().all(|v| r.contains(v)) {
                Some((field.remote.clone(), Provenance::Remote))
            } else {
                None
            }
        }
        // Additive: keep whichever side has a value
        ConflictType::Presence => match (local, remote) {
            (Some(v), _) if !v.is_null() => Some((field.local.clone(), Provenance::Local)),
            (_, Some(v)) if !v.is_null() => Some((field.remote.clone(), Provenance::Remote)),
            _ => None,
        },
        ConflictType::Value => None,
    }
}

/// Every conflicting field from the newer record.
///
/// Ties break on the editing device id, then on content, so both peers
/// pick the same winner.
fn newer_side(conflict: &DataConflict) -> FieldValues {
    let local_key = (conflict.local.updated_at, conflict.local.modified_by);
    let remote_key = (conflict.remote.updated_at, conflict.remote.modified_by);
    let remote_wins = match remote_key.cmp(&local_key) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => content_hash(&conflict.remote) > content_hash(&conflict.local),
    };

    conflict
        .fields
        .iter()
        .map(|f| {
            let picked = if remote_wins {
                (f.remote.clone(), Provenance::Remote)
            } else {
                (f.local.clone(), Provenance::Local)
            };
            (f.field.clone(), picked)
        })
        .collect()
}

fn build_resolution(
    conflict: &DataConflict,
    strategy: ResolutionStrategy,
    values: FieldValues,
    now: u64,
    resolved_by: ResolvedBy,
) -> ConflictResolution {
    // Fields both sides agree on are carried over unchanged
    let mut fields: BTreeMap<String, Value> = conflict
        .local
        .fields
        .iter()
        .filter(|(name, _)| !values.contains_key(*name))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let mut provenance = BTreeMap::new();
    for (name, (value, source)) in values {
        if let Some(value) = value {
            fields.insert(name.clone(), value);
        }
        provenance.insert(name, source);
    }

    let merged = Record {
        id: conflict.record_id.clone(),
        data_type: conflict.data_type.clone(),
        fields,
        version: conflict.local.version.max(conflict.remote.version) + 1,
        updated_at: now,
        modified_by: None,
    };

    ConflictResolution {
        record_id: conflict.record_id.clone(),
        strategy,
        content_hash: content_hash(&merged),
        merged,
        provenance,
        resolved_at: now,
        resolved_by,
    }
}
