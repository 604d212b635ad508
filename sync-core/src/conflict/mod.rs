//! Conflict detection and resolution for health records.
//!
//! Records are compared field by field. Each differing field is tagged
//! with a semantic category (which sets the conflict's severity) and a
//! conflict type (text, set, presence, value). The resolver then decides
//! whether the difference can be merged automatically or must wait for a
//! user decision:
//!
//! 1. high/critical severity never auto-resolves
//! 2. always-user-decision categories never auto-resolve
//! 3. edits made by only one side are taken as-is
//! 4. edits by both sides merge only if policy allows the field and type
//!    and the change is non-competing (substring or subset)
//! 5. disjoint categories on each side merge by category
//! 6. leftover competing fields fall back to the newer record when every
//!    such field has a policy rule, and defer to the user otherwise
//!
//! The rules are a tunable [`ConflictPolicy`], not a correctness guarantee.

mod history;
mod policy;
mod resolver;

pub use history::{content_hash, ResolutionHistory};
pub use policy::{ConflictPolicy, FieldRule};
pub use resolver::{ConflictResolver, DeferReason, Deferred, FieldChoice, ResolutionBatch};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use vitalsync_types::{DeviceId, ErrorClass};

/// Conflict engine errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConflictError {
    /// Local and remote are different records.
    #[error("record id mismatch: {local} vs {remote}")]
    RecordMismatch {
        /// Local id.
        local: String,
        /// Remote id.
        remote: String,
    },

    /// Records share an id but not a data type.
    #[error("data type mismatch for record {0}")]
    DataTypeMismatch(String),

    /// Resolution already present in history.
    #[error("resolution {0} already recorded")]
    Duplicate(String),

    /// User choice missing for a conflicting field.
    #[error("no choice given for field {0}")]
    MissingChoice(String),

    /// Choice names a field that is not in conflict.
    #[error("field {0} is not in conflict")]
    UnknownField(String),
}

impl ConflictError {
    /// Classification for retry decisions.
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Data
    }
}

/// A versioned record the engine compares.
///
/// Only decrypted records reach this module; nothing here is logged or
/// persisted outside the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Stable record id.
    pub id: String,
    /// Logical data type, e.g. "daily_log".
    pub data_type: String,
    /// Field values.
    pub fields: BTreeMap<String, Value>,
    /// Monotonic version.
    pub version: u64,
    /// Unix seconds of the last edit.
    pub updated_at: u64,
    /// Device that made the last edit.
    pub modified_by: Option<DeviceId>,
}

impl Record {
    /// Create an empty record at version 1.
    pub fn new(id: impl Into<String>, data_type: impl Into<String>, updated_at: u64) -> Self {
        Self {
            id: id.into(),
            data_type: data_type.into(),
            fields: BTreeMap::new(),
            version: 1,
            updated_at,
            modified_by: None,
        }
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }
}

/// Semantic grouping of fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldCategory {
    /// Raw vital signs and measurements.
    HealthObservation,
    /// Medication and dosing.
    Medication,
    /// Mood, energy and stress.
    Mood,
    /// Exercise and activities.
    Activity,
    /// Free-text notes.
    Notes,
    /// Labels.
    Tags,
    /// Anything unmapped.
    Other,
}

impl FieldCategory {
    /// Severity of a conflict in this category.
    pub fn severity(self) -> Severity {
        match self {
            FieldCategory::HealthObservation => Severity::Critical,
            FieldCategory::Medication => Severity::High,
            FieldCategory::Mood | FieldCategory::Activity => Severity::Medium,
            FieldCategory::Notes | FieldCategory::Tags | FieldCategory::Other => Severity::Low,
        }
    }
}

/// How serious a conflict is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Cosmetic.
    Low,
    /// Worth a look.
    Medium,
    /// Treatment-relevant.
    High,
    /// Clinical data.
    Critical,
}

/// Shape of a field difference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Both sides hold text.
    Text,
    /// Both sides hold arrays.
    Set,
    /// One side has no value.
    Presence,
    /// Any other value change.
    Value,
}

impl ConflictType {
    /// Classify a pair of values.
    pub fn of(local: Option<&Value>, remote: Option<&Value>) -> Self {
        match (local, remote) {
            (None, _) | (_, None) | (Some(Value::Null), _) | (_, Some(Value::Null)) => {
                ConflictType::Presence
            }
            (Some(Value::String(_)), Some(Value::String(_))) => ConflictType::Text,
            (Some(Value::Array(_)), Some(Value::Array(_))) => ConflictType::Set,
            _ => ConflictType::Value,
        }
    }
}

/// Which side changed a field relative to the common base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeSide {
    /// Only this device.
    Local,
    /// Only the peer.
    Remote,
    /// Both, or unknown because there is no base.
    Both,
}

/// One differing field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConflict {
    /// Field name.
    pub field: String,
    /// Semantic category.
    pub category: FieldCategory,
    /// Shape of the difference.
    pub conflict_type: ConflictType,
    /// Who changed it.
    pub changed_by: ChangeSide,
    /// Local value.
    pub local: Option<Value>,
    /// Remote value.
    pub remote: Option<Value>,
}

/// Two versions of a record that disagree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConflict {
    /// Record id.
    pub record_id: String,
    /// Logical data type.
    pub data_type: String,
    /// Differing fields, sorted by name.
    pub fields: Vec<FieldConflict>,
    /// Local version.
    pub local: Record,
    /// Remote version.
    pub remote: Record,
    /// Last version both sides agreed on, if known.
    pub base: Option<Record>,
    /// Highest field severity.
    pub severity: Severity,
    /// Whether the resolver would merge this without a user.
    pub auto_resolvable: bool,
}

impl DataConflict {
    /// Names of the differing fields.
    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.field.as_str()).collect()
    }
}

/// Where a merged field value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    /// Local value kept.
    Local,
    /// Remote value taken.
    Remote,
    /// Combined or user-supplied value.
    Merged,
}

/// How a conflict was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Each side's changes came from disjoint categories.
    CategoryMerge,
    /// Every field merged on its own (one-sided or non-competing).
    FieldMerge,
    /// Whole record taken from the newer side.
    LastWriterWins,
    /// User picked per field.
    UserChoice,
}

/// Who settled a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolvedBy {
    /// The resolver.
    Automatic,
    /// A person.
    User,
}

/// Immutable outcome of resolving a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictResolution {
    /// Record id.
    pub record_id: String,
    /// Strategy used.
    pub strategy: ResolutionStrategy,
    /// Merged record, version bumped past both inputs.
    pub merged: Record,
    /// Source of each conflicting field.
    pub provenance: BTreeMap<String, Provenance>,
    /// Unix seconds.
    pub resolved_at: u64,
    /// Automatic or user.
    pub resolved_by: ResolvedBy,
    /// SHA-256 over the merged content, hex.
    pub content_hash: String,
}
