//! Append-only resolution history.

use sha2::{Digest, Sha256};
use std::collections::HashSet;

use super::{ConflictError, ConflictResolution, Record};

/// Deterministic SHA-256 over a merged record's identity and content.
///
/// `updated_at` and `modified_by` are excluded so that two devices
/// resolving the same conflict produce the same hash.
pub fn content_hash(record: &Record) -> String {
    let mut hasher = Sha256::new();
    hasher.update(record.id.as_bytes());
    hasher.update([0u8]);
    hasher.update(record.data_type.as_bytes());
    hasher.update([0u8]);
    hasher.update(record.version.to_be_bytes());
    for (name, value) in &record.fields {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(value.to_string().as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Every resolution applied on this device, in order.
#[derive(Debug, Default)]
pub struct ResolutionHistory {
    entries: Vec<ConflictResolution>,
    hashes: HashSet<String>,
}

impl ResolutionHistory {
    /// Create an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a resolution, rejecting one already recorded.
    pub fn record(&mut self, resolution: ConflictResolution) -> Result<(), ConflictError> {
        if !self.hashes.insert(resolution.content_hash.clone()) {
            return Err(ConflictError::Duplicate(resolution.content_hash));
        }
        self.entries.push(resolution);
        Ok(())
    }

    /// Whether a resolution with this hash exists.
    pub fn contains(&self, content_hash: &str) -> bool {
        self.hashes.contains(content_hash)
    }

    /// Resolutions for one record, oldest first.
    pub fn for_record<'a>(
        &'a self,
        record_id: &'a str,
    ) -> impl Iterator<Item = &'a ConflictResolution> + 'a {
        self.entries.iter().filter(move |r| r.record_id == record_id)
    }

    /// All entries, oldest first.
    pub fn entries(&self) -> &[ConflictResolution] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
