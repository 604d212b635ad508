//! Tunable conflict policy

use std::collections::{HashMap, HashSet};

use super::{ConflictType, FieldCategory};

/// Auto-merge rule for one field.
///
/// A field with a rule has a policy default: if its edits compete, the
/// whole record may fall back to the newer side. A field without one
/// always defers to the user.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FieldRule {
    /// Conflict types the field may merge automatically.
    pub allowed: HashSet<ConflictType>,
}

impl FieldRule {
    /// Rule allowing the given types.
    pub fn allowing(types: &[ConflictType]) -> Self {
        Self {
            allowed: types.iter().copied().collect(),
        }
    }

    /// Whether a conflict of this type may auto-merge.
    pub fn allows(&self, conflict_type: ConflictType) -> bool {
        self.allowed.contains(&conflict_type)
    }
}

/// Field categories, per-field rules and always-user categories.
#[derive(Debug, Clone)]
pub struct ConflictPolicy {
    categories: HashMap<String, FieldCategory>,
    rules: HashMap<String, FieldRule>,
    always_user: HashSet<FieldCategory>,
}

impl ConflictPolicy {
    /// A policy with no mappings and no rules.
    ///
    /// Every field is `Other` and every competing edit defers to the user.
    pub fn empty() -> Self {
        Self {
            categories: HashMap::new(),
            rules: HashMap::new(),
            always_user: HashSet::new(),
        }
    }

    /// Map a field name to a category.
    pub fn with_category(mut self, field: impl Into<String>, category: FieldCategory) -> Self {
        self.categories.insert(field.into(), category);
        self
    }

    /// Allow a field to auto-merge for the given conflict types.
    pub fn with_rule(mut self, field: impl Into<String>, rule: FieldRule) -> Self {
        self.rules.insert(field.into(), rule);
        self
    }

    /// Mark a category as always needing a user decision.
    pub fn with_always_user(mut self, category: FieldCategory) -> Self {
        self.always_user.insert(category);
        self
    }

    /// Category of a field, `Other` when unmapped.
    pub fn category_of(&self, field: &str) -> FieldCategory {
        self.categories
            .get(field)
            .copied()
            .unwrap_or(FieldCategory::Other)
    }

    /// Rule for a field, if any.
    pub fn rule_for(&self, field: &str) -> Option<&FieldRule> {
        self.rules.get(field)
    }

    /// Whether the category is always a user decision.
    pub fn is_always_user(&self, category: FieldCategory) -> bool {
        self.always_user.contains(&category)
    }
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        let mut policy = Self::empty()
            .with_always_user(FieldCategory::HealthObservation)
            .with_always_user(FieldCategory::Medication);

        for field in [
            "heart_rate",
            "blood_pressure",
            "blood_glucose",
            "temperature",
            "weight",
            "oxygen_saturation",
            "symptoms",
        ] {
            policy = policy.with_category(field, FieldCategory::HealthObservation);
        }
        for field in ["medication", "medications", "dosage"] {
            policy = policy.with_category(field, FieldCategory::Medication);
        }
        for field in ["mood", "energy", "stress", "anxiety"] {
            policy = policy
                .with_category(field, FieldCategory::Mood)
                .with_rule(field, FieldRule::allowing(&[ConflictType::Presence]));
        }
        for field in ["activities", "exercise", "steps", "sleep_hours"] {
            policy = policy
                .with_category(field, FieldCategory::Activity)
                .with_rule(
                    field,
                    FieldRule::allowing(&[ConflictType::Set, ConflictType::Presence]),
                );
        }
        policy = policy
            .with_category("notes", FieldCategory::Notes)
            .with_rule(
                "notes",
                FieldRule::allowing(&[ConflictType::Text, ConflictType::Presence]),
            )
            .with_category("tags", FieldCategory::Tags)
            .with_rule(
                "tags",
                FieldRule::allowing(&[ConflictType::Set, ConflictType::Presence]),
            );
        policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmapped_fields_are_other() {
        let policy = ConflictPolicy::default();
        assert_eq!(policy.category_of("favourite_colour"), FieldCategory::Other);
        assert!(policy.rule_for("favourite_colour").is_none());
    }

    #[test]
    fn default_policy_guards_clinical_fields() {
        let policy = ConflictPolicy::default();
        assert!(policy.is_always_user(policy.category_of("heart_rate")));
        assert!(policy.is_always_user(policy.category_of("dosage")));
        assert!(!policy.is_always_user(policy.category_of("mood")));
        assert!(policy.rule_for("heart_rate").is_none());
    }

    #[test]
    fn default_policy_allows_additive_notes_and_tags() {
        let policy = ConflictPolicy::default();
        assert!(policy.rule_for("notes").unwrap().allows(ConflictType::Text));
        assert!(policy.rule_for("tags").unwrap().allows(ConflictType::Set));
        assert!(!policy.rule_for("mood").unwrap().allows(ConflictType::Value));
    }
}
