//! Operator mapping configuration for reference entity types.
//!
//! The document is keyed by entity type, then by source id (as a string,
//! because it is a JSON object key). Each entry is a [`Decision`]: either
//! create a new target record from the entry's fields, or map onto an
//! existing target record by id.
//!
//! ```json
//! {
//!   "users": {
//!     "12": { "action": "map", "mappedTo": 5 },
//!     "13": { "action": "create", "name": "Ada", "email": "ada@example.com" }
//!   },
//!   "statuses": {
//!     "1": { "action": "create", "name": "Passed", "isSuccess": true }
//!   }
//! }
//! ```
//!
//! The resolver rewrites decisions in place (a `create` becomes a `map` once
//! the record exists), which is what makes a retried resolve idempotent.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::EntityKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Map,
}

/// One create-or-map decision for a source record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision<F> {
    pub action: Action,
    #[serde(
        rename = "mappedTo",
        alias = "mapped_to",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub mapped_to: Option<i64>,
    #[serde(flatten)]
    pub fields: F,
}

impl<F> Decision<F> {
    pub fn create(fields: F) -> Self {
        Self {
            action: Action::Create,
            mapped_to: None,
            fields,
        }
    }

    pub fn map(target_id: i64, fields: F) -> Self {
        Self {
            action: Action::Map,
            mapped_to: Some(target_id),
            fields,
        }
    }
}

/// Decisions for one entity type, keyed by source id.
pub type Decisions<F> = BTreeMap<String, Decision<F>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Target role id chosen by the operator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_id: Option<i64>,
    /// Source role id from the export, used when no target role was chosen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_role_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_default: Option<bool>,
}

/// Fields for reference types that are identified by name alone
/// (groups, configurations, tags).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NameFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_failure: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_completed: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MilestoneTypeFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_default: Option<bool>,
}

/// The full operator-supplied decision table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingConfiguration {
    #[serde(default)]
    pub roles: Decisions<RoleFields>,
    #[serde(default)]
    pub users: Decisions<UserFields>,
    #[serde(default)]
    pub groups: Decisions<NameFields>,
    #[serde(default)]
    pub statuses: Decisions<StatusFields>,
    #[serde(default)]
    pub workflows: Decisions<WorkflowFields>,
    #[serde(default)]
    pub milestone_types: Decisions<MilestoneTypeFields>,
    #[serde(default)]
    pub configurations: Decisions<NameFields>,
    #[serde(default)]
    pub tags: Decisions<NameFields>,
}

impl MappingConfiguration {
    /// Overlay operator decisions on top of this (seeded) configuration.
    /// Operator entries replace seeded ones wholesale.
    pub fn apply_overrides(&mut self, overrides: MappingConfiguration) {
        self.roles.extend(overrides.roles);
        self.users.extend(overrides.users);
        self.groups.extend(overrides.groups);
        self.statuses.extend(overrides.statuses);
        self.workflows.extend(overrides.workflows);
        self.milestone_types.extend(overrides.milestone_types);
        self.configurations.extend(overrides.configurations);
        self.tags.extend(overrides.tags);
    }

    /// Number of decisions recorded for a reference entity type.
    pub fn decision_count(&self, kind: EntityKind) -> usize {
        match kind {
            EntityKind::Role => self.roles.len(),
            EntityKind::User => self.users.len(),
            EntityKind::Group => self.groups.len(),
            EntityKind::Status => self.statuses.len(),
            EntityKind::Workflow => self.workflows.len(),
            EntityKind::MilestoneType => self.milestone_types.len(),
            EntityKind::Configuration => self.configurations.len(),
            EntityKind::Tag => self.tags.len(),
            _ => 0,
        }
    }
}

/// Insert a `create` decision unless the source id already has one.
pub fn seed_create<F>(decisions: &mut Decisions<F>, source_id: i64, fields: F) {
    decisions
        .entry(source_id.to_string())
        .or_insert_with(|| Decision::create(fields));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_operator_document() {
        let doc = json!({
            "users": {
                "12": {"action": "map", "mappedTo": 5},
                "13": {"action": "create", "name": "Ada", "email": "ada@example.com"}
            },
            "statuses": {
                "1": {"action": "create", "name": "Passed", "isSuccess": true}
            }
        });
        let cfg: MappingConfiguration = serde_json::from_value(doc).unwrap();
        assert_eq!(cfg.users["12"].action, Action::Map);
        assert_eq!(cfg.users["12"].mapped_to, Some(5));
        assert_eq!(cfg.users["13"].fields.email.as_deref(), Some("ada@example.com"));
        assert_eq!(cfg.statuses["1"].fields.is_success, Some(true));
        assert!(cfg.roles.is_empty());
    }

    #[test]
    fn serializes_mapped_to_in_camel_case() {
        let d = Decision::map(9, NameFields { name: Some("smoke".into()) });
        let v = serde_json::to_value(&d).unwrap();
        assert_eq!(v, json!({"action": "map", "mappedTo": 9, "name": "smoke"}));
    }

    #[test]
    fn overrides_win_over_seeded_decisions() {
        let mut seeded = MappingConfiguration::default();
        seed_create(&mut seeded.tags, 1, NameFields { name: Some("a".into()) });
        seed_create(&mut seeded.tags, 2, NameFields { name: Some("b".into()) });
        // Seeding never clobbers an existing decision.
        seed_create(&mut seeded.tags, 1, NameFields { name: Some("zzz".into()) });
        assert_eq!(seeded.tags["1"].fields.name.as_deref(), Some("a"));

        let mut operator = MappingConfiguration::default();
        operator
            .tags
            .insert("2".into(), Decision::map(77, NameFields::default()));
        seeded.apply_overrides(operator);

        assert_eq!(seeded.tags["1"].action, Action::Create);
        assert_eq!(seeded.tags["2"].mapped_to, Some(77));
        assert_eq!(seeded.decision_count(EntityKind::Tag), 2);
    }
}
