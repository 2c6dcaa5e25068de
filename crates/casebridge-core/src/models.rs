//! Core data models shared by the analyzer, staging store and importer.
//!
//! These types describe the import job lifecycle, the entity types the
//! importer knows about, per-entity progress counters, and the staged
//! representation of source rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of an import job.
///
/// `PENDING → ANALYZING → READY → RUNNING → COMPLETED | FAILED | CANCELED`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Analyzing,
    /// Analysis finished; waiting for the operator's mapping configuration.
    Ready,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Analyzing => "ANALYZING",
            JobStatus::Ready => "READY",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Canceled => "CANCELED",
        }
    }

    /// Terminal jobs are never picked up again by `analyze` or `import`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "PENDING" => JobStatus::Pending,
            "ANALYZING" => JobStatus::Analyzing,
            "READY" => JobStatus::Ready,
            "RUNNING" => JobStatus::Running,
            "COMPLETED" => JobStatus::Completed,
            "FAILED" => JobStatus::Failed,
            "CANCELED" => JobStatus::Canceled,
            other => anyhow::bail!("unknown job status '{}'", other),
        })
    }
}

/// Every entity type the pipeline imports, reference types first.
///
/// The declaration order of the content types is the dependency order the
/// importer runs them in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    // Reference entities, resolved from the mapping configuration.
    Role,
    User,
    Group,
    Status,
    Workflow,
    MilestoneType,
    Configuration,
    Tag,
    // Organizational containers.
    Project,
    ProjectMember,
    Milestone,
    Repository,
    RepositoryFolder,
    // Content.
    CustomField,
    FieldOption,
    RepositoryCase,
    CaseStep,
    CaseFieldValue,
    Session,
    SessionResult,
    AutomationCase,
    // Execution.
    TestRun,
    RunCase,
    RunResult,
    RunResultStep,
    AutomationRun,
    AutomationResult,
    // Cross-links.
    TagLink,
    Issue,
    IssueLink,
    EntityLink,
    CaseLink,
}

impl EntityKind {
    pub const REFERENCE: [EntityKind; 8] = [
        EntityKind::Role,
        EntityKind::User,
        EntityKind::Group,
        EntityKind::Status,
        EntityKind::Workflow,
        EntityKind::MilestoneType,
        EntityKind::Configuration,
        EntityKind::Tag,
    ];

    pub const ALL: [EntityKind; 32] = [
        EntityKind::Role,
        EntityKind::User,
        EntityKind::Group,
        EntityKind::Status,
        EntityKind::Workflow,
        EntityKind::MilestoneType,
        EntityKind::Configuration,
        EntityKind::Tag,
        EntityKind::Project,
        EntityKind::ProjectMember,
        EntityKind::Milestone,
        EntityKind::Repository,
        EntityKind::RepositoryFolder,
        EntityKind::CustomField,
        EntityKind::FieldOption,
        EntityKind::RepositoryCase,
        EntityKind::CaseStep,
        EntityKind::CaseFieldValue,
        EntityKind::Session,
        EntityKind::SessionResult,
        EntityKind::AutomationCase,
        EntityKind::TestRun,
        EntityKind::RunCase,
        EntityKind::RunResult,
        EntityKind::RunResultStep,
        EntityKind::AutomationRun,
        EntityKind::AutomationResult,
        EntityKind::TagLink,
        EntityKind::Issue,
        EntityKind::IssueLink,
        EntityKind::EntityLink,
        EntityKind::CaseLink,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Role => "role",
            EntityKind::User => "user",
            EntityKind::Group => "group",
            EntityKind::Status => "status",
            EntityKind::Workflow => "workflow",
            EntityKind::MilestoneType => "milestone_type",
            EntityKind::Configuration => "configuration",
            EntityKind::Tag => "tag",
            EntityKind::Project => "project",
            EntityKind::ProjectMember => "project_member",
            EntityKind::Milestone => "milestone",
            EntityKind::Repository => "repository",
            EntityKind::RepositoryFolder => "repository_folder",
            EntityKind::CustomField => "custom_field",
            EntityKind::FieldOption => "field_option",
            EntityKind::RepositoryCase => "repository_case",
            EntityKind::CaseStep => "case_step",
            EntityKind::CaseFieldValue => "case_field_value",
            EntityKind::Session => "session",
            EntityKind::SessionResult => "session_result",
            EntityKind::AutomationCase => "automation_case",
            EntityKind::TestRun => "test_run",
            EntityKind::RunCase => "run_case",
            EntityKind::RunResult => "run_result",
            EntityKind::RunResultStep => "run_result_step",
            EntityKind::AutomationRun => "automation_run",
            EntityKind::AutomationResult => "automation_result",
            EntityKind::TagLink => "tag_link",
            EntityKind::Issue => "issue",
            EntityKind::IssueLink => "issue_link",
            EntityKind::EntityLink => "entity_link",
            EntityKind::CaseLink => "case_link",
        }
    }

    pub fn is_reference(&self) -> bool {
        Self::REFERENCE.contains(self)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown entity type '{}'", s))
    }
}

/// Per-entity counters.
///
/// `created` counts inserted target records, `mapped` counts reused ones.
/// `created + mapped <= total` holds at all times; skipped rows are removed
/// from `total` so the final numbers add up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityProgress {
    pub total: u64,
    pub created: u64,
    pub mapped: u64,
    #[serde(default)]
    pub skipped: u64,
}

impl EntityProgress {
    pub fn processed(&self) -> u64 {
        self.created + self.mapped
    }

    pub fn remaining(&self) -> u64 {
        self.total.saturating_sub(self.processed())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityLevel {
    Info,
    Warning,
    Error,
}

/// One entry of a job's activity log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub at: DateTime<Utc>,
    pub level: ActivityLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<EntityKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<EntityProgress>,
}

impl ActivityEntry {
    pub fn info(message: impl Into<String>) -> Self {
        Self::new(ActivityLevel::Info, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(ActivityLevel::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(ActivityLevel::Error, message)
    }

    fn new(level: ActivityLevel, message: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            level,
            message: message.into(),
            entity: None,
            summary: None,
        }
    }

    pub fn with_summary(mut self, entity: EntityKind, summary: EntityProgress) -> Self {
        self.entity = Some(entity);
        self.summary = Some(summary);
        self
    }
}

/// JSON value kinds recorded in a dataset's inferred schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsonKind {
    Null,
    Bool,
    Integer,
    Float,
    String,
    Array,
    Object,
}

impl JsonKind {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => JsonKind::Null,
            Value::Bool(_) => JsonKind::Bool,
            Value::Number(n) if n.is_i64() || n.is_u64() => JsonKind::Integer,
            Value::Number(_) => JsonKind::Float,
            Value::String(_) => JsonKind::String,
            Value::Array(_) => JsonKind::Array,
            Value::Object(_) => JsonKind::Object,
        }
    }
}

/// A named record collection discovered in a bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub name: String,
    pub row_count: u64,
    pub schema: BTreeMap<String, BTreeSet<JsonKind>>,
    pub sample: Vec<Value>,
}

impl Dataset {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            row_count: 0,
            schema: BTreeMap::new(),
            sample: Vec::new(),
        }
    }

    /// Fold one row into the row count, schema and sample.
    pub fn observe(&mut self, row: &Value, sample_rows: usize) {
        self.row_count += 1;
        if let Value::Object(map) = row {
            for (field, value) in map {
                self.schema
                    .entry(field.clone())
                    .or_default()
                    .insert(JsonKind::of(value));
            }
        }
        if self.sample.len() < sample_rows {
            self.sample.push(row.clone());
        }
    }
}

/// One staged source row.
///
/// `source_id`, `project_id` and `name` are copied out of the payload at
/// staging time so listings and lookups don't need to decode it again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedRow {
    pub row_index: u64,
    pub source_id: Option<i64>,
    pub project_id: Option<i64>,
    pub name: Option<String>,
    pub payload: Value,
}

impl StagedRow {
    pub fn from_payload(row_index: u64, payload: Value) -> Self {
        let source_id = payload.get("id").and_then(value_as_i64);
        let project_id = payload.get("project_id").and_then(value_as_i64);
        let name = payload
            .get("name")
            .and_then(Value::as_str)
            .map(|s| s.to_string());
        Self {
            row_index,
            source_id,
            project_id,
            name,
            payload,
        }
    }
}

/// Integer ids show up both as numbers and as numeric strings in exports.
pub fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entity_kind_round_trips_through_str() {
        for kind in EntityKind::ALL {
            assert_eq!(kind.as_str().parse::<EntityKind>().unwrap(), kind);
        }
        assert!("nope".parse::<EntityKind>().is_err());
    }

    #[test]
    fn all_is_sorted_in_dependency_order() {
        let mut sorted = EntityKind::ALL;
        sorted.sort();
        assert_eq!(sorted, EntityKind::ALL);
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Canceled.is_terminal());
        assert!(!JobStatus::Ready.is_terminal());
        assert_eq!("RUNNING".parse::<JobStatus>().unwrap(), JobStatus::Running);
    }

    #[test]
    fn staged_row_denormalizes_payload() {
        let row = StagedRow::from_payload(
            7,
            json!({"id": "42", "project_id": 3, "name": "Login works"}),
        );
        assert_eq!(row.row_index, 7);
        assert_eq!(row.source_id, Some(42));
        assert_eq!(row.project_id, Some(3));
        assert_eq!(row.name.as_deref(), Some("Login works"));
    }

    #[test]
    fn dataset_observe_infers_schema_and_sample() {
        let mut ds = Dataset::new("runs");
        ds.observe(&json!({"id": 1, "note": null}), 1);
        ds.observe(&json!({"id": 2, "note": "x", "elapsed": 1.5}), 1);
        assert_eq!(ds.row_count, 2);
        assert_eq!(ds.sample.len(), 1);
        let note = &ds.schema["note"];
        assert!(note.contains(&JsonKind::Null) && note.contains(&JsonKind::String));
        assert!(ds.schema["elapsed"].contains(&JsonKind::Float));
    }
}
