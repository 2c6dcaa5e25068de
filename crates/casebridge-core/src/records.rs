//! Typed source records, one struct per staged dataset.
//!
//! Transformers decode each staged payload into its record type exactly
//! once. A payload that does not decode is a per-row data problem: the row
//! is skipped with a warning and never aborts the job.
//!
//! Export files are loose about types (ids as strings, booleans as `0`/`1`,
//! several timestamp layouts), so the field deserializers in [`flex`] accept
//! every shape seen in the wild.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

/// Dataset names as they appear in the export bundle.
pub mod datasets {
    pub const USERS: &str = "users";
    pub const ROLES: &str = "roles";
    pub const GROUPS: &str = "groups";
    pub const STATUSES: &str = "statuses";
    pub const WORKFLOWS: &str = "workflows";
    pub const MILESTONE_TYPES: &str = "milestone_types";
    pub const CONFIGURATIONS: &str = "configurations";
    pub const TAGS: &str = "tags";

    pub const PROJECTS: &str = "projects";
    pub const PROJECT_USERS: &str = "project_users";
    pub const MILESTONES: &str = "milestones";
    pub const REPOSITORIES: &str = "repositories";
    pub const REPOSITORY_FOLDERS: &str = "repository_folders";
    pub const FIELDS: &str = "fields";
    pub const FIELD_OPTIONS: &str = "field_options";
    pub const REPOSITORY_CASES: &str = "repository_cases";
    pub const REPOSITORY_CASE_STEPS: &str = "repository_case_steps";
    pub const REPOSITORY_CASE_VALUES: &str = "repository_case_values";
    pub const SESSIONS: &str = "sessions";
    pub const SESSION_RESULTS: &str = "session_results";
    pub const AUTOMATION_CASES: &str = "automation_cases";
    pub const RUNS: &str = "runs";
    pub const RUN_TESTS: &str = "run_tests";
    pub const RUN_RESULTS: &str = "run_results";
    pub const RUN_RESULT_STEPS: &str = "run_result_steps";
    pub const AUTOMATION_RUNS: &str = "automation_runs";
    pub const AUTOMATION_RUN_TESTS: &str = "automation_run_tests";
    pub const REPOSITORY_CASE_TAGS: &str = "repository_case_tags";
    pub const RUN_TAGS: &str = "run_tags";
    pub const SESSION_TAGS: &str = "session_tags";
    pub const ISSUES: &str = "issues";
    pub const ISSUE_LINKS: &str = "issue_links";
    pub const LINKS: &str = "links";
    pub const REPOSITORY_CASE_LINKS: &str = "repository_case_links";
}

/// Lenient field deserializers for export payloads.
pub mod flex {
    use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    use crate::models::value_as_i64;

    pub fn id<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
        let v = Value::deserialize(d)?;
        value_as_i64(&v).ok_or_else(|| D::Error::custom(format!("expected an integer id, got {}", v)))
    }

    pub fn opt_id<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
        let v = Value::deserialize(d)?;
        match v {
            Value::Null => Ok(None),
            Value::String(ref s) if s.trim().is_empty() => Ok(None),
            other => value_as_i64(&other)
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("expected an integer id, got {}", other))),
        }
    }

    pub fn bool<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        let v = Value::deserialize(d)?;
        Ok(match v {
            Value::Bool(b) => b,
            Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
            Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
            _ => false,
        })
    }

    pub fn opt_datetime<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        let v = Value::deserialize(d)?;
        match v {
            Value::Null => Ok(None),
            Value::Number(n) => {
                let secs = n
                    .as_i64()
                    .ok_or_else(|| D::Error::custom("timestamp out of range"))?;
                Utc.timestamp_opt(secs, 0)
                    .single()
                    .map(Some)
                    .ok_or_else(|| D::Error::custom(format!("invalid unix timestamp {}", secs)))
            }
            Value::String(s) if s.trim().is_empty() => Ok(None),
            Value::String(s) => parse_datetime(&s)
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("unrecognized timestamp '{}'", s))),
            other => Err(D::Error::custom(format!("expected a timestamp, got {}", other))),
        }
    }

    pub fn opt_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        let v = Value::deserialize(d)?;
        match v {
            Value::Null => Ok(None),
            Value::Number(n) => Ok(n.as_f64()),
            Value::String(s) if s.trim().is_empty() => Ok(None),
            Value::String(s) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| D::Error::custom(format!("expected a number, got '{}'", s))),
            other => Err(D::Error::custom(format!("expected a number, got {}", other))),
        }
    }

    pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
        let s = s.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Some(dt.with_timezone(&Utc));
        }
        for layout in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, layout) {
                return Some(naive.and_utc());
            }
        }
        None
    }
}

// ── Reference datasets ──────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct UserRecord {
    #[serde(deserialize_with = "flex::id")]
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default = "default_true", deserialize_with = "flex::bool")]
    pub is_active: bool,
    #[serde(default, deserialize_with = "flex::opt_id")]
    pub role_id: Option<i64>,
}

/// Reference rows that only carry a name (roles, groups, configurations, tags).
#[derive(Debug, Clone, Deserialize)]
pub struct NamedRecord {
    #[serde(deserialize_with = "flex::id")]
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusRecord {
    #[serde(deserialize_with = "flex::id")]
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub system_name: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default, deserialize_with = "flex::bool")]
    pub is_success: bool,
    #[serde(default, deserialize_with = "flex::bool")]
    pub is_failure: bool,
    #[serde(default, deserialize_with = "flex::bool")]
    pub is_completed: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowRecord {
    #[serde(deserialize_with = "flex::id")]
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MilestoneTypeRecord {
    #[serde(deserialize_with = "flex::id")]
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
}

// ── Containers ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectRecord {
    #[serde(deserialize_with = "flex::id")]
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub note: Option<Value>,
    #[serde(default, deserialize_with = "flex::bool")]
    pub is_completed: bool,
    #[serde(default, deserialize_with = "flex::opt_datetime")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "flex::opt_id")]
    pub created_by: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectMemberRecord {
    #[serde(deserialize_with = "flex::id")]
    pub project_id: i64,
    #[serde(deserialize_with = "flex::id")]
    pub user_id: i64,
    #[serde(default, deserialize_with = "flex::opt_id")]
    pub role_id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MilestoneRecord {
    #[serde(deserialize_with = "flex::id")]
    pub id: i64,
    #[serde(deserialize_with = "flex::id")]
    pub project_id: i64,
    #[serde(default, deserialize_with = "flex::opt_id")]
    pub parent_id: Option<i64>,
    #[serde(default, deserialize_with = "flex::opt_id")]
    pub type_id: Option<i64>,
    pub name: String,
    #[serde(default)]
    pub note: Option<Value>,
    #[serde(default, deserialize_with = "flex::bool")]
    pub is_completed: bool,
    #[serde(default, deserialize_with = "flex::opt_datetime")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "flex::opt_datetime")]
    pub due_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "flex::opt_datetime")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "flex::opt_id")]
    pub created_by: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryRecord {
    #[serde(deserialize_with = "flex::id")]
    pub id: i64,
    #[serde(deserialize_with = "flex::id")]
    pub project_id: i64,
    #[serde(default, deserialize_with = "flex::bool")]
    pub is_master: bool,
    #[serde(default, deserialize_with = "flex::bool")]
    pub is_snapshot: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FolderRecord {
    #[serde(deserialize_with = "flex::id")]
    pub id: i64,
    #[serde(deserialize_with = "flex::id")]
    pub project_id: i64,
    #[serde(deserialize_with = "flex::id")]
    pub repo_id: i64,
    #[serde(default, deserialize_with = "flex::opt_id")]
    pub parent_id: Option<i64>,
    pub name: String,
    #[serde(default)]
    pub docs: Option<Value>,
    #[serde(default)]
    pub display_order: i64,
}

// ── Content ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct FieldRecord {
    #[serde(deserialize_with = "flex::id")]
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub system_name: Option<String>,
    #[serde(rename = "type", default = "default_field_type")]
    pub field_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldOptionRecord {
    #[serde(deserialize_with = "flex::id")]
    pub id: i64,
    #[serde(deserialize_with = "flex::id")]
    pub field_id: i64,
    pub name: String,
    #[serde(default, deserialize_with = "flex::bool")]
    pub is_default: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaseRecord {
    #[serde(deserialize_with = "flex::id")]
    pub id: i64,
    #[serde(deserialize_with = "flex::id")]
    pub project_id: i64,
    #[serde(deserialize_with = "flex::id")]
    pub repo_id: i64,
    #[serde(default, deserialize_with = "flex::opt_id")]
    pub folder_id: Option<i64>,
    pub name: String,
    #[serde(default, deserialize_with = "flex::opt_id")]
    pub state_id: Option<i64>,
    #[serde(default, deserialize_with = "flex::opt_f64")]
    pub estimate: Option<f64>,
    #[serde(default, deserialize_with = "flex::bool")]
    pub is_automated: bool,
    #[serde(default)]
    pub description: Option<Value>,
    #[serde(default, deserialize_with = "flex::opt_datetime")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "flex::opt_id")]
    pub created_by: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaseStepRecord {
    #[serde(deserialize_with = "flex::id")]
    pub id: i64,
    #[serde(deserialize_with = "flex::id")]
    pub case_id: i64,
    #[serde(default)]
    pub display_order: i64,
    #[serde(default)]
    pub step: Option<Value>,
    #[serde(default)]
    pub expected: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaseValueRecord {
    #[serde(deserialize_with = "flex::id")]
    pub case_id: i64,
    #[serde(deserialize_with = "flex::id")]
    pub field_id: i64,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionRecord {
    #[serde(deserialize_with = "flex::id")]
    pub id: i64,
    #[serde(deserialize_with = "flex::id")]
    pub project_id: i64,
    #[serde(default, deserialize_with = "flex::opt_id")]
    pub milestone_id: Option<i64>,
    #[serde(default, deserialize_with = "flex::opt_id")]
    pub config_id: Option<i64>,
    #[serde(default, deserialize_with = "flex::opt_id")]
    pub state_id: Option<i64>,
    pub name: String,
    #[serde(default)]
    pub note: Option<Value>,
    #[serde(default, deserialize_with = "flex::opt_id")]
    pub assignee_id: Option<i64>,
    #[serde(default, deserialize_with = "flex::opt_f64")]
    pub estimate: Option<f64>,
    #[serde(default, deserialize_with = "flex::opt_f64")]
    pub elapsed: Option<f64>,
    #[serde(default, deserialize_with = "flex::bool")]
    pub is_completed: bool,
    #[serde(default, deserialize_with = "flex::opt_datetime")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "flex::opt_id")]
    pub created_by: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionResultRecord {
    #[serde(deserialize_with = "flex::id")]
    pub id: i64,
    #[serde(deserialize_with = "flex::id")]
    pub session_id: i64,
    #[serde(default, deserialize_with = "flex::opt_id")]
    pub status_id: Option<i64>,
    #[serde(default)]
    pub note: Option<Value>,
    #[serde(default, deserialize_with = "flex::opt_f64")]
    pub elapsed: Option<f64>,
    #[serde(default, deserialize_with = "flex::opt_datetime")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "flex::opt_id")]
    pub created_by: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutomationCaseRecord {
    #[serde(deserialize_with = "flex::id")]
    pub id: i64,
    #[serde(deserialize_with = "flex::id")]
    pub project_id: i64,
    pub name: String,
    #[serde(default)]
    pub folder: Option<String>,
    #[serde(default)]
    pub class_name: Option<String>,
}

// ── Execution ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct RunRecord {
    #[serde(deserialize_with = "flex::id")]
    pub id: i64,
    #[serde(deserialize_with = "flex::id")]
    pub project_id: i64,
    #[serde(default, deserialize_with = "flex::opt_id")]
    pub milestone_id: Option<i64>,
    #[serde(default, deserialize_with = "flex::opt_id")]
    pub config_id: Option<i64>,
    #[serde(default, deserialize_with = "flex::opt_id")]
    pub state_id: Option<i64>,
    pub name: String,
    #[serde(default)]
    pub note: Option<Value>,
    #[serde(default, deserialize_with = "flex::bool")]
    pub is_completed: bool,
    #[serde(default, deserialize_with = "flex::opt_datetime")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "flex::opt_datetime")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "flex::opt_id")]
    pub created_by: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunCaseRecord {
    #[serde(deserialize_with = "flex::id")]
    pub id: i64,
    #[serde(deserialize_with = "flex::id")]
    pub run_id: i64,
    #[serde(deserialize_with = "flex::id")]
    pub case_id: i64,
    #[serde(default, deserialize_with = "flex::opt_id")]
    pub status_id: Option<i64>,
    #[serde(default, deserialize_with = "flex::opt_id")]
    pub assignee_id: Option<i64>,
    #[serde(default)]
    pub display_order: i64,
    #[serde(default, deserialize_with = "flex::bool")]
    pub is_completed: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunResultRecord {
    #[serde(deserialize_with = "flex::id")]
    pub id: i64,
    #[serde(deserialize_with = "flex::id")]
    pub test_id: i64,
    #[serde(default, deserialize_with = "flex::opt_id")]
    pub status_id: Option<i64>,
    #[serde(default)]
    pub note: Option<Value>,
    #[serde(default, deserialize_with = "flex::opt_f64")]
    pub elapsed: Option<f64>,
    #[serde(default, deserialize_with = "flex::opt_datetime")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "flex::opt_id")]
    pub created_by: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunResultStepRecord {
    #[serde(deserialize_with = "flex::id")]
    pub result_id: i64,
    #[serde(deserialize_with = "flex::id")]
    pub step_id: i64,
    #[serde(default, deserialize_with = "flex::opt_id")]
    pub status_id: Option<i64>,
    #[serde(default)]
    pub note: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutomationRunRecord {
    #[serde(deserialize_with = "flex::id")]
    pub id: i64,
    #[serde(deserialize_with = "flex::id")]
    pub project_id: i64,
    #[serde(default, deserialize_with = "flex::opt_id")]
    pub milestone_id: Option<i64>,
    #[serde(default, deserialize_with = "flex::opt_id")]
    pub config_id: Option<i64>,
    pub name: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default, deserialize_with = "flex::opt_id")]
    pub status_id: Option<i64>,
    #[serde(default, deserialize_with = "flex::opt_f64")]
    pub elapsed: Option<f64>,
    #[serde(default, deserialize_with = "flex::bool")]
    pub is_completed: bool,
    #[serde(default, deserialize_with = "flex::opt_datetime")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutomationResultRecord {
    #[serde(deserialize_with = "flex::id")]
    pub id: i64,
    #[serde(deserialize_with = "flex::id")]
    pub run_id: i64,
    #[serde(deserialize_with = "flex::id")]
    pub case_id: i64,
    #[serde(default, deserialize_with = "flex::opt_id")]
    pub status_id: Option<i64>,
    #[serde(default, deserialize_with = "flex::opt_f64")]
    pub elapsed: Option<f64>,
    #[serde(default, deserialize_with = "flex::opt_datetime")]
    pub created_at: Option<DateTime<Utc>>,
}

// ── Cross-links ─────────────────────────────────────────────────────────

/// What a tag, issue or link row points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkTarget {
    Project,
    Milestone,
    #[serde(alias = "repository_case")]
    Case,
    Run,
    #[serde(alias = "run_result")]
    Result,
    Session,
    AutomationRun,
}

impl LinkTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkTarget::Project => "project",
            LinkTarget::Milestone => "milestone",
            LinkTarget::Case => "case",
            LinkTarget::Run => "run",
            LinkTarget::Result => "result",
            LinkTarget::Session => "session",
            LinkTarget::AutomationRun => "automation_run",
        }
    }
}

/// A tag assignment. Each tag dataset names its owner column differently.
#[derive(Debug, Clone, Deserialize)]
pub struct TagLinkRecord {
    #[serde(deserialize_with = "flex::id")]
    pub tag_id: i64,
    #[serde(default, deserialize_with = "flex::opt_id")]
    pub case_id: Option<i64>,
    #[serde(default, deserialize_with = "flex::opt_id")]
    pub run_id: Option<i64>,
    #[serde(default, deserialize_with = "flex::opt_id")]
    pub session_id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IssueRecord {
    #[serde(deserialize_with = "flex::id")]
    pub id: i64,
    #[serde(alias = "display_id")]
    pub key: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IssueLinkRecord {
    #[serde(deserialize_with = "flex::id")]
    pub issue_id: i64,
    pub entity_type: LinkTarget,
    #[serde(deserialize_with = "flex::id")]
    pub entity_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinkRecord {
    pub entity_type: LinkTarget,
    #[serde(deserialize_with = "flex::id")]
    pub entity_id: i64,
    #[serde(default)]
    pub name: Option<String>,
    pub url: String,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaseLinkRecord {
    #[serde(deserialize_with = "flex::id")]
    pub case_id: i64,
    #[serde(deserialize_with = "flex::id")]
    pub linked_case_id: i64,
    #[serde(default)]
    pub link_type: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_field_type() -> String {
    "text".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ids_accept_strings_and_numbers() {
        let r: CaseRecord = serde_json::from_value(json!({
            "id": "10", "project_id": 1, "repo_id": "2", "folder_id": "",
            "name": "Checkout", "is_automated": 1
        }))
        .unwrap();
        assert_eq!(r.id, 10);
        assert_eq!(r.repo_id, 2);
        assert_eq!(r.folder_id, None);
        assert!(r.is_automated);
    }

    #[test]
    fn timestamps_accept_common_layouts() {
        let r: RunRecord = serde_json::from_value(json!({
            "id": 1, "project_id": 1, "name": "R",
            "created_at": "2023-04-01 10:20:30",
            "completed_at": 1680344430
        }))
        .unwrap();
        assert_eq!(r.created_at.unwrap().to_rfc3339(), "2023-04-01T10:20:30+00:00");
        assert_eq!(r.completed_at, r.created_at);
    }

    #[test]
    fn garbage_id_fails_to_decode() {
        let r = serde_json::from_value::<RunCaseRecord>(json!({
            "id": 1, "run_id": "abc", "case_id": 2
        }));
        assert!(r.is_err());
    }

    #[test]
    fn link_target_aliases() {
        let l: IssueLinkRecord = serde_json::from_value(json!({
            "issue_id": 3, "entity_type": "repository_case", "entity_id": 9
        }))
        .unwrap();
        assert_eq!(l.entity_type, LinkTarget::Case);
    }
}
