//! Test-case content: custom fields and their options, repository cases
//! with their version snapshot, case steps and custom-field values.

use async_trait::async_trait;
use casebridge_core::identifiers::RowIssue;
use casebridge_core::models::{value_as_i64, ActivityEntry, EntityKind};
use casebridge_core::records::{
    datasets, CaseRecord, CaseStepRecord, CaseValueRecord, FieldOptionRecord, FieldRecord,
};
use serde_json::{json, Value};
use sqlx::{Row, SqliteConnection};
use tracing::warn;

use super::containers::resolve_repository;
use super::{RowOutcome, RowResult, Transformer};
use crate::coerce::{self, FieldValue};
use crate::context::ImportContext;

/// `Summary Text!` → `summary_text`.
fn system_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

pub struct CustomFields;

#[async_trait]
impl Transformer for CustomFields {
    type Record = FieldRecord;

    fn kind(&self) -> EntityKind {
        EntityKind::CustomField
    }

    fn datasets(&self) -> &'static [&'static str] {
        &[datasets::FIELDS]
    }

    fn source_id(&self, r: &FieldRecord) -> Option<i64> {
        Some(r.id)
    }

    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        ctx: &mut ImportContext,
        _dataset: &str,
        r: &FieldRecord,
    ) -> RowResult {
        let name = coerce::required_text("name", &r.name)?;
        let system = match r.system_name.as_deref().map(system_name) {
            Some(s) if !s.is_empty() => s,
            _ => system_name(&name),
        };
        if system.is_empty() {
            return Err(RowIssue::new("system_name", &name, "no usable system name").into());
        }

        let existing = sqlx::query("SELECT id, field_type FROM custom_fields WHERE system_name = ?")
            .bind(&system)
            .fetch_optional(&mut *conn)
            .await?;
        if let Some(row) = existing {
            let id: i64 = row.get("id");
            ctx.field_types.insert(id, row.get("field_type"));
            return Ok(RowOutcome::Mapped(id));
        }

        let field_type = r.field_type.trim().to_ascii_lowercase();
        let id = sqlx::query("INSERT INTO custom_fields (name, system_name, field_type) VALUES (?, ?, ?)")
            .bind(&name)
            .bind(&system)
            .bind(&field_type)
            .execute(&mut *conn)
            .await?
            .last_insert_rowid();
        ctx.field_types.insert(id, field_type);
        Ok(RowOutcome::Created(id))
    }
}

pub struct FieldOptions;

#[async_trait]
impl Transformer for FieldOptions {
    type Record = FieldOptionRecord;

    fn kind(&self) -> EntityKind {
        EntityKind::FieldOption
    }

    fn datasets(&self) -> &'static [&'static str] {
        &[datasets::FIELD_OPTIONS]
    }

    fn source_id(&self, r: &FieldOptionRecord) -> Option<i64> {
        Some(r.id)
    }

    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        ctx: &mut ImportContext,
        _dataset: &str,
        r: &FieldOptionRecord,
    ) -> RowResult {
        let field = ctx.maps.require(EntityKind::CustomField, "field_id", r.field_id)?;
        let name = coerce::required_text("name", &r.name)?;
        let key = (field, name.to_lowercase());

        let existing: Option<i64> =
            sqlx::query_scalar("SELECT id FROM field_options WHERE field_id = ? AND name = ?")
                .bind(field)
                .bind(&name)
                .fetch_optional(&mut *conn)
                .await?;
        if let Some(id) = existing {
            ctx.field_options.insert(key, id);
            return Ok(RowOutcome::Mapped(id));
        }

        let id = sqlx::query("INSERT INTO field_options (field_id, name, is_default) VALUES (?, ?, ?)")
            .bind(field)
            .bind(&name)
            .bind(r.is_default)
            .execute(&mut *conn)
            .await?
            .last_insert_rowid();
        ctx.field_options.insert(key, id);
        Ok(RowOutcome::Created(id))
    }
}

/// Repository cases. A newly created case also gets its first version
/// snapshot in the same transaction.
pub struct Cases;

#[async_trait]
impl Transformer for Cases {
    type Record = CaseRecord;

    fn kind(&self) -> EntityKind {
        EntityKind::RepositoryCase
    }

    fn datasets(&self) -> &'static [&'static str] {
        &[datasets::REPOSITORY_CASES]
    }

    fn source_id(&self, r: &CaseRecord) -> Option<i64> {
        Some(r.id)
    }

    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        ctx: &mut ImportContext,
        _dataset: &str,
        r: &CaseRecord,
    ) -> RowResult {
        let project = ctx.maps.require(EntityKind::Project, "project_id", r.project_id)?;
        let repository = resolve_repository(ctx, r.repo_id)?;
        let name = coerce::required_text("name", &r.name)?;
        let estimate = coerce::seconds("estimate", r.estimate)?;
        let folder = ctx.maps.optional(EntityKind::RepositoryFolder, r.folder_id);

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM repository_cases WHERE repository_id = ? AND folder_id IS ? AND name = ?",
        )
        .bind(repository)
        .bind(folder)
        .bind(&name)
        .fetch_optional(&mut *conn)
        .await?;
        if let Some(id) = existing {
            return Ok(RowOutcome::Mapped(id));
        }

        let description = ctx.rich_text(r.description.as_ref());
        let state = ctx.maps.optional(EntityKind::Workflow, r.state_id);
        let created_by = ctx.maps.optional(EntityKind::User, r.created_by);
        let created_at = coerce::timestamp(r.created_at);
        let id = sqlx::query(
            r#"
            INSERT INTO repository_cases (project_id, repository_id, folder_id, name, state_id,
                                          estimate, is_automated, description, created_by, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(project)
        .bind(repository)
        .bind(folder)
        .bind(&name)
        .bind(state)
        .bind(estimate)
        .bind(r.is_automated)
        .bind(description.as_deref())
        .bind(created_by)
        .bind(created_at)
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();

        let snapshot = json!({
            "name": &name,
            "projectId": project,
            "repositoryId": repository,
            "folderId": folder,
            "stateId": state,
            "estimate": estimate,
            "isAutomated": r.is_automated,
            "description": description.as_deref().and_then(|d| serde_json::from_str::<Value>(d).ok()),
            "createdBy": created_by,
        });
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO repository_case_versions (case_id, version, name, snapshot, created_at)
            VALUES (?, 1, ?, ?, COALESCE(?, strftime('%s', 'now')))
            "#,
        )
        .bind(id)
        .bind(&name)
        .bind(snapshot.to_string())
        .bind(created_at)
        .execute(&mut *conn)
        .await?;
        Ok(RowOutcome::Created(id))
    }
}

pub struct CaseSteps;

#[async_trait]
impl Transformer for CaseSteps {
    type Record = CaseStepRecord;

    fn kind(&self) -> EntityKind {
        EntityKind::CaseStep
    }

    fn datasets(&self) -> &'static [&'static str] {
        &[datasets::REPOSITORY_CASE_STEPS]
    }

    fn source_id(&self, r: &CaseStepRecord) -> Option<i64> {
        Some(r.id)
    }

    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        ctx: &mut ImportContext,
        _dataset: &str,
        r: &CaseStepRecord,
    ) -> RowResult {
        let case = ctx.maps.require(EntityKind::RepositoryCase, "case_id", r.case_id)?;
        let existing: Option<i64> =
            sqlx::query_scalar("SELECT id FROM case_steps WHERE case_id = ? AND step_order = ?")
                .bind(case)
                .bind(r.display_order)
                .fetch_optional(&mut *conn)
                .await?;
        if let Some(id) = existing {
            return Ok(RowOutcome::Mapped(id));
        }

        let step = ctx.rich_text(r.step.as_ref());
        let expected = ctx.rich_text(r.expected.as_ref());
        let id = sqlx::query("INSERT INTO case_steps (case_id, step_order, step, expected) VALUES (?, ?, ?, ?)")
            .bind(case)
            .bind(r.display_order)
            .bind(step)
            .bind(expected)
            .execute(&mut *conn)
            .await?
            .last_insert_rowid();
        Ok(RowOutcome::Created(id))
    }
}

/// Custom-field values. Dropdown and multi-select values reference options
/// by source option id or by name; an option that can't be resolved is
/// dropped from the value (or skips the row, when configured to).
pub struct CaseFieldValues;

impl CaseFieldValues {
    fn resolve_option(ctx: &ImportContext, field: i64, raw: &Value) -> Option<i64> {
        if let Some(source_id) = value_as_i64(raw) {
            if let Some(id) = ctx.maps.get(EntityKind::FieldOption, source_id) {
                return Some(id);
            }
        }
        let name = match raw {
            Value::String(s) => s.trim().to_lowercase(),
            other => other.to_string().to_lowercase(),
        };
        ctx.field_options.get(&(field, name)).copied()
    }

    /// Resolve option references, dropping the ones that don't resolve.
    fn resolve_options(
        ctx: &mut ImportContext,
        field: i64,
        field_type: &str,
        case_source_id: i64,
        items: &[Value],
    ) -> Result<Value, RowIssue> {
        let mut resolved = Vec::with_capacity(items.len());
        for raw in items {
            match Self::resolve_option(ctx, field, raw) {
                Some(id) => resolved.push(id),
                None if ctx.options.skip_rows_with_unknown_options => {
                    return Err(RowIssue::new("value", raw, "unknown option for this field"));
                }
                None => {
                    warn!(
                        job = %ctx.job_id,
                        case_id = case_source_id,
                        field_id = field,
                        option = %raw,
                        "unknown field option dropped"
                    );
                    ctx.errors += 1;
                    *ctx.dropped_options.entry(field).or_default() += 1;
                }
            }
        }
        Ok(if field_type == "multiselect" {
            Value::from(resolved)
        } else {
            resolved.first().map(|id| Value::from(*id)).unwrap_or(Value::Null)
        })
    }
}

#[async_trait]
impl Transformer for CaseFieldValues {
    type Record = CaseValueRecord;

    fn kind(&self) -> EntityKind {
        EntityKind::CaseFieldValue
    }

    fn datasets(&self) -> &'static [&'static str] {
        &[datasets::REPOSITORY_CASE_VALUES]
    }

    fn source_id(&self, _r: &CaseValueRecord) -> Option<i64> {
        None
    }

    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        ctx: &mut ImportContext,
        _dataset: &str,
        r: &CaseValueRecord,
    ) -> RowResult {
        let case = ctx.maps.require(EntityKind::RepositoryCase, "case_id", r.case_id)?;
        let field = ctx.maps.require(EntityKind::CustomField, "field_id", r.field_id)?;
        let field_type = ctx
            .field_types
            .get(&field)
            .cloned()
            .unwrap_or_else(|| "text".to_string());
        let existing: Option<i64> =
            sqlx::query_scalar("SELECT id FROM case_field_values WHERE case_id = ? AND field_id = ?")
                .bind(case)
                .bind(field)
                .fetch_optional(&mut *conn)
                .await?;
        if let Some(id) = existing {
            return Ok(RowOutcome::Mapped(id));
        }

        let value = match coerce::field_value(&field_type, &r.value)? {
            None => Value::Null,
            Some(FieldValue::Options(items)) => {
                Self::resolve_options(ctx, field, &field_type, r.case_id, &items)?
            }
            Some(other) => other.to_json(),
        };

        let stored = (!value.is_null()).then(|| value.to_string());
        let id = sqlx::query("INSERT INTO case_field_values (case_id, field_id, value) VALUES (?, ?, ?)")
            .bind(case)
            .bind(field)
            .bind(stored)
            .execute(&mut *conn)
            .await?
            .last_insert_rowid();
        Ok(RowOutcome::Created(id))
    }

    fn finish(&self, ctx: &mut ImportContext) {
        let dropped = std::mem::take(&mut ctx.dropped_options);
        for (field, count) in dropped {
            ctx.note(ActivityEntry::warning(format!(
                "custom field {}: {} unknown option value(s) dropped, please confirm",
                field, count
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_names_are_snake_case() {
        assert_eq!(system_name("Summary Text!"), "summary_text");
        assert_eq!(system_name("  Priority  "), "priority");
        assert_eq!(system_name("A--B"), "a_b");
        assert_eq!(system_name("!!!"), "");
    }
}
