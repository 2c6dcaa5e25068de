//! Exploratory sessions, their results, and automation cases.

use async_trait::async_trait;
use casebridge_core::models::EntityKind;
use casebridge_core::records::{datasets, AutomationCaseRecord, SessionRecord, SessionResultRecord};
use sqlx::SqliteConnection;

use super::{RowOutcome, RowResult, Transformer};
use crate::coerce;
use crate::context::ImportContext;

pub struct Sessions;

#[async_trait]
impl Transformer for Sessions {
    type Record = SessionRecord;

    fn kind(&self) -> EntityKind {
        EntityKind::Session
    }

    fn datasets(&self) -> &'static [&'static str] {
        &[datasets::SESSIONS]
    }

    fn source_id(&self, r: &SessionRecord) -> Option<i64> {
        Some(r.id)
    }

    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        ctx: &mut ImportContext,
        _dataset: &str,
        r: &SessionRecord,
    ) -> RowResult {
        let project = ctx.maps.require(EntityKind::Project, "project_id", r.project_id)?;
        let name = coerce::required_text("name", &r.name)?;
        let estimate = coerce::seconds("estimate", r.estimate)?;
        let elapsed = coerce::seconds("elapsed", r.elapsed)?;
        let created_at = coerce::timestamp(r.created_at);

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM sessions WHERE project_id = ? AND name = ? AND created_at IS ?",
        )
        .bind(project)
        .bind(&name)
        .bind(created_at)
        .fetch_optional(&mut *conn)
        .await?;
        if let Some(id) = existing {
            return Ok(RowOutcome::Mapped(id));
        }

        let note = ctx.rich_text(r.note.as_ref());
        let id = sqlx::query(
            r#"
            INSERT INTO sessions (project_id, milestone_id, configuration_id, state_id, name, note,
                                  assignee_id, estimate, elapsed, is_completed, created_by, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(project)
        .bind(ctx.maps.optional(EntityKind::Milestone, r.milestone_id))
        .bind(ctx.maps.optional(EntityKind::Configuration, r.config_id))
        .bind(ctx.maps.optional(EntityKind::Workflow, r.state_id))
        .bind(&name)
        .bind(note)
        .bind(ctx.maps.optional(EntityKind::User, r.assignee_id))
        .bind(estimate)
        .bind(elapsed)
        .bind(r.is_completed)
        .bind(ctx.maps.optional(EntityKind::User, r.created_by))
        .bind(created_at)
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();
        Ok(RowOutcome::Created(id))
    }
}

/// Session results carry no natural key of their own; the source id is
/// kept as `external_ref` so a retry finds them again.
pub struct SessionResults;

#[async_trait]
impl Transformer for SessionResults {
    type Record = SessionResultRecord;

    fn kind(&self) -> EntityKind {
        EntityKind::SessionResult
    }

    fn datasets(&self) -> &'static [&'static str] {
        &[datasets::SESSION_RESULTS]
    }

    fn source_id(&self, r: &SessionResultRecord) -> Option<i64> {
        Some(r.id)
    }

    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        ctx: &mut ImportContext,
        _dataset: &str,
        r: &SessionResultRecord,
    ) -> RowResult {
        let session = ctx.maps.require(EntityKind::Session, "session_id", r.session_id)?;
        let elapsed = coerce::seconds("elapsed", r.elapsed)?;

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM session_results WHERE session_id = ? AND external_ref = ?",
        )
        .bind(session)
        .bind(r.id)
        .fetch_optional(&mut *conn)
        .await?;
        if let Some(id) = existing {
            return Ok(RowOutcome::Mapped(id));
        }

        let note = ctx.rich_text(r.note.as_ref());
        let id = sqlx::query(
            r#"
            INSERT INTO session_results (session_id, status_id, note, elapsed, created_by, created_at, external_ref)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(session)
        .bind(ctx.maps.optional(EntityKind::Status, r.status_id))
        .bind(note)
        .bind(elapsed)
        .bind(ctx.maps.optional(EntityKind::User, r.created_by))
        .bind(coerce::timestamp(r.created_at))
        .bind(r.id)
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();
        Ok(RowOutcome::Created(id))
    }
}

pub struct AutomationCases;

#[async_trait]
impl Transformer for AutomationCases {
    type Record = AutomationCaseRecord;

    fn kind(&self) -> EntityKind {
        EntityKind::AutomationCase
    }

    fn datasets(&self) -> &'static [&'static str] {
        &[datasets::AUTOMATION_CASES]
    }

    fn source_id(&self, r: &AutomationCaseRecord) -> Option<i64> {
        Some(r.id)
    }

    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        ctx: &mut ImportContext,
        _dataset: &str,
        r: &AutomationCaseRecord,
    ) -> RowResult {
        let project = ctx.maps.require(EntityKind::Project, "project_id", r.project_id)?;
        let name = coerce::required_text("name", &r.name)?;
        let class_name = r.class_name.as_deref().map(str::trim).filter(|s| !s.is_empty());

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM automation_cases WHERE project_id = ? AND name = ? AND class_name IS ?",
        )
        .bind(project)
        .bind(&name)
        .bind(class_name)
        .fetch_optional(&mut *conn)
        .await?;
        if let Some(id) = existing {
            return Ok(RowOutcome::Mapped(id));
        }

        let id = sqlx::query(
            "INSERT INTO automation_cases (project_id, name, folder, class_name) VALUES (?, ?, ?, ?)",
        )
        .bind(project)
        .bind(&name)
        .bind(r.folder.as_deref())
        .bind(class_name)
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();
        Ok(RowOutcome::Created(id))
    }
}
