//! Test execution: runs, run cases, results, step results, automation runs
//! and automation results.

use async_trait::async_trait;
use casebridge_core::models::EntityKind;
use casebridge_core::records::{
    datasets, AutomationResultRecord, AutomationRunRecord, RunCaseRecord, RunRecord,
    RunResultRecord, RunResultStepRecord,
};
use sqlx::SqliteConnection;

use super::{RowOutcome, RowResult, Transformer};
use crate::coerce;
use crate::context::ImportContext;

pub struct Runs;

#[async_trait]
impl Transformer for Runs {
    type Record = RunRecord;

    fn kind(&self) -> EntityKind {
        EntityKind::TestRun
    }

    fn datasets(&self) -> &'static [&'static str] {
        &[datasets::RUNS]
    }

    fn source_id(&self, r: &RunRecord) -> Option<i64> {
        Some(r.id)
    }

    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        ctx: &mut ImportContext,
        _dataset: &str,
        r: &RunRecord,
    ) -> RowResult {
        let project = ctx.maps.require(EntityKind::Project, "project_id", r.project_id)?;
        let name = coerce::required_text("name", &r.name)?;
        let created_at = coerce::timestamp(r.created_at);

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM runs WHERE project_id = ? AND name = ? AND created_at IS ?",
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
            INSERT INTO runs (project_id, milestone_id, configuration_id, state_id, name, note,
                              is_completed, created_by, created_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(project)
        .bind(ctx.maps.optional(EntityKind::Milestone, r.milestone_id))
        .bind(ctx.maps.optional(EntityKind::Configuration, r.config_id))
        .bind(ctx.maps.optional(EntityKind::Workflow, r.state_id))
        .bind(&name)
        .bind(note)
        .bind(r.is_completed)
        .bind(ctx.maps.optional(EntityKind::User, r.created_by))
        .bind(created_at)
        .bind(coerce::timestamp(r.completed_at))
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();
        Ok(RowOutcome::Created(id))
    }
}

/// A case scheduled in a run (the export calls these "tests").
pub struct RunCases;

#[async_trait]
impl Transformer for RunCases {
    type Record = RunCaseRecord;

    fn kind(&self) -> EntityKind {
        EntityKind::RunCase
    }

    fn datasets(&self) -> &'static [&'static str] {
        &[datasets::RUN_TESTS]
    }

    fn source_id(&self, r: &RunCaseRecord) -> Option<i64> {
        Some(r.id)
    }

    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        ctx: &mut ImportContext,
        _dataset: &str,
        r: &RunCaseRecord,
    ) -> RowResult {
        let run = ctx.maps.require(EntityKind::TestRun, "run_id", r.run_id)?;
        let case = ctx.maps.require(EntityKind::RepositoryCase, "case_id", r.case_id)?;

        let existing: Option<i64> =
            sqlx::query_scalar("SELECT id FROM run_cases WHERE run_id = ? AND case_id = ?")
                .bind(run)
                .bind(case)
                .fetch_optional(&mut *conn)
                .await?;
        if let Some(id) = existing {
            return Ok(RowOutcome::Mapped(id));
        }

        let id = sqlx::query(
            r#"
            INSERT INTO run_cases (run_id, case_id, status_id, assignee_id, display_order, is_completed)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(run)
        .bind(case)
        .bind(ctx.maps.optional(EntityKind::Status, r.status_id))
        .bind(ctx.maps.optional(EntityKind::User, r.assignee_id))
        .bind(r.display_order)
        .bind(r.is_completed)
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();
        Ok(RowOutcome::Created(id))
    }
}

pub struct RunResults;

#[async_trait]
impl Transformer for RunResults {
    type Record = RunResultRecord;

    fn kind(&self) -> EntityKind {
        EntityKind::RunResult
    }

    fn datasets(&self) -> &'static [&'static str] {
        &[datasets::RUN_RESULTS]
    }

    fn source_id(&self, r: &RunResultRecord) -> Option<i64> {
        Some(r.id)
    }

    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        ctx: &mut ImportContext,
        _dataset: &str,
        r: &RunResultRecord,
    ) -> RowResult {
        let run_case = ctx.maps.require(EntityKind::RunCase, "test_id", r.test_id)?;
        let elapsed = coerce::seconds("elapsed", r.elapsed)?;

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM run_results WHERE run_case_id = ? AND external_ref = ?",
        )
        .bind(run_case)
        .bind(r.id)
        .fetch_optional(&mut *conn)
        .await?;
        if let Some(id) = existing {
            return Ok(RowOutcome::Mapped(id));
        }

        let note = ctx.rich_text(r.note.as_ref());
        let id = sqlx::query(
            r#"
            INSERT INTO run_results (run_case_id, status_id, note, elapsed, created_by, created_at, external_ref)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(run_case)
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

pub struct RunResultSteps;

#[async_trait]
impl Transformer for RunResultSteps {
    type Record = RunResultStepRecord;

    fn kind(&self) -> EntityKind {
        EntityKind::RunResultStep
    }

    fn datasets(&self) -> &'static [&'static str] {
        &[datasets::RUN_RESULT_STEPS]
    }

    fn source_id(&self, _r: &RunResultStepRecord) -> Option<i64> {
        None
    }

    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        ctx: &mut ImportContext,
        _dataset: &str,
        r: &RunResultStepRecord,
    ) -> RowResult {
        let result = ctx.maps.require(EntityKind::RunResult, "result_id", r.result_id)?;
        let step = ctx.maps.require(EntityKind::CaseStep, "step_id", r.step_id)?;

        let existing: Option<i64> =
            sqlx::query_scalar("SELECT id FROM run_result_steps WHERE result_id = ? AND step_id = ?")
                .bind(result)
                .bind(step)
                .fetch_optional(&mut *conn)
                .await?;
        if let Some(id) = existing {
            return Ok(RowOutcome::Mapped(id));
        }

        let note = ctx.rich_text(r.note.as_ref());
        let id = sqlx::query(
            "INSERT INTO run_result_steps (result_id, step_id, status_id, note) VALUES (?, ?, ?, ?)",
        )
        .bind(result)
        .bind(step)
        .bind(ctx.maps.optional(EntityKind::Status, r.status_id))
        .bind(note)
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();
        Ok(RowOutcome::Created(id))
    }
}

pub struct AutomationRuns;

#[async_trait]
impl Transformer for AutomationRuns {
    type Record = AutomationRunRecord;

    fn kind(&self) -> EntityKind {
        EntityKind::AutomationRun
    }

    fn datasets(&self) -> &'static [&'static str] {
        &[datasets::AUTOMATION_RUNS]
    }

    fn source_id(&self, r: &AutomationRunRecord) -> Option<i64> {
        Some(r.id)
    }

    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        ctx: &mut ImportContext,
        _dataset: &str,
        r: &AutomationRunRecord,
    ) -> RowResult {
        let project = ctx.maps.require(EntityKind::Project, "project_id", r.project_id)?;
        let name = coerce::required_text("name", &r.name)?;
        let elapsed = coerce::seconds("elapsed", r.elapsed)?;
        let created_at = coerce::timestamp(r.created_at);

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM automation_runs WHERE project_id = ? AND name = ? AND created_at IS ?",
        )
        .bind(project)
        .bind(&name)
        .bind(created_at)
        .fetch_optional(&mut *conn)
        .await?;
        if let Some(id) = existing {
            return Ok(RowOutcome::Mapped(id));
        }

        let id = sqlx::query(
            r#"
            INSERT INTO automation_runs (project_id, milestone_id, configuration_id, name, source,
                                         status_id, elapsed, is_completed, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(project)
        .bind(ctx.maps.optional(EntityKind::Milestone, r.milestone_id))
        .bind(ctx.maps.optional(EntityKind::Configuration, r.config_id))
        .bind(&name)
        .bind(r.source.as_deref())
        .bind(ctx.maps.optional(EntityKind::Status, r.status_id))
        .bind(elapsed)
        .bind(r.is_completed)
        .bind(created_at)
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();
        Ok(RowOutcome::Created(id))
    }
}

pub struct AutomationResults;

#[async_trait]
impl Transformer for AutomationResults {
    type Record = AutomationResultRecord;

    fn kind(&self) -> EntityKind {
        EntityKind::AutomationResult
    }

    fn datasets(&self) -> &'static [&'static str] {
        &[datasets::AUTOMATION_RUN_TESTS]
    }

    fn source_id(&self, r: &AutomationResultRecord) -> Option<i64> {
        Some(r.id)
    }

    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        ctx: &mut ImportContext,
        _dataset: &str,
        r: &AutomationResultRecord,
    ) -> RowResult {
        let run = ctx.maps.require(EntityKind::AutomationRun, "run_id", r.run_id)?;
        let case = ctx.maps.require(EntityKind::AutomationCase, "case_id", r.case_id)?;
        let elapsed = coerce::seconds("elapsed", r.elapsed)?;

        let existing: Option<i64> =
            sqlx::query_scalar("SELECT id FROM automation_results WHERE run_id = ? AND case_id = ?")
                .bind(run)
                .bind(case)
                .fetch_optional(&mut *conn)
                .await?;
        if let Some(id) = existing {
            return Ok(RowOutcome::Mapped(id));
        }

        let id = sqlx::query(
            r#"
            INSERT INTO automation_results (run_id, case_id, status_id, elapsed, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(run)
        .bind(case)
        .bind(ctx.maps.optional(EntityKind::Status, r.status_id))
        .bind(elapsed)
        .bind(coerce::timestamp(r.created_at))
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();
        Ok(RowOutcome::Created(id))
    }
}
