//! Organizational containers: projects, members, milestones, repositories
//! and repository folders.

use async_trait::async_trait;
use casebridge_core::identifiers::{ContainerCandidate, RowIssue};
use casebridge_core::models::EntityKind;
use casebridge_core::records::{
    datasets, FolderRecord, MilestoneRecord, ProjectMemberRecord, ProjectRecord, RepositoryRecord,
};
use casebridge_core::staging::{load_all, StagingStore};
use sqlx::SqliteConnection;
use tracing::debug;

use super::{RowOutcome, RowResult, Transformer};
use crate::coerce;
use crate::context::ImportContext;
use crate::error::{ImportError, ImportResult};

pub struct Projects;

#[async_trait]
impl Transformer for Projects {
    type Record = ProjectRecord;

    fn kind(&self) -> EntityKind {
        EntityKind::Project
    }

    fn datasets(&self) -> &'static [&'static str] {
        &[datasets::PROJECTS]
    }

    fn source_id(&self, r: &ProjectRecord) -> Option<i64> {
        Some(r.id)
    }

    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        ctx: &mut ImportContext,
        _dataset: &str,
        r: &ProjectRecord,
    ) -> RowResult {
        let name = coerce::required_text("name", &r.name)?;
        let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM projects WHERE name = ?")
            .bind(&name)
            .fetch_optional(&mut *conn)
            .await?;
        if let Some(id) = existing {
            return Ok(RowOutcome::Mapped(id));
        }

        let note = ctx.rich_text(r.note.as_ref());
        let id = sqlx::query(
            "INSERT INTO projects (name, note, is_completed, created_by, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&name)
        .bind(note)
        .bind(r.is_completed)
        .bind(ctx.maps.optional(EntityKind::User, r.created_by))
        .bind(coerce::timestamp(r.created_at))
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();
        Ok(RowOutcome::Created(id))
    }
}

pub struct ProjectMembers;

#[async_trait]
impl Transformer for ProjectMembers {
    type Record = ProjectMemberRecord;

    fn kind(&self) -> EntityKind {
        EntityKind::ProjectMember
    }

    fn datasets(&self) -> &'static [&'static str] {
        &[datasets::PROJECT_USERS]
    }

    fn source_id(&self, _r: &ProjectMemberRecord) -> Option<i64> {
        None
    }

    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        ctx: &mut ImportContext,
        _dataset: &str,
        r: &ProjectMemberRecord,
    ) -> RowResult {
        let project = ctx.maps.require(EntityKind::Project, "project_id", r.project_id)?;
        let user = ctx.maps.require(EntityKind::User, "user_id", r.user_id)?;
        let existing: Option<i64> =
            sqlx::query_scalar("SELECT id FROM project_members WHERE project_id = ? AND user_id = ?")
                .bind(project)
                .bind(user)
                .fetch_optional(&mut *conn)
                .await?;
        if let Some(id) = existing {
            return Ok(RowOutcome::Mapped(id));
        }

        let id = sqlx::query("INSERT INTO project_members (project_id, user_id, role_id) VALUES (?, ?, ?)")
            .bind(project)
            .bind(user)
            .bind(ctx.maps.optional(EntityKind::Role, r.role_id))
            .execute(&mut *conn)
            .await?
            .last_insert_rowid();
        Ok(RowOutcome::Created(id))
    }
}

/// Resolve a same-type parent reference. `Err(())` means the parent exists
/// in the source but hasn't been imported yet.
/// Target id of a row's parent; `Err` carries a source parent id that isn't
/// imported yet.
fn parent(ctx: &ImportContext, kind: EntityKind, own_id: i64, parent_id: Option<i64>) -> Result<Option<i64>, i64> {
    match parent_id {
        None => Ok(None),
        Some(p) if p == own_id || p == 0 => Ok(None),
        Some(p) => ctx.maps.get(kind, p).map(Some).ok_or(p),
    }
}

pub struct Milestones;

#[async_trait]
impl Transformer for Milestones {
    type Record = MilestoneRecord;

    fn kind(&self) -> EntityKind {
        EntityKind::Milestone
    }

    fn datasets(&self) -> &'static [&'static str] {
        &[datasets::MILESTONES]
    }

    fn source_id(&self, r: &MilestoneRecord) -> Option<i64> {
        Some(r.id)
    }

    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        ctx: &mut ImportContext,
        _dataset: &str,
        r: &MilestoneRecord,
    ) -> RowResult {
        let project = ctx.maps.require(EntityKind::Project, "project_id", r.project_id)?;
        let name = coerce::required_text("name", &r.name)?;
        let parent_id = match parent(ctx, EntityKind::Milestone, r.id, r.parent_id) {
            Ok(id) => id,
            Err(missing) => return Ok(RowOutcome::Deferred { parent: missing }),
        };

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM milestones WHERE project_id = ? AND name = ? AND parent_id IS ?",
        )
        .bind(project)
        .bind(&name)
        .bind(parent_id)
        .fetch_optional(&mut *conn)
        .await?;
        if let Some(id) = existing {
            return Ok(RowOutcome::Mapped(id));
        }

        let note = ctx.rich_text(r.note.as_ref());
        let id = sqlx::query(
            r#"
            INSERT INTO milestones (project_id, parent_id, type_id, name, note, is_completed,
                                    started_at, due_at, completed_at, created_by)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(project)
        .bind(parent_id)
        .bind(ctx.maps.optional(EntityKind::MilestoneType, r.type_id))
        .bind(&name)
        .bind(note)
        .bind(r.is_completed)
        .bind(coerce::timestamp(r.started_at))
        .bind(coerce::timestamp(r.due_at))
        .bind(coerce::timestamp(r.completed_at))
        .bind(ctx.maps.optional(EntityKind::User, r.created_by))
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();
        Ok(RowOutcome::Created(id))
    }
}

/// Repositories fold onto one target repository per project. The
/// canonicalizer is fed every staged repository up front so that later
/// transformers can point rows of duplicate snapshots at the canonical one.
pub struct Repositories;

#[async_trait]
impl Transformer for Repositories {
    type Record = RepositoryRecord;

    fn kind(&self) -> EntityKind {
        EntityKind::Repository
    }

    fn datasets(&self) -> &'static [&'static str] {
        &[datasets::REPOSITORIES]
    }

    fn source_id(&self, r: &RepositoryRecord) -> Option<i64> {
        Some(r.id)
    }

    async fn prepare(&self, ctx: &mut ImportContext, store: &dyn StagingStore) -> ImportResult<()> {
        let rows = load_all(store, &ctx.job_id, datasets::REPOSITORIES, 1000)
            .await
            .map_err(ImportError::staging)?;
        for row in rows {
            if let Ok(r) = serde_json::from_value::<RepositoryRecord>(row.payload) {
                ctx.canonical.observe(ContainerCandidate {
                    source_id: r.id,
                    project_id: r.project_id,
                    is_master: r.is_master,
                    is_snapshot: r.is_snapshot,
                });
            }
        }
        debug!(
            projects = ctx.canonical.project_count(),
            duplicates = ctx.canonical.duplicate_count(),
            "repositories canonicalized"
        );
        Ok(())
    }

    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        ctx: &mut ImportContext,
        _dataset: &str,
        r: &RepositoryRecord,
    ) -> RowResult {
        let project = ctx.maps.require(EntityKind::Project, "project_id", r.project_id)?;
        let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM repositories WHERE project_id = ?")
            .bind(project)
            .fetch_optional(&mut *conn)
            .await?;
        if let Some(id) = existing {
            return Ok(RowOutcome::Mapped(id));
        }

        let id = sqlx::query("INSERT INTO repositories (project_id) VALUES (?)")
            .bind(project)
            .execute(&mut *conn)
            .await?
            .last_insert_rowid();
        Ok(RowOutcome::Created(id))
    }
}

/// Target repository for a source repository id, going through the
/// canonical container first.
pub(crate) fn resolve_repository(ctx: &ImportContext, source_repo_id: i64) -> Result<i64, RowIssue> {
    let canonical = ctx.canonical.canonical_for(source_repo_id);
    ctx.maps
        .require(EntityKind::Repository, "repo_id", canonical)
        .or_else(|issue| ctx.maps.get(EntityKind::Repository, source_repo_id).ok_or(issue))
}

pub struct Folders;

#[async_trait]
impl Transformer for Folders {
    type Record = FolderRecord;

    fn kind(&self) -> EntityKind {
        EntityKind::RepositoryFolder
    }

    fn datasets(&self) -> &'static [&'static str] {
        &[datasets::REPOSITORY_FOLDERS]
    }

    fn source_id(&self, r: &FolderRecord) -> Option<i64> {
        Some(r.id)
    }

    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        ctx: &mut ImportContext,
        _dataset: &str,
        r: &FolderRecord,
    ) -> RowResult {
        let repository = resolve_repository(ctx, r.repo_id)?;
        let name = coerce::required_text("name", &r.name)?;
        let parent_id = match parent(ctx, EntityKind::RepositoryFolder, r.id, r.parent_id) {
            Ok(id) => id,
            Err(missing) => return Ok(RowOutcome::Deferred { parent: missing }),
        };

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM repository_folders WHERE repository_id = ? AND parent_id IS ? AND name = ?",
        )
        .bind(repository)
        .bind(parent_id)
        .bind(&name)
        .fetch_optional(&mut *conn)
        .await?;
        if let Some(id) = existing {
            return Ok(RowOutcome::Mapped(id));
        }

        let docs = ctx.rich_text(r.docs.as_ref());
        let id = sqlx::query(
            "INSERT INTO repository_folders (repository_id, parent_id, name, docs, display_order) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(repository)
        .bind(parent_id)
        .bind(&name)
        .bind(docs)
        .bind(r.display_order)
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();
        Ok(RowOutcome::Created(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn ctx() -> ImportContext {
        let config: Config = toml::from_str("[db]\npath = \"unused.sqlite\"\n").unwrap();
        ImportContext::new("job", &config)
    }

    #[test]
    fn missing_parent_reports_the_parent_id() {
        let mut ctx = ctx();
        assert_eq!(parent(&ctx, EntityKind::Milestone, 5, Some(42)), Err(42));

        ctx.maps.insert(EntityKind::Milestone, 42, 1042);
        assert_eq!(parent(&ctx, EntityKind::Milestone, 5, Some(42)), Ok(Some(1042)));
    }

    #[test]
    fn self_and_zero_parents_are_roots() {
        let ctx = ctx();
        assert_eq!(parent(&ctx, EntityKind::RepositoryFolder, 7, Some(7)), Ok(None));
        assert_eq!(parent(&ctx, EntityKind::RepositoryFolder, 7, Some(0)), Ok(None));
        assert_eq!(parent(&ctx, EntityKind::RepositoryFolder, 7, None), Ok(None));
    }
}
