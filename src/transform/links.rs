//! Cross-links: tag assignments, issues, issue links, external links and
//! case-to-case links.

use async_trait::async_trait;
use casebridge_core::identifiers::RowIssue;
use casebridge_core::models::EntityKind;
use casebridge_core::records::{
    datasets, CaseLinkRecord, IssueLinkRecord, IssueRecord, LinkRecord, LinkTarget, TagLinkRecord,
};
use sqlx::SqliteConnection;

use super::{RowOutcome, RowResult, Transformer};
use crate::coerce;
use crate::context::ImportContext;

/// Entity type whose identifier map resolves a link target.
pub fn target_kind(target: LinkTarget) -> EntityKind {
    match target {
        LinkTarget::Project => EntityKind::Project,
        LinkTarget::Milestone => EntityKind::Milestone,
        LinkTarget::Case => EntityKind::RepositoryCase,
        LinkTarget::Run => EntityKind::TestRun,
        LinkTarget::Result => EntityKind::RunResult,
        LinkTarget::Session => EntityKind::Session,
        LinkTarget::AutomationRun => EntityKind::AutomationRun,
    }
}

fn resolve_target(ctx: &ImportContext, target: LinkTarget, source_id: i64) -> Result<i64, RowIssue> {
    ctx.maps.require(target_kind(target), "entity_id", source_id)
}

/// Tag assignments from the three per-owner tag datasets.
pub struct TagLinks;

#[async_trait]
impl Transformer for TagLinks {
    type Record = TagLinkRecord;

    fn kind(&self) -> EntityKind {
        EntityKind::TagLink
    }

    fn datasets(&self) -> &'static [&'static str] {
        &[datasets::REPOSITORY_CASE_TAGS, datasets::RUN_TAGS, datasets::SESSION_TAGS]
    }

    fn source_id(&self, _r: &TagLinkRecord) -> Option<i64> {
        None
    }

    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        ctx: &mut ImportContext,
        dataset: &str,
        r: &TagLinkRecord,
    ) -> RowResult {
        let tag = ctx.maps.require(EntityKind::Tag, "tag_id", r.tag_id)?;
        let (target, field, owner) = match dataset {
            datasets::RUN_TAGS => (LinkTarget::Run, "run_id", r.run_id),
            datasets::SESSION_TAGS => (LinkTarget::Session, "session_id", r.session_id),
            _ => (LinkTarget::Case, "case_id", r.case_id),
        };
        let owner = owner.ok_or_else(|| RowIssue::new(field, "null", "tag row has no owner"))?;
        let entity = ctx.maps.require(target_kind(target), field, owner)?;

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM entity_tags WHERE tag_id = ? AND entity_type = ? AND entity_id = ?",
        )
        .bind(tag)
        .bind(target.as_str())
        .bind(entity)
        .fetch_optional(&mut *conn)
        .await?;
        if let Some(id) = existing {
            return Ok(RowOutcome::Mapped(id));
        }

        let id = sqlx::query("INSERT INTO entity_tags (tag_id, entity_type, entity_id) VALUES (?, ?, ?)")
            .bind(tag)
            .bind(target.as_str())
            .bind(entity)
            .execute(&mut *conn)
            .await?
            .last_insert_rowid();
        Ok(RowOutcome::Created(id))
    }
}

pub struct Issues;

#[async_trait]
impl Transformer for Issues {
    type Record = IssueRecord;

    fn kind(&self) -> EntityKind {
        EntityKind::Issue
    }

    fn datasets(&self) -> &'static [&'static str] {
        &[datasets::ISSUES]
    }

    fn source_id(&self, r: &IssueRecord) -> Option<i64> {
        Some(r.id)
    }

    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        _ctx: &mut ImportContext,
        _dataset: &str,
        r: &IssueRecord,
    ) -> RowResult {
        let key = coerce::required_text("key", &r.key)?;
        let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM issues WHERE issue_key = ?")
            .bind(&key)
            .fetch_optional(&mut *conn)
            .await?;
        if let Some(id) = existing {
            return Ok(RowOutcome::Mapped(id));
        }

        let id = sqlx::query("INSERT INTO issues (issue_key, title, url) VALUES (?, ?, ?)")
            .bind(&key)
            .bind(r.title.as_deref())
            .bind(r.url.as_deref())
            .execute(&mut *conn)
            .await?
            .last_insert_rowid();
        Ok(RowOutcome::Created(id))
    }
}

pub struct IssueLinks;

#[async_trait]
impl Transformer for IssueLinks {
    type Record = IssueLinkRecord;

    fn kind(&self) -> EntityKind {
        EntityKind::IssueLink
    }

    fn datasets(&self) -> &'static [&'static str] {
        &[datasets::ISSUE_LINKS]
    }

    fn source_id(&self, _r: &IssueLinkRecord) -> Option<i64> {
        None
    }

    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        ctx: &mut ImportContext,
        _dataset: &str,
        r: &IssueLinkRecord,
    ) -> RowResult {
        let issue = ctx.maps.require(EntityKind::Issue, "issue_id", r.issue_id)?;
        let entity = resolve_target(ctx, r.entity_type, r.entity_id)?;

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM issue_links WHERE issue_id = ? AND entity_type = ? AND entity_id = ?",
        )
        .bind(issue)
        .bind(r.entity_type.as_str())
        .bind(entity)
        .fetch_optional(&mut *conn)
        .await?;
        if let Some(id) = existing {
            return Ok(RowOutcome::Mapped(id));
        }

        let id = sqlx::query("INSERT INTO issue_links (issue_id, entity_type, entity_id) VALUES (?, ?, ?)")
            .bind(issue)
            .bind(r.entity_type.as_str())
            .bind(entity)
            .execute(&mut *conn)
            .await?
            .last_insert_rowid();
        Ok(RowOutcome::Created(id))
    }
}

/// External URLs attached to any linkable entity.
pub struct EntityLinks;

#[async_trait]
impl Transformer for EntityLinks {
    type Record = LinkRecord;

    fn kind(&self) -> EntityKind {
        EntityKind::EntityLink
    }

    fn datasets(&self) -> &'static [&'static str] {
        &[datasets::LINKS]
    }

    fn source_id(&self, _r: &LinkRecord) -> Option<i64> {
        None
    }

    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        ctx: &mut ImportContext,
        _dataset: &str,
        r: &LinkRecord,
    ) -> RowResult {
        let entity = resolve_target(ctx, r.entity_type, r.entity_id)?;
        let url = coerce::required_text("url", &r.url)?;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(RowIssue::new("url", &url, "only http(s) links are imported").into());
        }

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM entity_links WHERE entity_type = ? AND entity_id = ? AND url = ?",
        )
        .bind(r.entity_type.as_str())
        .bind(entity)
        .bind(&url)
        .fetch_optional(&mut *conn)
        .await?;
        if let Some(id) = existing {
            return Ok(RowOutcome::Mapped(id));
        }

        let id = sqlx::query(
            "INSERT INTO entity_links (entity_type, entity_id, name, url, note) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(r.entity_type.as_str())
        .bind(entity)
        .bind(r.name.as_deref())
        .bind(&url)
        .bind(r.note.as_deref())
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();
        Ok(RowOutcome::Created(id))
    }
}

pub struct CaseLinks;

const DEFAULT_LINK_TYPE: &str = "related";

#[async_trait]
impl Transformer for CaseLinks {
    type Record = CaseLinkRecord;

    fn kind(&self) -> EntityKind {
        EntityKind::CaseLink
    }

    fn datasets(&self) -> &'static [&'static str] {
        &[datasets::REPOSITORY_CASE_LINKS]
    }

    fn source_id(&self, _r: &CaseLinkRecord) -> Option<i64> {
        None
    }

    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        ctx: &mut ImportContext,
        _dataset: &str,
        r: &CaseLinkRecord,
    ) -> RowResult {
        let case = ctx.maps.require(EntityKind::RepositoryCase, "case_id", r.case_id)?;
        let linked = ctx
            .maps
            .require(EntityKind::RepositoryCase, "linked_case_id", r.linked_case_id)?;
        if case == linked {
            return Err(RowIssue::new("linked_case_id", r.linked_case_id, "case links to itself").into());
        }
        let link_type = r
            .link_type
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_LINK_TYPE)
            .to_ascii_lowercase();

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM case_links WHERE case_id = ? AND linked_case_id = ? AND link_type = ?",
        )
        .bind(case)
        .bind(linked)
        .bind(&link_type)
        .fetch_optional(&mut *conn)
        .await?;
        if let Some(id) = existing {
            return Ok(RowOutcome::Mapped(id));
        }

        let id = sqlx::query("INSERT INTO case_links (case_id, linked_case_id, link_type) VALUES (?, ?, ?)")
            .bind(case)
            .bind(linked)
            .bind(&link_type)
            .execute(&mut *conn)
            .await?
            .last_insert_rowid();
        Ok(RowOutcome::Created(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_targets_resolve_through_their_entity_maps() {
        assert_eq!(target_kind(LinkTarget::Case), EntityKind::RepositoryCase);
        assert_eq!(target_kind(LinkTarget::Run), EntityKind::TestRun);
        assert_eq!(target_kind(LinkTarget::Result), EntityKind::RunResult);
    }
}
