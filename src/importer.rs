//! Dependency-ordered import of one job's staged data.
//!
//! Every entity type's staged row count is planned up front so the job's
//! total and ETA cover the whole import. Reference entities are then
//! resolved from the mapping configuration, and one transformer per entity
//! type runs, strictly in sequence, in the order their references require:
//! containers, content, execution, links.

use async_trait::async_trait;
use casebridge_core::models::{ActivityEntry, EntityKind, EntityProgress};
use casebridge_core::staging::StagingStore;
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use tracing::info;

use crate::config::Config;
use crate::context::ImportContext;
use crate::error::{ImportError, ImportResult};
use crate::jobs::{self, CancelCheck};
use crate::resolver;
use crate::transform::{cases, containers, links, runs, sessions, Pipeline, Transformer};

#[derive(Debug, Clone, Default)]
pub struct ImportSummary {
    pub entities: BTreeMap<EntityKind, EntityProgress>,
    pub processed: u64,
    pub skipped: u64,
    pub errors: u64,
}

/// Resolve references and import every staged entity type for `job_id`.
///
/// Returns [`ImportError::Canceled`] when cancellation was requested
/// between chunks; committed chunks stay committed either way.
pub async fn import_job(
    pool: &SqlitePool,
    store: &dyn StagingStore,
    cancel: &dyn CancelCheck,
    config: &Config,
    job_id: &str,
) -> ImportResult<ImportSummary> {
    let mut ctx = ImportContext::new(job_id, config);
    if cancel.should_abort().await {
        return Err(ImportError::Canceled);
    }

    let pipeline = Pipeline { pool, store, cancel };
    for step in STEPS {
        step.plan(&pipeline, &mut ctx).await?;
    }

    resolve_references(pool, &mut ctx).await?;

    for step in STEPS {
        step.run(&pipeline, &mut ctx).await?;
    }

    ctx.current = None;
    let (hits, misses) = ctx.richtext.cache_stats();
    info!(job = job_id, hits, misses, "rich-text cache");
    let mut conn = pool.acquire().await?;
    ctx.flush_status(&mut conn, Some("Import finished".to_string()))
        .await?;

    Ok(ImportSummary {
        entities: ctx.progress.snapshot(),
        processed: ctx.progress.processed(),
        skipped: ctx.progress.skipped_total(),
        errors: ctx.errors,
    })
}

async fn resolve_references(pool: &SqlitePool, ctx: &mut ImportContext) -> ImportResult<()> {
    let mut mapping = jobs::load_mapping(pool, &ctx.job_id).await?;
    let resolved = resolver::resolve_all(pool, &mut mapping, &mut ctx.maps).await?;

    let mut conn = pool.acquire().await?;
    jobs::save_mapping(&mut conn, &ctx.job_id, &mapping).await?;

    for (kind, summary) in resolved {
        ctx.progress.set(kind, summary);
        ctx.note(
            ActivityEntry::info(format!(
                "{}: {} created, {} mapped",
                kind, summary.created, summary.mapped
            ))
            .with_summary(kind, summary),
        );
    }
    ctx.flush_status(&mut conn, Some("Reference entities resolved".to_string()))
        .await
}

/// A transformer seen through its place in the import order.
#[async_trait]
trait Step: Send + Sync {
    async fn plan(&self, pipeline: &Pipeline<'_>, ctx: &mut ImportContext) -> ImportResult<()>;
    async fn run(&self, pipeline: &Pipeline<'_>, ctx: &mut ImportContext) -> ImportResult<()>;
}

#[async_trait]
impl<T: Transformer> Step for T {
    async fn plan(&self, pipeline: &Pipeline<'_>, ctx: &mut ImportContext) -> ImportResult<()> {
        pipeline.plan(ctx, self).await.map(|_| ())
    }

    async fn run(&self, pipeline: &Pipeline<'_>, ctx: &mut ImportContext) -> ImportResult<()> {
        step(pipeline, ctx, self).await
    }
}

const STEPS: &[&dyn Step] = &[
    &containers::Projects,
    &containers::ProjectMembers,
    &containers::Milestones,
    &containers::Repositories,
    &containers::Folders,
    &cases::CustomFields,
    &cases::FieldOptions,
    &cases::Cases,
    &cases::CaseSteps,
    &cases::CaseFieldValues,
    &sessions::Sessions,
    &sessions::SessionResults,
    &sessions::AutomationCases,
    &runs::Runs,
    &runs::RunCases,
    &runs::RunResults,
    &runs::RunResultSteps,
    &runs::AutomationRuns,
    &runs::AutomationResults,
    &links::TagLinks,
    &links::Issues,
    &links::IssueLinks,
    &links::EntityLinks,
    &links::CaseLinks,
];

async fn step<T: Transformer>(
    pipeline: &Pipeline<'_>,
    ctx: &mut ImportContext,
    transformer: &T,
) -> ImportResult<()> {
    let kind = transformer.kind();
    let summary = pipeline.run(ctx, transformer).await?;
    if summary.total + summary.skipped == 0 {
        return Ok(());
    }

    let mut message = format!(
        "{}: {} created, {} mapped",
        kind, summary.created, summary.mapped
    );
    if summary.skipped > 0 {
        message.push_str(&format!(", {} skipped", summary.skipped));
    }
    info!(job = %ctx.job_id, entity = %kind, created = summary.created, mapped = summary.mapped, skipped = summary.skipped, "entity imported");
    let entry = if summary.skipped > 0 {
        ActivityEntry::warning(message.clone())
    } else {
        ActivityEntry::info(message.clone())
    };
    ctx.note(entry.with_summary(kind, summary));

    let mut conn = pipeline.pool.acquire().await?;
    ctx.flush_status(&mut conn, Some(message)).await
}
