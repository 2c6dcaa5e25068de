//! Per-entity transformers and the chunked runner that drives them.
//!
//! A [`Transformer`] turns one typed source record into at most one target
//! record (plus dependent rows such as case version snapshots). The runner
//! owns everything the transformers have in common:
//!
//! - paging the staged dataset in chunks sized by the entity's chunk policy
//! - one transaction per chunk, bounded by the policy's timeout
//! - checking for cancellation before every chunk
//! - decoding payloads, where a payload that doesn't decode skips the row
//! - recording `source id → target id` and progress counters
//! - throttled status writes inside the chunk transaction
//! - retry passes for rows whose parent row isn't imported yet
//!
//! Transformers decide create-vs-reuse by natural key, so running a
//! transformer twice over the same rows creates nothing the second time.

pub mod cases;
pub mod containers;
pub mod links;
pub mod runs;
pub mod sessions;

use async_trait::async_trait;
use casebridge_core::identifiers::RowIssue;
use casebridge_core::models::{EntityKind, EntityProgress, StagedRow};
use casebridge_core::staging::StagingStore;
use serde::de::DeserializeOwned;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};

use crate::config::ChunkPolicy;
use crate::context::ImportContext;
use crate::error::{ImportError, ImportResult};
use crate::jobs::CancelCheck;

/// What happened to one source row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOutcome {
    Created(i64),
    /// An existing target record was reused.
    Mapped(i64),
    /// The row's parent (a source id of the same entity type) isn't
    /// imported yet; retry in a later pass.
    Deferred { parent: i64 },
}

/// Why a row produced no outcome.
#[derive(Debug)]
pub enum RowError {
    /// Per-row data problem: the row is skipped and the job continues.
    Skip(RowIssue),
    /// Anything else ends the run.
    Fatal(ImportError),
}

impl From<RowIssue> for RowError {
    fn from(issue: RowIssue) -> Self {
        RowError::Skip(issue)
    }
}

impl From<sqlx::Error> for RowError {
    fn from(err: sqlx::Error) -> Self {
        RowError::Fatal(ImportError::Database(err))
    }
}

impl From<ImportError> for RowError {
    fn from(err: ImportError) -> Self {
        RowError::Fatal(err)
    }
}

pub type RowResult = Result<RowOutcome, RowError>;

#[async_trait]
pub trait Transformer: Send + Sync {
    type Record: DeserializeOwned + Send + Sync;

    fn kind(&self) -> EntityKind;

    /// Staged datasets this transformer consumes, in processing order.
    fn datasets(&self) -> &'static [&'static str];

    /// Source id recorded in the identifier map for this entity type.
    fn source_id(&self, record: &Self::Record) -> Option<i64>;

    /// Runs once before the first chunk.
    async fn prepare(
        &self,
        _ctx: &mut ImportContext,
        _store: &dyn StagingStore,
    ) -> ImportResult<()> {
        Ok(())
    }

    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        ctx: &mut ImportContext,
        dataset: &str,
        record: &Self::Record,
    ) -> RowResult;

    /// Runs once after the last pass.
    fn finish(&self, _ctx: &mut ImportContext) {}
}

/// Everything a transformer run needs besides the job context.
pub struct Pipeline<'a> {
    pub pool: &'a SqlitePool,
    pub store: &'a dyn StagingStore,
    pub cancel: &'a dyn CancelCheck,
}

struct PendingRow {
    dataset: &'static str,
    row: StagedRow,
    /// Parent the row waited on in its last attempt.
    parent: Option<i64>,
}

type Pending = Vec<PendingRow>;

impl<'a> Pipeline<'a> {
    /// Count the staged rows of one entity type and record them as its
    /// planned total.
    pub async fn plan<T: Transformer>(
        &self,
        ctx: &mut ImportContext,
        transformer: &T,
    ) -> ImportResult<u64> {
        let mut total = 0;
        for dataset in transformer.datasets() {
            total += self
                .store
                .count(&ctx.job_id, dataset)
                .await
                .map_err(ImportError::staging)?;
        }
        ctx.progress.plan(transformer.kind(), total);
        Ok(total)
    }

    /// Import every staged row of one entity type. Uses the planned total
    /// when [`Pipeline::plan`] already ran for it.
    pub async fn run<T: Transformer>(
        &self,
        ctx: &mut ImportContext,
        transformer: &T,
    ) -> ImportResult<EntityProgress> {
        let kind = transformer.kind();
        let policy = ctx.options.chunk_policy(kind);

        let total = if ctx.progress.is_planned(kind) {
            ctx.progress.get(kind).total
        } else {
            self.plan(ctx, transformer).await?
        };
        ctx.current = Some(kind);
        if total == 0 {
            debug!(entity = %kind, "nothing staged");
            return Ok(ctx.progress.get(kind));
        }
        info!(job = %ctx.job_id, entity = %kind, total, chunk = policy.size, "importing");

        transformer.prepare(ctx, self.store).await?;

        let mut deferred: Pending = Vec::new();
        for &dataset in transformer.datasets() {
            let mut offset = 0;
            loop {
                self.check_cancel().await?;
                let rows = self
                    .store
                    .get(&ctx.job_id, dataset, offset, policy.size)
                    .await
                    .map_err(ImportError::staging)?;
                if rows.is_empty() {
                    break;
                }
                let fetched = rows.len() as u64;
                offset += fetched;
                let chunk = rows
                    .into_iter()
                    .map(|row| PendingRow {
                        dataset,
                        row,
                        parent: None,
                    })
                    .collect();
                deferred.extend(self.run_chunk(ctx, transformer, policy, chunk).await?);
                if fetched < policy.size {
                    break;
                }
            }
        }

        let mut pass = 0;
        while !deferred.is_empty() && pass < ctx.options.max_deferred_passes {
            pass += 1;
            let before = deferred.len();
            let mut still: Pending = Vec::new();
            while !deferred.is_empty() {
                self.check_cancel().await?;
                let n = deferred.len().min(policy.size as usize);
                let chunk: Pending = deferred.drain(..n).collect();
                still.extend(self.run_chunk(ctx, transformer, policy, chunk).await?);
            }
            debug!(entity = %kind, pass, resolved = before - still.len(), left = still.len(), "deferred pass");
            deferred = still;
            if deferred.len() == before {
                break;
            }
        }

        for pending in deferred {
            let issue = match pending.parent {
                Some(parent) => RowIssue::unresolved("parent_id", kind, parent),
                None => RowIssue::new("parent_id", "?", "parent row never resolved"),
            };
            skip_row(ctx, kind, pending.dataset, &pending.row, &issue);
        }

        transformer.finish(ctx);
        Ok(ctx.progress.get(kind))
    }

    async fn check_cancel(&self) -> ImportResult<()> {
        if self.cancel.should_abort().await {
            return Err(ImportError::Canceled);
        }
        Ok(())
    }

    /// Apply one chunk inside one transaction; returns the deferred rows.
    async fn run_chunk<T: Transformer>(
        &self,
        ctx: &mut ImportContext,
        transformer: &T,
        policy: ChunkPolicy,
        rows: Pending,
    ) -> ImportResult<Pending> {
        let kind = transformer.kind();
        let size = rows.len();
        let work = async {
            let mut tx = self.pool.begin().await?;
            let mut deferred = Vec::new();
            for PendingRow { dataset, row, .. } in rows {
                let record: T::Record = match serde_json::from_value(row.payload.clone()) {
                    Ok(record) => record,
                    Err(e) => {
                        let issue = RowIssue::new("payload", format!("row {}", row.row_index), e.to_string());
                        skip_row(ctx, kind, dataset, &row, &issue);
                        ctx.tick();
                        continue;
                    }
                };
                match transformer.apply(&mut *tx, ctx, dataset, &record).await {
                    Ok(RowOutcome::Created(target)) => {
                        if let Some(source) = transformer.source_id(&record) {
                            ctx.maps.insert(kind, source, target);
                        }
                        ctx.progress.created(kind);
                    }
                    Ok(RowOutcome::Mapped(target)) => {
                        if let Some(source) = transformer.source_id(&record) {
                            ctx.maps.insert(kind, source, target);
                        }
                        ctx.progress.mapped(kind);
                    }
                    Ok(RowOutcome::Deferred { parent }) => deferred.push(PendingRow {
                        dataset,
                        row,
                        parent: Some(parent),
                    }),
                    Err(RowError::Skip(issue)) => skip_row(ctx, kind, dataset, &row, &issue),
                    Err(RowError::Fatal(e)) => return Err(e),
                }
                ctx.tick();
                if ctx.flush_due() {
                    ctx.flush_status(&mut *tx, None).await?;
                }
            }
            tx.commit().await?;
            Ok::<_, ImportError>(deferred)
        };

        match tokio::time::timeout(policy.timeout, work).await {
            Ok(Ok(deferred)) => {
                debug!(entity = %kind, rows = size, deferred = deferred.len(), "chunk committed");
                Ok(deferred)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ImportError::Timeout {
                entity: kind,
                secs: policy.timeout.as_secs(),
            }),
        }
    }
}

fn skip_row(ctx: &mut ImportContext, kind: EntityKind, dataset: &str, row: &StagedRow, issue: &RowIssue) {
    warn!(
        job = %ctx.job_id,
        entity = %kind,
        dataset,
        row = row.row_index,
        source_id = ?row.source_id,
        field = issue.field,
        raw = %issue.raw,
        reason = %issue.reason,
        "row skipped"
    );
    ctx.progress.skipped(kind);
}
