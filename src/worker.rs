//! Job entry points: `analyze` and `import`.
//!
//! Both are what a queue worker would call with a job id, and both are a
//! no-op on a job that already reached a terminal status. They own the job
//! lifecycle transitions; the analyzer and importer below them only report
//! progress and return errors.
//!
//! ```text
//! PENDING ─analyze─▶ ANALYZING ─▶ READY ─import─▶ RUNNING ─▶ COMPLETED
//!                        │                           ├──────▶ FAILED
//!                        └──▶ CANCELED | FAILED      └──────▶ CANCELED
//! ```

use anyhow::{bail, Result};
use casebridge_core::models::{ActivityEntry, JobStatus};
use casebridge_core::staging::StagingStore;
use sqlx::SqlitePool;
use std::fs::File;
use tracing::{error, info};

use crate::analyzer::{self, AnalyzeOptions, AnalyzeOutcome, AnalyzeProgress};
use crate::config::Config;
use crate::error::{ImportError, ImportResult};
use crate::importer::{self, ImportSummary};
use crate::jobs::{self, JobCancelFlag};
use crate::reindex::{self, SqliteReindexQueue};
use crate::resolver;
use crate::sqlite_staging::SqliteStaging;

/// Stream the job's bundle into staging, record its digest, seed the
/// mapping configuration and move the job to `READY`.
pub async fn run_analyze_job(
    pool: &SqlitePool,
    config: &Config,
    job_id: &str,
    on_progress: &mut (dyn FnMut(AnalyzeProgress) + Send),
) -> Result<JobStatus> {
    let job = jobs::require_job(pool, job_id).await?;
    if job.status.is_terminal() {
        info!(job = job_id, status = %job.status, "job already finished, nothing to analyze");
        return Ok(job.status);
    }
    if job.status == JobStatus::Running {
        bail!("Job {} is importing; it can't be re-analyzed", job_id);
    }

    jobs::set_status(pool, job_id, JobStatus::Analyzing, "analyzing", Some("Analyzing bundle"))
        .await?;
    info!(job = job_id, bundle = %job.bundle_path, "analysis started");

    let store = SqliteStaging::new(pool.clone());
    let cancel = JobCancelFlag::new(pool.clone(), job_id);
    let outcome = analyze(&job.bundle_path, config, job_id, &store, &cancel, on_progress).await;

    match outcome {
        Ok(outcome) if outcome.aborted => {
            jobs::finish(pool, job_id, JobStatus::Canceled, "Analysis canceled", None).await?;
            jobs::log_activity(pool, job_id, ActivityEntry::warning("Analysis canceled")).await?;
            Ok(JobStatus::Canceled)
        }
        Ok(outcome) => {
            if let Some(sha) = &outcome.sha256 {
                jobs::record_bundle(pool, job_id, sha, outcome.bytes_read).await?;
            }
            let seeded = match seed(pool, &store, job_id).await {
                Ok(n) => n,
                Err(e) => return fail(pool, job_id, "Seeding the mapping configuration failed", &e).await,
            };

            let message = format!(
                "Analyzed {} datasets, {} rows staged",
                outcome.datasets.len(),
                outcome.rows_staged
            );
            jobs::set_status(pool, job_id, JobStatus::Ready, "ready", Some(&message)).await?;
            jobs::log_activity(
                pool,
                job_id,
                ActivityEntry::info(format!("{}; {} mapping decisions seeded", message, seeded)),
            )
            .await?;
            info!(job = job_id, datasets = outcome.datasets.len(), rows = outcome.rows_staged, seeded, "analysis finished");
            Ok(JobStatus::Ready)
        }
        Err(e) => fail(pool, job_id, "Analysis failed", &e).await,
    }
}

async fn seed(pool: &SqlitePool, store: &SqliteStaging, job_id: &str) -> ImportResult<u64> {
    let mut mapping = jobs::load_mapping(pool, job_id).await?;
    let seeded = resolver::seed_mapping(store, job_id, &mut mapping).await?;
    let mut conn = pool.acquire().await?;
    jobs::save_mapping(&mut conn, job_id, &mapping).await?;
    Ok(seeded)
}

async fn analyze(
    bundle_path: &str,
    config: &Config,
    job_id: &str,
    store: &SqliteStaging,
    cancel: &JobCancelFlag,
    on_progress: &mut (dyn FnMut(AnalyzeProgress) + Send),
) -> ImportResult<AnalyzeOutcome> {
    let file = File::open(bundle_path)
        .map_err(|e| ImportError::Bundle(format!("cannot open {}: {}", bundle_path, e)))?;
    let size = file
        .metadata()
        .map_err(|e| ImportError::Bundle(format!("cannot stat {}: {}", bundle_path, e)))?
        .len();
    let opts = AnalyzeOptions::from(&config.analyzer);
    analyzer::analyze_bundle(file, size, job_id, store, cancel, &opts, on_progress).await
}

/// Resolve references and import every staged entity type, then move the
/// job to its terminal status and request a reindex on success.
pub async fn run_import_job(pool: &SqlitePool, config: &Config, job_id: &str) -> Result<JobStatus> {
    let job = jobs::require_job(pool, job_id).await?;
    if job.status.is_terminal() {
        info!(job = job_id, status = %job.status, "job already finished, nothing to import");
        return Ok(job.status);
    }
    if !matches!(job.status, JobStatus::Ready | JobStatus::Running) {
        bail!(
            "Job {} is {}; run `casebridge analyze {}` first",
            job_id,
            job.status,
            job_id
        );
    }

    jobs::mark_started(pool, job_id).await?;
    info!(job = job_id, "import started");

    let store = SqliteStaging::new(pool.clone());
    let cancel = JobCancelFlag::new(pool.clone(), job_id);
    match importer::import_job(pool, &store, &cancel, config, job_id).await {
        Ok(summary) => {
            let message = completion_message(&summary);
            jobs::finish(pool, job_id, JobStatus::Completed, &message, None).await?;
            jobs::log_activity(pool, job_id, ActivityEntry::info(message.clone())).await?;
            info!(job = job_id, processed = summary.processed, skipped = summary.skipped, errors = summary.errors, "import completed");
            if config.import.reindex_on_complete {
                reindex::request_reindex(&SqliteReindexQueue::new(pool.clone()), job_id).await;
            }
            Ok(JobStatus::Completed)
        }
        Err(ImportError::Canceled) => {
            jobs::finish(pool, job_id, JobStatus::Canceled, "Import canceled", None).await?;
            jobs::log_activity(pool, job_id, ActivityEntry::warning("Import canceled")).await?;
            info!(job = job_id, "import canceled");
            Ok(JobStatus::Canceled)
        }
        Err(e) => fail(pool, job_id, "Import failed", &e).await,
    }
}

/// Delete a job's staged rows. Staging is only needed until the job is
/// finished, so purging a job that may still run requires `force`.
pub async fn purge_staging(pool: &SqlitePool, job_id: &str, force: bool) -> Result<u64> {
    let job = jobs::require_job(pool, job_id).await?;
    if !job.status.is_terminal() && job.status != JobStatus::Pending && !force {
        bail!(
            "Job {} is {}; purging its staging now would break the import (use --force)",
            job_id,
            job.status
        );
    }
    let removed = SqliteStaging::new(pool.clone())
        .delete(job_id, None)
        .await?;
    jobs::log_activity(
        pool,
        job_id,
        ActivityEntry::info(format!("Purged {} staged rows", removed)),
    )
    .await?;
    info!(job = job_id, rows = removed, "staging purged");
    Ok(removed)
}

fn completion_message(summary: &ImportSummary) -> String {
    let mut message = format!("Imported {} records", summary.processed);
    if summary.skipped > 0 {
        message.push_str(&format!(", {} rows skipped", summary.skipped));
    }
    if summary.errors > 0 {
        message.push_str(&format!(", {} data warnings", summary.errors));
    }
    message
}

async fn fail(pool: &SqlitePool, job_id: &str, what: &str, e: &ImportError) -> Result<JobStatus> {
    let detail = e.to_string();
    error!(job = job_id, error = %detail, "{}", what);
    jobs::finish(pool, job_id, JobStatus::Failed, what, Some(&detail)).await?;
    jobs::log_activity(pool, job_id, ActivityEntry::error(format!("{}: {}", what, detail))).await?;
    Ok(JobStatus::Failed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_message_mentions_skips_and_warnings() {
        let mut summary = ImportSummary {
            processed: 90,
            ..Default::default()
        };
        assert_eq!(completion_message(&summary), "Imported 90 records");
        summary.skipped = 10;
        summary.errors = 2;
        assert_eq!(
            completion_message(&summary),
            "Imported 90 records, 10 rows skipped, 2 data warnings"
        );
    }
}
