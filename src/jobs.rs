//! Import job records: creation, lifecycle transitions, status writes and
//! the activity log.
//!
//! The job row is the status contract other tools read. Everything the
//! pipeline reports (counts, current entity, ETA, per-entity progress,
//! activity log) is written here, and the `cancel_requested` flag set by
//! `casebridge cancel` is read back between chunks.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use casebridge_core::estimate::Estimate;
use casebridge_core::mapping::MappingConfiguration;
use casebridge_core::models::{ActivityEntry, EntityKind, EntityProgress, JobStatus};
use serde::Serialize;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

/// The activity log keeps only the newest entries.
pub const ACTIVITY_LOG_LIMIT: usize = 500;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportJob {
    pub id: String,
    pub status: JobStatus,
    pub phase: Option<String>,
    pub status_message: Option<String>,
    pub bundle_path: String,
    pub bundle_sha256: Option<String>,
    pub bundle_size: Option<i64>,
    pub cancel_requested: bool,
    pub processed_count: i64,
    pub error_count: i64,
    pub skipped_count: i64,
    pub total_count: i64,
    pub current_entity: Option<String>,
    /// Seconds.
    pub estimated_time_remaining: Option<i64>,
    /// Items per second.
    pub processing_rate: Option<f64>,
    pub activity_log: Vec<ActivityEntry>,
    pub entity_progress: BTreeMap<EntityKind, EntityProgress>,
    #[serde(skip)]
    pub mapping: MappingConfiguration,
    pub error: Option<String>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

/// A progress write from the importer.
#[derive(Debug)]
pub struct StatusSnapshot<'a> {
    pub phase: &'a str,
    pub message: Option<String>,
    pub current_entity: Option<EntityKind>,
    pub processed: u64,
    pub total: u64,
    pub skipped: u64,
    pub errors: u64,
    pub estimate: Option<Estimate>,
    pub entity_progress: &'a BTreeMap<EntityKind, EntityProgress>,
}

pub async fn create_job(
    pool: &SqlitePool,
    bundle_path: &Path,
    mapping: Option<&MappingConfiguration>,
) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    let mapping_json = serde_json::to_string(&mapping.cloned().unwrap_or_default())?;
    sqlx::query(
        r#"
        INSERT INTO import_jobs (id, status, phase, bundle_path, mapping_configuration, created_at)
        VALUES (?, ?, 'created', ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(JobStatus::Pending.as_str())
    .bind(bundle_path.display().to_string())
    .bind(&mapping_json)
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(id)
}

pub async fn get_job(pool: &SqlitePool, id: &str) -> Result<Option<ImportJob>> {
    let row = sqlx::query("SELECT * FROM import_jobs WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let status: String = row.get("status");
    let activity: String = row.get("activity_log");
    let progress: String = row.get("entity_progress");
    let mapping: String = row.get("mapping_configuration");

    Ok(Some(ImportJob {
        id: row.get("id"),
        status: status.parse()?,
        phase: row.get("phase"),
        status_message: row.get("status_message"),
        bundle_path: row.get("bundle_path"),
        bundle_sha256: row.get("bundle_sha256"),
        bundle_size: row.get("bundle_size"),
        cancel_requested: row.get::<i64, _>("cancel_requested") != 0,
        processed_count: row.get("processed_count"),
        error_count: row.get("error_count"),
        skipped_count: row.get("skipped_count"),
        total_count: row.get("total_count"),
        current_entity: row.get("current_entity"),
        estimated_time_remaining: row.get("estimated_time_remaining"),
        processing_rate: row.get("processing_rate"),
        activity_log: serde_json::from_str(&activity).context("corrupt activity log")?,
        entity_progress: serde_json::from_str(&progress).context("corrupt entity progress")?,
        mapping: serde_json::from_str(&mapping).context("corrupt mapping configuration")?,
        error: row.get("error"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
    }))
}

pub async fn require_job(pool: &SqlitePool, id: &str) -> Result<ImportJob> {
    match get_job(pool, id).await? {
        Some(job) => Ok(job),
        None => bail!("No import job found with id: {}", id),
    }
}

pub async fn set_status(
    pool: &SqlitePool,
    id: &str,
    status: JobStatus,
    phase: &str,
    message: Option<&str>,
) -> Result<()> {
    sqlx::query("UPDATE import_jobs SET status = ?, phase = ?, status_message = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(phase)
        .bind(message)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Move a job to `RUNNING`. `started_at` keeps the first start across retries.
pub async fn mark_started(pool: &SqlitePool, id: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE import_jobs
        SET status = ?, phase = 'resolving', status_message = NULL, error = NULL,
            started_at = COALESCE(started_at, ?)
        WHERE id = ?
        "#,
    )
    .bind(JobStatus::Running.as_str())
    .bind(chrono::Utc::now().timestamp())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Final status write: terminal status, message, optional error.
pub async fn finish(
    pool: &SqlitePool,
    id: &str,
    status: JobStatus,
    message: &str,
    error: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE import_jobs
        SET status = ?, phase = 'finished', status_message = ?, error = ?,
            estimated_time_remaining = NULL, completed_at = ?
        WHERE id = ?
        "#,
    )
    .bind(status.as_str())
    .bind(message)
    .bind(error)
    .bind(chrono::Utc::now().timestamp())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn record_bundle(pool: &SqlitePool, id: &str, sha256: &str, size: u64) -> Result<()> {
    sqlx::query("UPDATE import_jobs SET bundle_sha256 = ?, bundle_size = ? WHERE id = ?")
        .bind(sha256)
        .bind(size as i64)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Flag a job for cancellation. Returns `false` when the job is already
/// terminal (nothing to cancel).
pub async fn request_cancel(pool: &SqlitePool, id: &str) -> Result<bool> {
    let job = require_job(pool, id).await?;
    if job.status.is_terminal() {
        return Ok(false);
    }
    sqlx::query("UPDATE import_jobs SET cancel_requested = 1 WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(true)
}

pub async fn cancel_requested(pool: &SqlitePool, id: &str) -> Result<bool> {
    let flag: Option<i64> =
        sqlx::query_scalar("SELECT cancel_requested FROM import_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?;
    Ok(flag.unwrap_or(0) != 0)
}

pub async fn load_mapping(pool: &SqlitePool, id: &str) -> Result<MappingConfiguration> {
    Ok(require_job(pool, id).await?.mapping)
}

pub async fn save_mapping(
    conn: &mut SqliteConnection,
    id: &str,
    mapping: &MappingConfiguration,
) -> Result<()> {
    sqlx::query("UPDATE import_jobs SET mapping_configuration = ? WHERE id = ?")
        .bind(serde_json::to_string(mapping)?)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Overlay operator decisions on the job's current (possibly seeded)
/// mapping configuration.
pub async fn apply_operator_mapping(
    pool: &SqlitePool,
    id: &str,
    operator: MappingConfiguration,
) -> Result<MappingConfiguration> {
    let mut mapping = load_mapping(pool, id).await?;
    mapping.apply_overrides(operator);
    let mut conn = pool.acquire().await?;
    save_mapping(&mut conn, id, &mapping).await?;
    Ok(mapping)
}

/// Append entries to the activity log, keeping the newest
/// [`ACTIVITY_LOG_LIMIT`].
pub async fn append_activity(
    conn: &mut SqliteConnection,
    id: &str,
    entries: &[ActivityEntry],
) -> Result<()> {
    if entries.is_empty() {
        return Ok(());
    }
    let current: Option<String> =
        sqlx::query_scalar("SELECT activity_log FROM import_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
    let mut log: Vec<ActivityEntry> = match current {
        Some(json) => serde_json::from_str(&json).unwrap_or_default(),
        None => bail!("No import job found with id: {}", id),
    };
    log.extend_from_slice(entries);
    if log.len() > ACTIVITY_LOG_LIMIT {
        let excess = log.len() - ACTIVITY_LOG_LIMIT;
        log.drain(..excess);
    }
    sqlx::query("UPDATE import_jobs SET activity_log = ? WHERE id = ?")
        .bind(serde_json::to_string(&log)?)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn log_activity(pool: &SqlitePool, id: &str, entry: ActivityEntry) -> Result<()> {
    let mut conn = pool.acquire().await?;
    append_activity(&mut conn, id, std::slice::from_ref(&entry)).await
}

/// Write the live progress columns.
pub async fn write_progress(
    conn: &mut SqliteConnection,
    id: &str,
    snapshot: &StatusSnapshot<'_>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE import_jobs
        SET phase = ?, status_message = COALESCE(?, status_message), current_entity = ?,
            processed_count = ?, total_count = ?, skipped_count = ?, error_count = ?,
            estimated_time_remaining = ?, processing_rate = ?, entity_progress = ?
        WHERE id = ?
        "#,
    )
    .bind(snapshot.phase)
    .bind(snapshot.message.as_deref())
    .bind(snapshot.current_entity.map(|k| k.as_str()))
    .bind(snapshot.processed as i64)
    .bind(snapshot.total as i64)
    .bind(snapshot.skipped as i64)
    .bind(snapshot.errors as i64)
    .bind(snapshot.estimate.map(|e| e.seconds_remaining as i64))
    .bind(snapshot.estimate.map(|e| e.rate))
    .bind(serde_json::to_string(snapshot.entity_progress)?)
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Polled between chunks and datasets to honour cancellation.
#[async_trait]
pub trait CancelCheck: Send + Sync {
    async fn should_abort(&self) -> bool;
}

/// Reads the job's `cancel_requested` column.
pub struct JobCancelFlag {
    pool: SqlitePool,
    job_id: String,
}

impl JobCancelFlag {
    pub fn new(pool: SqlitePool, job_id: impl Into<String>) -> Self {
        Self {
            pool,
            job_id: job_id.into(),
        }
    }
}

#[async_trait]
impl CancelCheck for JobCancelFlag {
    async fn should_abort(&self) -> bool {
        match cancel_requested(&self.pool, &self.job_id).await {
            Ok(flag) => flag,
            Err(e) => {
                tracing::warn!(job = %self.job_id, error = %e, "could not read cancel flag");
                false
            }
        }
    }
}

#[async_trait]
impl CancelCheck for AtomicBool {
    async fn should_abort(&self) -> bool {
        self.load(Ordering::SeqCst)
    }
}
