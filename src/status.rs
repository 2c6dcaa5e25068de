//! Job status and staged-dataset overviews for `casebridge status` and
//! `casebridge datasets`.
//!
//! Everything printed here is read back from the job row and the staging
//! tables, so it shows the same picture whether the job runs in this
//! process or another one.

use anyhow::Result;
use casebridge_core::models::{ActivityEntry, ActivityLevel, Dataset, JobStatus};
use casebridge_core::staging::StagingStore;
use sqlx::{Row, SqlitePool};

use crate::jobs::{self, ImportJob};
use crate::progress::{format_duration, format_number};
use crate::sqlite_staging::SqliteStaging;

/// How many activity entries `status` shows.
const RECENT_ACTIVITY: usize = 10;

/// Print one job's status, or its JSON form with `--json`.
pub async fn run_status(pool: &SqlitePool, job_id: &str, json: bool) -> Result<()> {
    let job = jobs::require_job(pool, job_id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&job)?);
        return Ok(());
    }
    print!("{}", render_status(&job));
    Ok(())
}

fn render_status(job: &ImportJob) -> String {
    let mut out = String::new();
    let mut line = |s: String| {
        out.push_str(&s);
        out.push('\n');
    };

    line(format!("Import job {}", job.id));
    line("=".repeat(11 + job.id.len()));
    line(String::new());
    line(format!("  Status:      {}", job.status));
    if let Some(phase) = &job.phase {
        line(format!("  Phase:       {}", phase));
    }
    if let Some(message) = &job.status_message {
        line(format!("  Message:     {}", message));
    }
    line(format!("  Bundle:      {}", job.bundle_path));
    if let Some(size) = job.bundle_size {
        line(format!("  Size:        {}", format_bytes(size.max(0) as u64)));
    }
    if let Some(sha) = &job.bundle_sha256 {
        line(format!("  SHA-256:     {}", sha));
    }
    line(format!("  Created:     {}", format_ts_relative(job.created_at)));
    if let Some(ts) = job.started_at {
        line(format!("  Started:     {}", format_ts_relative(ts)));
    }
    if let Some(ts) = job.completed_at {
        line(format!("  Finished:    {}", format_ts_relative(ts)));
    }
    if job.cancel_requested && !job.status.is_terminal() {
        line("  Cancel:      requested".to_string());
    }

    line(String::new());
    line(format!(
        "  Processed:   {} / {}",
        format_number(job.processed_count.max(0) as u64),
        format_number(job.total_count.max(0) as u64)
    ));
    line(format!("  Skipped:     {}", format_number(job.skipped_count.max(0) as u64)));
    line(format!("  Warnings:    {}", format_number(job.error_count.max(0) as u64)));
    if job.status == JobStatus::Running {
        if let Some(entity) = &job.current_entity {
            line(format!("  Current:     {}", entity));
        }
        if let Some(rate) = job.processing_rate {
            line(format!("  Rate:        {:.1} items/s", rate));
        }
        if let Some(eta) = job.estimated_time_remaining {
            line(format!("  ETA:         {}", format_duration(eta.max(0) as u64)));
        }
    }

    let entities: Vec<_> = job
        .entity_progress
        .iter()
        .filter(|(_, p)| p.total + p.skipped > 0)
        .collect();
    if !entities.is_empty() {
        line(String::new());
        line(format!(
            "  {:<28} {:>9} {:>9} {:>9} {:>9}",
            "ENTITY", "TOTAL", "CREATED", "MAPPED", "SKIPPED"
        ));
        line(format!("  {}", "-".repeat(68)));
        for (kind, p) in entities {
            line(format!(
                "  {:<28} {:>9} {:>9} {:>9} {:>9}",
                kind.as_str(),
                format_number(p.total),
                format_number(p.created),
                format_number(p.mapped),
                format_number(p.skipped)
            ));
        }
    }

    if let Some(error) = &job.error {
        line(String::new());
        line(format!("  Error:       {}", error));
    }

    let recent = recent_activity(&job.activity_log, RECENT_ACTIVITY);
    if !recent.is_empty() {
        line(String::new());
        line("  Recent activity:".to_string());
        for entry in recent {
            line(format!(
                "  {:<16} {:<8} {}",
                format_ts_iso(entry.at.timestamp()),
                level_label(entry.level),
                entry.message
            ));
        }
    }
    out
}

fn level_label(level: ActivityLevel) -> &'static str {
    match level {
        ActivityLevel::Info => "info",
        ActivityLevel::Warning => "warning",
        ActivityLevel::Error => "error",
    }
}

fn recent_activity(log: &[ActivityEntry], n: usize) -> &[ActivityEntry] {
    &log[log.len().saturating_sub(n)..]
}

/// Print the datasets staged for a job: row counts and inferred columns.
pub async fn run_datasets(pool: &SqlitePool, job_id: &str, json: bool) -> Result<()> {
    jobs::require_job(pool, job_id).await?;
    let datasets = SqliteStaging::new(pool.clone()).datasets(job_id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&datasets)?);
        return Ok(());
    }
    if datasets.is_empty() {
        println!("No datasets staged for job {}. Run `casebridge analyze {}` first.", job_id, job_id);
        return Ok(());
    }
    print!("{}", render_datasets(&datasets));
    Ok(())
}

fn render_datasets(datasets: &[Dataset]) -> String {
    let mut out = format!("  {:<36} {:>10} {:>8}\n", "DATASET", "ROWS", "COLUMNS");
    out.push_str(&format!("  {}\n", "-".repeat(56)));
    let mut total = 0u64;
    for d in datasets {
        total += d.row_count;
        out.push_str(&format!(
            "  {:<36} {:>10} {:>8}\n",
            d.name,
            format_number(d.row_count),
            d.schema.len()
        ));
    }
    out.push_str(&format!("  {}\n", "-".repeat(56)));
    out.push_str(&format!("  {:<36} {:>10}\n", "total", format_number(total)));
    out
}

/// Recent jobs, newest first, for `casebridge jobs`.
pub async fn run_list_jobs(pool: &SqlitePool, limit: i64) -> Result<()> {
    let rows = sqlx::query(
        r#"
        SELECT id, status, processed_count, total_count, created_at
        FROM import_jobs
        ORDER BY created_at DESC
        LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    if rows.is_empty() {
        println!("No import jobs.");
        return Ok(());
    }
    println!(
        "  {:<36} {:<10} {:>21}   {}",
        "JOB", "STATUS", "PROCESSED", "CREATED"
    );
    println!("  {}", "-".repeat(86));
    for row in &rows {
        let id: String = row.get("id");
        let status: String = row.get("status");
        let processed: i64 = row.get("processed_count");
        let total: i64 = row.get("total_count");
        let created: i64 = row.get("created_at");
        println!(
            "  {:<36} {:<10} {:>21}   {}",
            id,
            status,
            format!(
                "{} / {}",
                format_number(processed.max(0) as u64),
                format_number(total.max(0) as u64)
            ),
            format_ts_relative(created)
        );
    }
    Ok(())
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// "3 hours ago" for recent timestamps, a date beyond a month.
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }
    let plural = |n: i64| if n == 1 { "" } else { "s" };
    match delta {
        d if d < 60 => "just now".to_string(),
        d if d < 3600 => format!("{} min{} ago", d / 60, plural(d / 60)),
        d if d < 86400 => format!("{} hour{} ago", d / 3600, plural(d / 3600)),
        d if d < 86400 * 30 => format!("{} day{} ago", d / 86400, plural(d / 86400)),
        _ => format_ts_iso(ts),
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn relative_timestamps() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 120), "2 mins ago");
        assert_eq!(format_ts_relative(now - 3600), "1 hour ago");
    }

    #[test]
    fn dataset_table_totals_rows() {
        let mut a = Dataset::new("projects");
        a.observe(&serde_json::json!({"id": 1, "name": "Web"}), 5);
        a.observe(&serde_json::json!({"id": 2, "name": "Api"}), 5);
        let mut b = Dataset::new("repository_cases");
        b.row_count = 1200;
        let table = render_datasets(&[a, b]);
        assert!(table.contains("projects"));
        assert!(table.contains("1,200"));
        assert!(table.lines().last().unwrap().contains("1,202"));
    }

    #[test]
    fn recent_activity_keeps_the_tail() {
        let log: Vec<ActivityEntry> = (0..15).map(|i| ActivityEntry::info(format!("e{}", i))).collect();
        let tail = recent_activity(&log, 10);
        assert_eq!(tail.len(), 10);
        assert_eq!(tail[0].message, "e5");
        assert_eq!(recent_activity(&log[..3], 10).len(), 3);
    }
}
