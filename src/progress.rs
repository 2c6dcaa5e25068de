//! CLI progress reporting for `analyze`, `import` and `run`.
//!
//! Progress goes to **stderr** so stdout stays parseable for scripts. The
//! analyzer reports through its progress callback; the import is watched by
//! polling the job row, which is the same status contract any other tool
//! would read.

use casebridge_core::models::JobStatus;
use sqlx::SqlitePool;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use crate::analyzer::AnalyzeProgress;
use crate::jobs;

/// A single progress event.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    Analyzing {
        job: String,
        progress: AnalyzeProgress,
    },
    Importing {
        job: String,
        entity: Option<String>,
        processed: u64,
        total: u64,
        eta_seconds: Option<i64>,
    },
    Finished {
        job: String,
        status: JobStatus,
    },
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr:
/// `import 3f2a…  repository_case  1,234 / 5,000  eta 2m 10s`.
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Analyzing { job, progress } => format!(
                "analyze {}  {:>5.1}%  {} / {} bytes{}\n",
                short_id(job),
                progress.percentage,
                format_number(progress.bytes_read),
                format_number(progress.total_bytes),
                eta_suffix(progress.eta_seconds.map(|s| s as i64))
            ),
            ProgressEvent::Importing {
                job,
                entity,
                processed,
                total,
                eta_seconds,
            } => format!(
                "import {}  {}  {} / {}{}\n",
                short_id(job),
                entity.as_deref().unwrap_or("-"),
                format_number(*processed),
                format_number(*total),
                eta_suffix(*eta_seconds)
            ),
            ProgressEvent::Finished { job, status } => {
                format!("job {}  {}\n", short_id(job), status)
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Analyzing { job, progress } => serde_json::json!({
                "event": "progress",
                "job": job,
                "phase": "analyzing",
                "bytesRead": progress.bytes_read,
                "totalBytes": progress.total_bytes,
                "percentage": progress.percentage,
                "etaSeconds": progress.eta_seconds,
            }),
            ProgressEvent::Importing {
                job,
                entity,
                processed,
                total,
                eta_seconds,
            } => serde_json::json!({
                "event": "progress",
                "job": job,
                "phase": "importing",
                "entity": entity,
                "processed": processed,
                "total": total,
                "etaSeconds": eta_seconds,
            }),
            ProgressEvent::Finished { job, status } => serde_json::json!({
                "event": "finished",
                "job": job,
                "status": status,
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

fn short_id(job: &str) -> &str {
    job.get(..8).unwrap_or(job)
}

fn eta_suffix(eta: Option<i64>) -> String {
    match eta {
        Some(s) if s >= 0 => format!("  eta {}", format_duration(s as u64)),
        _ => String::new(),
    }
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// `75` → `1m 15s`, `7260` → `2h 1m`.
pub fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Arc<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Arc::new(NoProgress),
            ProgressMode::Human => Arc::new(StderrProgress),
            ProgressMode::Json => Arc::new(JsonProgress),
        }
    }
}

/// Poll the job row and report import progress until the task is aborted.
pub async fn watch_import(
    pool: SqlitePool,
    job_id: String,
    reporter: Arc<dyn ProgressReporter>,
    every: Duration,
) {
    let mut ticker = tokio::time::interval(every);
    let mut last: Option<(u64, Option<String>)> = None;
    loop {
        ticker.tick().await;
        let Ok(Some(job)) = jobs::get_job(&pool, &job_id).await else {
            continue;
        };
        let processed = job.processed_count.max(0) as u64;
        let current = (processed, job.current_entity.clone());
        if last.as_ref() == Some(&current) {
            continue;
        }
        last = Some(current);
        reporter.report(ProgressEvent::Importing {
            job: job_id.clone(),
            entity: job.current_entity,
            processed,
            total: job.total_count.max(0) as u64,
            eta_seconds: job.estimated_time_remaining,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn durations_are_compact() {
        assert_eq!(format_duration(42), "42s");
        assert_eq!(format_duration(75), "1m 15s");
        assert_eq!(format_duration(7260), "2h 1m");
    }

    #[test]
    fn short_ids() {
        assert_eq!(short_id("3f2a9c1e-0000-4000"), "3f2a9c1e");
        assert_eq!(short_id("abc"), "abc");
    }
}
