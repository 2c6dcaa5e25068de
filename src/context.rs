//! Job-scoped state shared by the resolver and every transformer.
//!
//! One [`ImportContext`] is built per import run and dropped at the end of
//! it. Identifier maps, the repository canonicalizer, the rich-text cache,
//! the progress counters and the status-write throttle all live here, so
//! nothing leaks between jobs.

use casebridge_core::estimate::Estimator;
use casebridge_core::identifiers::{IdentifierMaps, RepositoryCanonicalizer};
use casebridge_core::models::{ActivityEntry, EntityKind};
use casebridge_core::progress::ProgressTracker;
use casebridge_core::richtext::RichTextNormalizer;
use serde_json::Value;
use sqlx::SqliteConnection;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;
use tracing::debug;

use crate::config::{Config, ImportConfig};
use crate::error::ImportResult;
use crate::jobs::{self, StatusSnapshot};

/// Phase name written while content rows are being imported.
pub const PHASE_IMPORTING: &str = "importing";

pub struct ImportContext {
    pub job_id: String,
    pub options: ImportConfig,
    pub maps: IdentifierMaps,
    pub canonical: RepositoryCanonicalizer,
    pub richtext: RichTextNormalizer,
    pub progress: ProgressTracker,
    pub estimator: Estimator,
    /// Target custom field id → field type.
    pub field_types: HashMap<i64, String>,
    /// `(target field id, lowercased option name)` → target option id.
    pub field_options: HashMap<(i64, String), i64>,
    /// Target custom field id → number of option values dropped.
    pub dropped_options: BTreeMap<i64, u64>,
    /// Data problems that did not skip a row (dropped options).
    pub errors: u64,
    pub current: Option<EntityKind>,
    pending_activity: Vec<ActivityEntry>,
    since_flush: u64,
    last_flush: Instant,
}

impl ImportContext {
    pub fn new(job_id: impl Into<String>, config: &Config) -> Self {
        Self {
            job_id: job_id.into(),
            options: config.import.clone(),
            maps: IdentifierMaps::new(),
            canonical: RepositoryCanonicalizer::new(),
            richtext: RichTextNormalizer::new(config.richtext.cache_capacity),
            progress: ProgressTracker::new(),
            estimator: Estimator::new(),
            field_types: HashMap::new(),
            field_options: HashMap::new(),
            dropped_options: BTreeMap::new(),
            errors: 0,
            current: None,
            pending_activity: Vec::new(),
            since_flush: 0,
            last_flush: Instant::now(),
        }
    }

    /// Normalize a rich-text source value and serialize it for storage.
    pub fn rich_text(&mut self, value: Option<&Value>) -> Option<String> {
        self.richtext.normalize(value).map(|doc| doc.to_string())
    }

    /// Queue an activity-log entry; it is written with the next status flush.
    pub fn note(&mut self, entry: ActivityEntry) {
        self.pending_activity.push(entry);
    }

    /// Count one processed row towards the status-write throttle.
    pub fn tick(&mut self) {
        self.since_flush += 1;
    }

    /// True once enough rows or enough time has passed since the last write.
    pub fn flush_due(&self) -> bool {
        self.since_flush >= self.options.status_interval_items
            || self.last_flush.elapsed() >= self.options.status_interval()
    }

    /// Write the status columns and any queued activity entries.
    pub async fn flush_status(
        &mut self,
        conn: &mut SqliteConnection,
        message: Option<String>,
    ) -> ImportResult<()> {
        let processed = self.progress.processed();
        let total = self.progress.total();
        self.estimator.record(processed);
        let entity_progress = self.progress.snapshot();
        let snapshot = StatusSnapshot {
            phase: PHASE_IMPORTING,
            message,
            current_entity: self.current,
            processed,
            total,
            skipped: self.progress.skipped_total(),
            errors: self.errors,
            estimate: self.estimator.estimate(total),
            entity_progress: &entity_progress,
        };
        jobs::write_progress(conn, &self.job_id, &snapshot).await?;
        jobs::append_activity(conn, &self.job_id, &self.pending_activity).await?;
        debug!(job = %self.job_id, processed, total, "status written");
        self.pending_activity.clear();
        self.since_flush = 0;
        self.last_flush = Instant::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        toml::from_str(
            r#"
            [db]
            path = "unused.sqlite"

            [import]
            status_interval_items = 3
            status_interval_secs = 3600
            "#,
        )
        .unwrap()
    }

    #[test]
    fn flush_is_due_after_interval_items() {
        let mut ctx = ImportContext::new("job", &config());
        assert!(!ctx.flush_due());
        ctx.tick();
        ctx.tick();
        assert!(!ctx.flush_due());
        ctx.tick();
        assert!(ctx.flush_due());
    }

    #[test]
    fn rich_text_is_stored_as_canonical_json() {
        let mut ctx = ImportContext::new("job", &config());
        let stored = ctx
            .rich_text(Some(&Value::String("hello".into())))
            .unwrap();
        let doc: Value = serde_json::from_str(&stored).unwrap();
        assert_eq!(doc["type"], "doc");
        assert_eq!(ctx.rich_text(Some(&Value::Null)), None);
    }
}
