//! Export analyzer: one streaming pass over the bundle.
//!
//! The bundle is a JSON object whose keys are dataset names and whose values
//! are arrays of rows:
//!
//! ```json
//! { "projects": [ {"id": 1, "name": "Web"} ],
//!   "repository_cases": [ ... ],
//!   "exported_at": "2024-01-01" }
//! ```
//!
//! An object-valued section (`{"data": {...}}`) is descended once and its
//! keys are treated as dataset names. Scalar sections are bundle metadata
//! and are ignored. A dataset name that shows up twice keeps counting rows
//! where it left off.
//!
//! The parse runs on a blocking thread with a `serde` visitor, so rows are
//! decoded one at a time and the file is never buffered whole. Row batches
//! travel to the async staging writer over a bounded channel; the writer
//! persists them, reports progress and checks for cancellation after each
//! dataset.

use anyhow::anyhow;
use casebridge_core::estimate::{Estimate, Estimator};
use casebridge_core::models::{Dataset, StagedRow};
use casebridge_core::staging::StagingStore;
use serde::de::{self, DeserializeSeed, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::io::{self, BufReader, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::AnalyzerConfig;
use crate::error::{ImportError, ImportResult};
use crate::jobs::CancelCheck;

/// Batches in flight between the parse thread and the staging writer.
const CHANNEL_DEPTH: usize = 4;

#[derive(Debug, Clone)]
pub struct AnalyzeOptions {
    pub batch_rows: usize,
    pub sample_rows: usize,
    pub progress_interval: Duration,
}

impl From<&AnalyzerConfig> for AnalyzeOptions {
    fn from(cfg: &AnalyzerConfig) -> Self {
        Self {
            batch_rows: cfg.batch_rows,
            sample_rows: cfg.sample_rows,
            progress_interval: Duration::from_millis(cfg.progress_interval_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AnalyzeProgress {
    pub bytes_read: u64,
    pub total_bytes: u64,
    pub percentage: f64,
    pub eta_seconds: Option<u64>,
}

impl AnalyzeProgress {
    fn new(bytes_read: u64, total_bytes: u64, estimate: Option<Estimate>) -> Self {
        let percentage = if total_bytes == 0 {
            0.0
        } else {
            (bytes_read as f64 / total_bytes as f64 * 100.0).min(100.0)
        };
        Self {
            bytes_read,
            total_bytes,
            percentage,
            eta_seconds: estimate.map(|e| e.seconds_remaining),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnalyzeOutcome {
    pub datasets: Vec<Dataset>,
    pub rows_staged: u64,
    /// Hex SHA-256 of the bundle; `None` when the pass was aborted.
    pub sha256: Option<String>,
    pub bytes_read: u64,
    pub aborted: bool,
}

enum Message {
    Rows { dataset: String, rows: Vec<StagedRow> },
    Finished(Dataset),
}

/// Stream a bundle into the staging store.
pub async fn analyze_bundle<R>(
    reader: R,
    total_bytes: u64,
    job_id: &str,
    store: &dyn StagingStore,
    cancel: &dyn CancelCheck,
    opts: &AnalyzeOptions,
    on_progress: &mut (dyn FnMut(AnalyzeProgress) + Send),
) -> ImportResult<AnalyzeOutcome>
where
    R: Read + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel(CHANNEL_DEPTH);
    let bytes = Arc::new(AtomicU64::new(0));
    let sink = BatchSink::new(tx, opts.batch_rows.max(1), opts.sample_rows);
    let counter = Arc::clone(&bytes);
    let parser = tokio::task::spawn_blocking(move || parse_blocking(reader, counter, sink));

    let mut estimator = Estimator::new();
    let mut last_report: Option<Instant> = None;
    let mut datasets: Vec<Dataset> = Vec::new();
    let mut rows_staged = 0u64;
    let mut aborted = false;

    while let Some(msg) = rx.recv().await {
        match msg {
            Message::Rows { dataset, rows } => {
                store
                    .put(job_id, &dataset, &rows)
                    .await
                    .map_err(ImportError::staging)?;
                rows_staged += rows.len() as u64;
            }
            Message::Finished(dataset) => {
                store
                    .save_dataset(job_id, &dataset)
                    .await
                    .map_err(ImportError::staging)?;
                debug!(job = job_id, dataset = %dataset.name, rows = dataset.row_count, "dataset staged");
                match datasets.iter_mut().find(|d| d.name == dataset.name) {
                    Some(existing) => *existing = dataset,
                    None => datasets.push(dataset),
                }
                if cancel.should_abort().await {
                    aborted = true;
                    break;
                }
            }
        }

        let read = bytes.load(Ordering::Relaxed);
        estimator.record(read);
        if last_report.map_or(true, |at| at.elapsed() >= opts.progress_interval) {
            on_progress(AnalyzeProgress::new(
                read,
                total_bytes,
                estimator.estimate(total_bytes),
            ));
            last_report = Some(Instant::now());
        }
    }
    // Closing the channel stops the parse thread if it is still running.
    drop(rx);

    let parsed = parser
        .await
        .map_err(|e| ImportError::Other(anyhow!("bundle parser task failed: {}", e)))?;
    let bytes_read = bytes.load(Ordering::Relaxed);

    if aborted {
        info!(job = job_id, datasets = datasets.len(), "analysis aborted");
        return Ok(AnalyzeOutcome {
            datasets,
            rows_staged,
            sha256: None,
            bytes_read,
            aborted: true,
        });
    }

    let sha256 = parsed.map_err(|e| ImportError::Bundle(format!("{:#}", e)))?;
    on_progress(AnalyzeProgress {
        bytes_read,
        total_bytes: total_bytes.max(bytes_read),
        percentage: 100.0,
        eta_seconds: Some(0),
    });
    info!(
        job = job_id,
        datasets = datasets.len(),
        rows = rows_staged,
        bytes = bytes_read,
        "analysis finished"
    );

    Ok(AnalyzeOutcome {
        datasets,
        rows_staged,
        sha256: Some(sha256),
        bytes_read,
        aborted: false,
    })
}

/// Hashes and counts every byte that passes through.
struct DigestReader<R> {
    inner: R,
    hasher: Sha256,
    bytes: Arc<AtomicU64>,
}

impl<R: Read> Read for DigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

fn parse_blocking<R: Read>(
    reader: R,
    bytes: Arc<AtomicU64>,
    mut sink: BatchSink,
) -> anyhow::Result<String> {
    let mut buffered = BufReader::new(DigestReader {
        inner: reader,
        hasher: Sha256::new(),
        bytes,
    });

    let mut de = serde_json::Deserializer::from_reader(&mut buffered);
    BundleSeed {
        sink: &mut sink,
        depth: 0,
    }
    .deserialize(&mut de)?;
    de.end()?;

    // Trailing whitespace still belongs to the digest.
    io::copy(&mut buffered, &mut io::sink())?;
    Ok(hex::encode(buffered.into_inner().hasher.finalize()))
}

/// Parse-thread side of the channel: numbers rows, accumulates dataset
/// metadata and ships batches.
struct BatchSink {
    tx: mpsc::Sender<Message>,
    batch_rows: usize,
    sample_rows: usize,
    next_index: HashMap<String, u64>,
    meta: HashMap<String, Dataset>,
}

impl BatchSink {
    fn new(tx: mpsc::Sender<Message>, batch_rows: usize, sample_rows: usize) -> Self {
        Self {
            tx,
            batch_rows,
            sample_rows,
            next_index: HashMap::new(),
            meta: HashMap::new(),
        }
    }
}

fn send(tx: &mpsc::Sender<Message>, msg: Message) -> Result<(), String> {
    tx.blocking_send(msg)
        .map_err(|_| "staging writer stopped".to_string())
}

struct BundleSeed<'a> {
    sink: &'a mut BatchSink,
    depth: u8,
}

impl<'de, 'a> DeserializeSeed<'de> for BundleSeed<'a> {
    type Value = ();

    fn deserialize<D: de::Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_map(BundleVisitor {
            sink: self.sink,
            depth: self.depth,
        })
    }
}

struct BundleVisitor<'a> {
    sink: &'a mut BatchSink,
    depth: u8,
}

impl<'de, 'a> Visitor<'de> for BundleVisitor<'a> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an export bundle object keyed by dataset name")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<(), A::Error> {
        while let Some(name) = map.next_key::<String>()? {
            map.next_value_seed(SectionSeed {
                sink: &mut *self.sink,
                name,
                depth: self.depth,
            })?;
        }
        Ok(())
    }
}

struct SectionSeed<'a> {
    sink: &'a mut BatchSink,
    name: String,
    depth: u8,
}

impl<'de, 'a> DeserializeSeed<'de> for SectionSeed<'a> {
    type Value = ();

    fn deserialize<D: de::Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_any(SectionVisitor {
            sink: self.sink,
            name: self.name,
            depth: self.depth,
        })
    }
}

struct SectionVisitor<'a> {
    sink: &'a mut BatchSink,
    name: String,
    depth: u8,
}

impl<'de, 'a> Visitor<'de> for SectionVisitor<'a> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an array of rows, a nested section object, or a scalar")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<(), A::Error> {
        let sink = self.sink;
        let name = self.name;
        let mut index = sink.next_index.get(&name).copied().unwrap_or(0);
        let meta = sink
            .meta
            .entry(name.clone())
            .or_insert_with(|| Dataset::new(name.clone()));
        let mut batch = Vec::with_capacity(sink.batch_rows);

        while let Some(row) = seq.next_element::<Value>()? {
            meta.observe(&row, sink.sample_rows);
            batch.push(StagedRow::from_payload(index, row));
            index += 1;
            if batch.len() >= sink.batch_rows {
                let rows = std::mem::replace(&mut batch, Vec::with_capacity(sink.batch_rows));
                send(
                    &sink.tx,
                    Message::Rows {
                        dataset: name.clone(),
                        rows,
                    },
                )
                .map_err(de::Error::custom)?;
            }
        }
        if !batch.is_empty() {
            send(
                &sink.tx,
                Message::Rows {
                    dataset: name.clone(),
                    rows: batch,
                },
            )
            .map_err(de::Error::custom)?;
        }
        let finished = meta.clone();
        sink.next_index.insert(name, index);
        send(&sink.tx, Message::Finished(finished)).map_err(de::Error::custom)
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<(), A::Error> {
        if self.depth == 0 {
            return BundleVisitor {
                sink: self.sink,
                depth: 1,
            }
            .visit_map(map);
        }
        while map.next_entry::<IgnoredAny, IgnoredAny>()?.is_some() {}
        Ok(())
    }

    fn visit_bool<E: de::Error>(self, _: bool) -> Result<(), E> {
        Ok(())
    }

    fn visit_i64<E: de::Error>(self, _: i64) -> Result<(), E> {
        Ok(())
    }

    fn visit_u64<E: de::Error>(self, _: u64) -> Result<(), E> {
        Ok(())
    }

    fn visit_f64<E: de::Error>(self, _: f64) -> Result<(), E> {
        Ok(())
    }

    fn visit_str<E: de::Error>(self, _: &str) -> Result<(), E> {
        Ok(())
    }

    fn visit_unit<E: de::Error>(self) -> Result<(), E> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use casebridge_core::staging::memory::InMemoryStaging;
    use std::io::Cursor;
    use std::sync::atomic::AtomicBool;

    fn opts(batch_rows: usize) -> AnalyzeOptions {
        AnalyzeOptions {
            batch_rows,
            sample_rows: 2,
            progress_interval: Duration::from_millis(1),
        }
    }

    async fn analyze(
        bundle: &str,
        store: &InMemoryStaging,
        cancel: &AtomicBool,
        batch_rows: usize,
    ) -> ImportResult<AnalyzeOutcome> {
        let bytes = bundle.as_bytes().to_vec();
        let total = bytes.len() as u64;
        let mut reports = Vec::new();
        let outcome = analyze_bundle(
            Cursor::new(bytes),
            total,
            "job",
            store,
            cancel,
            &opts(batch_rows),
            &mut |p| reports.push(p),
        )
        .await;
        if let Ok(o) = &outcome {
            if !o.aborted {
                assert_eq!(reports.last().map(|p| p.percentage), Some(100.0));
            }
        }
        outcome
    }

    #[tokio::test]
    async fn stages_sections_and_skips_metadata() {
        let bundle = r#"{
            "version": 3,
            "exported_at": "2024-01-01",
            "projects": [{"id": 1, "name": "Web"}, {"id": "2", "name": "API"}],
            "data": {
                "users": [{"id": 5, "email": "a@x.test"}],
                "meta": {"ignored": true}
            },
            "projects": [{"id": 3, "name": "Mobile"}]
        }"#;
        let store = InMemoryStaging::new();
        let outcome = analyze(bundle, &store, &AtomicBool::new(false), 1)
            .await
            .unwrap();

        assert!(!outcome.aborted);
        assert_eq!(outcome.rows_staged, 4);
        assert_eq!(store.count("job", "projects").await.unwrap(), 3);
        assert_eq!(store.count("job", "users").await.unwrap(), 1);
        assert_eq!(store.count("job", "meta").await.unwrap(), 0);

        let projects = store.get("job", "projects", 0, 10).await.unwrap();
        let idx: Vec<u64> = projects.iter().map(|r| r.row_index).collect();
        assert_eq!(idx, vec![0, 1, 2]);
        assert_eq!(projects[2].name.as_deref(), Some("Mobile"));

        let datasets = store.datasets("job").await.unwrap();
        let p = datasets.iter().find(|d| d.name == "projects").unwrap();
        assert_eq!(p.row_count, 3);
        assert_eq!(p.sample.len(), 2);

        let expected = hex::encode(Sha256::digest(bundle.as_bytes()));
        assert_eq!(outcome.sha256.as_deref(), Some(expected.as_str()));
        assert_eq!(outcome.bytes_read, bundle.len() as u64);
    }

    #[tokio::test]
    async fn malformed_bundle_is_a_bundle_error() {
        let store = InMemoryStaging::new();
        let err = analyze(r#"{"projects": [{"id": 1}, "#, &store, &AtomicBool::new(false), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::Bundle(_)), "{:?}", err);

        let err = analyze("[1, 2, 3]", &store, &AtomicBool::new(false), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::Bundle(_)));
    }

    #[tokio::test]
    async fn abort_between_datasets_keeps_what_was_staged() {
        let bundle = r#"{"users": [{"id": 1}, {"id": 2}], "projects": [{"id": 1}]}"#;
        let store = InMemoryStaging::new();
        let outcome = analyze(bundle, &store, &AtomicBool::new(true), 10)
            .await
            .unwrap();
        assert!(outcome.aborted);
        assert_eq!(outcome.sha256, None);
        assert_eq!(store.count("job", "users").await.unwrap(), 2);
        assert_eq!(store.count("job", "projects").await.unwrap(), 0);
    }
}
