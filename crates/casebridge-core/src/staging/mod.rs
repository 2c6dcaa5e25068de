//! Staging store abstraction.
//!
//! The analyzer writes every source row into a [`StagingStore`] once; the
//! importer pages through it again as many times as it needs. Rows are keyed
//! by `(job_id, dataset, row_index)` and always come back in `row_index`
//! order, so paging with `offset`/`limit` is stable across restarts.
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`put`](StagingStore::put) | Write a batch of rows (overwrites by key) |
//! | [`get`](StagingStore::get) | Read a page of rows in index order |
//! | [`count`](StagingStore::count) | Number of staged rows for a dataset |
//! | [`delete`](StagingStore::delete) | Drop one dataset or a whole job |
//! | [`save_dataset`](StagingStore::save_dataset) | Persist analysis metadata |
//! | [`datasets`](StagingStore::datasets) | List analysis metadata for a job |

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Dataset, StagedRow};

#[async_trait]
pub trait StagingStore: Send + Sync {
    async fn put(&self, job_id: &str, dataset: &str, rows: &[StagedRow]) -> Result<()>;

    async fn get(
        &self,
        job_id: &str,
        dataset: &str,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<StagedRow>>;

    async fn count(&self, job_id: &str, dataset: &str) -> Result<u64>;

    /// Delete one dataset's rows and its metadata, or everything staged for
    /// the job when `dataset` is `None`. Returns the number of rows removed.
    async fn delete(&self, job_id: &str, dataset: Option<&str>) -> Result<u64>;

    async fn save_dataset(&self, job_id: &str, dataset: &Dataset) -> Result<()>;

    async fn datasets(&self, job_id: &str) -> Result<Vec<Dataset>>;
}

/// Read a whole dataset in pages of `batch` rows.
///
/// Only meant for small reference datasets; content datasets are paged by
/// the importer chunk by chunk.
pub async fn load_all(
    store: &dyn StagingStore,
    job_id: &str,
    dataset: &str,
    batch: u64,
) -> Result<Vec<StagedRow>> {
    let batch = batch.max(1);
    let mut out = Vec::new();
    let mut offset = 0;
    loop {
        let page = store.get(job_id, dataset, offset, batch).await?;
        let len = page.len() as u64;
        out.extend(page);
        if len < batch {
            break;
        }
        offset += len;
    }
    Ok(out)
}
