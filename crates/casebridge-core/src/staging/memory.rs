//! In-memory [`StagingStore`] for tests.
//!
//! Rows live in a `BTreeMap` keyed by `(job, dataset, row_index)` behind a
//! `std::sync::RwLock`, so range scans come back in index order for free.

use std::collections::BTreeMap;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::models::{Dataset, StagedRow};

use super::StagingStore;

type RowKey = (String, String, u64);

#[derive(Default)]
pub struct InMemoryStaging {
    rows: RwLock<BTreeMap<RowKey, StagedRow>>,
    datasets: RwLock<BTreeMap<(String, String), Dataset>>,
}

impl InMemoryStaging {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("staging lock poisoned")
}

#[async_trait]
impl StagingStore for InMemoryStaging {
    async fn put(&self, job_id: &str, dataset: &str, rows: &[StagedRow]) -> Result<()> {
        let mut map = self.rows.write().map_err(poisoned)?;
        for row in rows {
            map.insert(
                (job_id.to_string(), dataset.to_string(), row.row_index),
                row.clone(),
            );
        }
        Ok(())
    }

    async fn get(
        &self,
        job_id: &str,
        dataset: &str,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<StagedRow>> {
        let map = self.rows.read().map_err(poisoned)?;
        let start = (job_id.to_string(), dataset.to_string(), 0);
        let end = (job_id.to_string(), dataset.to_string(), u64::MAX);
        Ok(map
            .range(start..=end)
            .skip(offset as usize)
            .take(limit as usize)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn count(&self, job_id: &str, dataset: &str) -> Result<u64> {
        let map = self.rows.read().map_err(poisoned)?;
        Ok(map
            .keys()
            .filter(|(j, d, _)| j == job_id && d == dataset)
            .count() as u64)
    }

    async fn delete(&self, job_id: &str, dataset: Option<&str>) -> Result<u64> {
        let mut map = self.rows.write().map_err(poisoned)?;
        let before = map.len();
        map.retain(|(j, d, _), _| !(j == job_id && dataset.map_or(true, |want| d == want)));
        self.datasets
            .write()
            .map_err(poisoned)?
            .retain(|(j, d), _| !(j == job_id && dataset.map_or(true, |want| d == want)));
        Ok((before - map.len()) as u64)
    }

    async fn save_dataset(&self, job_id: &str, dataset: &Dataset) -> Result<()> {
        self.datasets
            .write()
            .map_err(poisoned)?
            .insert((job_id.to_string(), dataset.name.clone()), dataset.clone());
        Ok(())
    }

    async fn datasets(&self, job_id: &str) -> Result<Vec<Dataset>> {
        let map = self.datasets.read().map_err(poisoned)?;
        Ok(map
            .iter()
            .filter(|((j, _), _)| j == job_id)
            .map(|(_, d)| d.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::load_all;
    use serde_json::json;

    fn rows(range: std::ops::Range<u64>) -> Vec<StagedRow> {
        range
            .map(|i| StagedRow::from_payload(i, json!({"id": i + 1, "name": format!("r{}", i)})))
            .collect()
    }

    #[tokio::test]
    async fn pages_come_back_in_index_order() {
        let store = InMemoryStaging::new();
        let mut batch = rows(0..25);
        batch.reverse();
        store.put("job", "cases", &batch).await.unwrap();
        store.put("other", "cases", &rows(0..3)).await.unwrap();

        assert_eq!(store.count("job", "cases").await.unwrap(), 25);
        let page = store.get("job", "cases", 10, 5).await.unwrap();
        let idx: Vec<u64> = page.iter().map(|r| r.row_index).collect();
        assert_eq!(idx, vec![10, 11, 12, 13, 14]);

        let all = load_all(&store, "job", "cases", 7).await.unwrap();
        assert_eq!(all.len(), 25);
        assert!(all.windows(2).all(|w| w[0].row_index < w[1].row_index));
    }

    #[tokio::test]
    async fn put_overwrites_by_key() {
        let store = InMemoryStaging::new();
        store.put("job", "tags", &rows(0..3)).await.unwrap();
        store
            .put("job", "tags", &[StagedRow::from_payload(1, json!({"id": 99}))])
            .await
            .unwrap();
        assert_eq!(store.count("job", "tags").await.unwrap(), 3);
        let page = store.get("job", "tags", 1, 1).await.unwrap();
        assert_eq!(page[0].source_id, Some(99));
    }

    #[tokio::test]
    async fn delete_one_dataset_or_whole_job() {
        let store = InMemoryStaging::new();
        store.put("job", "a", &rows(0..4)).await.unwrap();
        store.put("job", "b", &rows(0..2)).await.unwrap();
        store.put("keep", "a", &rows(0..1)).await.unwrap();

        for (job, name) in [("job", "a"), ("job", "b"), ("keep", "a")] {
            store.save_dataset(job, &Dataset::new(name)).await.unwrap();
        }

        assert_eq!(store.delete("job", Some("a")).await.unwrap(), 4);
        assert_eq!(store.count("job", "b").await.unwrap(), 2);
        assert_eq!(store.datasets("job").await.unwrap().len(), 1);
        assert_eq!(store.delete("job", None).await.unwrap(), 2);
        assert!(store.datasets("job").await.unwrap().is_empty());
        assert_eq!(store.count("keep", "a").await.unwrap(), 1);
        assert_eq!(store.datasets("keep").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn datasets_are_listed_per_job() {
        let store = InMemoryStaging::new();
        store.save_dataset("job", &Dataset::new("users")).await.unwrap();
        store.save_dataset("job", &Dataset::new("projects")).await.unwrap();
        store.save_dataset("x", &Dataset::new("users")).await.unwrap();
        let names: Vec<String> = store
            .datasets("job")
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["projects", "users"]);
    }
}
