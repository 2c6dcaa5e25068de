//! SQLite-backed [`StagingStore`].
//!
//! Staged rows live in `import_staged_rows`, keyed by
//! `(job_id, dataset, row_index)`. Writes go through one transaction per
//! batch and overwrite by key, so re-analyzing a bundle replaces rows in
//! place instead of duplicating them.

use anyhow::{Context, Result};
use async_trait::async_trait;
use casebridge_core::models::{Dataset, StagedRow};
use casebridge_core::staging::StagingStore;
use sqlx::{Row, SqlitePool};

pub struct SqliteStaging {
    pool: SqlitePool,
}

impl SqliteStaging {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StagingStore for SqliteStaging {
    async fn put(&self, job_id: &str, dataset: &str, rows: &[StagedRow]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO import_staged_rows (job_id, dataset, row_index, source_id, project_id, name, payload)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(job_id, dataset, row_index) DO UPDATE SET
                    source_id = excluded.source_id,
                    project_id = excluded.project_id,
                    name = excluded.name,
                    payload = excluded.payload
                "#,
            )
            .bind(job_id)
            .bind(dataset)
            .bind(row.row_index as i64)
            .bind(row.source_id)
            .bind(row.project_id)
            .bind(&row.name)
            .bind(serde_json::to_string(&row.payload)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get(
        &self,
        job_id: &str,
        dataset: &str,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<StagedRow>> {
        let rows = sqlx::query(
            r#"
            SELECT row_index, source_id, project_id, name, payload
            FROM import_staged_rows
            WHERE job_id = ? AND dataset = ?
            ORDER BY row_index
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(job_id)
        .bind(dataset)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let payload: String = row.get("payload");
                let row_index: i64 = row.get("row_index");
                Ok(StagedRow {
                    row_index: row_index as u64,
                    source_id: row.get("source_id"),
                    project_id: row.get("project_id"),
                    name: row.get("name"),
                    payload: serde_json::from_str(&payload)
                        .with_context(|| format!("corrupt staged row {}:{}", dataset, row_index))?,
                })
            })
            .collect()
    }

    async fn count(&self, job_id: &str, dataset: &str) -> Result<u64> {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM import_staged_rows WHERE job_id = ? AND dataset = ?",
        )
        .bind(job_id)
        .bind(dataset)
        .fetch_one(&self.pool)
        .await?;
        Ok(n as u64)
    }

    async fn delete(&self, job_id: &str, dataset: Option<&str>) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query(
            "DELETE FROM import_staged_rows WHERE job_id = ? AND (? IS NULL OR dataset = ?)",
        )
        .bind(job_id)
        .bind(dataset)
        .bind(dataset)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        sqlx::query("DELETE FROM import_datasets WHERE job_id = ? AND (? IS NULL OR name = ?)")
            .bind(job_id)
            .bind(dataset)
            .bind(dataset)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(removed)
    }

    async fn save_dataset(&self, job_id: &str, dataset: &Dataset) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO import_datasets (job_id, name, row_count, schema_json, sample_json)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(job_id, name) DO UPDATE SET
                row_count = excluded.row_count,
                schema_json = excluded.schema_json,
                sample_json = excluded.sample_json
            "#,
        )
        .bind(job_id)
        .bind(&dataset.name)
        .bind(dataset.row_count as i64)
        .bind(serde_json::to_string(&dataset.schema)?)
        .bind(serde_json::to_string(&dataset.sample)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn datasets(&self, job_id: &str) -> Result<Vec<Dataset>> {
        let rows = sqlx::query(
            "SELECT name, row_count, schema_json, sample_json FROM import_datasets WHERE job_id = ? ORDER BY name",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let schema: String = row.get("schema_json");
                let sample: String = row.get("sample_json");
                let row_count: i64 = row.get("row_count");
                Ok(Dataset {
                    name: row.get("name"),
                    row_count: row_count as u64,
                    schema: serde_json::from_str(&schema)?,
                    sample: serde_json::from_str(&sample)?,
                })
            })
            .collect()
    }
}
