//! Downstream search reindex signal.
//!
//! A completed import asks the search side to rebuild its index. The
//! request is a row in `search_reindex_requests`; whatever owns search picks
//! it up from there. A failed enqueue is logged and never fails the job.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::{info, warn};

/// Scope recorded for a whole-index rebuild.
pub const SCOPE_FULL: &str = "full";

#[async_trait]
pub trait ReindexQueue: Send + Sync {
    async fn enqueue_full(&self, job_id: &str) -> Result<()>;
}

pub struct SqliteReindexQueue {
    pool: SqlitePool,
}

impl SqliteReindexQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReindexQueue for SqliteReindexQueue {
    async fn enqueue_full(&self, job_id: &str) -> Result<()> {
        sqlx::query("INSERT INTO search_reindex_requests (job_id, scope, requested_at) VALUES (?, ?, ?)")
            .bind(job_id)
            .bind(SCOPE_FULL)
            .bind(chrono::Utc::now().timestamp())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Enqueue a full reindex; returns whether the request was recorded.
pub async fn request_reindex(queue: &dyn ReindexQueue, job_id: &str) -> bool {
    match queue.enqueue_full(job_id).await {
        Ok(()) => {
            info!(job = job_id, "full reindex requested");
            true
        }
        Err(e) => {
            warn!(job = job_id, error = %e, "could not enqueue reindex request");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;

    #[async_trait]
    impl ReindexQueue for Broken {
        async fn enqueue_full(&self, _job_id: &str) -> Result<()> {
            anyhow::bail!("queue unavailable")
        }
    }

    #[tokio::test]
    async fn enqueue_failure_is_swallowed() {
        assert!(!request_reindex(&Broken, "job-1").await);
    }
}
