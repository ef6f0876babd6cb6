//! Durable backing store of the worker pool.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::job::{Job, JobSpec};
use crate::error::Result;

#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// Store jobs for later delivery.
    async fn enqueue(&self, jobs: &[JobSpec]) -> Result<Vec<Job>>;

    /// Lease the earliest due job of one of `types`. A leased job is not
    /// handed out again until `lease` expires or it is settled.
    async fn acquire(&self, types: &[String], lease: Duration) -> Result<Option<Job>>;

    /// Remove a job that succeeded.
    async fn complete(&self, job: &Job) -> Result<()>;

    /// Release a failed job for another attempt at `run_at`.
    async fn retry(&self, job: &Job, run_at: DateTime<Utc>, error: &str) -> Result<()>;

    /// Park a job that will not be attempted again.
    async fn bury(&self, job: &Job, error: &str) -> Result<()>;

    /// Queued jobs of `job_type` with the given payload, earliest first.
    /// Jobs under an active lease are running and are not returned.
    async fn pending(&self, job_type: &str, payload: &[u8]) -> Result<Vec<Job>>;

    async fn dead_jobs(&self, size: usize, offset: usize) -> Result<Vec<Job>>;

    /// Move dead jobs back into the queue with their attempts reset.
    async fn resurrect(&self, ids: &[String]) -> Result<()>;

    async fn clear_dead_jobs(&self, ids: &[String]) -> Result<()>;
}
