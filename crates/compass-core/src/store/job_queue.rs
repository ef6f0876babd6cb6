//! Durable job queue on the `jobs_queue` and `dead_jobs` tables.
//!
//! A worker leases a job by stamping `locked_until`; the job's `run_at` is
//! only rewritten when the attempt is settled. A lease that expires
//! without settlement makes the job deliverable again.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, warn};

use super::{format_ts, is_unique_violation, parse_opt_ts, parse_ts, placeholders, Database};
use crate::error::{CompassError, Result};
use crate::worker::{Job, JobProcessor, JobSpec};

const JOB_COLUMNS: &str =
    "id, type, payload, created_at, updated_at, run_at, attempts_done, last_attempt_at, last_error";

/// SQLite implementation of [`JobProcessor`].
pub struct SqliteJobQueue {
    db: Database,
}

impl SqliteJobQueue {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get(0)?,
        job_type: row.get(1)?,
        payload: row.get(2)?,
        created_at: parse_ts(&row.get::<_, String>(3)?)?,
        updated_at: parse_ts(&row.get::<_, String>(4)?)?,
        run_at: parse_ts(&row.get::<_, String>(5)?)?,
        attempts_done: row.get(6)?,
        last_attempt_at: parse_opt_ts(row.get(7)?)?,
        last_error: row.get(8)?,
    })
}

fn lease_until(now: DateTime<Utc>, lease: Duration) -> Result<DateTime<Utc>> {
    let lease = chrono::Duration::from_std(lease)
        .map_err(|e| CompassError::Queue {
            message: format!("invalid lease {lease:?}: {e}"),
        })?;
    Ok(now + lease)
}

fn text_values(values: &[String]) -> Vec<SqlValue> {
    values.iter().cloned().map(SqlValue::Text).collect()
}

#[async_trait]
impl JobProcessor for SqliteJobQueue {
    async fn enqueue(&self, specs: &[JobSpec]) -> Result<Vec<Job>> {
        let now = Utc::now();
        let jobs: Vec<Job> = specs
            .iter()
            .map(|spec| Job {
                id: uuid::Uuid::new_v4().to_string(),
                job_type: spec.job_type.clone(),
                payload: spec.payload.clone(),
                created_at: now,
                updated_at: now,
                run_at: spec.run_at.unwrap_or(now),
                attempts_done: 0,
                last_attempt_at: None,
                last_error: None,
            })
            .collect();

        self.db
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                for job in &jobs {
                    tx.execute(
                        "INSERT INTO jobs_queue (id, type, payload, created_at, updated_at, run_at)
                         VALUES (?1, ?2, ?3, ?4, ?4, ?5)",
                        params![
                            job.id,
                            job.job_type,
                            job.payload,
                            format_ts(&job.created_at),
                            format_ts(&job.run_at),
                        ],
                    )
                    .map_err(|e| {
                        if is_unique_violation(&e) {
                            CompassError::AlreadyExists {
                                resource: "job",
                                key: job.id.clone(),
                            }
                        } else {
                            e.into()
                        }
                    })?;
                }
                tx.commit()?;
                Ok(jobs)
            })
            .await
    }

    async fn acquire(&self, types: &[String], lease: Duration) -> Result<Option<Job>> {
        if types.is_empty() {
            return Ok(None);
        }
        let now = Utc::now();
        let locked_until = format_ts(&lease_until(now, lease)?);
        let now = format_ts(&now);
        let mut values = text_values(types);
        values.push(SqlValue::Text(now.clone()));
        values.push(SqlValue::Text(now.clone()));
        let list = placeholders(types.len());

        self.db
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let job = tx
                    .query_row(
                        &format!(
                            "SELECT {JOB_COLUMNS} FROM jobs_queue
                             WHERE type IN ({list}) AND run_at <= ?
                               AND (locked_until IS NULL OR locked_until <= ?)
                             ORDER BY run_at, created_at
                             LIMIT 1"
                        ),
                        params_from_iter(values.iter()),
                        job_from_row,
                    )
                    .optional()?;
                let Some(mut job) = job else {
                    return Ok(None);
                };
                tx.execute(
                    "UPDATE jobs_queue SET locked_until = ?1, last_attempt_at = ?2, updated_at = ?2
                     WHERE id = ?3",
                    params![locked_until, now, job.id],
                )?;
                tx.commit()?;
                job.last_attempt_at = parse_opt_ts(Some(now))?;
                Ok(Some(job))
            })
            .await
    }

    async fn complete(&self, job: &Job) -> Result<()> {
        let id = job.id.clone();
        self.db
            .run(move |conn| {
                conn.execute("DELETE FROM jobs_queue WHERE id = ?1", params![id])?;
                Ok(())
            })
            .await
    }

    async fn retry(&self, job: &Job, run_at: DateTime<Utc>, error: &str) -> Result<()> {
        let id = job.id.clone();
        let error = error.to_string();
        self.db
            .run(move |conn| {
                let updated = conn.execute(
                    "UPDATE jobs_queue
                     SET attempts_done = attempts_done + 1, run_at = ?1, last_error = ?2,
                         locked_until = NULL, updated_at = ?3
                     WHERE id = ?4",
                    params![format_ts(&run_at), error, format_ts(&Utc::now()), id],
                )?;
                if updated == 0 {
                    warn!(job_id = %id, "Retried job no longer queued");
                }
                Ok(())
            })
            .await
    }

    async fn bury(&self, job: &Job, error: &str) -> Result<()> {
        let id = job.id.clone();
        let error = error.to_string();
        self.db
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                tx.execute(
                    "INSERT INTO dead_jobs (id, type, payload, created_at, updated_at, run_at,
                         attempts_done, last_attempt_at, last_error)
                     SELECT id, type, payload, created_at, ?1, run_at, attempts_done + 1,
                         last_attempt_at, ?2
                     FROM jobs_queue WHERE id = ?3",
                    params![format_ts(&Utc::now()), error, id],
                )?;
                tx.execute("DELETE FROM jobs_queue WHERE id = ?1", params![id])?;
                tx.commit()?;
                debug!(job_id = %id, "Moved job to dead jobs");
                Ok(())
            })
            .await
    }

    async fn pending(&self, job_type: &str, payload: &[u8]) -> Result<Vec<Job>> {
        let job_type = job_type.to_string();
        let payload = payload.to_vec();
        self.db
            .run(move |conn| {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs_queue
                     WHERE type = ?1 AND payload = ?2
                       AND (locked_until IS NULL OR locked_until <= ?3)
                     ORDER BY run_at, created_at"
                ))?;
                let now = format_ts(&Utc::now());
                let jobs = stmt
                    .query_map(params![job_type, payload, now], job_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(jobs)
            })
            .await
    }

    async fn dead_jobs(&self, size: usize, offset: usize) -> Result<Vec<Job>> {
        let (size, offset) = (size as i64, offset as i64);
        self.db
            .run(move |conn| {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {JOB_COLUMNS} FROM dead_jobs ORDER BY created_at, id LIMIT ?1 OFFSET ?2"
                ))?;
                let jobs = stmt
                    .query_map(params![size, offset], job_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(jobs)
            })
            .await
    }

    async fn resurrect(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let list = placeholders(ids.len());
        let now = format_ts(&Utc::now());
        let mut values = vec![SqlValue::Text(now.clone()), SqlValue::Text(now)];
        values.extend(text_values(ids));
        let ids = text_values(ids);
        self.db
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let moved = tx.execute(
                    &format!(
                        "INSERT INTO jobs_queue (id, type, payload, created_at, updated_at, run_at,
                             attempts_done, last_attempt_at, last_error)
                         SELECT id, type, payload, created_at, ?, ?, 0, last_attempt_at, last_error
                         FROM dead_jobs WHERE id IN ({list})"
                    ),
                    params_from_iter(values.iter()),
                )?;
                tx.execute(
                    &format!("DELETE FROM dead_jobs WHERE id IN ({list})"),
                    params_from_iter(ids.iter()),
                )?;
                tx.commit()?;
                debug!(moved, "Resurrected dead jobs");
                Ok(())
            })
            .await
    }

    async fn clear_dead_jobs(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let list = placeholders(ids.len());
        let ids = text_values(ids);
        self.db
            .run(move |conn| {
                conn.execute(
                    &format!("DELETE FROM dead_jobs WHERE id IN ({list})"),
                    params_from_iter(ids.iter()),
                )?;
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::temp_db;

    const LEASE: Duration = Duration::from_secs(60);

    fn types(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_enqueue_and_acquire_in_run_order() {
        let (_dir, db) = temp_db();
        let queue = SqliteJobQueue::new(db);
        let later = JobSpec {
            run_at: Some(Utc::now() - chrono::Duration::seconds(1)),
            ..JobSpec::new("sync-asset", "bq")
        };
        let earlier = JobSpec {
            run_at: Some(Utc::now() - chrono::Duration::seconds(10)),
            ..JobSpec::new("sync-asset", "kafka")
        };
        queue.enqueue(&[later, earlier]).await.unwrap();

        let first = queue.acquire(&types(&["sync-asset"]), LEASE).await.unwrap().unwrap();
        assert_eq!(first.payload, b"kafka".to_vec());
        assert!(first.last_attempt_at.is_some());

        let second = queue.acquire(&types(&["sync-asset"]), LEASE).await.unwrap().unwrap();
        assert_eq!(second.payload, b"bq".to_vec());

        // both are leased
        assert!(queue.acquire(&types(&["sync-asset"]), LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_acquire_filters_types_and_future_jobs() {
        let (_dir, db) = temp_db();
        let queue = SqliteJobQueue::new(db);
        queue
            .enqueue(&[
                JobSpec::new("index-asset", "{}"),
                JobSpec {
                    run_at: Some(Utc::now() + chrono::Duration::hours(1)),
                    ..JobSpec::new("delete-asset", "urn")
                },
            ])
            .await
            .unwrap();

        assert!(queue.acquire(&types(&["delete-asset"]), LEASE).await.unwrap().is_none());
        assert!(queue.acquire(&[], LEASE).await.unwrap().is_none());
        let job = queue.acquire(&types(&["index-asset", "delete-asset"]), LEASE).await.unwrap();
        assert_eq!(job.unwrap().job_type, "index-asset");
    }

    #[tokio::test]
    async fn test_expired_lease_is_redelivered() {
        let (_dir, db) = temp_db();
        let queue = SqliteJobQueue::new(db);
        queue.enqueue(&[JobSpec::new("index-asset", "{}")]).await.unwrap();

        let first = queue
            .acquire(&types(&["index-asset"]), Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        let again = queue
            .acquire(&types(&["index-asset"]), LEASE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id, again.id);
    }

    #[tokio::test]
    async fn test_retry_complete_and_bury() {
        let (_dir, db) = temp_db();
        let queue = SqliteJobQueue::new(db);
        queue
            .enqueue(&[JobSpec::new("index-asset", "a"), JobSpec::new("index-asset", "b")])
            .await
            .unwrap();
        let all = types(&["index-asset"]);

        let a = queue.acquire(&all, LEASE).await.unwrap().unwrap();
        queue.retry(&a, Utc::now(), "boom").await.unwrap();
        let b = queue.acquire(&all, LEASE).await.unwrap().unwrap();
        queue.complete(&b).await.unwrap();

        let retried = queue.acquire(&all, LEASE).await.unwrap().unwrap();
        assert_eq!(retried.id, a.id);
        assert_eq!(retried.attempts_done, 1);
        assert_eq!(retried.last_error.as_deref(), Some("boom"));

        queue.bury(&retried, "still broken").await.unwrap();
        assert!(queue.acquire(&all, LEASE).await.unwrap().is_none());

        let dead = queue.dead_jobs(10, 0).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts_done, 2);
        assert_eq!(dead[0].last_error.as_deref(), Some("still broken"));
    }

    #[tokio::test]
    async fn test_resurrect_and_clear_dead_jobs() {
        let (_dir, db) = temp_db();
        let queue = SqliteJobQueue::new(db);
        queue
            .enqueue(&[JobSpec::new("delete-asset", "a"), JobSpec::new("delete-asset", "b")])
            .await
            .unwrap();
        let all = types(&["delete-asset"]);
        for _ in 0..2 {
            let job = queue.acquire(&all, LEASE).await.unwrap().unwrap();
            queue.bury(&job, "gone").await.unwrap();
        }
        let dead = queue.dead_jobs(10, 0).await.unwrap();
        assert_eq!(dead.len(), 2);

        queue.resurrect(&[dead[0].id.clone()]).await.unwrap();
        queue.clear_dead_jobs(&[dead[1].id.clone()]).await.unwrap();
        assert!(queue.dead_jobs(10, 0).await.unwrap().is_empty());

        let revived = queue.acquire(&all, LEASE).await.unwrap().unwrap();
        assert_eq!(revived.id, dead[0].id);
        assert_eq!(revived.attempts_done, 0);
    }

    #[tokio::test]
    async fn test_pending_by_payload() {
        let (_dir, db) = temp_db();
        let queue = SqliteJobQueue::new(db);
        queue
            .enqueue(&[
                JobSpec::new("sync-asset", "bq"),
                JobSpec::new("sync-asset", "kafka"),
                JobSpec::new("sync-asset", "bq"),
            ])
            .await
            .unwrap();
        let pending = queue.pending("sync-asset", b"bq").await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending[0].run_at <= pending[1].run_at);
    }

    #[tokio::test]
    async fn test_pending_skips_leased_jobs() {
        let (_dir, db) = temp_db();
        let queue = SqliteJobQueue::new(db);
        queue
            .enqueue(&[JobSpec::new("sync-asset", "bq"), JobSpec::new("sync-asset", "bq")])
            .await
            .unwrap();

        let running = queue.acquire(&types(&["sync-asset"]), LEASE).await.unwrap().unwrap();
        let pending = queue.pending("sync-asset", b"bq").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_ne!(pending[0].id, running.id);

        // an expired lease counts as queued again
        let expired = queue
            .acquire(&types(&["sync-asset"]), Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        let pending = queue.pending("sync-asset", b"bq").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, expired.id);
    }
}
