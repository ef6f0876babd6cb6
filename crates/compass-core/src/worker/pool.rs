//! Worker pool draining the durable queue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::job::{Job, JobError, JobHandler, JobSpec};
use super::processor::JobProcessor;
use crate::cancel::CancellationToken;
use crate::config::{WorkerConfig, WorkerDefaults};
use crate::error::{CompassError, Result};

/// How an attempt was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Done,
    Retry,
    Dead,
}

/// Parallel consumers of a [`JobProcessor`] dispatching to typed handlers.
pub struct WorkerPool {
    processor: Arc<dyn JobProcessor>,
    handlers: HashMap<String, JobHandler>,
    pool_size: usize,
    poll_interval: Duration,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(processor: Arc<dyn JobProcessor>, config: &WorkerConfig) -> Self {
        Self {
            processor,
            handlers: HashMap::new(),
            pool_size: config.pool_size.max(1),
            poll_interval: config.poll_interval,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&mut self, job_type: &str, handler: JobHandler) -> Result<()> {
        if self.handlers.contains_key(job_type) {
            return Err(CompassError::Queue {
                message: format!("handler for job type '{job_type}' already registered"),
            });
        }
        self.handlers.insert(job_type.to_string(), handler);
        Ok(())
    }

    pub fn processor(&self) -> &Arc<dyn JobProcessor> {
        &self.processor
    }

    pub async fn enqueue(&self, spec: JobSpec) -> Result<Job> {
        if !self.handlers.contains_key(&spec.job_type) {
            return Err(CompassError::Queue {
                message: format!("no handler for job type '{}'", spec.job_type),
            });
        }
        let mut jobs = self.processor.enqueue(std::slice::from_ref(&spec)).await?;
        jobs.pop().ok_or_else(|| CompassError::Queue {
            message: format!("enqueue of '{}' returned no job", spec.job_type),
        })
    }

    fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    /// Lease long enough to outlive the slowest handler.
    fn lease(&self) -> Duration {
        self.handlers
            .values()
            .map(|h| h.options.timeout)
            .max()
            .unwrap_or_default()
            + WorkerDefaults::LEASE_MARGIN
    }

    /// Acquire and settle at most one job. Returns `None` when nothing is due.
    pub async fn process_one(&self) -> Result<Option<JobOutcome>> {
        let Some(job) = self.processor.acquire(&self.job_types(), self.lease()).await? else {
            return Ok(None);
        };
        let Some(handler) = self.handlers.get(&job.job_type) else {
            self.processor.bury(&job, "no handler registered").await?;
            return Ok(Some(JobOutcome::Dead));
        };

        let timeout = handler.options.timeout;
        let result = tokio::select! {
            result = tokio::time::timeout(timeout, handler.call(job.clone())) => match result {
                Ok(result) => result,
                Err(_) => Err(JobError::Retryable(CompassError::Timeout(timeout))),
            },
            _ = self.cancel.cancelled() => Err(JobError::Retryable(CompassError::Cancelled)),
        };

        let outcome = match result {
            Ok(()) => {
                self.processor.complete(&job).await?;
                debug!(job_id = %job.id, job_type = %job.job_type, "Job done");
                JobOutcome::Done
            }
            Err(err) => {
                let attempts = job.attempts_done + 1;
                let message = err.to_string();
                if err.is_retryable() && attempts < handler.options.max_attempts {
                    let delay = handler.options.backoff.delay(attempts);
                    let run_at = Utc::now()
                        + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                    self.processor.retry(&job, run_at, &message).await?;
                    warn!(
                        job_id = %job.id,
                        job_type = %job.job_type,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "Job failed, retrying"
                    );
                    JobOutcome::Retry
                } else {
                    self.processor.bury(&job, &message).await?;
                    error!(
                        job_id = %job.id,
                        job_type = %job.job_type,
                        attempts,
                        error = %message,
                        "Job failed permanently"
                    );
                    JobOutcome::Dead
                }
            }
        };
        Ok(Some(outcome))
    }

    /// Spawn `pool_size` consumers polling the queue until [`shutdown`](Self::shutdown).
    pub fn start(self: &Arc<Self>) {
        let mut tasks = match self.tasks.lock() {
            Ok(tasks) => tasks,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !tasks.is_empty() {
            return;
        }
        for worker_id in 0..self.pool_size {
            let pool = Arc::clone(self);
            tasks.push(tokio::spawn(async move { pool.consume(worker_id).await }));
        }
        info!(pool_size = self.pool_size, job_types = ?self.job_types(), "Started worker pool");
    }

    async fn consume(&self, worker_id: usize) {
        while !self.cancel.is_cancelled() {
            match self.process_one().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => error!(worker_id, error = %e, "Worker failed to process job"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = self.cancel.cancelled() => break,
            }
        }
        debug!(worker_id, "Worker stopped");
    }

    /// Stop the consumers and wait for them to exit. In-flight attempts are
    /// released for retry.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }
    }
}
