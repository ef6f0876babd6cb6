//! Job model of the durable queue.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use super::backoff::ExponentialBackoff;
use crate::error::CompassError;

pub const JOB_INDEX_ASSET: &str = "index-asset";
pub const JOB_DELETE_ASSET: &str = "delete-asset";
pub const JOB_SOFT_DELETE_ASSET: &str = "soft-delete-asset";
pub const JOB_DELETE_ASSETS_BY_QUERY: &str = "delete-assets-by-query";
pub const JOB_DELETE_ASSETS_BY_SERVICES_AND_UPDATED_AT: &str =
    "delete-assets-by-services-and-updated-at";
pub const JOB_SOFT_DELETE_ASSETS_BY_QUERY: &str = "soft-delete-assets-by-query";
pub const JOB_SYNC_ASSET: &str = "sync-asset";

/// A job to be enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub job_type: String,
    pub payload: Vec<u8>,
    /// Defaults to now.
    pub run_at: Option<DateTime<Utc>>,
}

impl JobSpec {
    pub fn new(job_type: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            job_type: job_type.into(),
            payload: payload.into(),
            run_at: None,
        }
    }
}

/// A job as stored in the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub job_type: String,
    #[serde(with = "payload_text")]
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub run_at: DateTime<Utc>,
    pub attempts_done: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Job {
    /// Payload read as UTF-8, for job types carrying a plain string.
    pub fn payload_str(&self) -> Result<&str, JobError> {
        std::str::from_utf8(&self.payload)
            .map_err(|e| JobError::permanent(format!("payload is not UTF-8: {e}")))
    }
}

/// Failure of a job handler.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Re-delivered with backoff until attempts run out.
    #[error("{0}")]
    Retryable(CompassError),

    /// Parked as dead immediately.
    #[error("{0}")]
    Permanent(CompassError),
}

impl JobError {
    pub fn retryable(err: impl Into<CompassError>) -> Self {
        JobError::Retryable(err.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        JobError::Permanent(CompassError::Other(message.into()))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Retryable(_))
    }
}

pub type JobResult = std::result::Result<(), JobError>;

type HandleFn = dyn Fn(Job) -> BoxFuture<'static, JobResult> + Send + Sync;

/// Delivery options of a job type.
#[derive(Debug, Clone)]
pub struct JobOptions {
    pub max_attempts: u32,
    pub timeout: Duration,
    pub backoff: ExponentialBackoff,
}

/// Handler of one job type.
#[derive(Clone)]
pub struct JobHandler {
    handle: Arc<HandleFn>,
    pub options: JobOptions,
}

impl JobHandler {
    pub fn new<F>(options: JobOptions, handle: F) -> Self
    where
        F: Fn(Job) -> BoxFuture<'static, JobResult> + Send + Sync + 'static,
    {
        Self {
            handle: Arc::new(handle),
            options,
        }
    }

    pub fn call(&self, job: Job) -> BoxFuture<'static, JobResult> {
        (self.handle)(job)
    }
}

impl fmt::Debug for JobHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandler")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Payloads are shown as text in dead job listings.
mod payload_text {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&String::from_utf8_lossy(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        Ok(String::deserialize(deserializer)?.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[test]
    fn test_payload_str() {
        let mut job = Job {
            id: "1".to_string(),
            job_type: JOB_DELETE_ASSET.to_string(),
            payload: b"urn:x:1".to_vec(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            run_at: Utc::now(),
            attempts_done: 0,
            last_attempt_at: None,
            last_error: None,
        };
        assert_eq!(job.payload_str().unwrap(), "urn:x:1");
        job.payload = vec![0xff, 0xfe];
        assert!(!job.payload_str().unwrap_err().is_retryable());

        let json = serde_json::to_value(&job).unwrap();
        assert!(json["payload"].is_string());
    }

    #[tokio::test]
    async fn test_handler_call() {
        let handler = JobHandler::new(
            JobOptions {
                max_attempts: 1,
                timeout: Duration::from_secs(1),
                backoff: ExponentialBackoff::default(),
            },
            |job| {
                async move {
                    if job.payload.is_empty() {
                        Err(JobError::permanent("empty"))
                    } else {
                        Ok(())
                    }
                }
                .boxed()
            },
        );
        let job = Job {
            id: "1".to_string(),
            job_type: "t".to_string(),
            payload: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            run_at: Utc::now(),
            attempts_done: 0,
            last_attempt_at: None,
            last_error: None,
        };
        assert!(handler.call(job).await.is_err());
    }
}
