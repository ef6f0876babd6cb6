//! Background propagation of asset mutations to the search index.
//!
//! Mutations are recorded as jobs in the durable queue and drained by a
//! [`WorkerPool`]. The [`Manager`] registers one handler per job type and
//! implements [`Worker`](crate::asset::Worker) by enqueueing. When durable
//! workers are disabled the [`InSituWorker`] runs the same handlers inline.

mod backoff;
mod in_situ;
mod job;
mod manager;
mod pool;
mod processor;

pub use backoff::ExponentialBackoff;
pub use in_situ::InSituWorker;
pub use job::{
    Job, JobError, JobHandler, JobOptions, JobResult, JobSpec, JOB_DELETE_ASSET,
    JOB_DELETE_ASSETS_BY_QUERY, JOB_DELETE_ASSETS_BY_SERVICES_AND_UPDATED_AT, JOB_INDEX_ASSET,
    JOB_SOFT_DELETE_ASSET, JOB_SOFT_DELETE_ASSETS_BY_QUERY, JOB_SYNC_ASSET,
};
pub use manager::{DiscoveryHandlers, Manager, ManagerDeps};
pub use pool::{JobOutcome, WorkerPool};
pub use processor::JobProcessor;
