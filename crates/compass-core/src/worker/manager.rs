//! Propagation of primary store mutations to the search index through the
//! durable queue.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::backoff::ExponentialBackoff;
use super::job::*;
use super::pool::WorkerPool;
use super::processor::JobProcessor;
use crate::asset::{
    Asset, AssetRepository, DiscoveryRepository, Filter, SoftDeleteParams, Worker,
};
use crate::config::{WorkerConfig, WorkerDefaults};
use crate::error::{CompassError, Result};
use crate::queryexpr::QueryExpr;

/// Index error code of a document the index refuses to store.
const ILLEGAL_ARGUMENT: &str = "illegal_argument_exception";

/// Payload of a stale asset cleanup job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CleanupPayload {
    is_deleted: bool,
    services: Vec<String>,
    expiry_threshold: DateTime<Utc>,
}

fn is_illegal_argument(err: &CompassError) -> bool {
    match err {
        CompassError::Discovery(e) => e.es_code == ILLEGAL_ARGUMENT || e.cause.contains(ILLEGAL_ARGUMENT),
        other => other.to_string().contains(ILLEGAL_ARGUMENT),
    }
}

/// Re-index every live asset of `service` into the index rotated by
/// [`DiscoveryRepository::sync_assets`], then complete the rotation.
///
/// Documents the index rejects as illegal are skipped.
pub(crate) async fn reindex_service(
    assets: &dyn AssetRepository,
    discovery: &dyn DiscoveryRepository,
    service: &str,
    batch_size: i64,
) -> Result<()> {
    let cleanup = discovery.sync_assets(service).await?;

    let mut offset = 0;
    let mut indexed = 0usize;
    let mut skipped = 0usize;
    loop {
        let batch = assets
            .get_all(&Filter {
                services: vec![service.to_string()],
                size: batch_size,
                offset,
                sort_by: "name".to_string(),
                ..Default::default()
            })
            .await?;

        for asset in &batch {
            match discovery.upsert(asset).await {
                Ok(()) => indexed += 1,
                Err(e) if is_illegal_argument(&e) => {
                    error!(urn = %asset.urn, error = %e, "Skipping asset rejected by the index");
                    skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        if (batch.len() as i64) < batch_size {
            break;
        }
        offset += batch_size;
    }

    cleanup().await?;
    info!(service, indexed, skipped, "Synced assets");
    Ok(())
}

/// Job handlers writing to the search index.
pub struct DiscoveryHandlers {
    discovery: Arc<dyn DiscoveryRepository>,
    assets: Arc<dyn AssetRepository>,
    processor: Arc<dyn JobProcessor>,
    sync_batch_size: i64,
}

impl DiscoveryHandlers {
    pub async fn index_asset(&self, job: &Job) -> JobResult {
        let asset: Asset = serde_json::from_slice(&job.payload)
            .map_err(|e| JobError::permanent(format!("index asset: deserialize payload: {e}")))?;
        self.discovery
            .upsert(&asset)
            .await
            .map_err(JobError::retryable)
    }

    pub async fn delete_asset(&self, job: &Job) -> JobResult {
        let urn = job.payload_str()?;
        self.discovery
            .delete_by_urn(urn)
            .await
            .map_err(JobError::retryable)
    }

    pub async fn soft_delete_asset(&self, job: &Job) -> JobResult {
        let params: SoftDeleteParams = serde_json::from_slice(&job.payload).map_err(|e| {
            JobError::permanent(format!("soft delete asset: deserialize payload: {e}"))
        })?;
        self.discovery
            .soft_delete(&params)
            .await
            .map_err(JobError::retryable)
    }

    pub async fn delete_assets_by_query(&self, job: &Job) -> JobResult {
        let expr = QueryExpr::parse(job.payload_str()?)
            .map_err(|e| JobError::permanent(format!("delete assets: {e}")))?;
        self.discovery
            .delete_by_query_expr(&expr)
            .await
            .map_err(JobError::retryable)
    }

    pub async fn delete_assets_by_services_and_updated_at(&self, job: &Job) -> JobResult {
        let payload: CleanupPayload = serde_json::from_slice(&job.payload)
            .map_err(|e| JobError::permanent(format!("cleanup assets: deserialize payload: {e}")))?;
        self.discovery
            .delete_by_is_deleted_and_services_and_updated_at(
                payload.is_deleted,
                &payload.services,
                payload.expiry_threshold,
            )
            .await
            .map_err(JobError::retryable)
    }

    pub async fn soft_delete_assets(&self, job: &Job) -> JobResult {
        let params: SoftDeleteParams = serde_json::from_slice(&job.payload).map_err(|e| {
            JobError::permanent(format!("soft delete assets: deserialize payload: {e}"))
        })?;
        self.discovery
            .soft_delete(&params)
            .await
            .map_err(JobError::retryable)
    }

    /// Rebuild the index of one service. A job is dropped when an earlier
    /// sync of the same service is still queued.
    pub async fn sync_asset(&self, job: &Job) -> JobResult {
        let service = job.payload_str()?;
        let pending = self
            .processor
            .pending(&job.job_type, &job.payload)
            .await
            .map_err(JobError::retryable)?;
        if pending
            .iter()
            .any(|other| other.id != job.id && other.run_at < job.run_at)
        {
            debug!(service, job_id = %job.id, "Earlier sync pending, dropping job");
            return Ok(());
        }

        reindex_service(
            self.assets.as_ref(),
            self.discovery.as_ref(),
            service,
            self.sync_batch_size,
        )
        .await
        .map_err(JobError::retryable)
    }
}

/// Dependencies of a [`Manager`].
#[derive(Clone)]
pub struct ManagerDeps {
    pub processor: Arc<dyn JobProcessor>,
    pub discovery_repo: Arc<dyn DiscoveryRepository>,
    pub asset_repo: Arc<dyn AssetRepository>,
}

/// Durable [`Worker`] backed by a [`WorkerPool`].
pub struct Manager {
    pool: Arc<WorkerPool>,
    handlers: Arc<DiscoveryHandlers>,
}

impl Manager {
    pub fn new(deps: ManagerDeps, config: &WorkerConfig) -> Result<Self> {
        Self::with_sync_batch_size(deps, config, WorkerDefaults::SYNC_BATCH_SIZE)
    }

    pub(crate) fn with_sync_batch_size(
        deps: ManagerDeps,
        config: &WorkerConfig,
        sync_batch_size: i64,
    ) -> Result<Self> {
        let handlers = Arc::new(DiscoveryHandlers {
            discovery: deps.discovery_repo,
            assets: deps.asset_repo,
            processor: Arc::clone(&deps.processor),
            sync_batch_size,
        });
        let mut pool = WorkerPool::new(deps.processor, config);

        let options = |timeout| JobOptions {
            max_attempts: config.max_attempts,
            timeout,
            backoff: ExponentialBackoff::from_config(config),
        };

        macro_rules! register {
            ($job_type:expr, $timeout:expr, $method:ident) => {{
                let handlers = Arc::clone(&handlers);
                pool.register(
                    $job_type,
                    JobHandler::new(options($timeout), move |job| {
                        let handlers = Arc::clone(&handlers);
                        async move { handlers.$method(&job).await }.boxed()
                    }),
                )?;
            }};
        }

        register!(JOB_INDEX_ASSET, config.index_timeout, index_asset);
        register!(JOB_DELETE_ASSET, config.delete_timeout, delete_asset);
        register!(JOB_SOFT_DELETE_ASSET, config.delete_timeout, soft_delete_asset);
        register!(JOB_DELETE_ASSETS_BY_QUERY, config.index_timeout, delete_assets_by_query);
        register!(
            JOB_DELETE_ASSETS_BY_SERVICES_AND_UPDATED_AT,
            config.index_timeout,
            delete_assets_by_services_and_updated_at
        );
        register!(JOB_SOFT_DELETE_ASSETS_BY_QUERY, config.index_timeout, soft_delete_assets);
        register!(JOB_SYNC_ASSET, config.sync_timeout, sync_asset);

        Ok(Self {
            pool: Arc::new(pool),
            handlers,
        })
    }

    /// Start consuming jobs in the background.
    pub fn start(&self) {
        self.pool.start();
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn handlers(&self) -> &Arc<DiscoveryHandlers> {
        &self.handlers
    }

    async fn enqueue(&self, job_type: &str, payload: Vec<u8>) -> Result<()> {
        let job = self
            .pool
            .enqueue(JobSpec::new(job_type, payload))
            .await
            .map_err(|e| CompassError::Queue {
                message: format!("enqueue {job_type} job: {e}"),
            })?;
        debug!(job_id = %job.id, job_type, "Enqueued job");
        Ok(())
    }
}

#[async_trait]
impl Worker for Manager {
    async fn enqueue_index_asset_job(&self, asset: &Asset) -> Result<()> {
        self.enqueue(JOB_INDEX_ASSET, serde_json::to_vec(asset)?).await
    }

    async fn enqueue_delete_asset_job(&self, urn: &str) -> Result<()> {
        self.enqueue(JOB_DELETE_ASSET, urn.as_bytes().to_vec()).await
    }

    async fn enqueue_soft_delete_asset_job(&self, params: &SoftDeleteParams) -> Result<()> {
        self.enqueue(JOB_SOFT_DELETE_ASSET, serde_json::to_vec(params)?).await
    }

    async fn enqueue_delete_assets_by_query_expr_job(&self, expr: &QueryExpr) -> Result<()> {
        self.enqueue(JOB_DELETE_ASSETS_BY_QUERY, expr.as_str().as_bytes().to_vec())
            .await
    }

    async fn enqueue_delete_assets_by_is_deleted_and_services_and_updated_at_job(
        &self,
        is_deleted: bool,
        services: &[String],
        threshold: DateTime<Utc>,
    ) -> Result<()> {
        let payload = CleanupPayload {
            is_deleted,
            services: services.to_vec(),
            expiry_threshold: threshold,
        };
        self.enqueue(
            JOB_DELETE_ASSETS_BY_SERVICES_AND_UPDATED_AT,
            serde_json::to_vec(&payload)?,
        )
        .await
    }

    async fn enqueue_soft_delete_assets_job(&self, params: &SoftDeleteParams) -> Result<()> {
        self.enqueue(JOB_SOFT_DELETE_ASSETS_BY_QUERY, serde_json::to_vec(params)?)
            .await
    }

    async fn enqueue_sync_asset_job(&self, service: &str) -> Result<()> {
        self.enqueue(JOB_SYNC_ASSET, service.as_bytes().to_vec()).await
    }

    async fn close(&self) -> Result<()> {
        self.pool.shutdown().await;
        Ok(())
    }
}
