//! Inline [`Worker`] used when the durable pool is disabled.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use super::manager::reindex_service;
use crate::asset::{Asset, AssetRepository, DiscoveryRepository, SoftDeleteParams, Worker};
use crate::config::WorkerDefaults;
use crate::error::Result;
use crate::queryexpr::QueryExpr;

/// Runs every job in the caller's task. Failures are returned to the
/// caller and nothing is retried.
pub struct InSituWorker {
    discovery: Arc<dyn DiscoveryRepository>,
    assets: Arc<dyn AssetRepository>,
    sync_lock: Mutex<()>,
}

impl InSituWorker {
    pub fn new(discovery: Arc<dyn DiscoveryRepository>, assets: Arc<dyn AssetRepository>) -> Self {
        Self {
            discovery,
            assets,
            sync_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl Worker for InSituWorker {
    async fn enqueue_index_asset_job(&self, asset: &Asset) -> Result<()> {
        self.discovery.upsert(asset).await
    }

    async fn enqueue_delete_asset_job(&self, urn: &str) -> Result<()> {
        self.discovery.delete_by_urn(urn).await
    }

    async fn enqueue_soft_delete_asset_job(&self, params: &SoftDeleteParams) -> Result<()> {
        self.discovery.soft_delete(params).await
    }

    async fn enqueue_delete_assets_by_query_expr_job(&self, expr: &QueryExpr) -> Result<()> {
        self.discovery.delete_by_query_expr(expr).await
    }

    async fn enqueue_delete_assets_by_is_deleted_and_services_and_updated_at_job(
        &self,
        is_deleted: bool,
        services: &[String],
        threshold: DateTime<Utc>,
    ) -> Result<()> {
        self.discovery
            .delete_by_is_deleted_and_services_and_updated_at(is_deleted, services, threshold)
            .await
    }

    async fn enqueue_soft_delete_assets_job(&self, params: &SoftDeleteParams) -> Result<()> {
        self.discovery.soft_delete(params).await
    }

    /// Rotations of the index are serialised.
    async fn enqueue_sync_asset_job(&self, service: &str) -> Result<()> {
        let _guard = self.sync_lock.lock().await;
        debug!(service, "Syncing assets inline");
        reindex_service(
            self.assets.as_ref(),
            self.discovery.as_ref(),
            service,
            WorkerDefaults::SYNC_BATCH_SIZE,
        )
        .await
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{table_asset, MemoryAssets, MemoryDiscovery};

    fn worker(assets: Vec<Asset>) -> (InSituWorker, Arc<MemoryDiscovery>) {
        let discovery = Arc::new(MemoryDiscovery::default());
        let worker = InSituWorker::new(
            discovery.clone(),
            Arc::new(MemoryAssets::with_assets(assets)),
        );
        (worker, discovery)
    }

    #[tokio::test]
    async fn test_jobs_run_inline() {
        let (worker, discovery) = worker(Vec::new());
        worker
            .enqueue_index_asset_job(&table_asset("urn:x:1"))
            .await
            .unwrap();
        assert_eq!(discovery.calls(), vec!["upsert:urn:x:1".to_string()]);

        worker.enqueue_delete_asset_job("urn:x:1").await.unwrap();
        assert!(discovery.documents.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failures_reach_caller() {
        let (worker, discovery) = worker(Vec::new());
        discovery
            .reject
            .lock()
            .unwrap()
            .insert("urn:x:1".to_string(), "cluster down".to_string());
        assert!(worker
            .enqueue_index_asset_job(&table_asset("urn:x:1"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_sync_rotates_and_reindexes() {
        let (worker, discovery) = worker(vec![table_asset("urn:bq:1"), table_asset("urn:bq:2")]);
        worker.enqueue_sync_asset_job("bq").await.unwrap();
        assert_eq!(
            discovery.calls(),
            vec![
                "sync:bq".to_string(),
                "upsert:urn:bq:1".to_string(),
                "upsert:urn:bq:2".to_string(),
                "sync_cleanup:bq".to_string(),
            ]
        );
    }
}
