//! Asset service: orchestrates the primary store, lineage, search index and
//! the worker that keeps the index in step with the primary store.
//!
//! Writes go to the primary store first. Lineage is updated next and the
//! index is brought up to date through a queued job, so a failed enqueue
//! leaves the primary store ahead of the index until the next write or sync.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::delete_expr::DeleteAssetExpr;
use super::discovery::{GroupConfig, GroupResult, SearchConfig, SearchResult};
use super::lineage::{Lineage, LineageQuery, NodeAttributes, ProbesInfo};
use super::metrics::{IdentifierKind, OperationCount, OperationCounter};
use super::model::{Asset, DeleteAssetsRequest, Filter, Probe, ProbesFilter, SoftDeleteParams};
use super::repository::{AssetRepository, DiscoveryRepository, LineageRepository, Worker};
use crate::cancel::CancellationToken;
use crate::config::ServiceDefaults;
use crate::error::{CompassError, Result};

/// Collaborators of an [`AssetService`].
#[derive(Clone)]
pub struct ServiceDeps {
    pub asset_repo: Arc<dyn AssetRepository>,
    pub discovery_repo: Arc<dyn DiscoveryRepository>,
    pub lineage_repo: Arc<dyn LineageRepository>,
    pub worker: Arc<dyn Worker>,
    /// Ceiling of a background bulk delete.
    pub delete_assets_timeout: Duration,
}

impl ServiceDeps {
    pub fn new(
        asset_repo: Arc<dyn AssetRepository>,
        discovery_repo: Arc<dyn DiscoveryRepository>,
        lineage_repo: Arc<dyn LineageRepository>,
        worker: Arc<dyn Worker>,
    ) -> Self {
        Self {
            asset_repo,
            discovery_repo,
            lineage_repo,
            worker,
            delete_assets_timeout: ServiceDefaults::DELETE_ASSETS_TIMEOUT,
        }
    }

    pub fn with_delete_assets_timeout(mut self, timeout: Duration) -> Self {
        self.delete_assets_timeout = timeout;
        self
    }
}

/// Background bulk deletes keyed by task id.
#[derive(Default)]
struct BackgroundTasks {
    tokens: Mutex<HashMap<String, CancellationToken>>,
    finished: Notify,
}

impl BackgroundTasks {
    fn register(&self) -> (String, CancellationToken) {
        let id = uuid::Uuid::new_v4().to_string();
        let token = CancellationToken::new();
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.insert(id.clone(), token.clone());
        }
        (id, token)
    }

    fn complete(&self, id: &str) {
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.remove(id);
        }
        self.finished.notify_waiters();
    }

    fn len(&self) -> usize {
        self.tokens.lock().map(|tokens| tokens.len()).unwrap_or(0)
    }

    fn cancel_all(&self) {
        if let Ok(tokens) = self.tokens.lock() {
            for token in tokens.values() {
                token.cancel();
            }
        }
    }
}

/// Entry point for every asset operation.
pub struct AssetService {
    deps: ServiceDeps,
    counter: Arc<OperationCounter>,
    tasks: Arc<BackgroundTasks>,
}

impl AssetService {
    pub fn new(deps: ServiceDeps) -> Self {
        Self {
            deps,
            counter: Arc::new(OperationCounter::new()),
            tasks: Arc::new(BackgroundTasks::default()),
        }
    }

    /// Counter of service operations, shared with the metrics endpoint.
    pub fn counter(&self) -> Arc<OperationCounter> {
        Arc::clone(&self.counter)
    }

    pub fn metrics(&self) -> Vec<OperationCount> {
        self.counter.snapshot()
    }

    fn instrument<T>(&self, operation: &'static str, identifier: &str, result: &Result<T>) {
        self.counter
            .record(operation, IdentifierKind::of(identifier), result.is_ok());
    }

    // ========================================
    // Reads
    // ========================================

    /// List assets, optionally counting every match of the filter.
    pub async fn get_all_assets(&self, filter: &Filter, with_total: bool) -> Result<(Vec<Asset>, u64)> {
        let assets = self.deps.asset_repo.get_all(filter).await?;
        let total = if with_total {
            self.deps.asset_repo.get_count(filter).await?
        } else {
            0
        };
        Ok((assets, total))
    }

    /// Fetch an asset by id or urn, with its probes attached.
    pub async fn get_asset_by_id(&self, id: &str) -> Result<Asset> {
        let result = self.fetch_with_probes(id).await;
        self.instrument("GetAssetByID", id, &result);
        result
    }

    async fn fetch_with_probes(&self, id: &str) -> Result<Asset> {
        let mut asset = self.fetch(id).await?;
        asset.probes = self.deps.asset_repo.get_probes(&asset.urn).await?;
        Ok(asset)
    }

    pub async fn get_asset_by_id_without_probes(&self, id: &str) -> Result<Asset> {
        let result = self.fetch(id).await;
        self.instrument("GetAssetByIDWithoutProbes", id, &result);
        result
    }

    async fn fetch(&self, id: &str) -> Result<Asset> {
        match IdentifierKind::of(id) {
            IdentifierKind::Id => self.deps.asset_repo.get_by_id(id).await,
            IdentifierKind::Urn => self.deps.asset_repo.get_by_urn(id).await,
        }
    }

    pub async fn get_asset_by_version(&self, id: &str, version: &str) -> Result<Asset> {
        let result = match IdentifierKind::of(id) {
            IdentifierKind::Id => self.deps.asset_repo.get_by_version_with_id(id, version).await,
            IdentifierKind::Urn => {
                self.deps
                    .asset_repo
                    .get_by_version_with_urn(id, version)
                    .await
            }
        };
        self.instrument("GetAssetByVersion", id, &result);
        result
    }

    pub async fn get_asset_version_history(&self, filter: &Filter, id: &str) -> Result<Vec<Asset>> {
        self.deps.asset_repo.get_version_history(filter, id).await
    }

    pub async fn get_types(&self, filter: &Filter) -> Result<BTreeMap<String, u64>> {
        self.deps.asset_repo.get_types(filter).await
    }

    // ========================================
    // Upserts
    // ========================================

    /// Upsert an asset and replace its direct lineage. Returns the asset id.
    pub async fn upsert_asset(
        &self,
        asset: &Asset,
        upstreams: &[String],
        downstreams: &[String],
        is_update_only: bool,
    ) -> Result<String> {
        let result = self
            .write_asset(asset, None, Some((upstreams, downstreams)), is_update_only)
            .await;
        self.instrument("UpsertAsset", &asset.urn, &result);
        result
    }

    pub async fn upsert_asset_without_lineage(&self, asset: &Asset, is_update_only: bool) -> Result<String> {
        let result = self.write_asset(asset, None, None, is_update_only).await;
        self.instrument("UpsertAssetWithoutLineage", &asset.urn, &result);
        result
    }

    /// Merge `patch` onto the stored asset and replace its direct lineage.
    pub async fn upsert_patch_asset(
        &self,
        asset: &Asset,
        upstreams: &[String],
        downstreams: &[String],
        patch: &Map<String, Value>,
        is_update_only: bool,
    ) -> Result<String> {
        let result = self
            .write_asset(asset, Some(patch), Some((upstreams, downstreams)), is_update_only)
            .await;
        self.instrument("UpsertPatchAsset", &asset.urn, &result);
        result
    }

    pub async fn upsert_patch_asset_without_lineage(
        &self,
        asset: &Asset,
        patch: &Map<String, Value>,
        is_update_only: bool,
    ) -> Result<String> {
        let result = self.write_asset(asset, Some(patch), None, is_update_only).await;
        self.instrument("UpsertPatchAssetWithoutLineage", &asset.urn, &result);
        result
    }

    async fn write_asset(
        &self,
        asset: &Asset,
        patch: Option<&Map<String, Value>>,
        lineage: Option<(&[String], &[String])>,
        is_update_only: bool,
    ) -> Result<String> {
        let mut asset = asset.clone();
        asset.refreshed_at = Some(Utc::now());

        let stored = match patch {
            Some(patch) => {
                self.deps
                    .asset_repo
                    .upsert_patch(&asset, patch, is_update_only)
                    .await?
            }
            None => self.deps.asset_repo.upsert(&asset, is_update_only).await?,
        };

        if let Some((upstreams, downstreams)) = lineage {
            self.deps
                .lineage_repo
                .upsert(&stored.urn, upstreams, downstreams)
                .await?;
        }

        self.deps.worker.enqueue_index_asset_job(&stored).await?;
        debug!(urn = %stored.urn, version = %stored.version, "Upserted asset");
        Ok(stored.id)
    }

    // ========================================
    // Single asset deletes
    // ========================================

    /// Hard delete an asset by id or urn.
    pub async fn delete_asset(&self, id: &str) -> Result<()> {
        let result = self.hard_delete(id).await;
        self.instrument("DeleteAsset", id, &result);
        result
    }

    async fn hard_delete(&self, id: &str) -> Result<()> {
        let urn = match IdentifierKind::of(id) {
            IdentifierKind::Id => self.deps.asset_repo.delete_by_id(id).await?,
            IdentifierKind::Urn => {
                self.deps.asset_repo.delete_by_urn(id).await?;
                id.to_string()
            }
        };
        self.deps.worker.enqueue_delete_asset_job(&urn).await?;
        self.deps.lineage_repo.delete_by_urn(&urn).await?;
        info!(urn = %urn, "Deleted asset");
        Ok(())
    }

    /// Soft delete an asset by id or urn on behalf of `user_id`.
    pub async fn soft_delete_asset(&self, id: &str, user_id: &str) -> Result<()> {
        let result = self.soft_delete(id, user_id).await;
        self.instrument("SoftDeleteAsset", id, &result);
        result
    }

    async fn soft_delete(&self, id: &str, user_id: &str) -> Result<()> {
        let executed_at = Utc::now();
        let (urn, new_version) = match IdentifierKind::of(id) {
            IdentifierKind::Id => {
                self.deps
                    .asset_repo
                    .soft_delete_by_id(executed_at, id, user_id)
                    .await?
            }
            IdentifierKind::Urn => {
                let version = self
                    .deps
                    .asset_repo
                    .soft_delete_by_urn(executed_at, id, user_id)
                    .await?;
                (id.to_string(), version)
            }
        };

        let params = SoftDeleteParams::for_urn(urn.as_str(), executed_at, new_version, user_id);
        self.deps.worker.enqueue_soft_delete_asset_job(&params).await?;
        self.deps.lineage_repo.soft_delete_by_urn(&urn).await?;
        info!(urn = %urn, "Soft deleted asset");
        Ok(())
    }

    // ========================================
    // Bulk deletes
    // ========================================

    /// Hard delete every asset matching the request expression.
    ///
    /// Returns the number of matching assets. Unless `dry_run` is set the
    /// deletion runs in a background task whose outcome is only logged.
    pub async fn delete_assets(&self, request: &DeleteAssetsRequest) -> Result<u64> {
        let expr = DeleteAssetExpr::new(&request.query_expr)?.into_expr();
        let total = self.deps.asset_repo.get_count_by_query_expr(&expr).await?;
        if request.dry_run || total == 0 {
            return Ok(total);
        }

        let deps = self.deps.clone();
        self.spawn_background("delete-assets", async move {
            let urns = match deps.asset_repo.delete_by_query_expr(&expr).await {
                Ok(urns) => urns,
                Err(e) => {
                    error!(
                        error = %e,
                        query_expr = %expr,
                        "asset deletion failed, skipping elasticsearch and lineage deletions"
                    );
                    return;
                }
            };
            if let Err(e) = deps.worker.enqueue_delete_assets_by_query_expr_job(&expr).await {
                error!(error = %e, query_expr = %expr, "failed to enqueue elasticsearch deletion");
            }
            if let Err(e) = deps.lineage_repo.delete_by_urns(&urns).await {
                error!(error = %e, count = urns.len(), "failed to delete lineage of deleted assets");
            }
            info!(count = urns.len(), query_expr = %expr, "Deleted assets");
        });
        Ok(total)
    }

    /// Soft delete every live asset matching the request expression.
    ///
    /// Behaves like [`delete_assets`](Self::delete_assets); assets already
    /// soft deleted are not counted or touched.
    pub async fn soft_delete_assets(&self, request: &DeleteAssetsRequest, user_id: &str) -> Result<u64> {
        if request.query_expr.trim().is_empty() {
            return Err(CompassError::EmptyQuery);
        }
        let live_only = format!("({}) && is_deleted == false", request.query_expr);
        let expr = DeleteAssetExpr::new(&live_only)?.into_expr();
        let total = self.deps.asset_repo.get_count_by_query_expr(&expr).await?;
        if request.dry_run || total == 0 {
            return Ok(total);
        }

        let deps = self.deps.clone();
        let user_id = user_id.to_string();
        self.spawn_background("soft-delete-assets", async move {
            let executed_at = Utc::now();
            let assets = match deps
                .asset_repo
                .soft_delete_by_query_expr(executed_at, &user_id, &expr)
                .await
            {
                Ok(assets) => assets,
                Err(e) => {
                    error!(
                        error = %e,
                        query_expr = %expr,
                        "asset soft deletion failed, skipping elasticsearch and lineage soft deletions"
                    );
                    return;
                }
            };
            let params = SoftDeleteParams::for_query_expr(expr.clone(), executed_at, user_id);
            if let Err(e) = deps.worker.enqueue_soft_delete_assets_job(&params).await {
                error!(error = %e, query_expr = %expr, "failed to enqueue elasticsearch soft deletion");
            }
            let urns: Vec<String> = assets.into_iter().map(|asset| asset.urn).collect();
            if let Err(e) = deps.lineage_repo.soft_delete_by_urns(&urns).await {
                error!(error = %e, count = urns.len(), "failed to soft delete lineage of deleted assets");
            }
            info!(count = urns.len(), query_expr = %expr, "Soft deleted assets");
        });
        Ok(total)
    }

    /// Hard delete assets of `services` (`"*"` for any) whose `is_deleted`
    /// flag matches and that were last updated before `threshold`.
    ///
    /// Runs to completion before returning so the cleanup command can report
    /// the outcome.
    pub async fn delete_assets_by_services_and_updated_at(
        &self,
        dry_run: bool,
        is_deleted: bool,
        services: &[String],
        threshold: DateTime<Utc>,
    ) -> Result<u64> {
        if services.is_empty() {
            return Err(CompassError::EmptyServices);
        }
        let total = self
            .deps
            .asset_repo
            .get_count_by_is_deleted_and_services_and_updated_at(is_deleted, services, threshold)
            .await?;
        info!(
            total,
            dry_run,
            services = %services.join(","),
            threshold = %threshold.to_rfc3339(),
            "Found assets eligible for cleanup"
        );
        if dry_run || total == 0 {
            return Ok(total);
        }

        let urns = self
            .deps
            .asset_repo
            .delete_by_is_deleted_and_services_and_updated_at(is_deleted, services, threshold)
            .await?;
        self.deps.lineage_repo.delete_by_urns(&urns).await?;
        self.deps
            .worker
            .enqueue_delete_assets_by_is_deleted_and_services_and_updated_at_job(
                is_deleted, services, threshold,
            )
            .await?;
        info!(deleted = urns.len(), "Cleanup job completed");
        Ok(total)
    }

    fn spawn_background<F>(&self, name: &'static str, work: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let (task_id, token) = self.tasks.register();
        let tasks = Arc::clone(&self.tasks);
        let timeout = self.deps.delete_assets_timeout;
        tokio::spawn(async move {
            tokio::select! {
                outcome = tokio::time::timeout(timeout, work) => {
                    if outcome.is_err() {
                        warn!(task = name, timeout_secs = timeout.as_secs(), "Background task timed out");
                    }
                }
                _ = token.cancelled() => {
                    warn!(task = name, "Background task cancelled");
                }
            }
            tasks.complete(&task_id);
        });
    }

    /// Number of bulk deletes still running.
    pub fn pending_background_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Cancel every running bulk delete.
    pub fn cancel_background_tasks(&self) {
        self.tasks.cancel_all();
    }

    /// Wait until no bulk delete is running.
    pub async fn wait_background_tasks(&self) {
        loop {
            let finished = self.tasks.finished.notified();
            if self.tasks.len() == 0 {
                return;
            }
            finished.await;
        }
    }

    // ========================================
    // Probes and lineage
    // ========================================

    pub async fn add_probe(&self, urn: &str, probe: &Probe) -> Result<Probe> {
        self.deps.asset_repo.add_probe(urn, probe).await
    }

    /// Lineage graph of `urn`, with the latest probe of every node when
    /// `with_attributes` is set.
    pub async fn get_lineage(&self, urn: &str, query: &LineageQuery) -> Result<Lineage> {
        let edges = self.deps.lineage_repo.get_graph(urn, query).await?;
        if !query.with_attributes {
            return Ok(Lineage {
                edges,
                node_attrs: BTreeMap::new(),
            });
        }

        let urns: BTreeSet<String> = edges
            .iter()
            .flat_map(|edge| [edge.source.clone(), edge.target.clone()])
            .collect();
        let filter = ProbesFilter {
            asset_urns: urns.into_iter().collect(),
            max_rows: 1,
            ..Default::default()
        };
        let probes = self.deps.asset_repo.get_probes_with_filter(&filter).await?;
        let node_attrs = probes
            .into_iter()
            .filter_map(|(urn, probes)| {
                let latest = probes.into_iter().next()?;
                Some((
                    urn,
                    NodeAttributes {
                        probes: ProbesInfo { latest },
                    },
                ))
            })
            .collect();
        Ok(Lineage { edges, node_attrs })
    }

    // ========================================
    // Search
    // ========================================

    pub async fn search_assets(&self, config: &SearchConfig) -> Result<Vec<SearchResult>> {
        self.deps.discovery_repo.search(config).await
    }

    pub async fn suggest_assets(&self, config: &SearchConfig) -> Result<Vec<String>> {
        self.deps.discovery_repo.suggest(config).await
    }

    pub async fn group_assets(&self, config: &GroupConfig) -> Result<Vec<GroupResult>> {
        self.deps.discovery_repo.group_assets(config).await
    }

    /// Queue a rebuild of the search index of every listed service.
    pub async fn sync_assets(&self, services: &[String]) -> Result<()> {
        if services.is_empty() {
            return Err(CompassError::EmptyServices);
        }
        for service in services {
            self.deps.worker.enqueue_sync_asset_job(service).await?;
        }
        Ok(())
    }
}

impl Drop for AssetService {
    fn drop(&mut self) {
        self.tasks.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::LineageEdge;
    use crate::error::NotFoundError;
    use crate::testing::{table_asset, MemoryAssets, MemoryDiscovery, MemoryLineage, RecordingWorker};

    struct Fixture {
        assets: Arc<MemoryAssets>,
        discovery: Arc<MemoryDiscovery>,
        lineage: Arc<MemoryLineage>,
        worker: Arc<RecordingWorker>,
        service: AssetService,
    }

    fn fixture_with(assets: MemoryAssets) -> Fixture {
        let assets = Arc::new(assets);
        let discovery = Arc::new(MemoryDiscovery::default());
        let lineage = Arc::new(MemoryLineage::default());
        let worker = Arc::new(RecordingWorker::default());
        let service = AssetService::new(ServiceDeps::new(
            assets.clone(),
            discovery.clone(),
            lineage.clone(),
            worker.clone(),
        ));
        Fixture {
            assets,
            discovery,
            lineage,
            worker,
            service,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(MemoryAssets::default())
    }

    const DELETE_EXPR: &str = r#"refreshed_at <= "2099-01-01" && type == "table" && service in ["bq"]"#;

    #[tokio::test]
    async fn test_upsert_asset_updates_lineage_then_enqueues() {
        let f = fixture();
        let id = f
            .service
            .upsert_asset(
                &table_asset("urn:x:1"),
                &["urn:x:up".to_string()],
                &["urn:x:down".to_string()],
                false,
            )
            .await
            .unwrap();

        let stored = f.assets.get("urn:x:1").unwrap();
        assert_eq!(stored.id, id);
        assert_eq!(stored.version, "0.1");
        assert!(stored.refreshed_at.is_some());
        assert_eq!(f.lineage.calls.lock().unwrap().as_slice(), ["upsert:urn:x:1"]);
        assert_eq!(f.lineage.edges.lock().unwrap().len(), 2);
        assert_eq!(f.worker.jobs(), ["index-asset:urn:x:1"]);
    }

    #[tokio::test]
    async fn test_upsert_without_lineage_skips_lineage() {
        let f = fixture();
        f.service
            .upsert_asset_without_lineage(&table_asset("urn:x:1"), false)
            .await
            .unwrap();
        assert!(f.lineage.calls.lock().unwrap().is_empty());
        assert_eq!(f.worker.jobs(), ["index-asset:urn:x:1"]);
    }

    #[tokio::test]
    async fn test_upsert_update_only_missing_asset() {
        let f = fixture();
        let err = f
            .service
            .upsert_asset(&table_asset("urn:x:1"), &[], &[], true)
            .await
            .unwrap_err();
        assert!(matches!(err, CompassError::NotFound(NotFoundError::Urn(_))));
        assert!(f.worker.jobs().is_empty());
        assert!(f.lineage.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_failure_is_reported_after_store_write() {
        let f = fixture();
        *f.worker.fail.lock().unwrap() = true;
        let err = f
            .service
            .upsert_asset_without_lineage(&table_asset("urn:x:1"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, CompassError::Queue { .. }));
        assert!(f.assets.get("urn:x:1").is_some());
    }

    #[tokio::test]
    async fn test_upsert_patch_asset_merges_data() {
        let f = fixture();
        f.service
            .upsert_asset_without_lineage(&table_asset("urn:x:1"), false)
            .await
            .unwrap();

        let patch: Map<String, Value> =
            serde_json::from_value(serde_json::json!({"description": "patched", "data": {"extra": true}}))
                .unwrap();
        f.service
            .upsert_patch_asset(&table_asset("urn:x:1"), &[], &[], &patch, true)
            .await
            .unwrap();

        let stored = f.assets.get("urn:x:1").unwrap();
        assert_eq!(stored.description, "patched");
        assert_eq!(stored.version, "0.2");
        let data = stored.data.unwrap();
        assert_eq!(data.get("k"), Some(&Value::from(1)));
        assert_eq!(data.get("extra"), Some(&Value::Bool(true)));
    }

    #[tokio::test]
    async fn test_get_asset_by_id_dispatches_on_uuid() {
        let f = fixture();
        let id = f
            .service
            .upsert_asset_without_lineage(&table_asset("urn:x:1"), false)
            .await
            .unwrap();
        f.service
            .add_probe("urn:x:1", &Probe {
                status: "SUCCESS".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let by_id = f.service.get_asset_by_id(&id).await.unwrap();
        let by_urn = f.service.get_asset_by_id("urn:x:1").await.unwrap();
        assert_eq!(by_id.urn, by_urn.urn);
        assert_eq!(by_id.probes.len(), 1);

        let without = f.service.get_asset_by_id_without_probes(&id).await.unwrap();
        assert!(without.probes.is_empty());

        let metrics = f.service.metrics();
        assert!(metrics
            .iter()
            .any(|m| m.operation == "GetAssetByID" && m.identifier == IdentifierKind::Id && m.success));
        assert!(metrics
            .iter()
            .any(|m| m.operation == "GetAssetByID" && m.identifier == IdentifierKind::Urn));
    }

    #[tokio::test]
    async fn test_failed_lookup_is_counted() {
        let f = fixture();
        assert!(f.service.get_asset_by_id("urn:missing").await.is_err());
        let metrics = f.service.metrics();
        assert_eq!(metrics.len(), 1);
        assert!(!metrics[0].success);
    }

    #[tokio::test]
    async fn test_delete_asset_by_urn_and_id() {
        let f = fixture();
        f.service
            .upsert_asset_without_lineage(&table_asset("urn:x:1"), false)
            .await
            .unwrap();
        let id = f
            .service
            .upsert_asset_without_lineage(&table_asset("urn:x:2"), false)
            .await
            .unwrap();

        f.service.delete_asset("urn:x:1").await.unwrap();
        f.service.delete_asset(&id).await.unwrap();

        assert!(f.assets.get("urn:x:1").is_none());
        assert!(f.assets.get("urn:x:2").is_none());
        let jobs = f.worker.jobs();
        assert!(jobs.contains(&"delete-asset:urn:x:1".to_string()));
        assert!(jobs.contains(&"delete-asset:urn:x:2".to_string()));
        assert_eq!(
            f.lineage.calls.lock().unwrap().as_slice(),
            ["delete:urn:x:1", "delete:urn:x:2"]
        );
    }

    #[tokio::test]
    async fn test_soft_delete_asset_carries_new_version() {
        let f = fixture();
        f.service
            .upsert_asset_without_lineage(&table_asset("urn:x:1"), false)
            .await
            .unwrap();

        f.service.soft_delete_asset("urn:x:1", "user-1").await.unwrap();
        let stored = f.assets.get("urn:x:1").unwrap();
        assert!(stored.is_deleted);
        assert_eq!(stored.version, "0.2");
        assert!(f.worker.jobs().contains(&"soft-delete-asset:0.2".to_string()));
        assert_eq!(f.lineage.calls.lock().unwrap().as_slice(), ["soft_delete:urn:x:1"]);

        let err = f.service.soft_delete_asset("urn:x:1", "user-1").await.unwrap_err();
        assert!(matches!(err, CompassError::AlreadyDeleted { .. }));
    }

    #[tokio::test]
    async fn test_delete_assets_validates_expression() {
        let f = fixture();
        let request = DeleteAssetsRequest {
            query_expr: r#"type != "table" && service == "bq" && refreshed_at < "2024-01-01""#.to_string(),
            dry_run: true,
        };
        assert!(matches!(
            f.service.delete_assets(&request).await,
            Err(CompassError::TypeOrServiceHasWrongOperator)
        ));

        let request = DeleteAssetsRequest::default();
        assert!(matches!(
            f.service.delete_assets(&request).await,
            Err(CompassError::EmptyQuery)
        ));
    }

    #[tokio::test]
    async fn test_delete_assets_dry_run_only_counts() {
        let f = fixture_with(MemoryAssets::with_assets([table_asset("urn:x:1"), table_asset("urn:x:2")]));
        let total = f
            .service
            .delete_assets(&DeleteAssetsRequest {
                query_expr: DELETE_EXPR.to_string(),
                dry_run: true,
            })
            .await
            .unwrap();
        assert_eq!(total, 2);
        assert_eq!(f.service.pending_background_tasks(), 0);
        assert!(f.assets.get("urn:x:1").is_some());
    }

    #[tokio::test]
    async fn test_delete_assets_runs_in_background() {
        let f = fixture_with(MemoryAssets::with_assets([table_asset("urn:x:1"), table_asset("urn:x:2")]));
        f.lineage
            .edges
            .lock()
            .unwrap()
            .push(LineageEdge::new("urn:x:1", "urn:y:9", "urn:x:1"));

        let total = f
            .service
            .delete_assets(&DeleteAssetsRequest {
                query_expr: DELETE_EXPR.to_string(),
                dry_run: false,
            })
            .await
            .unwrap();
        assert_eq!(total, 2);

        f.service.wait_background_tasks().await;
        assert!(f.assets.assets.lock().unwrap().is_empty());
        assert_eq!(
            f.worker.jobs(),
            [format!("delete-assets-by-query:{DELETE_EXPR}")]
        );
        assert!(f.lineage.edges.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_assets_store_failure_skips_index_and_lineage() {
        let f = fixture_with(MemoryAssets::with_assets([table_asset("urn:x:1")]));
        f.service
            .delete_assets(&DeleteAssetsRequest {
                query_expr: DELETE_EXPR.to_string(),
                dry_run: false,
            })
            .await
            .unwrap();
        // the count has already run, so the next store call is the delete
        *f.assets.fail_next.lock().unwrap() = Some("disk full".to_string());
        f.service.wait_background_tasks().await;
        assert!(f.assets.get("urn:x:1").is_some());
        assert!(f.worker.jobs().is_empty());
        assert!(f.lineage.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_soft_delete_assets_skips_deleted() {
        let mut deleted = table_asset("urn:x:2");
        deleted.is_deleted = true;
        let f = fixture_with(MemoryAssets::with_assets([table_asset("urn:x:1"), deleted]));
        for asset in f.assets.assets.lock().unwrap().values_mut() {
            asset.version = "0.1".to_string();
        }

        let total = f
            .service
            .soft_delete_assets(
                &DeleteAssetsRequest {
                    query_expr: DELETE_EXPR.to_string(),
                    dry_run: false,
                },
                "user-1",
            )
            .await
            .unwrap();
        assert_eq!(total, 1);

        f.service.wait_background_tasks().await;
        let stored = f.assets.get("urn:x:1").unwrap();
        assert!(stored.is_deleted);
        assert_eq!(stored.version, "0.2");
        assert_eq!(f.worker.jobs(), ["soft-delete-assets-by-query:user-1"]);
        assert_eq!(f.lineage.calls.lock().unwrap().as_slice(), ["soft_delete:urn:x:1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_task_cancel() {
        let f = fixture_with(MemoryAssets::with_assets([table_asset("urn:x:1")]));
        f.service.spawn_background("sleepy", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        assert_eq!(f.service.pending_background_tasks(), 1);
        f.service.cancel_background_tasks();
        f.service.wait_background_tasks().await;
        assert_eq!(f.service.pending_background_tasks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_task_timeout() {
        let deps = ServiceDeps::new(
            Arc::new(MemoryAssets::default()),
            Arc::new(MemoryDiscovery::default()),
            Arc::new(MemoryLineage::default()),
            Arc::new(RecordingWorker::default()),
        )
        .with_delete_assets_timeout(Duration::from_secs(1));
        let service = AssetService::new(deps);
        service.spawn_background("sleepy", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        service.wait_background_tasks().await;
        assert_eq!(service.pending_background_tasks(), 0);
    }

    #[tokio::test]
    async fn test_delete_assets_by_services_and_updated_at() {
        let mut stale = table_asset("urn:x:1");
        stale.is_deleted = true;
        stale.updated_at = Utc::now() - chrono::Duration::days(60);
        let f = fixture_with(MemoryAssets::with_assets([stale, table_asset("urn:x:2")]));
        let threshold = Utc::now() - chrono::Duration::days(30);
        let services = vec!["bq".to_string()];

        let total = f
            .service
            .delete_assets_by_services_and_updated_at(true, true, &services, threshold)
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert!(f.assets.get("urn:x:1").is_some());

        let total = f
            .service
            .delete_assets_by_services_and_updated_at(false, true, &services, threshold)
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert!(f.assets.get("urn:x:1").is_none());
        assert!(f.assets.get("urn:x:2").is_some());
        assert_eq!(
            f.worker.jobs(),
            ["delete-assets-by-services-and-updated-at:true:bq"]
        );

        assert!(matches!(
            f.service
                .delete_assets_by_services_and_updated_at(false, true, &[], threshold)
                .await,
            Err(CompassError::EmptyServices)
        ));
    }

    #[tokio::test]
    async fn test_get_lineage_with_attributes() {
        let f = fixture_with(MemoryAssets::with_assets([table_asset("urn:a"), table_asset("urn:b")]));
        f.lineage
            .edges
            .lock()
            .unwrap()
            .push(LineageEdge::new("urn:a", "urn:b", "urn:a"));
        for status in ["FAILED", "SUCCESS"] {
            f.service
                .add_probe("urn:b", &Probe {
                    status: status.to_string(),
                    timestamp: Some(Utc::now()),
                    ..Default::default()
                })
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let plain = f
            .service
            .get_lineage("urn:a", &LineageQuery::default())
            .await
            .unwrap();
        assert_eq!(plain.edges.len(), 1);
        assert!(plain.node_attrs.is_empty());

        let lineage = f
            .service
            .get_lineage("urn:a", &LineageQuery {
                with_attributes: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(lineage.node_attrs.len(), 1);
        assert_eq!(lineage.node_attrs["urn:b"].probes.latest.status, "SUCCESS");
    }

    #[tokio::test]
    async fn test_sync_assets_enqueues_per_service() {
        let f = fixture();
        f.service
            .sync_assets(&["bq".to_string(), "kafka".to_string()])
            .await
            .unwrap();
        assert_eq!(f.worker.jobs(), ["sync-asset:bq", "sync-asset:kafka"]);
        assert!(matches!(
            f.service.sync_assets(&[]).await,
            Err(CompassError::EmptyServices)
        ));
    }

    #[tokio::test]
    async fn test_search_passes_through() {
        let f = fixture();
        let config = SearchConfig {
            text: "orders".to_string(),
            ..Default::default()
        };
        f.service.search_assets(&config).await.unwrap();
        assert_eq!(f.service.suggest_assets(&config).await.unwrap(), ["orders"]);
        f.service
            .group_assets(&GroupConfig {
                group_by: vec!["service".to_string()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(f.discovery.calls(), ["search:orders", "suggest:orders", "group:service"]);
    }

    #[tokio::test]
    async fn test_get_all_assets_with_total() {
        let f = fixture_with(MemoryAssets::with_assets([
            table_asset("urn:x:1"),
            table_asset("urn:x:2"),
            table_asset("urn:x:3"),
        ]));
        let filter = Filter {
            size: 2,
            ..Default::default()
        };
        let (assets, total) = f.service.get_all_assets(&filter, true).await.unwrap();
        assert_eq!(assets.len(), 2);
        assert_eq!(total, 3);

        let (_, total) = f.service.get_all_assets(&filter, false).await.unwrap();
        assert_eq!(total, 0);
    }
}
