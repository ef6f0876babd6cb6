//! Collaborator contracts of the asset service.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::{Map, Value};

use super::discovery::{GroupConfig, GroupResult, SearchConfig, SearchResult};
use super::lineage::{LineageGraph, LineageQuery};
use super::model::{Asset, Filter, Probe, ProbesFilter, SoftDeleteParams};
use crate::error::Result;
use crate::queryexpr::QueryExpr;

/// Authoritative asset storage.
#[async_trait]
pub trait AssetRepository: Send + Sync {
    async fn get_all(&self, filter: &Filter) -> Result<Vec<Asset>>;

    async fn get_count(&self, filter: &Filter) -> Result<u64>;

    async fn get_count_by_query_expr(&self, expr: &QueryExpr) -> Result<u64>;

    /// Count assets with `is_deleted` matching, in one of `services` (`"*"`
    /// matches any) and last updated before `threshold`.
    async fn get_count_by_is_deleted_and_services_and_updated_at(
        &self,
        is_deleted: bool,
        services: &[String],
        threshold: DateTime<Utc>,
    ) -> Result<u64>;

    async fn get_by_id(&self, id: &str) -> Result<Asset>;

    async fn get_by_urn(&self, urn: &str) -> Result<Asset>;

    /// Historical versions of the asset with `id`, newest first.
    async fn get_version_history(&self, filter: &Filter, id: &str) -> Result<Vec<Asset>>;

    async fn get_by_version_with_id(&self, id: &str, version: &str) -> Result<Asset>;

    async fn get_by_version_with_urn(&self, urn: &str, version: &str) -> Result<Asset>;

    /// Count of non-deleted assets per supported type.
    async fn get_types(&self, filter: &Filter) -> Result<BTreeMap<String, u64>>;

    /// Insert or update by urn. With `is_update_only` a missing asset is
    /// reported as not found instead of being inserted.
    async fn upsert(&self, asset: &Asset, is_update_only: bool) -> Result<Asset>;

    /// Like [`upsert`](Self::upsert), merging `patch` onto the stored asset.
    async fn upsert_patch(
        &self,
        asset: &Asset,
        patch: &Map<String, Value>,
        is_update_only: bool,
    ) -> Result<Asset>;

    /// Hard delete by id, returning the urn of the deleted asset.
    async fn delete_by_id(&self, id: &str) -> Result<String>;

    async fn delete_by_urn(&self, urn: &str) -> Result<()>;

    /// Soft delete by id, returning the urn and the new version.
    async fn soft_delete_by_id(
        &self,
        executed_at: DateTime<Utc>,
        id: &str,
        updated_by: &str,
    ) -> Result<(String, String)>;

    /// Soft delete by urn, returning the new version.
    async fn soft_delete_by_urn(
        &self,
        executed_at: DateTime<Utc>,
        urn: &str,
        updated_by: &str,
    ) -> Result<String>;

    /// Hard delete every match, returning the deleted urns.
    async fn delete_by_query_expr(&self, expr: &QueryExpr) -> Result<Vec<String>>;

    /// Soft delete every non-deleted match, returning the updated assets.
    async fn soft_delete_by_query_expr(
        &self,
        executed_at: DateTime<Utc>,
        updated_by: &str,
        expr: &QueryExpr,
    ) -> Result<Vec<Asset>>;

    async fn delete_by_is_deleted_and_services_and_updated_at(
        &self,
        is_deleted: bool,
        services: &[String],
        threshold: DateTime<Utc>,
    ) -> Result<Vec<String>>;

    async fn add_probe(&self, urn: &str, probe: &Probe) -> Result<Probe>;

    async fn get_probes(&self, urn: &str) -> Result<Vec<Probe>>;

    /// Probes grouped by urn, newest first.
    async fn get_probes_with_filter(
        &self,
        filter: &ProbesFilter,
    ) -> Result<BTreeMap<String, Vec<Probe>>>;
}

/// Lineage edge storage.
#[async_trait]
pub trait LineageRepository: Send + Sync {
    async fn get_graph(&self, urn: &str, query: &LineageQuery) -> Result<LineageGraph>;

    /// Reconcile the direct edges of `urn` with the given neighbours.
    async fn upsert(&self, urn: &str, upstreams: &[String], downstreams: &[String]) -> Result<()>;

    async fn delete_by_urn(&self, urn: &str) -> Result<()>;

    async fn delete_by_urns(&self, urns: &[String]) -> Result<()>;

    async fn soft_delete_by_urn(&self, urn: &str) -> Result<()>;

    async fn soft_delete_by_urns(&self, urns: &[String]) -> Result<()>;
}

/// Completes an index rotation once every document has been re-indexed.
pub type SyncCleanup = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// Search index storage.
#[async_trait]
pub trait DiscoveryRepository: Send + Sync {
    async fn upsert(&self, asset: &Asset) -> Result<()>;

    async fn delete_by_id(&self, id: &str) -> Result<()>;

    async fn delete_by_urn(&self, urn: &str) -> Result<()>;

    async fn soft_delete(&self, params: &SoftDeleteParams) -> Result<()>;

    async fn delete_by_query_expr(&self, expr: &QueryExpr) -> Result<()>;

    async fn delete_by_is_deleted_and_services_and_updated_at(
        &self,
        is_deleted: bool,
        services: &[String],
        threshold: DateTime<Utc>,
    ) -> Result<()>;

    async fn search(&self, config: &SearchConfig) -> Result<Vec<SearchResult>>;

    async fn suggest(&self, config: &SearchConfig) -> Result<Vec<String>>;

    async fn group_assets(&self, config: &GroupConfig) -> Result<Vec<GroupResult>>;

    /// Rotate the index of one service so it can be rebuilt from scratch.
    async fn sync_assets(&self, index_name: &str) -> Result<SyncCleanup>;
}

/// Propagates primary store mutations to the search index.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn enqueue_index_asset_job(&self, asset: &Asset) -> Result<()>;

    async fn enqueue_delete_asset_job(&self, urn: &str) -> Result<()>;

    async fn enqueue_soft_delete_asset_job(&self, params: &SoftDeleteParams) -> Result<()>;

    async fn enqueue_delete_assets_by_query_expr_job(&self, expr: &QueryExpr) -> Result<()>;

    async fn enqueue_delete_assets_by_is_deleted_and_services_and_updated_at_job(
        &self,
        is_deleted: bool,
        services: &[String],
        threshold: DateTime<Utc>,
    ) -> Result<()>;

    async fn enqueue_soft_delete_assets_job(&self, params: &SoftDeleteParams) -> Result<()>;

    async fn enqueue_sync_asset_job(&self, service: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
