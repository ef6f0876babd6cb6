//! In-memory doubles of the repository traits for unit tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_json::{Map, Value};

use crate::asset::{
    increase_minor_version, soft_delete_changelog, Asset, AssetRepository, ArrayMergeRules,
    DiscoveryRepository, Filter, GroupConfig, GroupResult, LineageEdge, LineageGraph,
    LineageQuery, LineageRepository, Probe, ProbesFilter, SearchConfig, SearchResult,
    SoftDeleteParams, SyncCleanup, TypeRegistry, Worker, BASE_VERSION,
};
use crate::error::{CompassError, NotFoundError, Result};
use crate::queryexpr::QueryExpr;
use crate::user::User;

#[derive(Default)]
pub struct MemoryAssets {
    pub assets: Mutex<BTreeMap<String, Asset>>,
    pub versions: Mutex<Vec<Asset>>,
    pub probes: Mutex<Vec<Probe>>,
    /// Next call fails with this message.
    pub fail_next: Mutex<Option<String>>,
}

impl MemoryAssets {
    pub fn with_assets(assets: impl IntoIterator<Item = Asset>) -> Self {
        let repo = Self::default();
        {
            let mut map = repo.assets.lock().unwrap();
            for asset in assets {
                map.insert(asset.urn.clone(), asset);
            }
        }
        repo
    }

    pub fn get(&self, urn: &str) -> Option<Asset> {
        self.assets.lock().unwrap().get(urn).cloned()
    }

    fn take_failure(&self) -> Result<()> {
        match self.fail_next.lock().unwrap().take() {
            Some(message) => Err(CompassError::database(message)),
            None => Ok(()),
        }
    }

    /// Matches assets whose service appears as a quoted literal in `expr`.
    fn matching(&self, expr: &QueryExpr) -> Vec<Asset> {
        let source = expr.as_str();
        let live_only = source.contains("is_deleted == false");
        self.assets
            .lock()
            .unwrap()
            .values()
            .filter(|a| source.contains(&format!("\"{}\"", a.service)))
            .filter(|a| !(live_only && a.is_deleted))
            .cloned()
            .collect()
    }

    fn store(&self, asset: &Asset, patch: Option<&Map<String, Value>>, update_only: bool) -> Result<Asset> {
        self.take_failure()?;
        let mut assets = self.assets.lock().unwrap();
        let now = Utc::now();
        let Some(existing) = assets.get(&asset.urn).cloned() else {
            if update_only {
                return Err(NotFoundError::Urn(asset.urn.clone()).into());
            }
            let mut created = asset.clone();
            if let Some(patch) = patch {
                created.patch(patch, &ArrayMergeRules::new())?;
            }
            created.validate(&TypeRegistry::default())?;
            created.id = uuid::Uuid::new_v4().to_string();
            created.version = BASE_VERSION.to_string();
            created.created_at = now;
            created.updated_at = now;
            created.refreshed_at = created.refreshed_at.or(Some(now));
            created.is_deleted = false;
            assets.insert(created.urn.clone(), created.clone());
            self.versions.lock().unwrap().push(created.clone());
            return Ok(created);
        };

        let mut next = match patch {
            Some(patch) => {
                let mut merged = existing.clone();
                merged.patch(patch, &ArrayMergeRules::new())?;
                merged
            }
            None => asset.clone(),
        };
        next.is_deleted = false;
        let changelog = existing.diff(&next);
        if changelog.is_empty() {
            if next.refreshed_at == existing.refreshed_at {
                return Ok(existing);
            }
            let mut refreshed = existing;
            refreshed.refreshed_at = next.refreshed_at;
            assets.insert(refreshed.urn.clone(), refreshed.clone());
            return Ok(refreshed);
        }
        next.id = existing.id.clone();
        next.urn = existing.urn.clone();
        next.created_at = existing.created_at;
        next.updated_at = now;
        next.version = increase_minor_version(&existing.version)?;
        next.changelog = changelog;
        assets.insert(next.urn.clone(), next.clone());
        self.versions.lock().unwrap().push(next.clone());
        Ok(next)
    }

    fn soft_delete(&self, executed_at: DateTime<Utc>, urn: &str, updated_by: &str) -> Result<Asset> {
        self.take_failure()?;
        let mut assets = self.assets.lock().unwrap();
        let asset = assets
            .get_mut(urn)
            .ok_or_else(|| NotFoundError::Urn(urn.to_string()))?;
        if asset.is_deleted {
            return Err(CompassError::AlreadyDeleted {
                identifier: urn.to_string(),
            });
        }
        asset.is_deleted = true;
        asset.version = increase_minor_version(&asset.version)?;
        asset.updated_at = executed_at;
        asset.refreshed_at = Some(executed_at);
        asset.updated_by = User::with_id(updated_by);
        let mut version = asset.clone();
        version.changelog = soft_delete_changelog();
        self.versions.lock().unwrap().push(version);
        Ok(asset.clone())
    }
}

#[async_trait]
impl AssetRepository for MemoryAssets {
    async fn get_all(&self, filter: &Filter) -> Result<Vec<Asset>> {
        filter.validate()?;
        self.take_failure()?;
        let assets: Vec<Asset> = self
            .assets
            .lock()
            .unwrap()
            .values()
            .filter(|a| filter.services.is_empty() || filter.services.contains(&a.service))
            .filter(|a| filter.types.is_empty() || filter.types.contains(&a.asset_type))
            .filter(|a| a.is_deleted == filter.is_deleted)
            .cloned()
            .collect();
        let offset = filter.offset as usize;
        let size = if filter.size == 0 { usize::MAX } else { filter.size as usize };
        Ok(assets.into_iter().skip(offset).take(size).collect())
    }

    async fn get_count(&self, filter: &Filter) -> Result<u64> {
        let unpaged = Filter {
            size: 0,
            offset: 0,
            ..filter.clone()
        };
        Ok(self.get_all(&unpaged).await?.len() as u64)
    }

    async fn get_count_by_query_expr(&self, expr: &QueryExpr) -> Result<u64> {
        self.take_failure()?;
        Ok(self.matching(expr).len() as u64)
    }

    async fn get_count_by_is_deleted_and_services_and_updated_at(
        &self,
        is_deleted: bool,
        services: &[String],
        threshold: DateTime<Utc>,
    ) -> Result<u64> {
        Ok(self
            .assets
            .lock()
            .unwrap()
            .values()
            .filter(|a| is_stale(a, is_deleted, services, threshold))
            .count() as u64)
    }

    async fn get_by_id(&self, id: &str) -> Result<Asset> {
        self.take_failure()?;
        self.assets
            .lock()
            .unwrap()
            .values()
            .find(|a| a.id == id)
            .cloned()
            .ok_or_else(|| NotFoundError::AssetId(id.to_string()).into())
    }

    async fn get_by_urn(&self, urn: &str) -> Result<Asset> {
        self.take_failure()?;
        self.get(urn)
            .ok_or_else(|| NotFoundError::Urn(urn.to_string()).into())
    }

    async fn get_version_history(&self, _filter: &Filter, id: &str) -> Result<Vec<Asset>> {
        let mut versions: Vec<Asset> = self
            .versions
            .lock()
            .unwrap()
            .iter()
            .filter(|v| v.id == id)
            .cloned()
            .collect();
        versions.reverse();
        Ok(versions)
    }

    async fn get_by_version_with_id(&self, id: &str, version: &str) -> Result<Asset> {
        self.versions
            .lock()
            .unwrap()
            .iter()
            .find(|v| v.id == id && v.version == version)
            .cloned()
            .ok_or_else(|| {
                NotFoundError::Version {
                    identifier: id.to_string(),
                    version: version.to_string(),
                }
                .into()
            })
    }

    async fn get_by_version_with_urn(&self, urn: &str, version: &str) -> Result<Asset> {
        self.versions
            .lock()
            .unwrap()
            .iter()
            .find(|v| v.urn == urn && v.version == version)
            .cloned()
            .ok_or_else(|| {
                NotFoundError::Version {
                    identifier: urn.to_string(),
                    version: version.to_string(),
                }
                .into()
            })
    }

    async fn get_types(&self, _filter: &Filter) -> Result<BTreeMap<String, u64>> {
        let mut types = BTreeMap::new();
        for asset in self.assets.lock().unwrap().values().filter(|a| !a.is_deleted) {
            *types.entry(asset.asset_type.to_string()).or_insert(0) += 1;
        }
        Ok(types)
    }

    async fn upsert(&self, asset: &Asset, is_update_only: bool) -> Result<Asset> {
        self.store(asset, None, is_update_only)
    }

    async fn upsert_patch(
        &self,
        asset: &Asset,
        patch: &Map<String, Value>,
        is_update_only: bool,
    ) -> Result<Asset> {
        self.store(asset, Some(patch), is_update_only)
    }

    async fn delete_by_id(&self, id: &str) -> Result<String> {
        let asset = self.get_by_id(id).await?;
        self.assets.lock().unwrap().remove(&asset.urn);
        Ok(asset.urn)
    }

    async fn delete_by_urn(&self, urn: &str) -> Result<()> {
        self.take_failure()?;
        self.assets
            .lock()
            .unwrap()
            .remove(urn)
            .map(|_| ())
            .ok_or_else(|| NotFoundError::Urn(urn.to_string()).into())
    }

    async fn soft_delete_by_id(
        &self,
        executed_at: DateTime<Utc>,
        id: &str,
        updated_by: &str,
    ) -> Result<(String, String)> {
        let asset = self.get_by_id(id).await?;
        let deleted = self.soft_delete(executed_at, &asset.urn, updated_by)?;
        Ok((deleted.urn, deleted.version))
    }

    async fn soft_delete_by_urn(
        &self,
        executed_at: DateTime<Utc>,
        urn: &str,
        updated_by: &str,
    ) -> Result<String> {
        Ok(self.soft_delete(executed_at, urn, updated_by)?.version)
    }

    async fn delete_by_query_expr(&self, expr: &QueryExpr) -> Result<Vec<String>> {
        self.take_failure()?;
        let urns: Vec<String> = self.matching(expr).into_iter().map(|a| a.urn).collect();
        let mut assets = self.assets.lock().unwrap();
        for urn in &urns {
            assets.remove(urn);
        }
        Ok(urns)
    }

    async fn soft_delete_by_query_expr(
        &self,
        executed_at: DateTime<Utc>,
        updated_by: &str,
        expr: &QueryExpr,
    ) -> Result<Vec<Asset>> {
        let mut deleted = Vec::new();
        for asset in self.matching(expr).into_iter().filter(|a| !a.is_deleted) {
            deleted.push(self.soft_delete(executed_at, &asset.urn, updated_by)?);
        }
        Ok(deleted)
    }

    async fn delete_by_is_deleted_and_services_and_updated_at(
        &self,
        is_deleted: bool,
        services: &[String],
        threshold: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        self.take_failure()?;
        let mut assets = self.assets.lock().unwrap();
        let urns: Vec<String> = assets
            .values()
            .filter(|a| is_stale(a, is_deleted, services, threshold))
            .map(|a| a.urn.clone())
            .collect();
        for urn in &urns {
            assets.remove(urn);
        }
        Ok(urns)
    }

    async fn add_probe(&self, urn: &str, probe: &Probe) -> Result<Probe> {
        if self.get(urn).is_none() {
            return Err(NotFoundError::Urn(urn.to_string()).into());
        }
        let mut stored = probe.clone();
        stored.asset_urn = urn.to_string();
        if stored.id.is_empty() {
            stored.id = uuid::Uuid::new_v4().to_string();
        }
        let now = Utc::now();
        stored.created_at = Some(now);
        stored.timestamp = stored.timestamp.or(Some(now));
        self.probes.lock().unwrap().push(stored.clone());
        Ok(stored)
    }

    async fn get_probes(&self, urn: &str) -> Result<Vec<Probe>> {
        let mut probes: Vec<Probe> = self
            .probes
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.asset_urn == urn)
            .cloned()
            .collect();
        probes.sort_by_key(|p| p.timestamp);
        Ok(probes)
    }

    async fn get_probes_with_filter(
        &self,
        filter: &ProbesFilter,
    ) -> Result<BTreeMap<String, Vec<Probe>>> {
        let mut grouped: BTreeMap<String, Vec<Probe>> = BTreeMap::new();
        for probe in self.probes.lock().unwrap().iter() {
            if filter.asset_urns.is_empty() || filter.asset_urns.contains(&probe.asset_urn) {
                grouped
                    .entry(probe.asset_urn.clone())
                    .or_default()
                    .push(probe.clone());
            }
        }
        for probes in grouped.values_mut() {
            probes.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
            if filter.max_rows > 0 {
                probes.truncate(filter.max_rows);
            }
        }
        Ok(grouped)
    }
}

fn is_stale(asset: &Asset, is_deleted: bool, services: &[String], threshold: DateTime<Utc>) -> bool {
    asset.is_deleted == is_deleted
        && (services.iter().any(|s| s == "*") || services.contains(&asset.service))
        && asset.updated_at < threshold
}

#[derive(Default)]
pub struct MemoryLineage {
    pub edges: Mutex<Vec<LineageEdge>>,
    pub calls: Mutex<Vec<String>>,
}

#[async_trait]
impl LineageRepository for MemoryLineage {
    async fn get_graph(&self, urn: &str, _query: &LineageQuery) -> Result<LineageGraph> {
        Ok(self
            .edges
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.source == urn || e.target == urn)
            .cloned()
            .collect())
    }

    async fn upsert(&self, urn: &str, upstreams: &[String], downstreams: &[String]) -> Result<()> {
        self.calls.lock().unwrap().push(format!("upsert:{urn}"));
        let mut edges = self.edges.lock().unwrap();
        edges.retain(|e| !((e.source == urn || e.target == urn) && e.root() == Some(urn)));
        edges.extend(upstreams.iter().map(|u| LineageEdge::new(u.as_str(), urn, urn)));
        edges.extend(downstreams.iter().map(|d| LineageEdge::new(urn, d.as_str(), urn)));
        Ok(())
    }

    async fn delete_by_urn(&self, urn: &str) -> Result<()> {
        self.calls.lock().unwrap().push(format!("delete:{urn}"));
        self.edges
            .lock()
            .unwrap()
            .retain(|e| e.source != urn && e.target != urn);
        Ok(())
    }

    async fn delete_by_urns(&self, urns: &[String]) -> Result<()> {
        for urn in urns {
            self.delete_by_urn(urn).await?;
        }
        Ok(())
    }

    async fn soft_delete_by_urn(&self, urn: &str) -> Result<()> {
        self.calls.lock().unwrap().push(format!("soft_delete:{urn}"));
        Ok(())
    }

    async fn soft_delete_by_urns(&self, urns: &[String]) -> Result<()> {
        for urn in urns {
            self.soft_delete_by_urn(urn).await?;
        }
        Ok(())
    }
}

/// Records every call as `op:argument`.
#[derive(Default)]
pub struct MemoryDiscovery {
    pub calls: Arc<Mutex<Vec<String>>>,
    pub documents: Mutex<HashMap<String, Asset>>,
    pub search_results: Mutex<Vec<SearchResult>>,
    /// Urns rejected by `upsert` with the given message.
    pub reject: Mutex<HashMap<String, String>>,
}

impl MemoryDiscovery {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl DiscoveryRepository for MemoryDiscovery {
    async fn upsert(&self, asset: &Asset) -> Result<()> {
        if let Some(message) = self.reject.lock().unwrap().get(&asset.urn) {
            return Err(crate::error::DiscoveryError::new("IndexDoc", message.clone())
                .with_id(asset.id.clone())
                .into());
        }
        self.record(format!("upsert:{}", asset.urn));
        self.documents
            .lock()
            .unwrap()
            .insert(asset.urn.clone(), asset.clone());
        Ok(())
    }

    async fn delete_by_id(&self, id: &str) -> Result<()> {
        self.record(format!("delete_by_id:{id}"));
        Ok(())
    }

    async fn delete_by_urn(&self, urn: &str) -> Result<()> {
        self.record(format!("delete_by_urn:{urn}"));
        self.documents.lock().unwrap().remove(urn);
        Ok(())
    }

    async fn soft_delete(&self, params: &SoftDeleteParams) -> Result<()> {
        self.record(format!("soft_delete:{}", serde_json::to_string(&params.target)?));
        Ok(())
    }

    async fn delete_by_query_expr(&self, expr: &QueryExpr) -> Result<()> {
        self.record(format!("delete_by_query_expr:{expr}"));
        Ok(())
    }

    async fn delete_by_is_deleted_and_services_and_updated_at(
        &self,
        is_deleted: bool,
        services: &[String],
        _threshold: DateTime<Utc>,
    ) -> Result<()> {
        self.record(format!("delete_stale:{is_deleted}:{}", services.join(",")));
        Ok(())
    }

    async fn search(&self, config: &SearchConfig) -> Result<Vec<SearchResult>> {
        self.record(format!("search:{}", config.text));
        Ok(self.search_results.lock().unwrap().clone())
    }

    async fn suggest(&self, config: &SearchConfig) -> Result<Vec<String>> {
        self.record(format!("suggest:{}", config.text));
        Ok(vec![config.text.clone()])
    }

    async fn group_assets(&self, config: &GroupConfig) -> Result<Vec<GroupResult>> {
        self.record(format!("group:{}", config.group_by.join(",")));
        Ok(Vec::new())
    }

    async fn sync_assets(&self, index_name: &str) -> Result<SyncCleanup> {
        self.record(format!("sync:{index_name}"));
        let calls = Arc::clone(&self.calls);
        let index = index_name.to_string();
        Ok(Box::new(move || {
            async move {
                calls.lock().unwrap().push(format!("sync_cleanup:{index}"));
                Ok(())
            }
            .boxed()
        }))
    }
}

/// Records every enqueue as `job-type:argument`.
#[derive(Default)]
pub struct RecordingWorker {
    pub jobs: Mutex<Vec<String>>,
    pub fail: Mutex<bool>,
}

impl RecordingWorker {
    pub fn jobs(&self) -> Vec<String> {
        self.jobs.lock().unwrap().clone()
    }

    fn push(&self, job: String) -> Result<()> {
        if *self.fail.lock().unwrap() {
            return Err(CompassError::Queue {
                message: "queue unavailable".to_string(),
            });
        }
        self.jobs.lock().unwrap().push(job);
        Ok(())
    }
}

#[async_trait]
impl Worker for RecordingWorker {
    async fn enqueue_index_asset_job(&self, asset: &Asset) -> Result<()> {
        self.push(format!("index-asset:{}", asset.urn))
    }

    async fn enqueue_delete_asset_job(&self, urn: &str) -> Result<()> {
        self.push(format!("delete-asset:{urn}"))
    }

    async fn enqueue_soft_delete_asset_job(&self, params: &SoftDeleteParams) -> Result<()> {
        self.push(format!(
            "soft-delete-asset:{}",
            params.new_version.clone().unwrap_or_default()
        ))
    }

    async fn enqueue_delete_assets_by_query_expr_job(&self, expr: &QueryExpr) -> Result<()> {
        self.push(format!("delete-assets-by-query:{expr}"))
    }

    async fn enqueue_delete_assets_by_is_deleted_and_services_and_updated_at_job(
        &self,
        is_deleted: bool,
        services: &[String],
        _threshold: DateTime<Utc>,
    ) -> Result<()> {
        self.push(format!(
            "delete-assets-by-services-and-updated-at:{is_deleted}:{}",
            services.join(",")
        ))
    }

    async fn enqueue_soft_delete_assets_job(&self, params: &SoftDeleteParams) -> Result<()> {
        self.push(format!(
            "soft-delete-assets-by-query:{}",
            params.updated_by
        ))
    }

    async fn enqueue_sync_asset_job(&self, service: &str) -> Result<()> {
        self.push(format!("sync-asset:{service}"))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// A valid table asset in service `bq`.
pub fn table_asset(urn: &str) -> Asset {
    let mut data = Map::new();
    data.insert("k".to_string(), Value::from(1));
    Asset {
        urn: urn.to_string(),
        asset_type: "table".into(),
        service: "bq".to_string(),
        name: urn.rsplit(':').next().unwrap_or(urn).to_string(),
        data: Some(data),
        ..Default::default()
    }
}
