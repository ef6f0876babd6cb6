//! [`DiscoveryRepository`] backed by Elasticsearch.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use reqwest::Method;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::client::{EsRequest, EsResponse, Transport};
use super::mapping::index_definition;
use super::query::{
    build_group_body, build_search_body, build_suggest_body, to_group_results, to_search_results,
    to_suggestions,
};
use crate::asset::{
    Asset, DiscoveryRepository, GroupConfig, GroupResult, SearchConfig, SearchResult,
    SoftDeleteParams, SoftDeleteTarget, SyncCleanup, TypeRegistry,
};
use crate::config::SearchConfigDefaults;
use crate::error::{CompassError, DiscoveryError, Result};
use crate::queryexpr::QueryExpr;
use crate::user::User;

const READ_ALIAS: &str = SearchConfigDefaults::READ_ALIAS;

/// Marks matching documents deleted. Without an explicit version the
/// minor component of each document's version is bumped.
const SOFT_DELETE_SCRIPT: &str = "\
ctx._source.is_deleted = true;
ctx._source.updated_at = params.updated_at;
ctx._source.refreshed_at = params.refreshed_at;
ctx._source.updated_by = params.updated_by;
if (params.version != null) {
  ctx._source.version = params.version;
} else if (ctx._source.version != null) {
  def parts = ctx._source.version.splitOnToken('.');
  ctx._source.version = parts[0] + '.' + (Integer.parseInt(parts[1]) + 1);
}";

/// Index lifecycle requests shared by the repository and the cleanup
/// step of a sync.
#[derive(Clone)]
struct Indices {
    transport: Arc<dyn Transport>,
}

impl Indices {
    async fn send(&self, op: &str, index: &str, request: EsRequest) -> Result<EsResponse> {
        let response = self.transport.send(request).await.map_err(|e| {
            CompassError::from(DiscoveryError::new(op, e.to_string()).with_index(index))
        })?;
        if response.is_error() {
            let (code, reason) = response.error_code_and_reason();
            return Err(DiscoveryError::new(op, reason)
                .with_index(index)
                .with_es_code(code)
                .into());
        }
        Ok(response)
    }

    async fn exists(&self, index: &str) -> Result<bool> {
        let response = self
            .transport
            .send(EsRequest::new(Method::HEAD, escape(index)))
            .await
            .map_err(|e| {
                CompassError::from(DiscoveryError::new("IndexExists", e.to_string()).with_index(index))
            })?;
        match response.status {
            200 => Ok(true),
            404 => Ok(false),
            status => Err(DiscoveryError::new("IndexExists", format!("status {status}"))
                .with_index(index)
                .into()),
        }
    }

    async fn create_if_not_exists(&self, index: &str, alias: Option<&str>) -> Result<()> {
        if self.exists(index).await? {
            return Ok(());
        }
        let request = EsRequest::new(Method::PUT, escape(index)).body(index_definition(alias));
        match self.send("CreateIndex", index, request).await {
            Ok(_) => {
                info!(index, "Created search index");
                Ok(())
            }
            Err(CompassError::Discovery(e)) if e.es_code == "resource_already_exists_exception" => {
                warn!(index, error = %e, "Search index created concurrently");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn set_write_block(&self, index: &str, blocked: bool) -> Result<()> {
        let request = EsRequest::new(Method::PUT, format!("{}/_settings", escape(index)))
            .body(json!({ "settings": { "index.blocks.write": blocked } }));
        self.send("UpdateSettings", index, request).await.map(drop)
    }

    /// Clone `index` into `target` unless `target` already exists.
    async fn clone_to(&self, index: &str, target: &str) -> Result<()> {
        if self.exists(target).await? {
            return Ok(());
        }
        let request = EsRequest::new(
            Method::POST,
            format!("{}/_clone/{}", escape(index), escape(target)),
        );
        self.send("CloneIndex", index, request).await.map(drop)
    }

    async fn put_alias(&self, index: &str, alias: &str) -> Result<()> {
        let request = EsRequest::new(
            Method::PUT,
            format!("{}/_alias/{}", escape(index), escape(alias)),
        );
        self.send("UpdateAlias", index, request).await.map(drop)
    }

    async fn delete(&self, index: &str) -> Result<()> {
        let request = EsRequest::new(Method::DELETE, escape(index));
        self.send("DeleteIndex", index, request).await.map(drop)
    }
}

fn escape(segment: &str) -> String {
    urlencoding::encode(segment).into_owned()
}

/// Search index repository. Each service has its own index; every index
/// is reachable through the `universe` alias.
pub struct ElasticsearchDiscoveryRepository {
    indices: Indices,
    registry: Arc<TypeRegistry>,
    column_search_exclusion_list: Vec<String>,
}

impl ElasticsearchDiscoveryRepository {
    pub fn new(transport: Arc<dyn Transport>, registry: Arc<TypeRegistry>) -> Self {
        Self {
            indices: Indices { transport },
            registry,
            column_search_exclusion_list: Vec::new(),
        }
    }

    pub fn with_column_search_exclusion_list(mut self, words: Vec<String>) -> Self {
        self.column_search_exclusion_list = words;
        self
    }

    async fn delete_with_query(&self, op: &str, query: Value) -> Result<()> {
        let request = EsRequest::new(Method::POST, format!("{READ_ALIAS}/_delete_by_query"))
            .param("refresh", true)
            .param("ignore_unavailable", true)
            .body(query);
        let response = self.indices.send(op, READ_ALIAS, request).await?;
        debug!(op, deleted = %response.body["deleted"], "Deleted documents");
        Ok(())
    }

    async fn search_request(&self, op: &str, body: Value) -> Result<EsResponse> {
        let request = EsRequest::new(Method::POST, format!("{READ_ALIAS}/_search"))
            .param("ignore_unavailable", true)
            .body(body);
        self.indices.send(op, READ_ALIAS, request).await
    }
}

#[async_trait]
impl DiscoveryRepository for ElasticsearchDiscoveryRepository {
    async fn upsert(&self, asset: &Asset) -> Result<()> {
        if asset.id.is_empty() {
            return Err(CompassError::EmptyId);
        }
        if !self.registry.is_valid(&asset.asset_type) {
            return Err(CompassError::UnknownType(asset.asset_type.to_string()));
        }

        self.indices
            .create_if_not_exists(&asset.service, Some(READ_ALIAS))
            .await?;

        let request = EsRequest::new(
            Method::PUT,
            format!("{}/_doc/{}", escape(&asset.service), escape(&asset.id)),
        )
        .body(serde_json::to_value(asset)?);
        self.indices
            .send("IndexDoc", &asset.service, request)
            .await
            .map_err(|e| match e {
                CompassError::Discovery(e) => e.with_id(asset.id.clone()).into(),
                other => other,
            })?;
        Ok(())
    }

    async fn delete_by_id(&self, id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(CompassError::EmptyId);
        }
        self.delete_with_query("DeleteByID", json!({ "query": { "term": { "_id": id } } }))
            .await
    }

    async fn delete_by_urn(&self, urn: &str) -> Result<()> {
        if urn.is_empty() {
            return Err(CompassError::EmptyUrn);
        }
        self.delete_with_query(
            "DeleteByURN",
            json!({ "query": { "term": { "urn.keyword": urn } } }),
        )
        .await
    }

    async fn soft_delete(&self, params: &SoftDeleteParams) -> Result<()> {
        let query = match &params.target {
            SoftDeleteTarget::Urn(urn) if urn.is_empty() => return Err(CompassError::EmptyUrn),
            SoftDeleteTarget::Urn(urn) => json!({ "term": { "urn.keyword": urn } }),
            SoftDeleteTarget::QueryExpr(expr) => {
                let compiled = expr.to_search_query()?;
                json!({
                    "bool": {
                        "must": compiled["query"],
                        "filter": [{ "term": { "is_deleted": false } }]
                    }
                })
            }
        };
        let body = json!({
            "query": query,
            "script": {
                "source": SOFT_DELETE_SCRIPT,
                "lang": "painless",
                "params": {
                    "updated_at": params.executed_at,
                    "refreshed_at": params.executed_at,
                    "updated_by": User::with_id(params.updated_by.as_str()),
                    "version": params.new_version,
                }
            }
        });
        let request = EsRequest::new(Method::POST, format!("{READ_ALIAS}/_update_by_query"))
            .param("refresh", true)
            .param("ignore_unavailable", true)
            .param("wait_for_completion", true)
            .param("conflicts", "proceed")
            .body(body);
        let response = self.indices.send("SoftDeleteDoc", READ_ALIAS, request).await?;
        debug!(updated = %response.body["updated"], "Soft deleted documents");
        Ok(())
    }

    async fn delete_by_query_expr(&self, expr: &QueryExpr) -> Result<()> {
        if expr.as_str().trim().is_empty() {
            return Err(CompassError::EmptyQuery);
        }
        let query = expr.to_search_query()?;
        self.delete_with_query("DeleteByQueryExpr", query).await
    }

    async fn delete_by_is_deleted_and_services_and_updated_at(
        &self,
        is_deleted: bool,
        services: &[String],
        threshold: DateTime<Utc>,
    ) -> Result<()> {
        if services.is_empty() {
            return Err(CompassError::EmptyServices);
        }
        let mut filter = vec![
            json!({ "term": { "is_deleted": is_deleted } }),
            json!({ "range": { "updated_at": { "lt": threshold } } }),
        ];
        if !services.iter().any(|s| s == "*") {
            filter.push(json!({ "terms": { "service.keyword": services } }));
        }
        self.delete_with_query(
            "DeleteByIsDeletedAndServicesAndUpdatedAt",
            json!({ "query": { "bool": { "filter": filter } } }),
        )
        .await
    }

    async fn search(&self, config: &SearchConfig) -> Result<Vec<SearchResult>> {
        let body = build_search_body(config, &self.column_search_exclusion_list)?;
        let response = self.search_request("Search", body).await?;
        Ok(to_search_results(&response.body))
    }

    async fn suggest(&self, config: &SearchConfig) -> Result<Vec<String>> {
        let response = self
            .search_request("Suggest", build_suggest_body(config))
            .await?;
        to_suggestions(&response.body)
    }

    async fn group_assets(&self, config: &GroupConfig) -> Result<Vec<GroupResult>> {
        let body = build_group_body(config)?;
        debug!(group_by = ?config.group_by, "Group assets query");
        let response = self.search_request("GroupAssets", body).await?;
        to_group_results(&response.body, &config.group_by)
    }

    /// Rotate `index_name` so it can be rebuilt: block writes, keep a
    /// clone serving reads through the alias, then recreate the index
    /// empty. The returned cleanup swaps the alias back to the rebuilt
    /// index and drops the clone.
    async fn sync_assets(&self, index_name: &str) -> Result<SyncCleanup> {
        let backup = format!("{index_name}-bak");

        self.indices.set_write_block(index_name, true).await?;
        self.indices.clone_to(index_name, &backup).await?;
        self.indices.put_alias(&backup, READ_ALIAS).await?;
        self.indices.delete(index_name).await?;
        self.indices.create_if_not_exists(index_name, None).await?;
        info!(index = index_name, backup = %backup, "Rotated search index for sync");

        let indices = self.indices.clone();
        let index = index_name.to_string();
        Ok(Box::new(move || {
            async move {
                indices.put_alias(&index, READ_ALIAS).await?;
                indices.delete(&backup).await?;
                indices.set_write_block(&index, false).await?;
                info!(index = %index, "Completed search index sync");
                Ok(())
            }
            .boxed()
        }))
    }
}
