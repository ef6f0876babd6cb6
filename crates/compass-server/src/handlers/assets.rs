//! Asset handlers.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use chrono::{DateTime, Utc};
use compass_core::asset::{ArrayMergeRules, Data, SortDirection};
use compass_core::{Asset, AssetType, DeleteAssetsRequest, Filter, Probe, User};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use super::shared::{ApiError, CurrentUser, Params};
use crate::server::AppState;

type ApiResult = Result<Json<Value>, ApiError>;

/// A lineage neighbour named in an upsert.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LineageNode {
    pub urn: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub service: String,
}

fn urns(nodes: &[LineageNode]) -> Vec<String> {
    nodes
        .iter()
        .filter(|n| !n.urn.is_empty())
        .map(|n| n.urn.clone())
        .collect()
}

/// Build a listing filter from query parameters.
pub fn filter_from_params(params: &Params) -> Result<Filter, ApiError> {
    let filter = Filter {
        types: params.list("types").into_iter().map(AssetType::new).collect(),
        services: params.list("services"),
        size: params.number("size")?.unwrap_or_default(),
        offset: params.number("offset")?.unwrap_or_default(),
        sort_by: params.string("sort"),
        sort_direction: SortDirection::parse(params.get("direction").unwrap_or_default())?,
        query_fields: params.list("q_fields"),
        query: params.string("q"),
        data: params.bracketed("data"),
        is_deleted: params.bool("is_deleted")?,
    };
    filter.validate()?;
    Ok(filter)
}

pub async fn list_assets(State(state): State<Arc<AppState>>, params: Params) -> ApiResult {
    let filter = filter_from_params(&params)?;
    let with_total = params.bool("with_total")?;
    let (assets, total) = state
        .compass
        .assets()
        .get_all_assets(&filter, with_total)
        .await?;
    let mut body = json!({ "data": assets });
    if with_total {
        body["total"] = json!(total);
    }
    Ok(Json(body))
}

pub async fn get_asset(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    let asset = state.compass.assets().get_asset_by_id(&id).await?;
    Ok(Json(json!({ "data": asset })))
}

pub async fn get_asset_versions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    params: Params,
) -> ApiResult {
    let filter = Filter {
        size: params.number("size")?.unwrap_or_default(),
        offset: params.number("offset")?.unwrap_or_default(),
        ..Default::default()
    };
    filter.validate()?;
    let versions = state
        .compass
        .assets()
        .get_asset_version_history(&filter, &id)
        .await?;
    Ok(Json(json!({ "data": versions })))
}

pub async fn get_asset_by_version(
    State(state): State<Arc<AppState>>,
    Path((id, version)): Path<(String, String)>,
) -> ApiResult {
    let asset = state
        .compass
        .assets()
        .get_asset_by_version(&id, &version)
        .await?;
    Ok(Json(json!({ "data": asset })))
}

pub async fn get_types(State(state): State<Arc<AppState>>, params: Params) -> ApiResult {
    let filter = filter_from_params(&params)?;
    let counts = state.compass.assets().get_types(&filter).await?;
    let data: Vec<Value> = counts
        .into_iter()
        .map(|(name, count)| json!({ "name": name, "count": count }))
        .collect();
    Ok(Json(json!({ "data": data })))
}

// ============================================================================
// Upserts
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct UpsertAssetRequest {
    pub asset: Option<Asset>,
    #[serde(default)]
    pub upstreams: Vec<LineageNode>,
    #[serde(default)]
    pub downstreams: Vec<LineageNode>,
    #[serde(default)]
    pub update_only: bool,
}

pub async fn upsert_asset(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Json(request): Json<UpsertAssetRequest>,
) -> ApiResult {
    let Some(base) = request.asset else {
        return Err(ApiError::BadRequest("asset cannot be empty".to_string()));
    };
    validate_upsert(&base)?;

    // Server managed fields are never taken from the caller.
    let asset = Asset {
        id: String::new(),
        version: String::new(),
        is_deleted: false,
        changelog: Vec::new(),
        probes: Vec::new(),
        updated_by: User::with_id(user_id),
        ..base
    };
    let id = state
        .compass
        .assets()
        .upsert_asset(
            &asset,
            &urns(&request.upstreams),
            &urns(&request.downstreams),
            request.update_only,
        )
        .await?;
    Ok(Json(json!({ "id": id })))
}

fn validate_upsert(asset: &Asset) -> Result<(), ApiError> {
    let missing = [
        ("urn", asset.urn.is_empty()),
        ("type", asset.asset_type.is_empty()),
        ("name", asset.name.is_empty()),
        ("service", asset.service.is_empty()),
        ("data", asset.data.is_none()),
    ];
    match missing.iter().find(|(_, is_missing)| *is_missing) {
        Some((field, _)) => Err(ApiError::BadRequest(format!("{field} is required"))),
        None => Ok(()),
    }
}

#[derive(Debug, Deserialize)]
pub struct UpsertPatchAssetRequest {
    pub asset: Option<Map<String, Value>>,
    #[serde(default)]
    pub upstreams: Vec<LineageNode>,
    #[serde(default)]
    pub downstreams: Vec<LineageNode>,
    /// Replace lineage even when no neighbours are given.
    #[serde(default)]
    pub overwrite_lineage: bool,
    #[serde(default)]
    pub update_only: bool,
}

pub async fn upsert_patch_asset(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Json(request): Json<UpsertPatchAssetRequest>,
) -> ApiResult {
    let Some(patch) = request.asset else {
        return Err(ApiError::BadRequest("asset cannot be empty".to_string()));
    };
    if patch.get("urn").and_then(Value::as_str).unwrap_or_default().is_empty() {
        return Err(ApiError::BadRequest("urn is required".to_string()));
    }

    let mut asset = Asset::default();
    asset.patch(&patch, &ArrayMergeRules::new())?;
    asset.updated_by = User::with_id(user_id);

    let service = state.compass.assets();
    let with_lineage = request.overwrite_lineage
        || !request.upstreams.is_empty()
        || !request.downstreams.is_empty();
    let id = if with_lineage {
        service
            .upsert_patch_asset(
                &asset,
                &urns(&request.upstreams),
                &urns(&request.downstreams),
                &patch,
                request.update_only,
            )
            .await?
    } else {
        service
            .upsert_patch_asset_without_lineage(&asset, &patch, request.update_only)
            .await?
    };
    Ok(Json(json!({ "id": id })))
}

// ============================================================================
// Deletes
// ============================================================================

/// Soft delete by id or urn. `?hard=true` removes the asset and its history.
pub async fn delete_asset(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Path(id): Path<String>,
    params: Params,
) -> ApiResult {
    if params.bool("hard")? {
        state.compass.assets().delete_asset(&id).await?;
    } else {
        state.compass.assets().soft_delete_asset(&id, &user_id).await?;
    }
    Ok(Json(json!({})))
}

#[derive(Debug, Deserialize)]
pub struct DeleteAssetsBody {
    #[serde(default)]
    pub query_expr: String,
    #[serde(default)]
    pub dry_run: bool,
    /// Remove matching assets instead of marking them deleted.
    #[serde(default)]
    pub hard: bool,
}

pub async fn delete_assets(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Json(body): Json<DeleteAssetsBody>,
) -> ApiResult {
    let request = DeleteAssetsRequest {
        query_expr: body.query_expr,
        dry_run: body.dry_run,
    };
    let service = state.compass.assets();
    let affected_rows = if body.hard {
        service.delete_assets(&request).await?
    } else {
        service.soft_delete_assets(&request, &user_id).await?
    };
    warn!(
        affected_rows,
        query_expr = %request.query_expr,
        dry_run = request.dry_run,
        hard = body.hard,
        user_id = %user_id,
        "Delete assets by query"
    );
    Ok(Json(json!({ "affected_rows": affected_rows })))
}

// ============================================================================
// Probes and sync
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ProbeBody {
    pub id: String,
    pub status: String,
    pub status_reason: String,
    pub metadata: Option<Data>,
    pub timestamp: Option<DateTime<Utc>>,
}

pub async fn create_probe(
    State(state): State<Arc<AppState>>,
    CurrentUser(_user_id): CurrentUser,
    Path(urn): Path<String>,
    Json(body): Json<ProbeBody>,
) -> ApiResult {
    if body.status.is_empty() {
        return Err(ApiError::BadRequest("status is required".to_string()));
    }
    let Some(timestamp) = body.timestamp else {
        return Err(ApiError::BadRequest("timestamp is required".to_string()));
    };

    let probe = Probe {
        id: body.id,
        asset_urn: urn.clone(),
        status: body.status,
        status_reason: body.status_reason,
        metadata: body.metadata,
        timestamp: Some(timestamp),
        created_at: None,
    };
    let stored = state.compass.assets().add_probe(&urn, &probe).await?;
    Ok(Json(json!({ "id": stored.id })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SyncAssetsBody {
    pub services: Vec<String>,
}

pub async fn sync_assets(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Json(body): Json<SyncAssetsBody>,
) -> ApiResult {
    state.compass.assets().sync_assets(&body.services).await?;
    info!(services = ?body.services, user_id = %user_id, "Queued asset sync");
    Ok(Json(json!({})))
}
