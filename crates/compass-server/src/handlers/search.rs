//! Search, suggestion and grouping handlers.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use compass_core::asset::SearchFlags;
use compass_core::{GroupConfig, SearchConfig};
use serde_json::{json, Value};

use super::shared::{ApiError, Params};
use crate::server::AppState;

fn search_config(params: &Params) -> Result<SearchConfig, ApiError> {
    let queries: BTreeMap<String, String> = params
        .bracketed("query")
        .into_iter()
        .filter_map(|(field, values)| Some((field, values.into_iter().last()?)))
        .collect();
    Ok(SearchConfig {
        text: params.string("text").trim().to_string(),
        filters: params.bracketed("filter"),
        max_results: params.number("size")?.unwrap_or_default(),
        rank_by: params.string("rankby"),
        queries,
        flags: SearchFlags {
            enable_highlight: params.bool("highlight")?,
            disable_fuzzy: params.bool("disable_fuzzy")?,
            is_column_search: params.bool("is_column_search")?,
        },
        offset: params.number("offset")?.unwrap_or_default(),
        include_fields: params.list("include_fields"),
    })
}

/// Free-text search. An empty `text` matches every live asset.
pub async fn search_assets(
    State(state): State<Arc<AppState>>,
    params: Params,
) -> Result<Json<Value>, ApiError> {
    let config = search_config(&params)?;
    let results = state.compass.assets().search_assets(&config).await?;
    Ok(Json(json!({ "data": results })))
}

pub async fn suggest_assets(
    State(state): State<Arc<AppState>>,
    params: Params,
) -> Result<Json<Value>, ApiError> {
    let text = params.string("text").trim().to_string();
    if text.is_empty() {
        return Err(ApiError::BadRequest("'text' must be specified".to_string()));
    }
    let config = SearchConfig {
        text,
        ..Default::default()
    };
    let suggestions = state.compass.assets().suggest_assets(&config).await?;
    Ok(Json(json!({ "data": suggestions })))
}

pub async fn group_assets(
    State(state): State<Arc<AppState>>,
    params: Params,
) -> Result<Json<Value>, ApiError> {
    let group_by = params.list("groupby");
    if group_by.is_empty() {
        return Err(ApiError::BadRequest("'groupby' must be specified".to_string()));
    }
    let config = GroupConfig {
        included_fields: params.list("include_fields"),
        group_by,
        filters: params.bracketed("filter"),
        size: params.number("size")?.unwrap_or_default(),
    };
    let groups = state.compass.assets().group_assets(&config).await?;
    Ok(Json(json!({ "asset_groups": groups })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_config_from_params() {
        let params = Params::new(
            [
                ("text", " orders "),
                ("filter[service]", "bq,kafka"),
                ("query[name]", "ord"),
                ("size", "5"),
                ("highlight", "true"),
                ("include_fields", "id,urn"),
            ]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        );
        let config = search_config(&params).unwrap();
        assert_eq!(config.text, "orders");
        assert_eq!(config.filters["service"], vec!["bq", "kafka"]);
        assert_eq!(config.queries["name"], "ord");
        assert_eq!(config.max_results, 5);
        assert!(config.flags.enable_highlight);
        assert!(!config.flags.disable_fuzzy);
        assert_eq!(config.include_fields, vec!["id", "urn"]);
    }
}
