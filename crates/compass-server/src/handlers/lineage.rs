//! Lineage handler.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use compass_core::{Lineage, LineageDirection, LineageQuery};

use super::shared::{ApiError, Params};
use crate::server::AppState;

/// Build a lineage query from `level`, `direction`, `with_attributes` and
/// `include_deleted`.
pub fn lineage_query(params: &Params) -> Result<LineageQuery, ApiError> {
    let direction = match params.get("direction") {
        None | Some("") => None,
        Some(raw) => Some(
            raw.parse::<LineageDirection>()
                .map_err(ApiError::BadRequest)?,
        ),
    };
    Ok(LineageQuery {
        level: params.number("level")?.unwrap_or_default(),
        direction,
        with_attributes: params.bool("with_attributes")?,
        include_deleted: params.bool("include_deleted")?,
    })
}

pub async fn get_lineage(
    State(state): State<Arc<AppState>>,
    Path(urn): Path<String>,
    params: Params,
) -> Result<Json<Lineage>, ApiError> {
    let query = lineage_query(&params)?;
    let lineage = state.compass.assets().get_lineage(&urn, &query).await?;
    Ok(Json(lineage))
}
