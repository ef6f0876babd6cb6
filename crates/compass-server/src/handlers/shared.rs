//! Shared handler utilities used across domains.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::async_trait;
use axum::extract::{FromRequestParts, Query};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use compass_core::{CompassError, ErrorKind};
use serde_json::json;
use tracing::{error, warn};

use crate::server::AppState;

// ============================================================================
// Errors
// ============================================================================

/// Error returned by every handler.
#[derive(Debug)]
pub enum ApiError {
    Compass(CompassError),
    BadRequest(String),
    Unauthenticated(String),
}

impl From<CompassError> for ApiError {
    fn from(err: CompassError) -> Self {
        ApiError::Compass(err)
    }
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, "invalid_argument", message.clone())
            }
            ApiError::Unauthenticated(message) => {
                (StatusCode::UNAUTHORIZED, "unauthenticated", message.clone())
            }
            ApiError::Compass(err) => match err.kind() {
                ErrorKind::NotFound => (StatusCode::NOT_FOUND, "not_found", err.to_string()),
                ErrorKind::AlreadyExists => {
                    (StatusCode::CONFLICT, "already_exists", err.to_string())
                }
                ErrorKind::InvalidArgument => {
                    (StatusCode::BAD_REQUEST, "invalid_argument", err.to_string())
                }
                ErrorKind::FailedPrecondition => {
                    (StatusCode::BAD_REQUEST, "failed_precondition", err.to_string())
                }
                ErrorKind::Unavailable => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "unavailable",
                    err.to_string(),
                ),
                ErrorKind::Internal => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "Internal Server Error".to_string(),
                ),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        match &self {
            ApiError::Compass(err) if status.is_server_error() => {
                error!(error = %err, code, "Request failed");
            }
            _ => warn!(status = status.as_u16(), message = %message, "Request rejected"),
        }
        (status, Json(json!({"code": code, "message": message}))).into_response()
    }
}

// ============================================================================
// Caller identity
// ============================================================================

/// Id of the user named by the identity header, created on first sight.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub String);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let email = parts
            .headers
            .get(&state.identity_header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .unwrap_or_default();
        if email.is_empty() {
            return Err(ApiError::Unauthenticated(format!(
                "missing header {}",
                state.identity_header
            )));
        }
        let user_id = state.compass.users().validate_user(email).await?;
        Ok(CurrentUser(user_id))
    }
}

// ============================================================================
// Query parameters
// ============================================================================

/// Query string pairs, keeping repeated keys.
#[derive(Debug, Clone, Default)]
pub struct Params(Vec<(String, String)>);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Params {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(pairs) = Query::<Vec<(String, String)>>::from_request_parts(parts, state)
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;
        Ok(Params(pairs))
    }
}

impl Params {
    pub fn new(pairs: Vec<(String, String)>) -> Self {
        Params(pairs)
    }

    /// Last value of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn string(&self, key: &str) -> String {
        self.get(key).unwrap_or_default().to_string()
    }

    /// Every value of `key`, with comma separated values split apart.
    pub fn list(&self, key: &str) -> Vec<String> {
        self.0
            .iter()
            .filter(|(k, _)| k == key)
            .flat_map(|(_, v)| split_csv(v))
            .collect()
    }

    pub fn bool(&self, key: &str) -> Result<bool, ApiError> {
        match self.get(key) {
            None | Some("") => Ok(false),
            Some("true") | Some("1") => Ok(true),
            Some("false") | Some("0") => Ok(false),
            Some(other) => Err(ApiError::BadRequest(format!(
                "{key} must be a boolean, got {other:?}"
            ))),
        }
    }

    /// Parse `key` as a number. Absent or empty values give `None`.
    pub fn number<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>, ApiError> {
        match self.get(key) {
            None | Some("") => Ok(None),
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| ApiError::BadRequest(format!("{key} must be a number, got {raw:?}"))),
        }
    }

    /// Values of keys written as `prefix[name]`, grouped by name.
    pub fn bracketed(&self, prefix: &str) -> BTreeMap<String, Vec<String>> {
        let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (key, value) in &self.0 {
            let Some(name) = key
                .strip_prefix(prefix)
                .and_then(|rest| rest.strip_prefix('['))
                .and_then(|rest| rest.strip_suffix(']'))
            else {
                continue;
            };
            if name.is_empty() {
                continue;
            }
            out.entry(name.to_string())
                .or_default()
                .extend(split_csv(value));
        }
        out
    }
}

/// Split a comma separated list, dropping blanks.
pub fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> Params {
        Params::new(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_list_splits_and_repeats() {
        let p = params(&[("types", "table, topic"), ("types", "job"), ("services", "")]);
        assert_eq!(p.list("types"), vec!["table", "topic", "job"]);
        assert!(p.list("services").is_empty());
    }

    #[test]
    fn test_bracketed_groups_by_name() {
        let p = params(&[
            ("filter[service]", "bq"),
            ("filter[service]", "kafka"),
            ("filter[]", "x"),
            ("query[name]", "orders"),
        ]);
        let filters = p.bracketed("filter");
        assert_eq!(filters.len(), 1);
        assert_eq!(filters["service"], vec!["bq", "kafka"]);
        assert_eq!(p.bracketed("query")["name"], vec!["orders"]);
    }

    #[test]
    fn test_scalars() {
        let p = params(&[("size", "10"), ("flag", "true"), ("bad", "x")]);
        assert_eq!(p.number::<i64>("size").unwrap(), Some(10));
        assert_eq!(p.number::<i64>("offset").unwrap(), None);
        assert!(p.number::<i64>("bad").is_err());
        assert!(p.bool("flag").unwrap());
        assert!(!p.bool("missing").unwrap());
        assert!(p.bool("bad").is_err());
    }

    #[test]
    fn test_error_status_mapping() {
        let not_found: ApiError =
            CompassError::from(compass_core::error::NotFoundError::Urn("x".into())).into();
        assert_eq!(not_found.parts().0, StatusCode::NOT_FOUND);
        assert_eq!(ApiError::from(CompassError::EmptyUrn).parts().0, StatusCode::BAD_REQUEST);
        let internal = ApiError::from(CompassError::Other("boom".into()));
        assert_eq!(internal.parts().0, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(internal.parts().2, "Internal Server Error");
        assert_eq!(
            ApiError::from(CompassError::AlreadyDeleted {
                identifier: "x".into()
            })
            .parts()
            .1,
            "failed_precondition"
        );
    }
}
