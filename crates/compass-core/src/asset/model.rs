//! Asset, probe and listing filter models.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::diff::Change;
use super::types::{AssetType, TypeRegistry};
use crate::error::{CompassError, InvalidError, Result};
use crate::queryexpr::QueryExpr;
use crate::user::User;

/// Opaque structured payload carried by an asset.
pub type Data = Map<String, Value>;

/// An asset wraps producer-supplied data with catalog context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Asset {
    pub id: String,
    pub urn: String,
    #[serde(rename = "type")]
    pub asset_type: AssetType,
    pub service: String,
    pub name: String,
    pub description: String,
    pub data: Option<Data>,
    pub url: String,
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub owners: Vec<User>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub refreshed_at: Option<DateTime<Utc>>,
    pub version: String,
    pub updated_by: User,
    pub is_deleted: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub changelog: Vec<Change>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub probes: Vec<Probe>,
}

impl Asset {
    /// Check the fields required to insert a new asset.
    pub fn validate(&self, registry: &TypeRegistry) -> Result<()> {
        if self.urn.is_empty() {
            return Err(CompassError::EmptyUrn);
        }
        if !registry.is_valid(&self.asset_type) {
            return Err(CompassError::UnknownType(self.asset_type.to_string()));
        }
        if self.name.is_empty() {
            return Err(InvalidError::Required("name").into());
        }
        if self.data.is_none() {
            return Err(InvalidError::Required("data").into());
        }
        if self.service.is_empty() {
            return Err(InvalidError::Required("service").into());
        }
        Ok(())
    }

    /// Data payload, treating an absent payload as empty.
    pub fn data_or_empty(&self) -> Data {
        self.data.clone().unwrap_or_default()
    }
}

/// A status observation attached to an asset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Probe {
    pub id: String,
    pub asset_urn: String,
    pub status: String,
    pub status_reason: String,
    pub metadata: Option<Data>,
    /// When the observation was made. Defaults to `created_at` on insert.
    pub timestamp: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Bulk probe lookup.
#[derive(Debug, Clone, Default)]
pub struct ProbesFilter {
    pub asset_urns: Vec<String>,
    /// Per-urn cap on returned probes; zero means unbounded.
    pub max_rows: usize,
    pub newer_than: Option<DateTime<Utc>>,
    pub older_than: Option<DateTime<Utc>>,
}

/// Sort direction of a listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_sql(self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }

    /// Parse a direction, case-insensitively. Anything else is rejected.
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "" | "asc" => Ok(SortDirection::Asc),
            "desc" => Ok(SortDirection::Desc),
            _ => Err(InvalidError::Field {
                field: "sort_direction".to_string(),
                message: format!("{s:?} is not one of asc, desc"),
            }
            .into()),
        }
    }
}

/// Paging and filtering options of an asset listing.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub types: Vec<AssetType>,
    pub services: Vec<String>,
    /// Zero means no limit.
    pub size: i64,
    pub offset: i64,
    pub sort_by: String,
    pub sort_direction: SortDirection,
    /// Fields matched against `query`.
    pub query_fields: Vec<String>,
    pub query: String,
    /// JSON path inside `data` mapped to accepted values. The value
    /// [`NON_EMPTY_VALUE`] means the path holds a non-empty value.
    pub data: BTreeMap<String, Vec<String>>,
    pub is_deleted: bool,
}

/// Data filter value that matches any non-empty value.
pub const NON_EMPTY_VALUE: &str = "_nonempty";

impl Filter {
    pub fn validate(&self) -> Result<()> {
        if self.size < 0 || self.offset < 0 {
            return Err(InvalidError::Range(format!(
                "size and offset must be non-negative, got size={} offset={}",
                self.size, self.offset
            ))
            .into());
        }
        Ok(())
    }
}

/// What a soft delete applies to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SoftDeleteTarget {
    Urn(String),
    QueryExpr(QueryExpr),
}

/// Parameters of a soft delete propagated to the search index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoftDeleteParams {
    pub target: SoftDeleteTarget,
    pub executed_at: DateTime<Utc>,
    /// Version written by the primary store. Bulk soft deletes leave this
    /// unset and the index bumps each document's version itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_version: Option<String>,
    pub updated_by: String,
}

impl SoftDeleteParams {
    pub fn for_urn(
        urn: impl Into<String>,
        executed_at: DateTime<Utc>,
        new_version: impl Into<String>,
        updated_by: impl Into<String>,
    ) -> Self {
        Self {
            target: SoftDeleteTarget::Urn(urn.into()),
            executed_at,
            new_version: Some(new_version.into()),
            updated_by: updated_by.into(),
        }
    }

    pub fn for_query_expr(
        expr: QueryExpr,
        executed_at: DateTime<Utc>,
        updated_by: impl Into<String>,
    ) -> Self {
        Self {
            target: SoftDeleteTarget::QueryExpr(expr),
            executed_at,
            new_version: None,
            updated_by: updated_by.into(),
        }
    }
}

/// Request of a bulk delete by expression.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeleteAssetsRequest {
    pub query_expr: String,
    pub dry_run: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_asset() -> Asset {
        Asset {
            urn: "urn:x:1".to_string(),
            asset_type: AssetType::from("table"),
            service: "bq".to_string(),
            name: "n".to_string(),
            data: Some(Map::new()),
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_required_fields() {
        let registry = TypeRegistry::default();
        assert!(valid_asset().validate(&registry).is_ok());

        let mut asset = valid_asset();
        asset.urn.clear();
        assert!(matches!(asset.validate(&registry), Err(CompassError::EmptyUrn)));

        let mut asset = valid_asset();
        asset.asset_type = AssetType::from("nope");
        assert!(matches!(
            asset.validate(&registry),
            Err(CompassError::UnknownType(_))
        ));

        let mut asset = valid_asset();
        asset.data = None;
        assert!(asset.validate(&registry).is_err());

        let mut asset = valid_asset();
        asset.service.clear();
        assert!(asset.validate(&registry).is_err());
    }

    #[test]
    fn test_asset_json_shape() {
        let asset: Asset = serde_json::from_value(json!({
            "urn": "urn:x:1",
            "type": "table",
            "service": "bq",
            "name": "orders",
            "data": {"k": 1},
            "labels": {"team": "core"},
            "owners": [{"email": "a@example.com"}]
        }))
        .unwrap();
        assert_eq!(asset.asset_type.as_str(), "table");
        assert_eq!(asset.owners[0].email, "a@example.com");
        assert!(asset.refreshed_at.is_none());

        let value = serde_json::to_value(&asset).unwrap();
        assert_eq!(value["type"], "table");
        assert!(value.get("changelog").is_none());
        assert!(value.get("probes").is_none());
    }

    #[test]
    fn test_filter_rejects_negative_range() {
        let filter = Filter {
            size: -1,
            ..Default::default()
        };
        assert!(matches!(
            filter.validate(),
            Err(CompassError::Invalid(InvalidError::Range(_)))
        ));
    }

    #[test]
    fn test_soft_delete_params_json() {
        let params = SoftDeleteParams::for_urn("urn:x:1", Utc::now(), "0.3", "user-1");
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["target"], json!({"urn": "urn:x:1"}));
        assert_eq!(value["new_version"], "0.3");

        let back: SoftDeleteParams = serde_json::from_value(value).unwrap();
        assert_eq!(back, params);
    }

    #[test]
    fn test_sort_direction_parse() {
        assert_eq!(SortDirection::parse("DESC").unwrap(), SortDirection::Desc);
        assert_eq!(SortDirection::parse("").unwrap(), SortDirection::Asc);
        assert!(SortDirection::parse("sideways").is_err());
    }
}
