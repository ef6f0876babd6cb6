//! Search-side types shared by the asset service and the search index.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::model::Asset;
use super::types::AssetType;

/// Field name mapped to the accepted values.
pub type SearchFilter = BTreeMap<String, Vec<String>>;

/// Default number of search results.
pub const DEFAULT_MAX_RESULTS: usize = 200;

/// Default number of groups returned by a group query.
pub const DEFAULT_GROUP_SIZE: usize = 10;

/// Flags adjusting how a search is executed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchFlags {
    pub enable_highlight: bool,
    pub disable_fuzzy: bool,
    pub is_column_search: bool,
}

/// A free-text search with its filters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub text: String,
    pub filters: SearchFilter,
    /// Zero selects [`DEFAULT_MAX_RESULTS`].
    pub max_results: usize,
    /// Numeric field boosting the score. Defaults to the query count.
    pub rank_by: String,
    /// Field name mapped to a value matched against that field.
    pub queries: BTreeMap<String, String>,
    pub flags: SearchFlags,
    pub offset: usize,
    pub include_fields: Vec<String>,
}

/// An item of a search response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchResult {
    pub id: String,
    pub urn: String,
    pub title: String,
    #[serde(rename = "type")]
    pub asset_type: String,
    pub service: String,
    pub description: String,
    pub labels: BTreeMap<String, String>,
    pub data: Map<String, Value>,
}

impl SearchResult {
    pub fn to_asset(&self) -> Asset {
        Asset {
            id: self.id.clone(),
            urn: self.urn.clone(),
            name: self.title.clone(),
            asset_type: AssetType::new(self.asset_type.as_str()),
            service: self.service.clone(),
            description: self.description.clone(),
            labels: self.labels.clone(),
            data: Some(self.data.clone()),
            ..Default::default()
        }
    }
}

/// A group query with its filters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    pub included_fields: Vec<String>,
    pub group_by: Vec<String>,
    pub filters: SearchFilter,
    /// Zero selects [`DEFAULT_GROUP_SIZE`].
    pub size: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupField {
    pub name: String,
    pub value: String,
}

/// One group of a group query response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupResult {
    pub fields: Vec<GroupField>,
    pub assets: Vec<Asset>,
}
