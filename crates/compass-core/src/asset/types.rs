//! Asset type names and the registry of supported types.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{CompassError, Result};

static TYPE_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9_]{3,16}$").expect("type name regex must compile"));

/// Name of an asset type such as `table` or `topic`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetType(String);

impl AssetType {
    pub const TABLE: &'static str = "table";
    pub const JOB: &'static str = "job";
    pub const DASHBOARD: &'static str = "dashboard";
    pub const TOPIC: &'static str = "topic";
    pub const FEATURE_TABLE: &'static str = "feature_table";
    pub const APPLICATION: &'static str = "application";
    pub const MODEL: &'static str = "model";
    pub const QUERY: &'static str = "query";
    pub const METRIC: &'static str = "metric";

    /// Types every registry starts with.
    pub const BUILT_IN: [&'static str; 9] = [
        Self::TABLE,
        Self::JOB,
        Self::DASHBOARD,
        Self::TOPIC,
        Self::FEATURE_TABLE,
        Self::APPLICATION,
        Self::MODEL,
        Self::QUERY,
        Self::METRIC,
    ];

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AssetType {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for AssetType {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Set of asset types accepted by validation.
///
/// Built once at startup from the built-in types plus any configured
/// additional types, then shared read-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeRegistry {
    types: BTreeSet<String>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self {
            types: AssetType::BUILT_IN.iter().map(|t| t.to_string()).collect(),
        }
    }
}

impl TypeRegistry {
    /// Registry with the built-in types plus `additional`.
    ///
    /// Each additional name must be 3 to 16 characters of lowercase letters,
    /// digits or underscores.
    pub fn new<S: AsRef<str>>(additional: &[S]) -> Result<Self> {
        let mut registry = Self::default();
        for name in additional {
            let name = name.as_ref();
            if !is_valid_type_name(name) {
                return Err(CompassError::Config {
                    message: format!(
                        "invalid additional asset type {name:?}: must match {}",
                        TYPE_NAME_RE.as_str()
                    ),
                });
            }
            registry.types.insert(name.to_string());
        }
        Ok(registry)
    }

    pub fn is_valid(&self, asset_type: &AssetType) -> bool {
        self.types.contains(asset_type.as_str())
    }

    /// All supported types in name order.
    pub fn types(&self) -> impl Iterator<Item = AssetType> + '_ {
        self.types.iter().map(|t| AssetType::new(t.as_str()))
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// Whether `name` is acceptable as a type name.
pub fn is_valid_type_name(name: &str) -> bool {
    TYPE_NAME_RE.is_match(name)
}
