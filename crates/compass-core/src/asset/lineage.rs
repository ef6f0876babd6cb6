//! Lineage graph between assets.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::model::Probe;

/// Property recording which endpoint installed or last modified an edge.
pub const ROOT_PROP: &str = "root";
pub const SOURCE_IS_DELETED_PROP: &str = "source_is_deleted";
pub const TARGET_IS_DELETED_PROP: &str = "target_is_deleted";

/// Directed edge between two asset urns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LineageEdge {
    pub source: String,
    pub target: String,
    pub prop: Map<String, Value>,
}

impl LineageEdge {
    /// Edge installed by `root`.
    pub fn new(source: impl Into<String>, target: impl Into<String>, root: &str) -> Self {
        let mut prop = Map::new();
        prop.insert(ROOT_PROP.to_string(), Value::String(root.to_string()));
        Self {
            source: source.into(),
            target: target.into(),
            prop,
        }
    }

    /// Urn of the node that owns this edge, if recorded.
    pub fn root(&self) -> Option<&str> {
        self.prop.get(ROOT_PROP).and_then(Value::as_str)
    }
}

pub type LineageGraph = Vec<LineageEdge>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineageDirection {
    Upstream,
    Downstream,
}

impl std::str::FromStr for LineageDirection {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "upstream" => Ok(LineageDirection::Upstream),
            "downstream" => Ok(LineageDirection::Downstream),
            other => Err(format!("invalid lineage direction {other:?}")),
        }
    }
}

/// Traversal options of a lineage lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LineageQuery {
    /// Maximum depth; zero means unbounded.
    pub level: u32,
    /// `None` walks both directions.
    pub direction: Option<LineageDirection>,
    pub with_attributes: bool,
    pub include_deleted: bool,
}

impl LineageQuery {
    pub fn includes(&self, direction: LineageDirection) -> bool {
        self.direction.is_none_or(|d| d == direction)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbesInfo {
    pub latest: Probe,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeAttributes {
    pub probes: ProbesInfo,
}

/// Lineage graph with optional per-node attributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Lineage {
    pub edges: LineageGraph,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub node_attrs: BTreeMap<String, NodeAttributes>,
}
