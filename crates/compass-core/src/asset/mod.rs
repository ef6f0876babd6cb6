//! Assets: the data model, its versioning and change tracking, the
//! collaborator contracts and the service orchestrating them.

pub mod delete_expr;
pub mod diff;
pub mod discovery;
pub mod lineage;
pub mod metrics;
pub mod model;
pub mod patch;
pub mod repository;
pub mod service;
pub mod types;
pub mod version;

pub use delete_expr::{DeleteAssetExpr, ASSET_FIELDS};
pub use diff::{soft_delete_changelog, Change, ChangeKind};
pub use discovery::{
    GroupConfig, GroupField, GroupResult, SearchConfig, SearchFilter, SearchFlags, SearchResult,
    DEFAULT_GROUP_SIZE, DEFAULT_MAX_RESULTS,
};
pub use lineage::{
    Lineage, LineageDirection, LineageEdge, LineageGraph, LineageQuery, NodeAttributes,
    ProbesInfo, ROOT_PROP, SOURCE_IS_DELETED_PROP, TARGET_IS_DELETED_PROP,
};
pub use metrics::{IdentifierKind, OperationCount, OperationCounter};
pub use model::{
    Asset, Data, DeleteAssetsRequest, Filter, Probe, ProbesFilter, SoftDeleteParams,
    SoftDeleteTarget, SortDirection, NON_EMPTY_VALUE,
};
pub use patch::{merge, ArrayMergeRules, MAX_MERGE_DEPTH};
pub use repository::{
    AssetRepository, DiscoveryRepository, LineageRepository, SyncCleanup, Worker,
};
pub use service::{AssetService, ServiceDeps};
pub use types::{is_valid_type_name, AssetType, TypeRegistry};
pub use version::{increase_minor_version, parse_version, BASE_VERSION};
