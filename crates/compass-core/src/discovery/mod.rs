//! Elasticsearch search index.
//!
//! Assets are indexed per service and read through the `universe` alias.
//! Writes to the index are driven by the worker; reads serve search,
//! suggestion and grouping.

mod client;
mod mapping;
mod query;
mod repository;

pub use client::{EsRequest, EsResponse, HttpTransport, Transport};
pub use mapping::index_definition;
pub use query::{build_group_body, build_search_body, build_suggest_body, RETURNED_FIELDS};
pub use repository::ElasticsearchDiscoveryRepository;
