//! HTTP request handlers, split by domain.

pub mod assets;
pub mod lineage;
pub mod search;
pub mod status;

mod shared;

pub use shared::{ApiError, CurrentUser, Params};
