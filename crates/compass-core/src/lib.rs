//! Compass Core - metadata discovery engine.
//!
//! Compass catalogs data assets produced by many services. Each asset is
//! versioned in the primary store together with its owners, probes and
//! lineage, and mirrored into a search index that serves free-text search.
//! The primary store is authoritative; the index is kept in step by queued
//! jobs and can be rebuilt per service.
//!
//! # Example
//!
//! ```rust,ignore
//! use compass_core::{CompassBuilder, CompassConfig};
//!
//! #[tokio::main]
//! async fn main() -> compass_core::Result<()> {
//!     let compass = CompassBuilder::new(CompassConfig::default()).build()?;
//!
//!     let user_id = compass.users().validate_user("jane@example.com").await?;
//!     let asset = compass.assets().get_asset_by_id("urn:bigquery:orders").await?;
//!     println!("{} v{} updated by {}", asset.urn, asset.version, user_id);
//!
//!     compass.shutdown().await
//! }
//! ```

pub mod asset;
pub mod cancel;
pub mod config;
pub mod discovery;
pub mod error;
pub mod queryexpr;
pub mod store;
pub mod user;
pub mod worker;

mod builder;

#[cfg(test)]
mod testing;

pub use asset::{
    Asset, AssetRepository, AssetService, AssetType, DeleteAssetsRequest, DiscoveryRepository,
    Filter, GroupConfig, Lineage, LineageDirection, LineageQuery, LineageRepository, Probe,
    SearchConfig, SoftDeleteParams, TypeRegistry, Worker,
};
pub use builder::CompassBuilder;
pub use cancel::CancellationToken;
pub use config::CompassConfig;
pub use error::{CompassError, ErrorKind, Result};
pub use queryexpr::QueryExpr;
pub use store::Database;
pub use user::{User, UserRepository, UserService};

use std::sync::Arc;

use tracing::info;

use worker::{JobProcessor, Manager};

/// A wired Compass instance.
pub struct Compass {
    config: CompassConfig,
    db: Database,
    assets: Arc<AssetService>,
    users: Arc<UserService>,
    worker: Arc<dyn Worker>,
    manager: Option<Arc<Manager>>,
    jobs: Arc<dyn JobProcessor>,
}

impl Compass {
    pub fn builder(config: CompassConfig) -> CompassBuilder {
        CompassBuilder::new(config)
    }

    pub fn config(&self) -> &CompassConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn assets(&self) -> &Arc<AssetService> {
        &self.assets
    }

    pub fn users(&self) -> &Arc<UserService> {
        &self.users
    }

    /// The durable job queue. Present even when jobs run inline, so dead
    /// jobs left by an earlier durable run can be inspected.
    pub fn jobs(&self) -> &Arc<dyn JobProcessor> {
        &self.jobs
    }

    pub fn is_durable(&self) -> bool {
        self.manager.is_some()
    }

    /// Start draining the job queue. Does nothing when jobs run inline.
    pub fn start_workers(&self) {
        if let Some(manager) = &self.manager {
            manager.start();
        }
    }

    /// Cancel running bulk deletes, wait for them, then stop the worker.
    pub async fn shutdown(&self) -> Result<()> {
        self.assets.cancel_background_tasks();
        self.assets.wait_background_tasks().await;
        self.worker.close().await?;
        info!("Compass shut down");
        Ok(())
    }
}
