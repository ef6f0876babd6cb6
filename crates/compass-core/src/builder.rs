//! Builder for [`Compass`].

use std::sync::Arc;

use tracing::info;

use crate::asset::{AssetService, DiscoveryRepository, ServiceDeps, TypeRegistry, Worker};
use crate::config::CompassConfig;
use crate::discovery::{ElasticsearchDiscoveryRepository, HttpTransport};
use crate::error::Result;
use crate::store::{
    Database, SqliteAssetRepository, SqliteJobQueue, SqliteLineageRepository,
    SqliteUserRepository,
};
use crate::user::UserService;
use crate::worker::{InSituWorker, JobProcessor, Manager, ManagerDeps};
use crate::Compass;

/// Builder for [`Compass`].
///
/// # Example
///
/// ```rust,ignore
/// let compass = CompassBuilder::new(CompassConfig::load("compass.json")?)
///     .durable_worker(true)
///     .build()?;
/// compass.start_workers();
/// ```
pub struct CompassBuilder {
    config: CompassConfig,
    database: Option<Database>,
    discovery: Option<Arc<dyn DiscoveryRepository>>,
    durable_worker: Option<bool>,
}

impl CompassBuilder {
    pub fn new(config: CompassConfig) -> Self {
        Self {
            config,
            database: None,
            discovery: None,
            durable_worker: None,
        }
    }

    /// Use an already opened database instead of `config.db.path`.
    pub fn with_database(mut self, database: Database) -> Self {
        self.database = Some(database);
        self
    }

    /// Use another search index implementation instead of Elasticsearch.
    pub fn with_discovery(mut self, discovery: Arc<dyn DiscoveryRepository>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Override `worker.enabled`.
    ///
    /// Default: the configured value
    pub fn durable_worker(mut self, enable: bool) -> Self {
        self.durable_worker = Some(enable);
        self
    }

    pub fn build(self) -> Result<Compass> {
        self.config.validate()?;
        let config = self.config;

        let db = match self.database {
            Some(db) => db,
            None => Database::open(&config.db.path)?,
        };
        let registry = Arc::new(TypeRegistry::new(config.service.additional_types.as_slice())?);

        let asset_repo = Arc::new(
            SqliteAssetRepository::new(db.clone(), Arc::clone(&registry))
                .with_default_provider(config.identity.provider.clone())
                .with_array_merge_rules(config.service.array_merge_rules.clone()),
        );
        let lineage_repo = Arc::new(SqliteLineageRepository::new(db.clone()));
        let user_repo = Arc::new(SqliteUserRepository::new(db.clone()));
        let jobs = Arc::new(SqliteJobQueue::new(db.clone()));

        let discovery: Arc<dyn DiscoveryRepository> = match self.discovery {
            Some(discovery) => discovery,
            None => Arc::new(
                ElasticsearchDiscoveryRepository::new(
                    Arc::new(HttpTransport::new(&config.elasticsearch)?),
                    Arc::clone(&registry),
                )
                .with_column_search_exclusion_list(
                    config.elasticsearch.column_search_exclusion_list.clone(),
                ),
            ),
        };

        let durable = self.durable_worker.unwrap_or(config.worker.enabled);
        let (worker, manager): (Arc<dyn Worker>, Option<Arc<Manager>>) = if durable {
            let manager = Arc::new(Manager::new(
                ManagerDeps {
                    processor: jobs.clone(),
                    discovery_repo: Arc::clone(&discovery),
                    asset_repo: asset_repo.clone(),
                },
                &config.worker,
            )?);
            (manager.clone(), Some(manager))
        } else {
            (
                Arc::new(InSituWorker::new(Arc::clone(&discovery), asset_repo.clone())),
                None,
            )
        };

        let assets = Arc::new(AssetService::new(
            ServiceDeps::new(asset_repo, discovery, lineage_repo, Arc::clone(&worker))
                .with_delete_assets_timeout(config.service.delete_assets_timeout),
        ));
        let users = Arc::new(UserService::new(user_repo, config.identity.provider.clone()));

        info!(
            db = %db.path().display(),
            durable_worker = durable,
            asset_types = registry.len(),
            "Compass initialized"
        );

        Ok(Compass {
            config,
            db,
            assets,
            users,
            worker,
            manager,
            jobs: jobs as Arc<dyn JobProcessor>,
        })
    }
}
