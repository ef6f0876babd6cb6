//! Compass - metadata discovery service.
//!
//! Serves the HTTP gateway, drains the job queue and runs maintenance
//! commands against the primary store and the search index.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use compass_core::config::duration_str;
use compass_core::{Compass, CompassConfig, Database, LineageDirection, LineageQuery};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "compass")]
#[command(about = "Metadata discovery and lineage service")]
struct Args {
    /// JSON configuration file (defaults apply when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP gateway
    Serve {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (0 = auto-assign)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Apply pending database migrations
    Migrate,
    /// Drain the durable job queue
    Worker,
    /// Hard delete soft deleted assets that expired
    Cleanup {
        /// Comma separated services, `*` for all
        #[arg(long)]
        services: Option<String>,

        /// Age after which a soft deleted asset is removed, e.g. `720h`
        #[arg(long)]
        expiry_duration: Option<String>,

        /// Only count the assets that would be removed
        #[arg(long)]
        dry_run: Option<bool>,
    },
    /// Print the lineage graph of an asset as JSON
    Lineage {
        urn: String,

        /// `upstream` or `downstream`; both when omitted
        #[arg(long)]
        direction: Option<LineageDirection>,

        /// Maximum depth, 0 for unbounded
        #[arg(long, default_value = "0")]
        level: u32,

        /// Attach the latest probe of every node
        #[arg(long)]
        with_attributes: bool,
    },
    /// Print the version
    Version,
}

fn init_logging(debug: bool, format: LogFormat) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.compact().init(),
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<CompassConfig> {
    match path {
        Some(path) => CompassConfig::load(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(CompassConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if let Command::Version = args.command {
        println!("compass {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    init_logging(args.debug, args.log_format);
    let mut config = load_config(args.config.as_ref())?;

    match args.command {
        Command::Serve { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            serve(config).await
        }
        Command::Migrate => {
            let db = Database::open_without_migrations(&config.db.path)?;
            let applied = db.migrate()?;
            info!(applied, version = db.schema_version()?, "Migration finished");
            Ok(())
        }
        Command::Worker => run_worker(config).await,
        Command::Cleanup {
            services,
            expiry_duration,
            dry_run,
        } => {
            if let Some(services) = services {
                config.cleanup.services = services;
            }
            if let Some(raw) = expiry_duration {
                config.cleanup.expiry_duration =
                    duration_str::parse(&raw).map_err(anyhow::Error::msg)?;
            }
            if let Some(dry_run) = dry_run {
                config.cleanup.dry_run = dry_run;
            }
            cleanup(config).await
        }
        Command::Lineage {
            urn,
            direction,
            level,
            with_attributes,
        } => {
            let query = LineageQuery {
                level,
                direction,
                with_attributes,
                include_deleted: false,
            };
            print_lineage(config, &urn, &query).await
        }
        Command::Version => Ok(()),
    }
}

async fn serve(config: CompassConfig) -> Result<()> {
    let (host, port) = (config.server.host.clone(), config.server.port);
    let compass = Arc::new(Compass::builder(config).build()?);
    compass.start_workers();

    let (addr, server) = compass_server::start_server(Arc::clone(&compass), &host, port).await?;
    info!(addr = %addr, durable_worker = compass.is_durable(), "Compass server running");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    server.abort();
    compass.shutdown().await?;
    Ok(())
}

async fn run_worker(config: CompassConfig) -> Result<()> {
    let compass = Compass::builder(config).durable_worker(true).build()?;
    compass.start_workers();
    info!("Worker running");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, draining workers");
    compass.shutdown().await?;
    Ok(())
}

async fn cleanup(config: CompassConfig) -> Result<()> {
    let services: Vec<String> = config
        .cleanup
        .services
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    if services.is_empty() {
        bail!("cleanup needs --services (comma separated, `*` for all)");
    }
    let dry_run = config.cleanup.dry_run;
    let threshold = Utc::now() - chrono::Duration::from_std(config.cleanup.expiry_duration)?;

    let compass = Compass::builder(config).build()?;
    let total = compass
        .assets()
        .delete_assets_by_services_and_updated_at(dry_run, true, &services, threshold)
        .await?;
    info!(total, dry_run, services = ?services, threshold = %threshold, "Cleanup finished");
    println!("Compass cleanup completed with total deleted assets {}", total);
    compass.shutdown().await?;
    Ok(())
}

async fn print_lineage(config: CompassConfig, urn: &str, query: &LineageQuery) -> Result<()> {
    let compass = Compass::builder(config).build()?;
    let lineage = compass.assets().get_lineage(urn, query).await?;
    println!("{}", serde_json::to_string_pretty(&lineage)?);
    compass.shutdown().await?;
    Ok(())
}
