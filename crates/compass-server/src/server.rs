//! HTTP server implementation using Axum.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::HeaderName;
use axum::routing::{get, post};
use axum::Router;
use compass_core::Compass;
use tokio::task::JoinHandle;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::handlers::{assets, lineage, search, status};

/// Requests served at once before new ones wait.
const MAX_CONCURRENT_REQUESTS: usize = 512;

/// Application state shared across handlers.
pub struct AppState {
    pub compass: Arc<Compass>,
    /// Header carrying the caller's email.
    pub identity_header: HeaderName,
}

impl AppState {
    pub fn new(compass: Arc<Compass>) -> anyhow::Result<Self> {
        let identity_header =
            HeaderName::from_bytes(compass.config().identity.header.to_ascii_lowercase().as_bytes())?;
        Ok(Self {
            compass,
            identity_header,
        })
    }
}

/// Build the gateway router.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let v1beta1 = Router::new()
        .route(
            "/assets",
            get(assets::list_assets)
                .put(assets::upsert_asset)
                .patch(assets::upsert_patch_asset),
        )
        .route("/assets/delete-by-query", post(assets::delete_assets))
        .route("/assets/sync", post(assets::sync_assets))
        .route(
            "/assets/:id",
            get(assets::get_asset).delete(assets::delete_asset),
        )
        .route("/assets/:id/versions", get(assets::get_asset_versions))
        .route("/assets/:id/versions/:version", get(assets::get_asset_by_version))
        .route("/assets/:id/probes", post(assets::create_probe))
        .route("/lineage/:urn", get(lineage::get_lineage))
        .route("/types", get(assets::get_types))
        .route("/search", get(search::search_assets))
        .route("/search/suggest", get(search::suggest_assets))
        .route("/search/group", get(search::group_assets));

    Router::new()
        .route("/health", get(status::health))
        .route("/metrics", get(status::metrics))
        .nest("/v1beta1", v1beta1)
        .layer(TraceLayer::new_for_http())
        .layer(ConcurrencyLimitLayer::new(MAX_CONCURRENT_REQUESTS))
        .layer(cors)
        .with_state(state)
}

/// Start the HTTP server.
///
/// Returns the actual address the server is bound to (useful when port=0)
/// and the task serving it.
pub async fn start_server(
    compass: Arc<Compass>,
    host: &str,
    port: u16,
) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
    let state = Arc::new(AppState::new(compass)?);
    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!(addr = %actual_addr, "Server listening");

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Server error");
        }
    });

    Ok((actual_addr, handle))
}
