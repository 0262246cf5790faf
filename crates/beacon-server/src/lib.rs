//! Beacon server library logic: shared state, the HTTP router and the
//! background tasks started next to it.

pub mod api_upstream;
pub mod background;
pub mod config;
pub mod jobs;
pub mod middleware;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Extension, Json, Router,
};
use beacon_db::DbPool;
use config::HubConfig;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub pool: DbPool,
    /// Hub role settings; the upstream routes exist only when enabled.
    pub hub: HubConfig,
}

/// Maximum request body size (16 MiB). Push batches carry whole rows.
const MAX_REQUEST_BODY_BYTES: usize = 16 * 1024 * 1024;

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    let mut router = Router::new().route("/health", get(health));

    if state.hub.enabled {
        let hub_routes = Router::new()
            .route("/upstream/push", post(api_upstream::push_handler))
            .route("/upstream/pull/{agent_name}", get(api_upstream::pull_handler))
            .route("/upstream/status/{agent_name}", get(api_upstream::status_handler))
            .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
            .layer(axum::middleware::from_fn(middleware::hub_auth_middleware));
        router = router.merge(hub_routes);
    }

    router
        .layer(TraceLayer::new_for_http())
        .layer(Extension(Arc::new(state)))
}
