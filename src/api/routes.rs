//! Route table for the HTTP surface.
//!
//! Four service groups under `/v1`:
//! - `/v1/catalog` - allocate, commit, delete, promote, spill,
//!   metadata, lineage
//! - `/v1/data` - resolve, lease, release
//! - `/v1/streams` - create, delete, append, read, range, commit,
//!   committed, subscribe
//! - `/v1/admin` - stats

use axum::routing::{delete, get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::handlers::{self, AppState};

/// Build the full router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/v1/catalog", catalog_routes())
        .nest("/v1/data", data_routes())
        .nest("/v1/streams", stream_routes())
        .nest("/v1/admin", admin_routes())
        .route("/health", get(handlers::health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn catalog_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/allocate", post(handlers::allocate))
        .route("/commit/:id", post(handlers::commit))
        .route("/payloads/:id", delete(handlers::delete_payload))
        .route("/promote/:id", post(handlers::promote))
        .route("/spill", post(handlers::spill))
        .route("/metadata", post(handlers::update_metadata))
        .route("/metadata/events", post(handlers::append_metadata_event))
        .route("/lineage", post(handlers::add_lineage))
        .route("/lineage/:id", get(handlers::get_lineage))
}

fn data_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/resolve/:id", get(handlers::resolve_snapshot))
        .route("/lease", post(handlers::acquire_lease))
        .route("/lease/:lease_id", delete(handlers::release_lease))
}

fn stream_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(handlers::create_stream))
        .route("/:namespace/:name", delete(handlers::delete_stream))
        .route("/append", post(handlers::append_stream))
        .route("/read", post(handlers::read_stream))
        .route("/range", post(handlers::stream_range))
        .route("/commit", post(handlers::commit_offset))
        .route(
            "/:namespace/:name/committed/:group",
            get(handlers::get_committed),
        )
        .route("/subscribe", post(handlers::subscribe_stream))
}

fn admin_routes() -> Router<Arc<AppState>> {
    Router::new().route("/stats", get(handlers::stats))
}
