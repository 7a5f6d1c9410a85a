//! # HTTP Frontend
//!
//! JSON-over-HTTP transport composed around the service layer. Portable
//! error kinds map onto HTTP statuses in one place; the subscribe
//! endpoint streams newline-delimited JSON.
//!
//! The frontend carries no business logic. Swapping it for another
//! transport means re-wiring `service::ServiceContext` behind new
//! argument decoding, nothing more.

pub mod handlers;
pub mod responses;
pub mod routes;

pub use handlers::AppState;
pub use responses::{ApiError, ApiResult, ErrorBody};
pub use routes::create_router;

use std::sync::Arc;

use crate::core::{Error, Result};
use crate::service::{
    AdminService, CatalogService, DataService, ServiceContext, StreamService,
};

/// Assemble handler state from the shared service context.
pub fn app_state(ctx: ServiceContext) -> Arc<AppState> {
    Arc::new(AppState {
        catalog: CatalogService::new(ctx.clone()),
        data: DataService::new(ctx.clone()),
        streams: StreamService::new(ctx.clone()),
        admin: AdminService::new(ctx),
    })
}

/// Serve the router on `bind_address` until `shutdown` resolves.
pub async fn serve(
    bind_address: &str,
    state: Arc<AppState>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .map_err(|e| Error::Io(format!("bind {}: {}", bind_address, e)))?;
    tracing::info!(%bind_address, "http frontend listening");
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::Io(format!("serve: {}", e)))
}
