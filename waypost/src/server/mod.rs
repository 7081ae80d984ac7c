//! HTTP and RPC surface.
//!
//! Fixed routes are registered on the router; the ingest, approval and
//! connector paths come from config and are matched in the fallback so they
//! follow reloads.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod rpc;

pub use error::{ApiError, ApiResult};
pub use rpc::RpcCommand;

use crate::error::Result;
use crate::gateway::Gateway;
use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Build the router.
pub fn router(gateway: Gateway) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/status", get(handlers::status))
        .route("/messages", get(handlers::messages))
        .route("/config", get(handlers::config_get))
        .route("/config/reload", post(handlers::config_reload))
        .route(
            "/config/channels/{id}",
            get(handlers::channel_get).post(handlers::channel_put),
        )
        .route(
            "/config/groups/{id}",
            get(handlers::group_get).post(handlers::group_put),
        )
        .route("/rpc", post(handlers::rpc))
        .route("/approve", post(handlers::approve))
        .fallback(handlers::configured_paths)
        .with_state(gateway)
        .layer(TraceLayer::new_for_http())
}

/// Bind the configured address and serve until `shutdown` resolves.
///
/// The listen address is read once; changing it needs a restart.
///
/// # Errors
///
/// Returns an error if the address cannot be bound or the server fails.
pub async fn serve<F>(gateway: Gateway, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let snapshot = gateway.snapshot().await;
    let addr = format!("{}:{}", snapshot.config.server.bind, snapshot.config.server.port);
    drop(snapshot);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "listening");
    axum::serve(listener, router(gateway))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
