//! HTTP API server.
//!
//! Read-only JSON endpoints under `/api/v1` for pulling the latest report
//! and controller status. Built on Axum.

pub mod v1;

use std::net::SocketAddr;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::error::Result;
use crate::tracing::prelude::*;

pub use v1::{AppState, Status};

/// Full router with all API versions mounted.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", v1::routes(state))
        .layer(TraceLayer::new_for_http())
}

/// Bind `listen` and serve until `running` is cancelled.
pub async fn serve(listen: SocketAddr, state: AppState, running: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(listen).await?;
    serve_on(listener, state, running).await
}

/// Serve on an already bound listener until `running` is cancelled.
pub async fn serve_on(
    listener: TcpListener,
    state: AppState,
    running: CancellationToken,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, "API server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { running.cancelled().await })
        .await?;
    trace!("API server stopped.");
    Ok(())
}
