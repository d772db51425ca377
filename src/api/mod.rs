//! Push-channel server
//!
//! A small Axum app exposing the viewer WebSocket plus a health probe.
//! All state a connection needs is the hub handle.

pub mod websocket;

use std::net::SocketAddr;

use axum::{routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::actors::hub::HubHandle;

/// Shared state for the push-channel routes
#[derive(Clone)]
pub struct ApiState {
    pub hub: HubHandle,
}

/// Spawn the push-channel server. Returns the bound address.
pub async fn spawn_push_server(bind_addr: SocketAddr, hub: HubHandle) -> anyhow::Result<SocketAddr> {
    info!("starting push server on {bind_addr}");

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/ws", get(websocket::websocket_handler))
        .with_state(ApiState { hub })
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    let addr = listener.local_addr()?;

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("push server failed: {e}");
        }
    });

    info!("push server listening on {addr}");
    Ok(addr)
}
