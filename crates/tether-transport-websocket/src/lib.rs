//! tether-transport-websocket: WebSocket transport for tether servers.
//!
//! Provides [`AxumSocket`], a [`Socket`](tether_core::Socket) over an
//! upgraded axum WebSocket, and an axum [`Router`] that upgrades incoming
//! requests and hands the sockets to a [`Server`].
//!
//! The entry route also answers the out-of-band metadata query: a request
//! with the HTTP method [`METADATA_METHOD`] gets the server's
//! [`ServerMetadata`](tether_core::ServerMetadata) as JSON.

use std::net::SocketAddr;

use axum::Json;
use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tether_core::{METADATA_METHOD, Server};
use tokio::net::TcpListener;

mod socket;

pub use socket::AxumSocket;

/// A server over WebSocket connections.
pub type WebSocketServer = Server<AxumSocket>;

/// Router serving `server` at `/`.
pub fn router(server: WebSocketServer) -> Router {
    router_at("/", server)
}

/// Router serving `server` at `path`.
///
/// `GET` upgrades to a WebSocket; [`METADATA_METHOD`] returns metadata;
/// anything else is `405 Method Not Allowed`. Upgrades are refused with
/// `503 Service Unavailable` once shutdown has begun.
pub fn router_at(path: &str, server: WebSocketServer) -> Router {
    Router::new()
        .route(path, get(upgrade).fallback(metadata_or_405))
        .with_state(server)
}

async fn upgrade(
    State(server): State<WebSocketServer>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    ws: WebSocketUpgrade,
) -> Response {
    if !server.accepts_connections() {
        tracing::debug!("refusing websocket upgrade during shutdown");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let remote_addr = connect_info.map(|ConnectInfo(addr)| addr);
    ws.on_upgrade(move |ws| async move {
        let socket = AxumSocket::new(ws, remote_addr);
        if let Err(e) = server.serve(socket).await {
            tracing::debug!(?remote_addr, error = %e, "websocket connection ended with error");
        }
    })
}

async fn metadata_or_405(State(server): State<WebSocketServer>, method: Method) -> Response {
    if method.as_str() == METADATA_METHOD {
        Json(server.metadata()).into_response()
    } else {
        StatusCode::METHOD_NOT_ALLOWED.into_response()
    }
}

/// Accept connections on `listener` until `server` has shut down.
pub async fn serve(listener: TcpListener, server: WebSocketServer) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "websocket server listening");
    }
    let app = router(server.clone());
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { server.stopped().await })
    .await
}
