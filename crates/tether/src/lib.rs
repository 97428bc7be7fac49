//! tether: request/reply and signal messaging server with resumable
//! sessions.
//!
//! # Quick Start
//!
//! Implement a [`Handler`] and serve it over WebSockets:
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use tether::prelude::*;
//! use tether::websocket::{AxumSocket, WebSocketServer};
//!
//! struct Greeter;
//!
//! impl Handler<AxumSocket> for Greeter {
//!     fn on_request<'a>(
//!         &'a self,
//!         conn: &'a Arc<Connection<AxumSocket>>,
//!         request: Request,
//!     ) -> BoxFuture<'a, Result<Payload, HandlerError>> {
//!         Box::pin(async move {
//!             match request.name.as_str() {
//!                 "hello" => Ok(Payload::utf8("hi")),
//!                 "login" => {
//!                     let session = conn.create_session(SessionInfo::new()).await?;
//!                     Ok(Payload::utf8(session.key()))
//!                 }
//!                 other => Err(HandlerError::domain("NOT_FOUND", other)),
//!             }
//!         })
//!     }
//! }
//!
//! tether::init_tracing();
//! let server = WebSocketServer::new(ServerConfig::from_env(), Greeter);
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//! tokio::spawn(tether::websocket::serve(listener, server.clone()));
//!
//! tokio::signal::ctrl_c().await?;
//! server.shutdown().await;
//! ```
//!
//! # Sessions
//!
//! A handler creates a session with [`Connection::create_session`]; the
//! client receives the key in a session-created frame and can later restore
//! it on another connection. Storage is pluggable through
//! [`SessionStore`] via [`ServerBuilder::session_store`].

pub use tether_core::*;

/// WebSocket transport.
pub use tether_transport_websocket as websocket;

mod tracing_setup;

pub use tracing_setup::{init_tracing, init_tracing_with_default};

/// Prelude for handler implementations.
///
/// ```ignore
/// use tether::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        BoxFuture, Connection, Handler, HandlerError, Payload, Request, Server, ServerConfig,
        SessionInfo, Signal, Socket,
    };
}
