//! User-facing handler capability.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::{Connection, HandlerError, Payload, Socket};

/// A fire-and-forget frame from a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    pub name: String,
    pub payload: Payload,
}

/// A frame that must receive exactly one reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub name: String,
    pub payload: Payload,
}

/// Application callbacks invoked by the server.
///
/// Handlers for frames from the same connection may run concurrently, up to
/// the connection's concurrency limit. A panic in a handler is caught and
/// treated as an internal error.
pub trait Handler<S: Socket>: Send + Sync + 'static {
    /// Called once per connection, after the configuration frame was sent
    /// and before any client frame is read.
    fn on_client_connected(&self, _conn: &Arc<Connection<S>>) {}

    /// Called once per connection, after the socket has been closed.
    fn on_client_disconnected(&self, _conn: &Connection<S>) {}

    /// Handle a signal. No reply is sent.
    fn on_signal<'a>(&'a self, _conn: &'a Arc<Connection<S>>, _signal: Signal) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }

    /// Handle a request. `Ok` becomes a success reply, which may carry an
    /// empty payload.
    fn on_request<'a>(
        &'a self,
        conn: &'a Arc<Connection<S>>,
        request: Request,
    ) -> BoxFuture<'a, Result<Payload, HandlerError>>;
}
