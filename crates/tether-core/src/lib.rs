//! tether-core: connection and session coordination engine for tether
//! servers.
//!
//! This crate defines:
//! - The wire codec ([`Message`], [`Reply`], [`Payload`])
//! - Fixed-capacity inbound buffers ([`BufferPool`], [`PooledBuf`])
//! - Per-socket connection state ([`Connection`])
//! - The session registry ([`SessionRegistry`]) and session types ([`Session`], [`SessionInfo`])
//! - The graceful shutdown barrier ([`ShutdownCoordinator`])
//! - Capabilities the server consumes ([`Socket`], [`SessionStore`], [`KeyGenerator`], [`Handler`])
//! - The server itself ([`Server`])

#![forbid(unsafe_code)]

mod buffer_pool;
mod config;
mod connection;
mod dispatcher;
mod error;
mod frame;
mod handler;
mod handshake;
mod registry;
mod server;
mod session;
mod shutdown;
mod storage;
pub mod transport;

pub use buffer_pool::*;
pub use config::*;
pub use connection::{Connection, ConnectionId, ConnectionStatus};
pub use dispatcher::SESSION_ALREADY_ACTIVE;
pub use error::*;
pub use frame::*;
pub use handler::*;
pub use handshake::*;
pub use registry::*;
pub use server::{Server, ServerBuilder};
pub use session::{InfoValue, KeyGenerator, RandomKeyGenerator, Session, SessionInfo, SessionRecord};
pub use shutdown::*;
pub use storage::*;
pub use transport::Socket;

/// Boxed future returned by [`Handler`] and [`SessionStore`] methods.
pub use futures::future::BoxFuture;
