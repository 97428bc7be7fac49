//! Socket transport capability.
//!
//! The core never parses transport framing. A [`Socket`] hands it one whole
//! frame per read and writes one whole frame per call. Implementations live
//! in transport crates; [`mem`] provides an in-process pair for tests.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;

use crate::{PooledBuf, SocketError};

pub mod mem;

/// One accepted client connection.
pub trait Socket: Send + Sync + 'static {
    /// Read the next frame into `buf`, waiting at most `timeout`.
    ///
    /// A frame larger than the buffer must be drained and reported as
    /// [`SocketError::Buffer`] overflow; the socket stays usable.
    fn read(
        &self,
        buf: PooledBuf,
        timeout: Duration,
    ) -> impl Future<Output = Result<PooledBuf, SocketError>> + Send;

    /// Write one complete frame. Concurrent writers are serialized.
    fn write(&self, frame: Bytes) -> impl Future<Output = Result<(), SocketError>> + Send;

    fn is_connected(&self) -> bool;

    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Close the socket. Must be safe to call from synchronous code.
    fn close(&self);
}
