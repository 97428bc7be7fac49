//! In-process socket pair over tokio channels.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::Socket;
use crate::{Message, PooledBuf, SendError, SocketError};

const CHANNEL_CAPACITY: usize = 1024;

/// Server side of an in-memory connection.
#[derive(Clone, Debug)]
pub struct MemSocket {
    inner: Arc<MemInner>,
}

#[derive(Debug)]
struct MemInner {
    inbound: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    outbound: Mutex<Option<mpsc::Sender<Bytes>>>,
    closing: CancellationToken,
    close_calls: AtomicUsize,
    remote_addr: Option<SocketAddr>,
}

/// Client side of an in-memory connection.
#[derive(Debug)]
pub struct MemClient {
    tx: Option<mpsc::Sender<Bytes>>,
    rx: mpsc::Receiver<Bytes>,
    server: Arc<MemInner>,
}

/// Create a connected socket/client pair.
pub fn pair() -> (MemSocket, MemClient) {
    pair_with_addr(None)
}

/// Like [`pair`], with a remote address reported by the socket.
pub fn pair_with_addr(remote_addr: Option<SocketAddr>) -> (MemSocket, MemClient) {
    let (client_tx, server_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (server_tx, client_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let inner = Arc::new(MemInner {
        inbound: tokio::sync::Mutex::new(server_rx),
        outbound: Mutex::new(Some(server_tx)),
        closing: CancellationToken::new(),
        close_calls: AtomicUsize::new(0),
        remote_addr,
    });
    (
        MemSocket {
            inner: inner.clone(),
        },
        MemClient {
            tx: Some(client_tx),
            rx: client_rx,
            server: inner,
        },
    )
}

impl MemSocket {
    /// How many times `close` has been called.
    pub fn close_calls(&self) -> usize {
        self.inner.close_calls.load(Ordering::Acquire)
    }
}

impl Socket for MemSocket {
    async fn read(&self, buf: PooledBuf, timeout: Duration) -> Result<PooledBuf, SocketError> {
        let closing = &self.inner.closing;
        let mut inbound = tokio::select! {
            _ = closing.cancelled() => return Err(SocketError::Closed),
            guard = self.inner.inbound.lock() => guard,
        };
        let next = tokio::select! {
            _ = closing.cancelled() => return Err(SocketError::Closed),
            next = tokio::time::timeout(timeout, inbound.recv()) => next,
        };
        match next {
            Err(_) => Err(SocketError::Timeout(timeout)),
            Ok(None) => Err(SocketError::Closed),
            Ok(Some(frame)) => Ok(buf.read_from(&mut &frame[..])?),
        }
    }

    async fn write(&self, frame: Bytes) -> Result<(), SocketError> {
        let tx = self.inner.outbound.lock().clone();
        let tx = tx.ok_or(SocketError::Closed)?;
        tx.send(frame).await.map_err(|_| SocketError::Closed)
    }

    fn is_connected(&self) -> bool {
        !self.inner.closing.is_cancelled()
            && self
                .inner
                .outbound
                .lock()
                .as_ref()
                .is_some_and(|tx| !tx.is_closed())
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr
    }

    fn close(&self) {
        self.inner.close_calls.fetch_add(1, Ordering::AcqRel);
        self.inner.closing.cancel();
        self.inner.outbound.lock().take();
    }
}

impl MemClient {
    /// Send a raw frame.
    pub async fn send(&self, frame: impl Into<Bytes>) -> Result<(), SocketError> {
        let tx = self.tx.as_ref().ok_or(SocketError::Closed)?;
        tx.send(frame.into()).await.map_err(|_| SocketError::Closed)
    }

    pub async fn send_message(&self, message: &Message) -> Result<(), SendError> {
        self.send(message.encode()?).await?;
        Ok(())
    }

    /// Next raw frame from the server, or `None` once the server closed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Next frame the codec recognises. Undecodable frames are skipped.
    pub async fn recv_message(&mut self) -> Option<Message> {
        loop {
            let frame = self.recv().await?;
            match Message::decode(&frame) {
                Ok(Some(message)) => return Some(message),
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(?e, "mem client skipping malformed frame");
                    continue;
                }
            }
        }
    }

    /// Stop sending. The server's next read reports the socket closed.
    pub fn disconnect(&mut self) {
        self.tx = None;
    }

    /// How many times the server side has called `close`.
    pub fn server_close_calls(&self) -> usize {
        self.server.close_calls.load(Ordering::Acquire)
    }

    pub fn is_closed_by_server(&self) -> bool {
        self.server.closing.is_cancelled()
    }
}
