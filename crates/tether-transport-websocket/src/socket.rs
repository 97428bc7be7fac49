use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tether_core::{PooledBuf, Socket, SocketError};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

/// [`Socket`] over an upgraded axum WebSocket.
///
/// Binary and text messages are both delivered as frames; ping and pong are
/// answered by axum and skipped here.
#[derive(Clone)]
pub struct AxumSocket {
    inner: Arc<Inner>,
}

struct Inner {
    /// Write half (async mutex for holding across awaits).
    sink: AsyncMutex<SplitSink<WebSocket, Message>>,
    /// Read half.
    stream: AsyncMutex<SplitStream<WebSocket>>,
    closing: CancellationToken,
    closed: AtomicBool,
    /// Set once the peer sent a close frame or the stream ended.
    peer_gone: AtomicBool,
    remote_addr: Option<SocketAddr>,
}

// axum's WebSocket is not Sync, but the mutexes around each half are.
static_assertions::assert_impl_all!(AxumSocket: Send, Sync);

impl AxumSocket {
    pub fn new(ws: WebSocket, remote_addr: Option<SocketAddr>) -> Self {
        let (sink, stream) = ws.split();
        Self {
            inner: Arc::new(Inner {
                sink: AsyncMutex::new(sink),
                stream: AsyncMutex::new(stream),
                closing: CancellationToken::new(),
                closed: AtomicBool::new(false),
                peer_gone: AtomicBool::new(false),
                remote_addr,
            }),
        }
    }

    fn peer_closed(&self, err: SocketError) -> SocketError {
        self.inner.peer_gone.store(true, Ordering::Release);
        err
    }

    async fn next_frame(&self, buf: PooledBuf) -> Result<PooledBuf, SocketError> {
        let mut stream = self.inner.stream.lock().await;
        loop {
            let Some(message) = stream.next().await else {
                return Err(self.peer_closed(SocketError::Abnormal(
                    "connection dropped without a close frame".into(),
                )));
            };
            let message = message
                .map_err(|e| self.peer_closed(SocketError::Abnormal(e.to_string())))?;
            match message {
                Message::Binary(data) => return Ok(buf.read_from(&mut &data[..])?),
                Message::Text(text) => return Ok(buf.read_from(&mut text.as_bytes())?),
                Message::Close(frame) => return Err(self.peer_closed(close_error(frame))),
                Message::Ping(_) | Message::Pong(_) => continue,
            }
        }
    }
}

fn close_error(frame: Option<CloseFrame<'static>>) -> SocketError {
    match frame {
        Some(frame) if frame.code != close_code::NORMAL && frame.code != close_code::AWAY => {
            SocketError::Abnormal(format!("closed with code {}: {}", frame.code, frame.reason))
        }
        _ => SocketError::Closed,
    }
}

impl Socket for AxumSocket {
    async fn read(&self, buf: PooledBuf, timeout: Duration) -> Result<PooledBuf, SocketError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(SocketError::Closed);
        }
        tokio::select! {
            _ = self.inner.closing.cancelled() => Err(SocketError::Closed),
            next = tokio::time::timeout(timeout, self.next_frame(buf)) => {
                next.map_err(|_| SocketError::Timeout(timeout))?
            }
        }
    }

    async fn write(&self, frame: Bytes) -> Result<(), SocketError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(SocketError::Closed);
        }
        let mut sink = self.inner.sink.lock().await;
        sink.send(Message::Binary(frame.to_vec()))
            .await
            .map_err(|e| SocketError::Io(std::io::Error::other(format!("websocket send: {e}"))))
    }

    fn is_connected(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire) && !self.inner.peer_gone.load(Ordering::Acquire)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr
    }

    fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.closing.cancel();

        // The close handshake needs the sink, which a writer may hold.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        runtime.spawn(async move {
            let mut sink = inner.sink.lock().await;
            if !inner.peer_gone.load(Ordering::Acquire) {
                let _ = sink.send(Message::Close(None)).await;
            }
            let _ = sink.close().await;
        });
    }
}
