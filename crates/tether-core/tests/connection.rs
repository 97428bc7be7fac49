//! Connection lifecycle and session ownership.

mod common;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use common::*;
use futures::future::BoxFuture;
use tether_core::transport::mem::{self, MemSocket};
use tether_core::{
    Connection, ConnectionStatus, Handler, HandlerError, Message, Payload, PooledBuf, Reply,
    Request, Server, ServerConfig, SessionError, SessionInfo, Socket, SocketError,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_close_closes_socket_once() {
    let (server, state) = server(ServerConfig::default());
    let (conn, client) = connect(&server).await;

    let closers: Vec<_> = (0..32)
        .map(|_| {
            let conn = conn.clone();
            tokio::spawn(async move { conn.close() })
        })
        .collect();
    for closer in closers {
        closer.await.unwrap();
    }

    assert_eq!(conn.status(), ConnectionStatus::Inactive);
    eventually(|| state.disconnected.load(Ordering::SeqCst) == 1).await;
    assert_eq!(client.server_close_calls(), 1);
    assert_eq!(server.connection_count(), 0);
    assert!(!conn.register_task(), "inactive connections take no new tasks");
}

#[tokio::test]
async fn close_waits_for_running_handlers() {
    let (server, state) = server(ServerConfig::default());
    let (conn, mut client) = connect(&server).await;

    send_request(&client, 1, "wait", Payload::utf8("late")).await;
    eventually(|| conn.in_flight_tasks() == 1).await;

    conn.close();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(client.server_close_calls(), 0, "socket closed under a running handler");
    assert_eq!(state.disconnected.load(Ordering::SeqCst), 0);

    state.release(1);
    assert_eq!(reply_to(&mut client, 1).await, Reply::Success(Payload::utf8("late")));
    eventually(|| client.server_close_calls() == 1).await;
    assert_eq!(state.disconnected.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn peer_disconnect_finalizes_connection() {
    let (server, state) = server(ServerConfig::default());
    let (_conn, mut client) = connect(&server).await;
    assert_eq!(state.connected.load(Ordering::SeqCst), 1);
    assert_eq!(server.connection_count(), 1);

    client.disconnect();
    eventually(|| server.connection_count() == 0).await;
    assert_eq!(state.disconnected.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn create_session_notifies_then_installs() {
    let (server, _state) = server(ServerConfig::default());
    let (conn, mut client) = connect(&server).await;

    let session = conn
        .create_session(SessionInfo::new().with("user", "ada"))
        .await
        .unwrap();
    match next_message(&mut client).await {
        Message::SessionCreated(record) => {
            assert_eq!(record.key, session.key());
            assert_eq!(record.info, session.info());
        }
        other => panic!("expected session created, got {other:?}"),
    }
    assert_eq!(conn.session().unwrap().key(), session.key());
    assert_eq!(server.session_connections_num(session.key()), Some(1));
    assert_eq!(server.active_sessions_num(), 1);

    let again = conn.create_session(SessionInfo::new()).await;
    assert!(matches!(again, Err(SessionError::SessionAlreadyActive)));
}

#[tokio::test]
async fn create_session_rejected_when_disabled() {
    let (server, _state) = server(ServerConfig::default().with_sessions_enabled(false));
    let (conn, _client) = connect(&server).await;
    let result = conn.create_session(SessionInfo::new()).await;
    assert!(matches!(result, Err(SessionError::SessionsDisabled)));
    assert!(!conn.has_session());
}

#[tokio::test]
async fn create_session_rejected_when_disconnected() {
    let (server, _state) = server(ServerConfig::default());
    let (conn, client) = connect(&server).await;
    drop(client);
    let result = conn.create_session(SessionInfo::new()).await;
    assert!(matches!(result, Err(SessionError::Disconnected)));
    assert_eq!(server.active_sessions_num(), 0);
}

#[tokio::test]
async fn close_session_twice_notifies_once() {
    let (server, _state) = server(ServerConfig::default());
    let (conn, mut client) = connect(&server).await;
    let session = conn.create_session(SessionInfo::new()).await.unwrap();
    assert!(matches!(next_message(&mut client).await, Message::SessionCreated(_)));

    assert!(conn.close_session().await.unwrap());
    assert!(!conn.close_session().await.unwrap());
    assert!(!conn.has_session());
    assert_eq!(server.session_connections_num(session.key()), None);

    assert_eq!(next_message(&mut client).await, Message::SessionClosed);
    // The only frame left is the reply below; a second SessionClosed would
    // arrive first.
    assert_eq!(
        request(&mut client, 1, "echo", Payload::utf8("after")).await,
        Reply::Success(Payload::utf8("after"))
    );
}

#[tokio::test]
async fn closing_connection_releases_its_session() {
    let (server, _state) = server(ServerConfig::default());
    let (conn, _client) = connect(&server).await;
    let session = conn.create_session(SessionInfo::new()).await.unwrap();
    let key = session.key().to_owned();

    conn.close();
    assert_eq!(server.session_connections_num(&key), None);
    assert_eq!(server.active_sessions_num(), 0);
}

#[tokio::test]
async fn server_sends_signals() {
    let (server, _state) = server(ServerConfig::default());
    let (conn, mut client) = connect(&server).await;

    conn.signal("tick", Payload::binary(&b"\x01"[..])).await.unwrap();
    assert_eq!(
        next_message(&mut client).await,
        Message::Signal {
            name: "tick".into(),
            payload: Payload::binary(&b"\x01"[..]),
        }
    );

    conn.close();
    assert!(conn.signal("tick", Payload::empty()).await.is_err());
}

/// Socket whose writes can be made to fail while it still reports itself
/// connected.
#[derive(Clone)]
struct FlakySocket {
    inner: MemSocket,
    fail_writes: Arc<AtomicBool>,
}

impl Socket for FlakySocket {
    fn read(
        &self,
        buf: PooledBuf,
        timeout: Duration,
    ) -> impl Future<Output = Result<PooledBuf, SocketError>> + Send {
        self.inner.read(buf, timeout)
    }

    async fn write(&self, frame: Bytes) -> Result<(), SocketError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SocketError::Io(std::io::Error::other("broken pipe")));
        }
        self.inner.write(frame).await
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr()
    }

    fn close(&self) {
        self.inner.close();
    }
}

struct NoopHandler;

impl Handler<FlakySocket> for NoopHandler {
    fn on_request<'a>(
        &'a self,
        _conn: &'a Arc<Connection<FlakySocket>>,
        request: Request,
    ) -> BoxFuture<'a, Result<Payload, HandlerError>> {
        Box::pin(async move { Ok(request.payload) })
    }
}

#[tokio::test]
async fn failed_creation_notice_installs_nothing() {
    let server = Server::new(ServerConfig::default(), NoopHandler);
    let (socket, mut client) = mem::pair();
    let fail_writes = Arc::new(AtomicBool::new(false));
    let conn = server
        .accept(FlakySocket {
            inner: socket,
            fail_writes: fail_writes.clone(),
        })
        .unwrap();
    assert!(matches!(next_message(&mut client).await, Message::Configuration(_)));

    fail_writes.store(true, Ordering::SeqCst);
    let result = conn.create_session(SessionInfo::new()).await;
    assert!(matches!(result, Err(SessionError::Notify(_))));
    assert!(!conn.has_session());
    assert_eq!(server.active_sessions_num(), 0);
}

#[tokio::test]
async fn failed_close_notice_still_closes_session() {
    let server = Server::new(ServerConfig::default(), NoopHandler);
    let (socket, mut client) = mem::pair();
    let fail_writes = Arc::new(AtomicBool::new(false));
    let conn = server
        .accept(FlakySocket {
            inner: socket,
            fail_writes: fail_writes.clone(),
        })
        .unwrap();
    assert!(matches!(next_message(&mut client).await, Message::Configuration(_)));
    let session = conn.create_session(SessionInfo::new()).await.unwrap();

    fail_writes.store(true, Ordering::SeqCst);
    let result = conn.close_session().await;
    assert!(matches!(result, Err(SessionError::Notify(_))));
    assert!(!conn.has_session());
    assert_eq!(server.session_connections_num(session.key()), None);
}
