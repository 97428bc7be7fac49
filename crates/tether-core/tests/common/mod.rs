//! Shared helpers for tether-core integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use tether_core::transport::mem::{self, MemClient, MemSocket};
use tether_core::{
    Connection, CorrelationId, Handler, HandlerError, Message, Payload, Reply, Request, Server,
    ServerConfig, SessionInfo, Signal,
};
use tokio::sync::Semaphore;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Observable state of [`TestHandler`].
pub struct TestState {
    /// Requests named `wait` block until a permit is added here.
    pub gate: Semaphore,
    pub connected: AtomicUsize,
    pub disconnected: AtomicUsize,
    pub running: AtomicUsize,
    pub max_running: AtomicUsize,
    pub signals: AtomicUsize,
}

impl Default for TestState {
    fn default() -> Self {
        Self {
            gate: Semaphore::new(0),
            connected: AtomicUsize::new(0),
            disconnected: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            signals: AtomicUsize::new(0),
        }
    }
}

impl TestState {
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }
}

/// Handler with one request per behaviour under test.
pub struct TestHandler {
    pub state: Arc<TestState>,
}

impl Handler<MemSocket> for TestHandler {
    fn on_client_connected(&self, _conn: &Arc<Connection<MemSocket>>) {
        self.state.connected.fetch_add(1, Ordering::SeqCst);
    }

    fn on_client_disconnected(&self, _conn: &Connection<MemSocket>) {
        self.state.disconnected.fetch_add(1, Ordering::SeqCst);
    }

    fn on_signal<'a>(
        &'a self,
        conn: &'a Arc<Connection<MemSocket>>,
        signal: Signal,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.state.signals.fetch_add(1, Ordering::SeqCst);
            if signal.name == "ping" {
                let _ = conn.signal("pong", signal.payload).await;
            }
        })
    }

    fn on_request<'a>(
        &'a self,
        conn: &'a Arc<Connection<MemSocket>>,
        request: Request,
    ) -> BoxFuture<'a, Result<Payload, HandlerError>> {
        Box::pin(async move {
            match request.name.as_str() {
                "echo" => Ok(request.payload),
                "empty" => Ok(Payload::empty()),
                "fail" => Err(HandlerError::domain("E_FAIL", "it failed")),
                "boom" => Err(HandlerError::internal("database password is hunter2")),
                "panic" => panic!("handler exploded"),
                "login" => {
                    let user = request.payload.as_str().unwrap_or("anonymous").to_owned();
                    let session = conn
                        .create_session(SessionInfo::new().with("user", user))
                        .await?;
                    Ok(Payload::utf8(session.key()))
                }
                "whoami" => Ok(match conn.session() {
                    Some(session) => Payload::utf8(session.key()),
                    None => Payload::empty(),
                }),
                "logout" => {
                    conn.close_session().await?;
                    Ok(Payload::empty())
                }
                "wait" => {
                    let permit = self
                        .state
                        .gate
                        .acquire()
                        .await
                        .map_err(HandlerError::internal)?;
                    permit.forget();
                    Ok(request.payload)
                }
                "track" => {
                    let now = self.state.running.fetch_add(1, Ordering::SeqCst) + 1;
                    self.state.max_running.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    self.state.running.fetch_sub(1, Ordering::SeqCst);
                    Ok(Payload::empty())
                }
                other => Err(HandlerError::domain("NOT_FOUND", format!("no request {other}"))),
            }
        })
    }
}

static INIT: Once = Once::new();

/// Route server logs to the test writer. Filter with `RUST_LOG`.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn server(config: ServerConfig) -> (Server<MemSocket>, Arc<TestState>) {
    init_tracing();
    let state = Arc::new(TestState::default());
    let server = Server::new(
        config,
        TestHandler {
            state: state.clone(),
        },
    );
    (server, state)
}

/// Accept a fresh in-memory connection and consume its configuration frame.
pub async fn connect(server: &Server<MemSocket>) -> (Arc<Connection<MemSocket>>, MemClient) {
    let (socket, mut client) = mem::pair();
    let conn = server.accept(socket).expect("server accepts");
    match next_message(&mut client).await {
        Message::Configuration(_) => {}
        other => panic!("expected configuration frame, got {other:?}"),
    }
    (conn, client)
}

pub async fn next_message(client: &mut MemClient) -> Message {
    tokio::time::timeout(TIMEOUT, client.recv_message())
        .await
        .expect("timed out waiting for a frame")
        .expect("server closed the connection")
}

pub async fn send_request(client: &MemClient, id: u64, name: &str, payload: Payload) {
    client
        .send_message(&Message::Request {
            id: CorrelationId::from_u64(id),
            name: name.to_owned(),
            payload,
        })
        .await
        .expect("send request");
}

/// Wait for the reply to `id`, skipping any other frames.
pub async fn reply_to(client: &mut MemClient, id: u64) -> Reply {
    let id = CorrelationId::from_u64(id);
    loop {
        if let Message::Reply { id: got, reply } = next_message(client).await {
            if got == id {
                return reply;
            }
        }
    }
}

pub async fn request(client: &mut MemClient, id: u64, name: &str, payload: Payload) -> Reply {
    send_request(client, id, name, payload).await;
    reply_to(client, id).await
}

/// Poll `cond` until it holds or the test timeout passes.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "condition never held");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
