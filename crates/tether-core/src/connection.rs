//! Per-socket connection state.
//!
//! A connection is `Active` until closed, then `Inactive` for good. Closing
//! never interrupts running handlers: the socket is closed, and the session
//! deregistered, once the last in-flight task finishes.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::registry::SessionOwner;
use crate::server::ServerShared;
use crate::session::key_prefix;
use crate::{
    ConnectionOptions, Message, Payload, SendError, Session, SessionError, SessionInfo, Socket,
    SocketError,
};

/// Server-assigned connection identifier, unique for the server's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state. `Inactive` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Active,
    Inactive,
}

#[derive(Debug)]
struct TaskState {
    status: ConnectionStatus,
    in_flight: usize,
    finalized: bool,
}

/// One client connection.
pub struct Connection<S: Socket> {
    id: ConnectionId,
    socket: S,
    shared: Arc<ServerShared<S>>,
    tasks: Mutex<TaskState>,
    session: RwLock<Option<Arc<Session>>>,
    /// Serializes create/restore/close so check-then-install is atomic.
    session_op: tokio::sync::Mutex<()>,
    concurrency: usize,
    slots: Option<Arc<Semaphore>>,
    closing: CancellationToken,
}

impl<S: Socket> fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tasks = self.tasks.lock();
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("status", &tasks.status)
            .field("in_flight", &tasks.in_flight)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

impl<S: Socket> Connection<S> {
    pub(crate) fn new(
        id: ConnectionId,
        socket: S,
        shared: Arc<ServerShared<S>>,
        options: ConnectionOptions,
    ) -> Self {
        let concurrency = options.concurrency.min(Semaphore::MAX_PERMITS);
        if concurrency != options.concurrency {
            tracing::warn!(
                connection_id = id.0,
                requested = options.concurrency,
                limit = concurrency,
                "handler concurrency clamped to the semaphore maximum"
            );
        }
        let slots = (concurrency > 1).then(|| Arc::new(Semaphore::new(concurrency)));
        Self {
            id,
            socket,
            shared,
            tasks: Mutex::new(TaskState {
                status: ConnectionStatus::Active,
                in_flight: 0,
                finalized: false,
            }),
            session: RwLock::new(None),
            session_op: tokio::sync::Mutex::new(()),
            concurrency,
            slots,
            closing: CancellationToken::new(),
        }
    }

    /// Server-assigned identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Peer address, when the transport knows it.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.socket.remote_addr()
    }

    /// The underlying socket.
    pub fn socket(&self) -> &S {
        &self.socket
    }

    pub(crate) fn shared(&self) -> &Arc<ServerShared<S>> {
        &self.shared
    }

    /// Current lifecycle state.
    pub fn status(&self) -> ConnectionStatus {
        self.tasks.lock().status
    }

    /// Shorthand for `status() == Active`.
    pub fn is_active(&self) -> bool {
        self.status() == ConnectionStatus::Active
    }

    /// Tasks registered and not yet finished.
    pub fn in_flight_tasks(&self) -> usize {
        self.tasks.lock().in_flight
    }

    /// Handler concurrency: 0 unlimited, 1 serialized, N a counting gate.
    /// Values above [`Semaphore::MAX_PERMITS`] are clamped to it.
    pub fn concurrency_limit(&self) -> usize {
        self.concurrency
    }

    /// Count a task as running on this connection. Returns `false` once the
    /// connection is inactive.
    pub fn register_task(&self) -> bool {
        let mut tasks = self.tasks.lock();
        if tasks.status == ConnectionStatus::Inactive {
            return false;
        }
        tasks.in_flight += 1;
        true
    }

    /// Finish a task started with [`register_task`](Self::register_task).
    /// The last task of a closed connection finalizes it.
    pub fn deregister_task(&self) {
        let finalize = {
            let mut tasks = self.tasks.lock();
            if tasks.in_flight == 0 {
                tracing::error!(connection_id = self.id.0, "task deregistered twice");
                return;
            }
            tasks.in_flight -= 1;
            Self::take_finalize(&mut tasks)
        };
        if finalize {
            self.finalize();
        }
    }

    /// Register a task that deregisters itself when dropped.
    pub(crate) fn task_guard(self: &Arc<Self>) -> Option<TaskGuard<S>> {
        self.register_task().then(|| TaskGuard {
            conn: Arc::clone(self),
        })
    }

    /// Close the connection. Idempotent.
    ///
    /// If handlers are still running, the socket is closed when the last one
    /// finishes.
    pub fn close(&self) {
        let finalize = {
            let mut tasks = self.tasks.lock();
            if tasks.status == ConnectionStatus::Inactive {
                return;
            }
            tasks.status = ConnectionStatus::Inactive;
            tracing::debug!(
                connection_id = self.id.0,
                in_flight = tasks.in_flight,
                "closing connection"
            );
            Self::take_finalize(&mut tasks)
        };
        self.closing.cancel();
        if finalize {
            self.finalize();
        }
    }

    fn take_finalize(tasks: &mut TaskState) -> bool {
        if tasks.status == ConnectionStatus::Inactive && tasks.in_flight == 0 && !tasks.finalized {
            tasks.finalized = true;
            true
        } else {
            false
        }
    }

    fn finalize(&self) {
        self.socket.close();
        let session = self.session.write().take();
        if let Some(session) = session {
            let remaining = self.shared.registry.deregister(session.key(), self.id);
            tracing::debug!(
                connection_id = self.id.0,
                session = key_prefix(session.key()),
                ?remaining,
                "released session on disconnect"
            );
        }
        self.shared.forget_connection(self.id);
        tracing::debug!(connection_id = self.id.0, "connection finalized");
        self.shared.handler.on_client_disconnected(self);
    }

    /// Wait for a handler slot. Returns `None` when the connection has no
    /// counting gate, and fails if the connection closes while waiting.
    pub(crate) async fn acquire_slot(&self) -> Result<Option<OwnedSemaphorePermit>, SocketError> {
        let Some(slots) = &self.slots else {
            return Ok(None);
        };
        tokio::select! {
            _ = self.closing.cancelled() => Err(SocketError::Closed),
            permit = Arc::clone(slots).acquire_owned() => {
                permit.map(Some).map_err(|_| SocketError::Closed)
            }
        }
    }

    pub(crate) async fn send(&self, message: &Message) -> Result<(), SendError> {
        let frame = message.encode()?;
        self.socket.write(frame).await?;
        Ok(())
    }

    /// Send a signal to the client.
    pub async fn signal(&self, name: impl Into<String>, payload: Payload) -> Result<(), SendError> {
        if !self.is_active() {
            return Err(SocketError::Closed.into());
        }
        self.send(&Message::Signal {
            name: name.into(),
            payload,
        })
        .await
    }

    /// The session this connection owns, if any.
    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.read().clone()
    }

    /// Whether this connection currently owns a session.
    pub fn has_session(&self) -> bool {
        self.session.read().is_some()
    }

    /// Create a session, notify the client and install it on this connection.
    ///
    /// Nothing is installed if the client cannot be notified. A failing
    /// [`SessionStore::on_session_created`](crate::SessionStore::on_session_created)
    /// hook is logged and ignored.
    pub async fn create_session(self: &Arc<Self>, info: SessionInfo) -> Result<Arc<Session>, SessionError> {
        if !self.shared.config.sessions_enabled {
            return Err(SessionError::SessionsDisabled);
        }
        let _task = self.task_guard().ok_or(SessionError::Disconnected)?;
        if !self.socket.is_connected() {
            return Err(SessionError::Disconnected);
        }
        let _op = self.session_op.lock().await;
        if self.has_session() {
            return Err(SessionError::SessionAlreadyActive);
        }

        let session = Arc::new(Session::new(self.shared.keys.generate(), info));
        self.send(&Message::SessionCreated(session.to_record()))
            .await?;
        self.shared.registry.register(session.key(), self)?;
        *self.session.write() = Some(Arc::clone(&session));

        if let Err(e) = self.shared.store.on_session_created(&session).await {
            tracing::warn!(
                connection_id = self.id.0,
                session = key_prefix(session.key()),
                error = %e,
                "session created but storage hook failed"
            );
        }
        tracing::debug!(
            connection_id = self.id.0,
            session = key_prefix(session.key()),
            "session created"
        );
        Ok(session)
    }

    /// Restore a stored session onto this connection.
    pub(crate) async fn restore_session(self: &Arc<Self>, key: &str) -> Result<Arc<Session>, SessionError> {
        if !self.shared.config.sessions_enabled {
            return Err(SessionError::SessionsDisabled);
        }
        let _task = self.task_guard().ok_or(SessionError::Disconnected)?;
        let _op = self.session_op.lock().await;
        if self.has_session() {
            return Err(SessionError::SessionAlreadyActive);
        }
        let registry = &self.shared.registry;
        if registry.is_full(key) {
            return Err(SessionError::MaxConnectionsReached {
                max: registry.max_connections(),
            });
        }

        let record = self
            .shared
            .store
            .on_session_lookup(key)
            .await?
            .ok_or(SessionError::NotFound)?;
        let session = Arc::new(Session::restored(record));
        registry.register(session.key(), self)?;
        *self.session.write() = Some(Arc::clone(&session));

        tracing::debug!(
            connection_id = self.id.0,
            session = key_prefix(session.key()),
            "session restored"
        );
        Ok(session)
    }

    /// Close this connection's session and notify the client. Returns
    /// `false` when there was no session to close.
    ///
    /// If the client cannot be notified the session stays closed and the
    /// error is returned.
    pub async fn close_session(&self) -> Result<bool, SessionError> {
        let _op = self.session_op.lock().await;
        let session = self.session.write().take();
        let Some(session) = session else {
            return Ok(false);
        };
        let remaining = self.shared.registry.deregister(session.key(), self.id);
        if let Err(e) = self.shared.store.on_session_closed(session.key()).await {
            tracing::warn!(
                connection_id = self.id.0,
                session = key_prefix(session.key()),
                error = %e,
                "session storage close hook failed"
            );
        }

        if let Err(e) = self.send(&Message::SessionClosed).await {
            tracing::error!(
                connection_id = self.id.0,
                session = key_prefix(session.key()),
                error = %e,
                "client was not told its session closed"
            );
            return Err(e.into());
        }
        tracing::debug!(
            connection_id = self.id.0,
            session = key_prefix(session.key()),
            ?remaining,
            "session closed"
        );
        Ok(true)
    }
}

impl<S: Socket> SessionOwner for Connection<S> {
    fn connection_id(&self) -> ConnectionId {
        self.id
    }
}

/// Keeps a task registered on a connection until dropped.
pub(crate) struct TaskGuard<S: Socket> {
    conn: Arc<Connection<S>>,
}

impl<S: Socket> Drop for TaskGuard<S> {
    fn drop(&mut self) {
        self.conn.deregister_task();
    }
}
