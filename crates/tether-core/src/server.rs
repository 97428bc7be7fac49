//! The server: owns every connection, the session registry and the
//! shutdown barrier for its lifetime.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::dispatch;
use crate::handshake::{PROTOCOL_VERSION, ServerConfiguration, ServerMetadata};
use crate::registry::SessionRegistry;
use crate::{
    BufferPool, Connection, ConnectionId, ConnectionOptions, Handler, KeyGenerator,
    MemorySessionStore, Message, RandomKeyGenerator, ServerConfig, ServerError, SessionStore,
    ShutdownCoordinator, Socket, SocketError,
};

/// State shared by the server handle and its connections.
pub(crate) struct ServerShared<S: Socket> {
    pub(crate) config: ServerConfig,
    pub(crate) configuration: ServerConfiguration,
    pub(crate) handler: Arc<dyn Handler<S>>,
    pub(crate) store: Arc<dyn SessionStore>,
    pub(crate) keys: Arc<dyn KeyGenerator>,
    pub(crate) registry: SessionRegistry<Connection<S>>,
    pub(crate) shutdown: Arc<ShutdownCoordinator>,
    pub(crate) pool: BufferPool,
    connections: Mutex<ConnectionList<S>>,
    next_connection_id: AtomicU64,
    stopped: CancellationToken,
}

struct ConnectionList<S: Socket> {
    /// Set once shutdown has closed every connection; nothing joins after.
    closed: bool,
    by_id: HashMap<ConnectionId, Arc<Connection<S>>>,
}

impl<S: Socket> ServerShared<S> {
    pub(crate) fn forget_connection(&self, id: ConnectionId) {
        self.connections.lock().by_id.remove(&id);
    }
}

/// Configures and builds a [`Server`].
pub struct ServerBuilder<S: Socket> {
    config: ServerConfig,
    store: Option<Arc<dyn SessionStore>>,
    keys: Option<Arc<dyn KeyGenerator>>,
    _socket: PhantomData<fn() -> S>,
}

impl<S: Socket> ServerBuilder<S> {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            store: None,
            keys: None,
            _socket: PhantomData,
        }
    }

    /// Session storage. Defaults to a [`MemorySessionStore`].
    #[must_use]
    pub fn session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Session key generator. Defaults to [`RandomKeyGenerator`].
    #[must_use]
    pub fn key_generator(mut self, keys: Arc<dyn KeyGenerator>) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn build(self, handler: impl Handler<S>) -> Server<S> {
        let config = self.config;
        let configuration = ServerConfiguration {
            protocol_version: PROTOCOL_VERSION.to_owned(),
            read_timeout: config.read_timeout,
            message_buffer_size: config.message_buffer_size,
        };
        let shared = ServerShared {
            configuration,
            handler: Arc::new(handler),
            store: self
                .store
                .unwrap_or_else(|| Arc::new(MemorySessionStore::new())),
            keys: self
                .keys
                .unwrap_or_else(|| Arc::new(RandomKeyGenerator::default())),
            registry: SessionRegistry::new(config.max_session_connections),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            pool: BufferPool::new(config.buffer_pool, config.message_buffer_size),
            connections: Mutex::new(ConnectionList {
                closed: false,
                by_id: HashMap::new(),
            }),
            next_connection_id: AtomicU64::new(1),
            stopped: CancellationToken::new(),
            config,
        };
        Server {
            shared: Arc::new(shared),
        }
    }
}

/// A messaging server over sockets of type `S`.
///
/// Cheap to clone; clones share the same state.
pub struct Server<S: Socket> {
    shared: Arc<ServerShared<S>>,
}

impl<S: Socket> Clone for Server<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: Socket> std::fmt::Debug for Server<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.shared.config)
            .field("connections", &self.connection_count())
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

impl<S: Socket> Server<S> {
    /// Server with default session storage and key generation.
    pub fn new(config: ServerConfig, handler: impl Handler<S>) -> Self {
        ServerBuilder::new(config).build(handler)
    }

    /// Builder for custom session storage or key generation.
    pub fn builder(config: ServerConfig) -> ServerBuilder<S> {
        ServerBuilder::new(config)
    }

    /// Configuration the server was built with.
    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// The configuration frame sent at the start of every connection.
    pub fn configuration(&self) -> &ServerConfiguration {
        &self.shared.configuration
    }

    /// Out-of-band metadata document.
    pub fn metadata(&self) -> ServerMetadata {
        ServerMetadata::from(&self.shared.configuration)
    }

    /// Pool backing inbound frame buffers.
    pub fn buffer_pool(&self) -> &BufferPool {
        &self.shared.pool
    }

    /// Admission and drain state for graceful shutdown.
    pub fn shutdown_coordinator(&self) -> &ShutdownCoordinator {
        &self.shared.shutdown
    }

    /// Take over `socket` and serve it on a spawned task.
    pub fn accept(&self, socket: S) -> Result<Arc<Connection<S>>, ServerError> {
        self.accept_with(socket, ConnectionOptions::from(&self.shared.config))
    }

    /// [`accept`](Self::accept) with per-connection options.
    pub fn accept_with(
        &self,
        socket: S,
        options: ConnectionOptions,
    ) -> Result<Arc<Connection<S>>, ServerError> {
        let conn = self.register(socket, options)?;
        tokio::spawn(run_connection(Arc::clone(&conn)));
        Ok(conn)
    }

    /// Serve `socket` on the current task until the connection ends.
    pub async fn serve(&self, socket: S) -> Result<(), ServerError> {
        self.serve_with(socket, ConnectionOptions::from(&self.shared.config))
            .await
    }

    /// [`serve`](Self::serve) with per-connection options.
    pub async fn serve_with(&self, socket: S, options: ConnectionOptions) -> Result<(), ServerError> {
        let conn = self.register(socket, options)?;
        run_connection(conn).await
    }

    fn register(&self, socket: S, options: ConnectionOptions) -> Result<Arc<Connection<S>>, ServerError> {
        let mut list = self.shared.connections.lock();
        if list.closed || self.shared.shutdown.is_shutting_down() {
            drop(list);
            socket.close();
            return Err(ServerError::ShuttingDown);
        }
        let id = ConnectionId(self.shared.next_connection_id.fetch_add(1, Ordering::Relaxed));
        let conn = Arc::new(Connection::new(
            id,
            socket,
            Arc::clone(&self.shared),
            options,
        ));
        list.by_id.insert(id, Arc::clone(&conn));
        drop(list);

        tracing::debug!(
            connection_id = id.0,
            remote_addr = ?conn.remote_addr(),
            concurrency = options.concurrency,
            "connection accepted"
        );
        Ok(conn)
    }

    /// Whether new connections are accepted. `false` once shutdown began.
    pub fn accepts_connections(&self) -> bool {
        !self.is_shutting_down()
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.is_shutting_down()
    }

    /// Stop admitting operations and connections without waiting.
    /// Returns `false` if shutdown had already begun.
    pub fn begin_shutdown(&self) -> bool {
        self.shared.shutdown.begin_shutdown()
    }

    /// Shut down gracefully: refuse new work, wait for every admitted
    /// operation to finish, then close all connections.
    ///
    /// Waits without a timeout; wrap in `tokio::time::timeout` to bound it.
    pub async fn shutdown(&self) {
        self.begin_shutdown();
        self.shared.shutdown.wait_drained().await;

        let conns: Vec<_> = {
            let mut list = self.shared.connections.lock();
            list.closed = true;
            list.by_id.values().cloned().collect()
        };
        for conn in &conns {
            conn.close();
        }
        self.shared.stopped.cancel();
        tracing::info!(closed = conns.len(), "server stopped");
    }

    /// Resolves once [`shutdown`](Self::shutdown) has completed.
    pub async fn stopped(&self) {
        self.shared.stopped.cancelled().await;
    }

    /// Close session `key` on every connection that owns it. Returns how
    /// many connections actually closed it.
    pub async fn close_session(&self, key: &str) -> usize {
        let owners = self.shared.registry.session_connections(key);
        if owners.is_empty() {
            if let Err(e) = self.shared.store.on_session_closed(key).await {
                tracing::warn!(error = %e, "session storage close hook failed");
            }
            return 0;
        }
        let mut closed = 0;
        for conn in owners {
            match conn.close_session().await {
                Ok(true) => closed += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(connection_id = conn.id().0, error = %e, "closing session"),
            }
        }
        closed
    }

    /// Number of sessions with at least one connection.
    pub fn active_sessions_num(&self) -> usize {
        self.shared.registry.active_sessions_num()
    }

    /// Connections owning `key`, or `None` if no connection owns it.
    pub fn session_connections_num(&self, key: &str) -> Option<usize> {
        self.shared.registry.session_connections_num(key)
    }

    /// Snapshot of the connections owning `key`.
    pub fn session_connections(&self, key: &str) -> Vec<Arc<Connection<S>>> {
        self.shared.registry.session_connections(key)
    }

    /// Number of connections not yet finalized.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.lock().by_id.len()
    }
}

/// Handshake, then read frames until the connection ends.
async fn run_connection<S: Socket>(conn: Arc<Connection<S>>) -> Result<(), ServerError> {
    let shared = Arc::clone(conn.shared());
    let configuration = Message::Configuration(shared.configuration.clone());
    if let Err(e) = conn.send(&configuration).await {
        tracing::warn!(connection_id = conn.id().0, error = %e, "failed to send configuration frame");
        conn.close();
        return Err(ServerError::Handshake(e));
    }
    shared.handler.on_client_connected(&conn);
    read_loop(&conn).await;
    Ok(())
}

async fn read_loop<S: Socket>(conn: &Arc<Connection<S>>) {
    let shared = conn.shared();
    let timeout = shared.config.read_timeout;
    while conn.is_active() {
        match conn.socket().read(shared.pool.acquire(), timeout).await {
            Ok(buf) => dispatch(conn, buf).await,
            Err(e) if e.is_timeout() => {
                tracing::trace!(connection_id = conn.id().0, "read deadline expired");
            }
            Err(e) if e.is_overflow() => {
                tracing::warn!(connection_id = conn.id().0, error = %e, "discarding oversized frame");
            }
            Err(SocketError::Closed) => {
                tracing::debug!(connection_id = conn.id().0, "socket closed");
                conn.close();
                break;
            }
            Err(e) if e.is_abnormal() => {
                tracing::warn!(connection_id = conn.id().0, error = %e, "abnormal closure");
                conn.close();
                break;
            }
            Err(e) => {
                tracing::warn!(connection_id = conn.id().0, error = %e, "read failed");
                conn.close();
                break;
            }
        }
    }
}
