//! Routes decoded frames to handlers and writes their replies.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::OwnedSemaphorePermit;

use crate::connection::TaskGuard;
use crate::shutdown::OpGuard;
use crate::{
    Connection, CorrelationId, HandlerError, Message, Payload, PayloadEncoding, PooledBuf, Reply,
    Request, SendError, SessionError, Signal, Socket,
};

/// Error code sent when a client restores a session on a connection that
/// already has one.
pub const SESSION_ALREADY_ACTIVE: &str = "SESSION_ALREADY_ACTIVE";

/// An admitted frame and everything it holds until it finishes.
struct Work<S: Socket> {
    conn: Arc<Connection<S>>,
    message: Message,
    _op: OpGuard,
    _task: TaskGuard<S>,
    _slot: Option<OwnedSemaphorePermit>,
}

/// Decode one inbound frame and run it.
///
/// Admission and slot acquisition happen here, in arrival order; the
/// handler itself runs inline for serialized connections and on its own
/// task otherwise.
pub(crate) async fn dispatch<S: Socket>(conn: &Arc<Connection<S>>, buf: PooledBuf) {
    let frame = buf.into_bytes();
    let message = match Message::decode(&frame) {
        Ok(Some(message)) => message,
        Ok(None) => {
            tracing::trace!(
                connection_id = conn.id().0,
                tag = frame.first().copied(),
                "dropping unrecognised frame"
            );
            return;
        }
        Err(e) => {
            tracing::debug!(connection_id = conn.id().0, error = %e, "malformed frame");
            if let Some(id) = e.replyable() {
                send_reply(conn, id, Reply::ProtocolError).await;
            }
            return;
        }
    };
    drop(frame);

    let message_type = message.message_type();
    if message_type.is_server_only() {
        tracing::debug!(
            connection_id = conn.id().0,
            %message_type,
            "ignoring server-only frame from client"
        );
        return;
    }

    let Some(op) = conn.shared().shutdown.try_admit() else {
        match message.correlation_id() {
            Some(id) => send_reply(conn, id, Reply::Shutdown).await,
            None => tracing::debug!(
                connection_id = conn.id().0,
                "dropping signal during shutdown"
            ),
        }
        return;
    };
    let Some(task) = conn.task_guard() else {
        tracing::debug!(connection_id = conn.id().0, "connection closing, dropping frame");
        return;
    };

    let slot = match conn.acquire_slot().await {
        Ok(slot) => slot,
        Err(_) => {
            tracing::debug!(connection_id = conn.id().0, "connection closed while waiting for a handler slot");
            return;
        }
    };

    let work = Work {
        conn: Arc::clone(conn),
        message,
        _op: op,
        _task: task,
        _slot: slot,
    };
    if conn.concurrency_limit() == 1 {
        run(work).await;
    } else {
        tokio::spawn(run(work));
    }
}

async fn run<S: Socket>(work: Work<S>) {
    let Work {
        conn,
        message,
        _op,
        _task,
        _slot,
    } = work;
    let message_type = message.message_type();
    let reply_to = message.correlation_id();

    let outcome = AssertUnwindSafe(handle(&conn, message)).catch_unwind().await;
    let reply = match outcome {
        Ok(reply) => reply,
        Err(panic) => {
            tracing::error!(
                connection_id = conn.id().0,
                %message_type,
                panic = panic_message(&*panic),
                "handler panicked"
            );
            reply_to.map(|_| Reply::Internal)
        }
    };

    if let (Some(id), Some(reply)) = (reply_to, reply) {
        send_reply(&conn, id, reply).await;
    }
}

/// Run the handler for `message`, returning the reply it earns, if any.
async fn handle<S: Socket>(conn: &Arc<Connection<S>>, message: Message) -> Option<Reply> {
    let handler = &conn.shared().handler;
    match message {
        Message::Signal { name, payload } => {
            handler.on_signal(conn, Signal { name, payload }).await;
            None
        }
        Message::Request { name, payload, .. } => {
            let result = handler
                .on_request(
                    conn,
                    Request {
                        name: name.clone(),
                        payload,
                    },
                )
                .await;
            Some(match result {
                Ok(payload) => Reply::Success(payload),
                Err(HandlerError::Domain { code, message }) => Reply::Error { code, message },
                Err(HandlerError::Internal(e)) => {
                    tracing::error!(
                        connection_id = conn.id().0,
                        request = %name,
                        error = %e,
                        "request handler failed"
                    );
                    Reply::Internal
                }
            })
        }
        Message::RestoreSession { key, .. } => Some(restore(conn, &key).await),
        Message::CloseSession { .. } => Some(close(conn).await),
        _ => None,
    }
}

async fn restore<S: Socket>(conn: &Arc<Connection<S>>, key: &str) -> Reply {
    match conn.restore_session(key).await {
        Ok(session) => match serde_json::to_vec(&session.to_record()) {
            Ok(body) => Reply::Success(Payload::new(PayloadEncoding::Utf8, body)),
            Err(e) => {
                tracing::error!(connection_id = conn.id().0, error = %e, "serializing restored session");
                Reply::Internal
            }
        },
        Err(SessionError::SessionsDisabled) => Reply::SessionsDisabled,
        Err(SessionError::NotFound) => Reply::SessionNotFound,
        Err(SessionError::MaxConnectionsReached { .. }) => Reply::MaxSessionConnectionsReached,
        Err(SessionError::SessionAlreadyActive) => Reply::Error {
            code: SESSION_ALREADY_ACTIVE.into(),
            message: "connection already has an active session".into(),
        },
        Err(e) => {
            tracing::error!(connection_id = conn.id().0, error = %e, "session restore failed");
            Reply::Internal
        }
    }
}

async fn close<S: Socket>(conn: &Arc<Connection<S>>) -> Reply {
    if !conn.shared().config.sessions_enabled {
        return Reply::SessionsDisabled;
    }
    match conn.close_session().await {
        Ok(_) => Reply::Success(Payload::empty()),
        Err(e) => {
            tracing::error!(connection_id = conn.id().0, error = %e, "session close failed");
            Reply::Internal
        }
    }
}

/// Write a reply. Replies that cannot be encoded degrade to an internal
/// error; a failed write closes the connection.
async fn send_reply<S: Socket>(conn: &Connection<S>, id: CorrelationId, reply: Reply) {
    let result = match conn.send(&Message::Reply { id, reply }).await {
        Err(SendError::Encode(e)) => {
            tracing::error!(
                connection_id = conn.id().0,
                %id,
                error = %e,
                "reply could not be encoded, sending internal error"
            );
            conn.send(&Message::Reply {
                id,
                reply: Reply::Internal,
            })
            .await
        }
        other => other,
    };
    if let Err(e) = result {
        tracing::warn!(
            connection_id = conn.id().0,
            %id,
            error = %e,
            "failed to write reply, closing connection"
        );
        conn.close();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
