//! Error types.
//!
//! Each layer owns its error enum: the buffer pool, the wire codec, the
//! socket transport, session operations, session storage, user handlers and
//! the server itself. Conversions flow upward with `?`.

use std::time::Duration;

use crate::frame::{CorrelationId, MessageType};

/// Boxed error used by pluggable collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failures while filling a pooled read buffer.
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    /// The frame did not fit the fixed-capacity buffer. The remainder of the
    /// frame has been drained and discarded.
    #[error("frame exceeds the {capacity}-byte message buffer")]
    Overflow { capacity: usize },

    #[error("reading frame into buffer: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a recognised frame could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Malformed {
    #[error("truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("name contains bytes outside printable ASCII")]
    NameNotPrintable,

    #[error("UTF-16 payload has odd length {len}")]
    OddUtf16Length { len: usize },

    #[error("UTF-8 payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("error code is empty or not printable ASCII")]
    InvalidErrorCode,

    #[error("session key is empty or not printable ASCII")]
    InvalidSessionKey,

    #[error("protocol version is not printable ASCII")]
    InvalidVersion,

    #[error("invalid JSON body: {0}")]
    Json(String),
}

/// A recognised frame whose type-specific structure is broken.
///
/// Carries the correlation id when it could be read, so the server can reply
/// to replyable frames without closing the connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed {message_type} frame: {reason}")]
pub struct ProtocolError {
    pub message_type: MessageType,
    pub correlation_id: Option<CorrelationId>,
    pub reason: Malformed,
}

impl ProtocolError {
    /// Whether the sender is owed a protocol-error reply.
    pub fn replyable(&self) -> Option<CorrelationId> {
        if self.message_type.expects_reply() {
            self.correlation_id
        } else {
            None
        }
    }
}

/// Failures while building an outbound frame.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("name is {len} bytes, limit is 255")]
    NameTooLong { len: usize },

    #[error("name contains bytes outside printable ASCII")]
    NameNotPrintable,

    #[error("error code must be 1..=255 bytes of printable ASCII, got {code:?}")]
    InvalidErrorCode { code: String },

    #[error("session key must be non-empty printable ASCII")]
    InvalidSessionKey,

    #[error("protocol version must be at most 255 bytes of printable ASCII")]
    InvalidVersion,

    #[error("UTF-16 payload has odd length {len}")]
    OddUtf16Length { len: usize },

    #[error("serializing frame body: {0}")]
    Json(#[from] serde_json::Error),
}

/// Transport-level failures reported by a [`Socket`](crate::Socket).
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    /// The peer or the server closed the socket normally.
    #[error("socket closed")]
    Closed,

    /// No frame arrived before the read deadline.
    #[error("no frame within {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    /// The peer vanished without a closing handshake, or closed with an
    /// error status.
    #[error("abnormal closure: {0}")]
    Abnormal(String),

    #[error("socket I/O: {0}")]
    Io(#[from] std::io::Error),
}

impl SocketError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    pub fn is_overflow(&self) -> bool {
        matches!(self, Self::Buffer(BufferError::Overflow { .. }))
    }

    pub fn is_abnormal(&self) -> bool {
        matches!(self, Self::Abnormal(_))
    }
}

/// Failures while sending a frame to the client.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Socket(#[from] SocketError),
}

/// Error reported by a [`SessionStore`](crate::SessionStore) implementation.
#[derive(Debug, thiserror::Error)]
#[error("session storage: {source}")]
pub struct StorageError {
    #[source]
    source: BoxError,
}

impl StorageError {
    pub fn new(source: impl Into<BoxError>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

/// Failures of session operations on a connection.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("sessions are disabled on this server")]
    SessionsDisabled,

    #[error("connection is not connected")]
    Disconnected,

    #[error("connection already owns an active session")]
    SessionAlreadyActive,

    #[error("session already has the maximum of {max} connections")]
    MaxConnectionsReached { max: usize },

    #[error("session not found")]
    NotFound,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("notifying client: {0}")]
    Notify(#[from] SendError),
}

/// Error returned by a user [`Handler`](crate::Handler).
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// A domain error. Code and message are sent to the client verbatim.
    #[error("{code}: {message}")]
    Domain { code: String, message: String },

    /// Anything else. Logged locally; the client only sees an internal error
    /// reply.
    #[error("internal handler failure: {0}")]
    Internal(BoxError),
}

impl HandlerError {
    pub fn domain(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Domain {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn internal(err: impl Into<BoxError>) -> Self {
        Self::Internal(err.into())
    }
}

impl From<SessionError> for HandlerError {
    fn from(err: SessionError) -> Self {
        Self::Internal(Box::new(err))
    }
}

impl From<SendError> for HandlerError {
    fn from(err: SendError) -> Self {
        Self::Internal(Box::new(err))
    }
}

/// Server-level failures.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// New connections are refused once shutdown has begun.
    #[error("server is shutting down")]
    ShuttingDown,

    #[error("writing configuration frame: {0}")]
    Handshake(#[from] SendError),
}
