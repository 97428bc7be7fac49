//! Wire codec.
//!
//! Every frame starts with a one-byte type tag. The remaining layout depends
//! on the tag; multi-byte integers are little-endian.
//!
//! | Tag         | Frame                          | Layout after the tag                              |
//! |-------------|--------------------------------|---------------------------------------------------|
//! | 0           | error reply                    | id(8) code_len(1) code message                    |
//! | 1           | shutdown reply                 | id(8)                                             |
//! | 2           | internal error reply           | id(8)                                             |
//! | 3           | session not found              | id(8)                                             |
//! | 4           | max session connections        | id(8)                                             |
//! | 5           | sessions disabled              | id(8)                                             |
//! | 6           | protocol error reply           | id(8)                                             |
//! | 10          | configuration                  | version_len(1) version timeout_ms(4) buf_size(4)  |
//! | 21          | session created                | JSON session record                               |
//! | 22          | session closed                 | -                                                 |
//! | 31          | close session                  | id(8)                                             |
//! | 32          | restore session                | id(8) key                                         |
//! | 63/64/65    | signal (binary/utf8/utf16)     | name_len(1) name [pad] payload                    |
//! | 127/128/129 | request (binary/utf8/utf16)    | id(8) name_len(1) name [pad] payload              |
//! | 191/192/193 | reply (binary/utf8/utf16)      | id(8) [pad] payload                               |
//!
//! UTF-16 payloads start on an even offset: a single zero pad byte follows
//! the header when the header length is odd.
//!
//! Decoding never fails on an unknown tag; such frames decode to `None` and
//! are dropped by the caller.

use std::fmt;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

use crate::handshake::ServerConfiguration;
use crate::session::SessionRecord;
use crate::{EncodeError, Malformed, ProtocolError};

pub mod tag {
    pub const ERROR_REPLY: u8 = 0;
    pub const REPLY_SHUTDOWN: u8 = 1;
    pub const REPLY_INTERNAL_ERROR: u8 = 2;
    pub const SESSION_NOT_FOUND: u8 = 3;
    pub const MAX_SESSION_CONNECTIONS_REACHED: u8 = 4;
    pub const SESSIONS_DISABLED: u8 = 5;
    pub const REPLY_PROTOCOL_ERROR: u8 = 6;
    pub const CONFIGURATION: u8 = 10;
    pub const SESSION_CREATED: u8 = 21;
    pub const SESSION_CLOSED: u8 = 22;
    pub const CLOSE_SESSION: u8 = 31;
    pub const RESTORE_SESSION: u8 = 32;
    pub const SIGNAL_BINARY: u8 = 63;
    pub const REQUEST_BINARY: u8 = 127;
    pub const REPLY_BINARY: u8 = 191;
}

/// 8-byte correlation id tying a reply to its request.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationId(pub [u8; 8]);

impl CorrelationId {
    pub const fn from_u64(value: u64) -> Self {
        Self(value.to_le_bytes())
    }

    pub const fn as_u64(&self) -> u64 {
        u64::from_le_bytes(self.0)
    }
}

impl fmt::Debug for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CorrelationId({:#018x})", self.as_u64())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.as_u64())
    }
}

/// How a payload's bytes are to be interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PayloadEncoding {
    #[default]
    Binary,
    Utf8,
    Utf16,
}

impl PayloadEncoding {
    const fn offset(self) -> u8 {
        match self {
            Self::Binary => 0,
            Self::Utf8 => 1,
            Self::Utf16 => 2,
        }
    }

    const fn from_offset(offset: u8) -> Option<Self> {
        match offset {
            0 => Some(Self::Binary),
            1 => Some(Self::Utf8),
            2 => Some(Self::Utf16),
            _ => None,
        }
    }
}

impl fmt::Display for PayloadEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Binary => write!(f, "binary"),
            Self::Utf8 => write!(f, "utf8"),
            Self::Utf16 => write!(f, "utf16"),
        }
    }
}

/// Encoded payload bytes plus their declared encoding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    pub encoding: PayloadEncoding,
    pub data: Bytes,
}

impl Payload {
    pub fn new(encoding: PayloadEncoding, data: impl Into<Bytes>) -> Self {
        Self {
            encoding,
            data: data.into(),
        }
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(PayloadEncoding::Binary, data)
    }

    pub fn utf8(text: impl Into<String>) -> Self {
        Self::new(PayloadEncoding::Utf8, Bytes::from(text.into().into_bytes()))
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The payload as text, when it is declared UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        match self.encoding {
            PayloadEncoding::Utf8 => std::str::from_utf8(&self.data).ok(),
            _ => None,
        }
    }
}

/// Frame type, as identified by the tag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    ErrorReply,
    ReplyShutdown,
    ReplyInternalError,
    SessionNotFound,
    MaxSessionConnectionsReached,
    SessionsDisabled,
    ReplyProtocolError,
    Configuration,
    SessionCreated,
    SessionClosed,
    CloseSession,
    RestoreSession,
    Signal(PayloadEncoding),
    Request(PayloadEncoding),
    Reply(PayloadEncoding),
}

impl MessageType {
    pub fn from_tag(value: u8) -> Option<Self> {
        Some(match value {
            tag::ERROR_REPLY => Self::ErrorReply,
            tag::REPLY_SHUTDOWN => Self::ReplyShutdown,
            tag::REPLY_INTERNAL_ERROR => Self::ReplyInternalError,
            tag::SESSION_NOT_FOUND => Self::SessionNotFound,
            tag::MAX_SESSION_CONNECTIONS_REACHED => Self::MaxSessionConnectionsReached,
            tag::SESSIONS_DISABLED => Self::SessionsDisabled,
            tag::REPLY_PROTOCOL_ERROR => Self::ReplyProtocolError,
            tag::CONFIGURATION => Self::Configuration,
            tag::SESSION_CREATED => Self::SessionCreated,
            tag::SESSION_CLOSED => Self::SessionClosed,
            tag::CLOSE_SESSION => Self::CloseSession,
            tag::RESTORE_SESSION => Self::RestoreSession,
            tag::SIGNAL_BINARY..=65 => {
                Self::Signal(PayloadEncoding::from_offset(value - tag::SIGNAL_BINARY)?)
            }
            tag::REQUEST_BINARY..=129 => {
                Self::Request(PayloadEncoding::from_offset(value - tag::REQUEST_BINARY)?)
            }
            tag::REPLY_BINARY..=193 => {
                Self::Reply(PayloadEncoding::from_offset(value - tag::REPLY_BINARY)?)
            }
            _ => return None,
        })
    }

    pub fn tag(self) -> u8 {
        match self {
            Self::ErrorReply => tag::ERROR_REPLY,
            Self::ReplyShutdown => tag::REPLY_SHUTDOWN,
            Self::ReplyInternalError => tag::REPLY_INTERNAL_ERROR,
            Self::SessionNotFound => tag::SESSION_NOT_FOUND,
            Self::MaxSessionConnectionsReached => tag::MAX_SESSION_CONNECTIONS_REACHED,
            Self::SessionsDisabled => tag::SESSIONS_DISABLED,
            Self::ReplyProtocolError => tag::REPLY_PROTOCOL_ERROR,
            Self::Configuration => tag::CONFIGURATION,
            Self::SessionCreated => tag::SESSION_CREATED,
            Self::SessionClosed => tag::SESSION_CLOSED,
            Self::CloseSession => tag::CLOSE_SESSION,
            Self::RestoreSession => tag::RESTORE_SESSION,
            Self::Signal(enc) => tag::SIGNAL_BINARY + enc.offset(),
            Self::Request(enc) => tag::REQUEST_BINARY + enc.offset(),
            Self::Reply(enc) => tag::REPLY_BINARY + enc.offset(),
        }
    }

    /// Client frames that must receive exactly one reply.
    pub fn expects_reply(self) -> bool {
        matches!(
            self,
            Self::Request(_) | Self::RestoreSession | Self::CloseSession
        )
    }

    /// Frames only the server sends. Clients sending these are ignored.
    pub fn is_server_only(self) -> bool {
        !matches!(
            self,
            Self::Signal(_) | Self::Request(_) | Self::RestoreSession | Self::CloseSession
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ErrorReply => write!(f, "error reply"),
            Self::ReplyShutdown => write!(f, "shutdown reply"),
            Self::ReplyInternalError => write!(f, "internal error reply"),
            Self::SessionNotFound => write!(f, "session not found"),
            Self::MaxSessionConnectionsReached => write!(f, "max session connections reached"),
            Self::SessionsDisabled => write!(f, "sessions disabled"),
            Self::ReplyProtocolError => write!(f, "protocol error reply"),
            Self::Configuration => write!(f, "configuration"),
            Self::SessionCreated => write!(f, "session created"),
            Self::SessionClosed => write!(f, "session closed"),
            Self::CloseSession => write!(f, "close session"),
            Self::RestoreSession => write!(f, "restore session"),
            Self::Signal(enc) => write!(f, "{enc} signal"),
            Self::Request(enc) => write!(f, "{enc} request"),
            Self::Reply(enc) => write!(f, "{enc} reply"),
        }
    }
}

/// The outcome carried by a reply frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Success(Payload),
    /// Domain error from a handler, echoed verbatim.
    Error { code: String, message: String },
    ProtocolError,
    SessionsDisabled,
    SessionNotFound,
    MaxSessionConnectionsReached,
    Internal,
    Shutdown,
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Signal {
        name: String,
        payload: Payload,
    },
    Request {
        id: CorrelationId,
        name: String,
        payload: Payload,
    },
    RestoreSession {
        id: CorrelationId,
        key: String,
    },
    CloseSession {
        id: CorrelationId,
    },
    Reply {
        id: CorrelationId,
        reply: Reply,
    },
    Configuration(ServerConfiguration),
    SessionCreated(SessionRecord),
    SessionClosed,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Signal { payload, .. } => MessageType::Signal(payload.encoding),
            Self::Request { payload, .. } => MessageType::Request(payload.encoding),
            Self::RestoreSession { .. } => MessageType::RestoreSession,
            Self::CloseSession { .. } => MessageType::CloseSession,
            Self::Reply { reply, .. } => match reply {
                Reply::Success(payload) => MessageType::Reply(payload.encoding),
                Reply::Error { .. } => MessageType::ErrorReply,
                Reply::ProtocolError => MessageType::ReplyProtocolError,
                Reply::SessionsDisabled => MessageType::SessionsDisabled,
                Reply::SessionNotFound => MessageType::SessionNotFound,
                Reply::MaxSessionConnectionsReached => MessageType::MaxSessionConnectionsReached,
                Reply::Internal => MessageType::ReplyInternalError,
                Reply::Shutdown => MessageType::ReplyShutdown,
            },
            Self::Configuration(_) => MessageType::Configuration,
            Self::SessionCreated(_) => MessageType::SessionCreated,
            Self::SessionClosed => MessageType::SessionClosed,
        }
    }

    /// Correlation id of replyable frames and replies.
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        match self {
            Self::Request { id, .. }
            | Self::RestoreSession { id, .. }
            | Self::CloseSession { id }
            | Self::Reply { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// Encode into a single frame.
    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        let message_type = self.message_type();
        let mut out = BytesMut::with_capacity(self.encoded_len_hint());
        out.put_u8(message_type.tag());

        match self {
            Self::Signal { name, payload } => {
                put_name(&mut out, name)?;
                put_payload(&mut out, payload)?;
            }
            Self::Request { id, name, payload } => {
                out.put_slice(&id.0);
                put_name(&mut out, name)?;
                put_payload(&mut out, payload)?;
            }
            Self::RestoreSession { id, key } => {
                if !is_printable(key.as_bytes()) || key.is_empty() {
                    return Err(EncodeError::InvalidSessionKey);
                }
                out.put_slice(&id.0);
                out.put_slice(key.as_bytes());
            }
            Self::CloseSession { id } => out.put_slice(&id.0),
            Self::Reply { id, reply } => {
                out.put_slice(&id.0);
                match reply {
                    Reply::Success(payload) => put_payload(&mut out, payload)?,
                    Reply::Error { code, message } => {
                        if code.is_empty() || code.len() > 255 || !is_printable(code.as_bytes()) {
                            return Err(EncodeError::InvalidErrorCode { code: code.clone() });
                        }
                        out.put_u8(code.len() as u8);
                        out.put_slice(code.as_bytes());
                        out.put_slice(message.as_bytes());
                    }
                    _ => {}
                }
            }
            Self::Configuration(config) => {
                let version = config.protocol_version.as_bytes();
                if version.len() > 255 || !is_printable(version) {
                    return Err(EncodeError::InvalidVersion);
                }
                out.put_u8(version.len() as u8);
                out.put_slice(version);
                out.put_u32_le(saturating_millis(config.read_timeout));
                out.put_u32_le(u32::try_from(config.message_buffer_size).unwrap_or(u32::MAX));
            }
            Self::SessionCreated(record) => out.put_slice(&serde_json::to_vec(record)?),
            Self::SessionClosed => {}
        }

        Ok(out.freeze())
    }

    fn encoded_len_hint(&self) -> usize {
        match self {
            Self::Signal { name, payload } => 3 + name.len() + payload.data.len(),
            Self::Request { name, payload, .. } => 11 + name.len() + payload.data.len(),
            Self::Reply {
                reply: Reply::Success(payload),
                ..
            } => 10 + payload.data.len(),
            _ => 64,
        }
    }

    /// Decode one frame.
    ///
    /// Returns `Ok(None)` for empty frames and unknown tags. Payload bytes
    /// are zero-copy slices of `frame`.
    pub fn decode(frame: &Bytes) -> Result<Option<Message>, ProtocolError> {
        let Some((&first, _)) = frame.split_first() else {
            return Ok(None);
        };
        let Some(message_type) = MessageType::from_tag(first) else {
            return Ok(None);
        };
        let mut r = Reader {
            frame,
            pos: 1,
            message_type,
            id: None,
        };

        let message = match message_type {
            MessageType::Signal(encoding) => {
                let name = r.name()?;
                let payload = r.payload(encoding)?;
                Message::Signal { name, payload }
            }
            MessageType::Request(encoding) => {
                let id = r.id()?;
                let name = r.name()?;
                let payload = r.payload(encoding)?;
                Message::Request { id, name, payload }
            }
            MessageType::Reply(encoding) => {
                let id = r.id()?;
                let payload = r.payload(encoding)?;
                Message::Reply {
                    id,
                    reply: Reply::Success(payload),
                }
            }
            MessageType::RestoreSession => {
                let id = r.id()?;
                let key = r.rest();
                if key.is_empty() || !is_printable(&key) {
                    return Err(r.malformed(Malformed::InvalidSessionKey));
                }
                Message::RestoreSession {
                    id,
                    key: ascii_string(&key),
                }
            }
            MessageType::CloseSession => Message::CloseSession { id: r.id()? },
            MessageType::ErrorReply => {
                let id = r.id()?;
                let code_len = r.u8()? as usize;
                let code = r.take(code_len)?;
                if code.is_empty() || !is_printable(&code) {
                    return Err(r.malformed(Malformed::InvalidErrorCode));
                }
                let message = String::from_utf8_lossy(&r.rest()).into_owned();
                Message::Reply {
                    id,
                    reply: Reply::Error {
                        code: ascii_string(&code),
                        message,
                    },
                }
            }
            MessageType::ReplyShutdown => fixed_reply(&mut r, Reply::Shutdown)?,
            MessageType::ReplyInternalError => fixed_reply(&mut r, Reply::Internal)?,
            MessageType::SessionNotFound => fixed_reply(&mut r, Reply::SessionNotFound)?,
            MessageType::MaxSessionConnectionsReached => {
                fixed_reply(&mut r, Reply::MaxSessionConnectionsReached)?
            }
            MessageType::SessionsDisabled => fixed_reply(&mut r, Reply::SessionsDisabled)?,
            MessageType::ReplyProtocolError => fixed_reply(&mut r, Reply::ProtocolError)?,
            MessageType::Configuration => {
                let version_len = r.u8()? as usize;
                let version = r.take(version_len)?;
                if !is_printable(&version) {
                    return Err(r.malformed(Malformed::InvalidVersion));
                }
                let read_timeout = Duration::from_millis(u64::from(r.u32()?));
                let message_buffer_size = r.u32()? as usize;
                Message::Configuration(ServerConfiguration {
                    protocol_version: ascii_string(&version),
                    read_timeout,
                    message_buffer_size,
                })
            }
            MessageType::SessionCreated => {
                let body = r.rest();
                let record = serde_json::from_slice(&body)
                    .map_err(|e| r.malformed(Malformed::Json(e.to_string())))?;
                Message::SessionCreated(record)
            }
            MessageType::SessionClosed => Message::SessionClosed,
        };

        Ok(Some(message))
    }
}

fn fixed_reply(r: &mut Reader<'_>, reply: Reply) -> Result<Message, ProtocolError> {
    Ok(Message::Reply { id: r.id()?, reply })
}

fn is_printable(bytes: &[u8]) -> bool {
    bytes.iter().all(|b| (0x20..=0x7e).contains(b))
}

fn ascii_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

fn saturating_millis(d: Duration) -> u32 {
    u32::try_from(d.as_millis()).unwrap_or(u32::MAX)
}

fn put_name(out: &mut BytesMut, name: &str) -> Result<(), EncodeError> {
    let bytes = name.as_bytes();
    if bytes.len() > 255 {
        return Err(EncodeError::NameTooLong { len: bytes.len() });
    }
    if !is_printable(bytes) {
        return Err(EncodeError::NameNotPrintable);
    }
    out.put_u8(bytes.len() as u8);
    out.put_slice(bytes);
    Ok(())
}

fn put_payload(out: &mut BytesMut, payload: &Payload) -> Result<(), EncodeError> {
    if payload.encoding == PayloadEncoding::Utf16 {
        if payload.data.len() % 2 != 0 {
            return Err(EncodeError::OddUtf16Length {
                len: payload.data.len(),
            });
        }
        if out.len() % 2 != 0 {
            out.put_u8(0);
        }
    }
    out.put_slice(&payload.data);
    Ok(())
}

/// Cursor over a frame being decoded.
struct Reader<'a> {
    frame: &'a Bytes,
    pos: usize,
    message_type: MessageType,
    id: Option<CorrelationId>,
}

impl Reader<'_> {
    fn malformed(&self, reason: Malformed) -> ProtocolError {
        ProtocolError {
            message_type: self.message_type,
            correlation_id: self.id,
            reason,
        }
    }

    fn take(&mut self, n: usize) -> Result<Bytes, ProtocolError> {
        let available = self.frame.len() - self.pos;
        if n > available {
            return Err(self.malformed(Malformed::Truncated {
                needed: n,
                available,
            }));
        }
        let bytes = self.frame.slice(self.pos..self.pos + n);
        self.pos += n;
        Ok(bytes)
    }

    fn rest(&mut self) -> Bytes {
        let bytes = self.frame.slice(self.pos..);
        self.pos = self.frame.len();
        bytes
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn id(&mut self) -> Result<CorrelationId, ProtocolError> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes);
        let id = CorrelationId(raw);
        self.id = Some(id);
        Ok(id)
    }

    fn name(&mut self) -> Result<String, ProtocolError> {
        let len = self.u8()? as usize;
        let name = self.take(len)?;
        if !is_printable(&name) {
            return Err(self.malformed(Malformed::NameNotPrintable));
        }
        Ok(ascii_string(&name))
    }

    fn payload(&mut self, encoding: PayloadEncoding) -> Result<Payload, ProtocolError> {
        match encoding {
            PayloadEncoding::Binary => {}
            PayloadEncoding::Utf8 => {
                if std::str::from_utf8(&self.frame[self.pos..]).is_err() {
                    return Err(self.malformed(Malformed::InvalidUtf8));
                }
            }
            PayloadEncoding::Utf16 => {
                if self.pos % 2 != 0 {
                    self.take(1)?;
                }
                let len = self.frame.len() - self.pos;
                if len % 2 != 0 {
                    return Err(self.malformed(Malformed::OddUtf16Length { len }));
                }
            }
        }
        Ok(Payload::new(encoding, self.rest()))
    }
}
