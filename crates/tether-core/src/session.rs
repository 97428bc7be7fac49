//! Sessions: resumable identities that outlive any single connection.

use std::collections::BTreeMap;

use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// A value in a session's attribute set.
///
/// Strings, numbers, booleans, and lists or maps of the same. Cloning is a
/// deep copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InfoValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<InfoValue>),
    Map(BTreeMap<String, InfoValue>),
}

impl From<bool> for InfoValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for InfoValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for InfoValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for InfoValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<String> for InfoValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl<T: Into<InfoValue>> From<Vec<T>> for InfoValue {
    fn from(v: Vec<T>) -> Self {
        Self::List(v.into_iter().map(Into::into).collect())
    }
}

/// User-defined session attributes, keyed by field name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionInfo(BTreeMap<String, InfoValue>);

impl SessionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<InfoValue>) -> Self {
        self.insert(field, value);
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<InfoValue>) {
        self.0.insert(field.into(), value.into());
    }

    /// Field names, in sorted order.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn value(&self, field: &str) -> Option<&InfoValue> {
        self.0.get(field)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// An active session.
///
/// Immutable once built; connections share it behind an `Arc` and callers
/// only ever get copies of its attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    key: String,
    creation: DateTime<Utc>,
    last_lookup: DateTime<Utc>,
    info: SessionInfo,
}

impl Session {
    pub fn new(key: impl Into<String>, info: SessionInfo) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            creation: now,
            last_lookup: now,
            info,
        }
    }

    /// Rebuild a session from a stored record, stamping the lookup time.
    pub fn restored(record: SessionRecord) -> Self {
        Self {
            key: record.key,
            creation: record.creation,
            last_lookup: Utc::now(),
            info: record.info,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn creation(&self) -> DateTime<Utc> {
        self.creation
    }

    pub fn last_lookup(&self) -> DateTime<Utc> {
        self.last_lookup
    }

    /// A copy of the attribute set.
    pub fn info(&self) -> SessionInfo {
        self.info.clone()
    }

    pub fn info_fields(&self) -> impl Iterator<Item = &str> {
        self.info.fields()
    }

    /// A copy of one attribute.
    pub fn info_value(&self, field: &str) -> Option<InfoValue> {
        self.info.value(field).cloned()
    }

    pub fn to_record(&self) -> SessionRecord {
        SessionRecord {
            key: self.key.clone(),
            creation: self.creation,
            last_lookup: self.last_lookup,
            info: self.info.clone(),
        }
    }
}

/// Serialized form of a session, as sent to clients and kept by stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub key: String,
    pub creation: DateTime<Utc>,
    pub last_lookup: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "SessionInfo::is_empty")]
    pub info: SessionInfo,
}

/// Leading characters of a key, enough to correlate log lines without
/// leaking the key.
pub(crate) fn key_prefix(key: &str) -> &str {
    key.get(..6).unwrap_or(key)
}

/// Produces session keys.
pub trait KeyGenerator: Send + Sync + 'static {
    /// A new unique key. Must be non-empty printable ASCII.
    fn generate(&self) -> String;
}

/// Cryptographically random keys: 32 bytes from the thread RNG, encoded as
/// unpadded URL-safe base64.
#[derive(Debug, Clone, Copy)]
pub struct RandomKeyGenerator {
    bytes: usize,
}

impl RandomKeyGenerator {
    pub const DEFAULT_BYTES: usize = 32;

    pub fn with_bytes(bytes: usize) -> Self {
        Self {
            bytes: bytes.max(1),
        }
    }
}

impl Default for RandomKeyGenerator {
    fn default() -> Self {
        Self::with_bytes(Self::DEFAULT_BYTES)
    }
}

impl KeyGenerator for RandomKeyGenerator {
    fn generate(&self) -> String {
        let mut raw = vec![0u8; self.bytes];
        rand::thread_rng().fill_bytes(&mut raw);
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw)
    }
}
