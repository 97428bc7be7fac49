//! Pluggable session storage.

use std::collections::HashMap;

use chrono::Utc;
use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::{Session, SessionRecord, StorageError};

/// Persistence hooks the server calls around a session's lifetime.
///
/// Implementations are shared across connections behind an `Arc`.
pub trait SessionStore: Send + Sync + 'static {
    /// A session was created and installed on a connection. Failures are
    /// logged; the session stays active.
    fn on_session_created<'a>(&'a self, session: &'a Session)
    -> BoxFuture<'a, Result<(), StorageError>>;

    /// Look up a session by key for restoration. `Ok(None)` means the key is
    /// unknown, which is not an error.
    fn on_session_lookup<'a>(
        &'a self,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Option<SessionRecord>, StorageError>>;

    /// A session was closed explicitly.
    fn on_session_closed<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), StorageError>>;
}

/// Keeps session records in memory for the life of the process.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    records: Mutex<HashMap<String, SessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn get(&self, key: &str) -> Option<SessionRecord> {
        self.records.lock().get(key).cloned()
    }
}

impl SessionStore for MemorySessionStore {
    fn on_session_created<'a>(
        &'a self,
        session: &'a Session,
    ) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            self.records
                .lock()
                .insert(session.key().to_owned(), session.to_record());
            Ok(())
        })
    }

    fn on_session_lookup<'a>(
        &'a self,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Option<SessionRecord>, StorageError>> {
        Box::pin(async move {
            let mut records = self.records.lock();
            Ok(records.get_mut(key).map(|record| {
                record.last_lookup = Utc::now();
                record.clone()
            }))
        })
    }

    fn on_session_closed<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            self.records.lock().remove(key);
            Ok(())
        })
    }
}
