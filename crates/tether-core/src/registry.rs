//! Session registry: which connections currently own each session key.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::{ConnectionId, SessionError};

/// Anything the registry can track as a session owner.
pub trait SessionOwner: Send + Sync + 'static {
    fn connection_id(&self) -> ConnectionId;
}

/// Maps session keys to their owning connections, enforcing a per-session
/// connection cap.
///
/// An entry exists only while at least one connection owns the key.
pub struct SessionRegistry<C> {
    max_connections: usize,
    entries: RwLock<HashMap<String, HashMap<ConnectionId, Arc<C>>>>,
}

impl<C> std::fmt::Debug for SessionRegistry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("max_connections", &self.max_connections)
            .field("active_sessions", &self.entries.read().len())
            .finish()
    }
}

impl<C: SessionOwner> SessionRegistry<C> {
    /// `max_connections == 0` means unlimited.
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Per-session connection cap; 0 is unlimited.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Add `owner` to the owners of `key`, returning the new owner count.
    ///
    /// Registering an owner that is already present changes nothing.
    pub fn register(&self, key: &str, owner: &Arc<C>) -> Result<usize, SessionError> {
        let id = owner.connection_id();
        let mut entries = self.entries.write();
        match entries.entry(key.to_owned()) {
            Entry::Vacant(slot) => {
                slot.insert(HashMap::from([(id, Arc::clone(owner))]));
                Ok(1)
            }
            Entry::Occupied(mut slot) => {
                let owners = slot.get_mut();
                if owners.contains_key(&id) {
                    return Ok(owners.len());
                }
                if self.max_connections > 0 && owners.len() >= self.max_connections {
                    return Err(SessionError::MaxConnectionsReached {
                        max: self.max_connections,
                    });
                }
                owners.insert(id, Arc::clone(owner));
                Ok(owners.len())
            }
        }
    }

    /// Remove connection `id` from the owners of `key`.
    ///
    /// Returns the remaining owner count, `Some(0)` when the last owner was
    /// removed (and the entry with it), or `None` when `key` had no entry.
    pub fn deregister(&self, key: &str, id: ConnectionId) -> Option<usize> {
        let mut entries = self.entries.write();
        let owners = entries.get_mut(key)?;
        owners.remove(&id);
        let remaining = owners.len();
        if remaining == 0 {
            entries.remove(key);
        }
        Some(remaining)
    }

    /// Number of session keys with at least one owner.
    pub fn active_sessions_num(&self) -> usize {
        self.entries.read().len()
    }

    /// Owner count for `key`, or `None` when the key has no entry.
    pub fn session_connections_num(&self, key: &str) -> Option<usize> {
        self.entries.read().get(key).map(HashMap::len)
    }

    /// Snapshot of the owners of `key`.
    pub fn session_connections(&self, key: &str) -> Vec<Arc<C>> {
        self.entries
            .read()
            .get(key)
            .map(|owners| owners.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether `key` is at its connection cap.
    pub fn is_full(&self, key: &str) -> bool {
        self.max_connections > 0
            && self
                .session_connections_num(key)
                .is_some_and(|n| n >= self.max_connections)
    }
}
