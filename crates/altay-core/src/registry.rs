use crate::storage_key::StorageKey;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

/// Label every connection carries until it announces itself.
pub const UNKNOWN_LABEL: &str = "Unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Metadata tracked for one live connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientSession {
    pub conn_id: ConnectionId,
    pub remote_address: String,
    /// Last label announced by the peer.
    pub label: String,
    /// Label whose storage key currently holds this connection's log. Differs
    /// from `label` only while a relabel is blocked by a collision.
    pub storage_label: String,
    pub connected_at: DateTime<Utc>,
}

impl ClientSession {
    fn new(conn_id: ConnectionId, remote_address: String) -> Self {
        Self {
            conn_id,
            remote_address,
            label: UNKNOWN_LABEL.to_string(),
            storage_label: UNKNOWN_LABEL.to_string(),
            connected_at: Utc::now(),
        }
    }

    pub fn storage_key(&self) -> StorageKey {
        StorageKey::new(&self.storage_label, &self.remote_address)
    }

    pub fn target_key(&self) -> StorageKey {
        StorageKey::new(&self.label, &self.remote_address)
    }

    pub fn relabel_pending(&self) -> bool {
        self.label != self.storage_label
    }
}

/// Both sides of a label update, read under one lock acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relabel {
    pub previous: ClientSession,
    pub current: ClientSession,
}

/// Live connections keyed by connection id.
///
/// A single mutex guards the whole map. The map never holds more entries
/// than there are open connections and each critical section is one map
/// operation, so contention stays negligible. No I/O happens under the lock.
#[derive(Debug, Default)]
pub struct IdentityRegistry {
    next_id: AtomicU64,
    sessions: Mutex<HashMap<ConnectionId, ClientSession>>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Inserts a fresh anonymous entry, replacing any entry under the same id.
    pub fn register(
        &self,
        conn_id: ConnectionId,
        remote_address: impl Into<String>,
    ) -> ClientSession {
        let session = ClientSession::new(conn_id, remote_address.into());
        self.lock().insert(conn_id, session.clone());
        session
    }

    /// Sets the announced label. Returns `None` when the id is not registered.
    pub fn update_label(&self, conn_id: ConnectionId, label: &str) -> Option<Relabel> {
        let mut sessions = self.lock();
        let entry = sessions.get_mut(&conn_id)?;
        let previous = entry.clone();
        entry.label = label.to_string();
        Some(Relabel {
            previous,
            current: entry.clone(),
        })
    }

    /// Records that storage now lives under `storage_label`.
    pub fn commit_storage_label(&self, conn_id: ConnectionId, storage_label: &str) -> bool {
        match self.lock().get_mut(&conn_id) {
            Some(entry) => {
                entry.storage_label = storage_label.to_string();
                true
            }
            None => false,
        }
    }

    pub fn unregister(&self, conn_id: ConnectionId) -> Option<ClientSession> {
        self.lock().remove(&conn_id)
    }

    pub fn snapshot(&self, conn_id: ConnectionId) -> Option<ClientSession> {
        self.lock().get(&conn_id).cloned()
    }

    pub fn snapshot_all(&self) -> Vec<ClientSession> {
        let mut sessions: Vec<_> = self.lock().values().cloned().collect();
        sessions.sort_by_key(|session| session.conn_id);
        sessions
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, ClientSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
