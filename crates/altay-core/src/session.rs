use crate::{
    protocol::ClientMessage,
    registry::{ClientSession, ConnectionId, IdentityRegistry},
    sink::{EventSink, RenameOutcome, SinkError},
    storage_key::StorageKey,
};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

/// Minimum gap between rename retries triggered by appends while a relabel
/// is blocked. Announcements always retry immediately.
pub const RELABEL_RETRY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Anonymous,
    Identified,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Anonymous => "anonymous",
            SessionState::Identified => "identified",
            SessionState::Closed => "closed",
        }
    }
}

/// Observable outcome of a session step. The hub turns these into log lines.
#[derive(Debug)]
pub enum SessionEvent {
    Opened {
        session: ClientSession,
    },
    LabelChanged {
        conn_id: ConnectionId,
        previous: String,
        label: String,
    },
    StorageMoved {
        conn_id: ConnectionId,
        from: StorageKey,
        to: StorageKey,
        outcome: RenameOutcome,
    },
    /// The target key is taken; appends stay on `kept` until a retry succeeds.
    RelabelDeferred {
        conn_id: ConnectionId,
        kept: StorageKey,
        target: StorageKey,
        retry: bool,
    },
    Visited {
        conn_id: ConnectionId,
        key: StorageKey,
        url: String,
    },
    StorageFailed {
        conn_id: ConnectionId,
        key: StorageKey,
        error: SinkError,
    },
    InvalidLabel {
        conn_id: ConnectionId,
    },
    /// The registry lost this connection's entry; nothing was written.
    RegistryMiss {
        conn_id: ConnectionId,
        op: &'static str,
    },
    Closed {
        conn_id: ConnectionId,
        session: Option<ClientSession>,
    },
}

/// Per-connection state machine: `Anonymous -> Identified -> Closed`.
///
/// Messages are handled one at a time in arrival order. Storage failures are
/// reported as events and never end the session; only [`close`] does.
///
/// [`close`]: ConnectionSession::close
pub struct ConnectionSession {
    conn_id: ConnectionId,
    state: SessionState,
    registry: Arc<IdentityRegistry>,
    sink: Arc<dyn EventSink>,
    relabel_retry: Duration,
    next_retry: Option<Instant>,
}

impl ConnectionSession {
    pub fn open(
        registry: Arc<IdentityRegistry>,
        sink: Arc<dyn EventSink>,
        remote_address: impl Into<String>,
    ) -> (Self, Vec<SessionEvent>) {
        let conn_id = registry.next_connection_id();
        let session = registry.register(conn_id, remote_address);
        let mut events = Vec::with_capacity(2);
        let key = session.storage_key();
        events.push(SessionEvent::Opened { session });
        if let Err(error) = sink.ensure_storage(&key) {
            events.push(SessionEvent::StorageFailed {
                conn_id,
                key,
                error,
            });
        }
        let session = Self {
            conn_id,
            state: SessionState::Anonymous,
            registry,
            sink,
            relabel_retry: RELABEL_RETRY_INTERVAL,
            next_retry: None,
        };
        (session, events)
    }

    pub fn with_relabel_retry(mut self, interval: Duration) -> Self {
        self.relabel_retry = interval;
        self
    }

    pub fn conn_id(&self) -> ConnectionId {
        self.conn_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn snapshot(&self) -> Option<ClientSession> {
        self.registry.snapshot(self.conn_id)
    }

    /// Handles one inbound text frame. Does nothing once closed.
    pub fn handle_text(&mut self, text: &str) -> Vec<SessionEvent> {
        if self.state == SessionState::Closed {
            return Vec::new();
        }
        match ClientMessage::parse(text) {
            ClientMessage::Identify(label) => self.identify(label),
            ClientMessage::Visit(url) => self.visit(url),
            ClientMessage::Other => Vec::new(),
        }
    }

    pub fn close(&mut self) -> Vec<SessionEvent> {
        if self.state == SessionState::Closed {
            return Vec::new();
        }
        self.state = SessionState::Closed;
        let session = self.registry.unregister(self.conn_id);
        vec![SessionEvent::Closed {
            conn_id: self.conn_id,
            session,
        }]
    }

    fn identify(&mut self, label: &str) -> Vec<SessionEvent> {
        // A blank announcement names nobody; moving storage to `@addr` would
        // only orphan it, so the current label stays.
        if label.is_empty() {
            return vec![SessionEvent::InvalidLabel {
                conn_id: self.conn_id,
            }];
        }
        let Some(relabel) = self.registry.update_label(self.conn_id, label) else {
            return vec![self.registry_miss("update_label")];
        };
        self.state = SessionState::Identified;
        let mut events = vec![SessionEvent::LabelChanged {
            conn_id: self.conn_id,
            previous: relabel.previous.label,
            label: relabel.current.label.clone(),
        }];
        self.reconcile(&relabel.current, false, &mut events);
        events
    }

    fn visit(&mut self, url: &str) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        let Some(mut current) = self.snapshot() else {
            events.push(self.registry_miss("visit"));
            return events;
        };
        if current.relabel_pending()
            && self.retry_due()
            && self.reconcile(&current, true, &mut events)
        {
            current.storage_label = current.label.clone();
        }
        let key = current.storage_key();
        match self.sink.append(&key, url) {
            Ok(()) => events.push(SessionEvent::Visited {
                conn_id: self.conn_id,
                key,
                url: url.to_string(),
            }),
            Err(error) => events.push(SessionEvent::StorageFailed {
                conn_id: self.conn_id,
                key,
                error,
            }),
        }
        events
    }

    /// Moves storage from `storage_label` to `label` if they differ. Returns
    /// whether storage now lives under `label`.
    fn reconcile(
        &mut self,
        current: &ClientSession,
        retry: bool,
        events: &mut Vec<SessionEvent>,
    ) -> bool {
        if !current.relabel_pending() {
            return true;
        }
        let from = current.storage_key();
        let to = current.target_key();
        match self.sink.rename(&from, &to) {
            Ok(outcome) => {
                if !self.registry.commit_storage_label(self.conn_id, &current.label) {
                    events.push(self.registry_miss("commit_storage_label"));
                    return false;
                }
                self.next_retry = None;
                events.push(SessionEvent::StorageMoved {
                    conn_id: self.conn_id,
                    from,
                    to,
                    outcome,
                });
                true
            }
            Err(SinkError::Collision { .. }) => {
                self.next_retry = Some(Instant::now() + self.relabel_retry);
                events.push(SessionEvent::RelabelDeferred {
                    conn_id: self.conn_id,
                    kept: from,
                    target: to,
                    retry,
                });
                false
            }
            Err(error) => {
                events.push(SessionEvent::StorageFailed {
                    conn_id: self.conn_id,
                    key: from,
                    error,
                });
                false
            }
        }
    }

    fn retry_due(&self) -> bool {
        self.next_retry
            .map_or(true, |deadline| Instant::now() >= deadline)
    }

    fn registry_miss(&self, op: &'static str) -> SessionEvent {
        SessionEvent::RegistryMiss {
            conn_id: self.conn_id,
            op,
        }
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        if self.state != SessionState::Closed {
            self.registry.unregister(self.conn_id);
        }
    }
}
