use altay_core::{
    ClientSession, ConnectionSession, EventSink, FsEventLog, IdentityRegistry, RenameOutcome,
    SessionEvent, StorageKey, RELABEL_RETRY_INTERVAL,
};
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::{future::Future, io, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::watch};
use tracing::{debug, error, info, warn};

const REMOTE_ADDRESS_HEADERS: [&str; 2] = ["x-real-ip", "x-forwarded-for"];

/// Same cap axum applies by default; URLs such as `data:` links can be large.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 << 20;

pub struct HubState {
    registry: Arc<IdentityRegistry>,
    sink: Arc<dyn EventSink>,
    max_message_bytes: usize,
    relabel_retry: Duration,
    shutdown: watch::Sender<bool>,
    live_sessions: watch::Sender<usize>,
}

impl HubState {
    pub fn new(data_dir: impl Into<PathBuf>, max_message_bytes: usize) -> Self {
        Self::with_sink(Arc::new(FsEventLog::new(data_dir)), max_message_bytes)
    }

    pub fn with_sink(sink: Arc<dyn EventSink>, max_message_bytes: usize) -> Self {
        Self {
            registry: Arc::new(IdentityRegistry::new()),
            sink,
            max_message_bytes,
            relabel_retry: RELABEL_RETRY_INTERVAL,
            shutdown: watch::channel(false).0,
            live_sessions: watch::channel(0).0,
        }
    }

    pub fn with_relabel_retry(mut self, interval: Duration) -> Self {
        self.relabel_retry = interval;
        self
    }

    pub fn registry(&self) -> &IdentityRegistry {
        &self.registry
    }

    async fn handle_socket(self: Arc<Self>, socket: WebSocket, remote_address: String) {
        let _live = LiveSession::enter(self.clone());
        let registry = self.registry.clone();
        let sink = self.sink.clone();
        let relabel_retry = self.relabel_retry;
        let opened = tokio::task::spawn_blocking(move || {
            let (session, events) = ConnectionSession::open(registry, sink, remote_address);
            (session.with_relabel_retry(relabel_retry), events)
        })
        .await;
        let mut session = match opened {
            Ok((session, events)) => {
                log_events(&events);
                session
            }
            Err(err) => {
                error!(event = "session_open_failed", error = %err);
                return;
            }
        };
        let conn_id = session.conn_id();
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let mut shutdown = self.shutdown.subscribe();

        loop {
            let next = tokio::select! {
                _ = stopped(&mut shutdown) => {
                    debug!(
                        event = "session_shutdown",
                        conn_id = %conn_id,
                        state = session.state().as_str()
                    );
                    let _ = ws_sender
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::AWAY,
                            reason: "server shutting down".into(),
                        })))
                        .await;
                    break;
                }
                next = ws_receiver.next() => next,
            };
            let message = match next {
                Some(Ok(message)) => message,
                Some(Err(err)) => {
                    warn!(event = "read_error", conn_id = %conn_id, error = %err);
                    break;
                }
                None => break,
            };
            let text = match message {
                Message::Text(text) => text,
                Message::Close(_) => {
                    debug!(
                        event = "client_close",
                        conn_id = %conn_id,
                        state = session.state().as_str()
                    );
                    break;
                }
                Message::Binary(_) | Message::Ping(_) | Message::Pong(_) => continue,
            };
            let step = tokio::task::spawn_blocking(move || {
                let events = session.handle_text(&text);
                (session, events)
            })
            .await;
            session = match step {
                Ok((session, events)) => {
                    log_events(&events);
                    session
                }
                Err(err) => {
                    // The session was dropped inside the task, which unregisters it.
                    error!(event = "session_step_failed", conn_id = %conn_id, error = %err);
                    return;
                }
            };
        }

        log_events(&session.close());
    }
}

/// Counts a session as live for the shutdown grace period.
struct LiveSession {
    hub: Arc<HubState>,
}

impl LiveSession {
    fn enter(hub: Arc<HubState>) -> Self {
        hub.live_sessions.send_modify(|live| *live += 1);
        Self { hub }
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.hub
            .live_sessions
            .send_modify(|live| *live = live.saturating_sub(1));
    }
}

pub fn router(hub: Arc<HubState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/sessions", get(sessions_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(hub)
}

/// Serves until `shutdown_signal` resolves, then stops accepting and gives
/// live sessions up to `grace` to finish.
pub async fn serve<F>(
    listener: TcpListener,
    hub: Arc<HubState>,
    shutdown_signal: F,
    grace: Duration,
) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let mut stop_accepting = hub.shutdown.subscribe();
    let app = router(hub.clone()).into_make_service_with_connect_info::<SocketAddr>();
    let server = async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { stopped(&mut stop_accepting).await })
            .await
    };
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => return result,
        _ = shutdown_signal => {}
    }

    info!(
        event = "shutdown_requested",
        live_sessions = hub.registry.len(),
        grace_secs = grace.as_secs_f64()
    );
    hub.shutdown.send_replace(true);

    let mut live = hub.live_sessions.subscribe();
    let drain = async {
        server.await?;
        let _ = live.wait_for(|count| *count == 0).await;
        Ok::<(), io::Error>(())
    };
    match tokio::time::timeout(grace, drain).await {
        Ok(result) => result,
        Err(_) => {
            warn!(event = "grace_expired", live_sessions = hub.registry.len());
            Ok(())
        }
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(hub): State<Arc<HubState>>,
) -> impl IntoResponse {
    let remote_address = resolve_remote_address(&headers, peer);
    ws.max_message_size(hub.max_message_bytes)
        .on_failed_upgrade(|err| warn!(event = "upgrade_failed", error = %err))
        .on_upgrade(move |socket| async move {
            hub.handle_socket(socket, remote_address).await;
        })
}

#[derive(Debug, Serialize)]
struct SessionView {
    #[serde(flatten)]
    session: ClientSession,
    storage_key: StorageKey,
    relabel_pending: bool,
    connected_secs: i64,
}

async fn sessions_handler(State(hub): State<Arc<HubState>>) -> Json<Vec<SessionView>> {
    let now = Utc::now();
    let views = hub
        .registry
        .snapshot_all()
        .into_iter()
        .map(|session| SessionView {
            storage_key: session.storage_key(),
            relabel_pending: session.relabel_pending(),
            connected_secs: (now - session.connected_at).num_seconds(),
            session,
        })
        .collect();
    Json(views)
}

/// `X-Real-IP`, then the first `X-Forwarded-For` hop, then the peer address.
pub fn resolve_remote_address(headers: &HeaderMap, peer: SocketAddr) -> String {
    for name in REMOTE_ADDRESS_HEADERS {
        let value = headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .unwrap_or_default();
        if !value.is_empty() {
            return value.to_string();
        }
    }
    peer.ip().to_string()
}

fn log_events(events: &[SessionEvent]) {
    for event in events {
        log_event(event);
    }
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::Opened { session } => info!(
            event = "client_connected",
            conn_id = %session.conn_id,
            remote = %session.remote_address,
            storage_key = %session.storage_key()
        ),
        SessionEvent::LabelChanged {
            conn_id,
            previous,
            label,
        } => info!(
            event = "label_changed",
            conn_id = %conn_id,
            previous = %previous,
            label = %label
        ),
        SessionEvent::StorageMoved {
            conn_id,
            from,
            to,
            outcome: RenameOutcome::Moved,
        } => info!(event = "storage_moved", conn_id = %conn_id, from = %from, to = %to),
        SessionEvent::StorageMoved {
            conn_id,
            from,
            to,
            outcome,
        } => debug!(
            event = "storage_relabeled",
            conn_id = %conn_id,
            from = %from,
            to = %to,
            outcome = ?outcome
        ),
        SessionEvent::RelabelDeferred {
            conn_id,
            kept,
            target,
            retry: false,
        } => warn!(
            event = "rename_collision",
            conn_id = %conn_id,
            kept = %kept,
            target = %target
        ),
        SessionEvent::RelabelDeferred {
            conn_id,
            kept,
            target,
            retry: true,
        } => debug!(
            event = "rename_retry_blocked",
            conn_id = %conn_id,
            kept = %kept,
            target = %target
        ),
        SessionEvent::Visited { conn_id, key, url } => {
            info!(event = "visit_logged", conn_id = %conn_id, storage_key = %key, url = %url)
        }
        SessionEvent::StorageFailed {
            conn_id,
            key,
            error,
        } => warn!(
            event = "storage_error",
            conn_id = %conn_id,
            storage_key = %key,
            error = %error
        ),
        SessionEvent::InvalidLabel { conn_id } => {
            debug!(event = "invalid_label", conn_id = %conn_id)
        }
        SessionEvent::RegistryMiss { conn_id, op } => {
            warn!(event = "registry_miss", conn_id = %conn_id, op = op)
        }
        SessionEvent::Closed { conn_id, session } => match session {
            Some(session) => info!(
                event = "client_disconnected",
                conn_id = %conn_id,
                remote = %session.remote_address,
                label = %session.label
            ),
            None => info!(event = "client_disconnected", conn_id = %conn_id),
        },
    }
}
