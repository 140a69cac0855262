//! The socket gateway — one persistent WebSocket shared by all tasks.
//!
//! The gateway owns the connection lifecycle (including reconnection with
//! capped exponential backoff and a periodic keep-alive ping), correlates
//! room operations with their replies, and fans `chat:*` events out to
//! per-task subscribers. Task state machines talk to it through a small
//! injected interface; it never calls back into them directly.

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, trace, warn};

use crate::protocol::{ChatEvent, Envelope, JoinOptions, JoinReply, MessageKind};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const JOIN_TIMEOUT_SECS: u64 = 10;
const HEARTBEAT_INTERVAL_SECS: u64 = 30;
const RECONNECT_BASE_DELAY_MS: u64 = 500;
const RECONNECT_MAX_DELAY_MS: u64 = 30_000;
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 256;
const ROUTED_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors the gateway surfaces to callers.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Socket is not connected")]
    NotConnected,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Room operation timed out")]
    Timeout,

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// A chat event together with the task id the server attached to it.
/// `task_id` may be absent for events the server routes by subtask only.
#[derive(Debug, Clone)]
pub struct RoutedEvent {
    pub task_id: Option<i64>,
    pub event: ChatEvent,
}

// ---------------------------------------------------------------------------
// SocketGateway
// ---------------------------------------------------------------------------

struct Inner {
    url: String,
    connected: AtomicBool,
    /// Write path into the current connection's writer loop.
    writer: Mutex<Option<mpsc::Sender<Message>>>,
    /// Outstanding room operations awaiting a correlated reply.
    pending: Mutex<HashMap<String, oneshot::Sender<JoinReply>>>,
    /// Per-task event subscribers.
    subscribers: Mutex<HashMap<i64, Vec<mpsc::Sender<ChatEvent>>>>,
    /// All chat events, for the manager's routing loop.
    routed: broadcast::Sender<RoutedEvent>,
    /// Fires after every successful re-establishment of the connection.
    reconnects: broadcast::Sender<()>,
    shutdown: broadcast::Sender<()>,
}

/// Persistent multiplexed socket connection, shared across all tasks.
#[derive(Clone)]
pub struct SocketGateway {
    inner: Arc<Inner>,
}

impl SocketGateway {
    /// Connect to the socket endpoint. Fails if the first connection cannot
    /// be established; afterwards the gateway reconnects on its own.
    pub async fn connect(url: impl Into<String>) -> Result<Self, GatewayError> {
        let url = url.into();
        let (ws, _) = connect_async(&url)
            .await
            .map_err(|e| GatewayError::Transport(format!("Connect to {url} failed: {e}")))?;
        info!("Socket connected to {url}");

        let (routed, _) = broadcast::channel(ROUTED_CHANNEL_CAPACITY);
        let (reconnects, _) = broadcast::channel(8);
        // The receiver is created up front and lives in the supervisor, so a
        // close() issued at any point is never lost.
        let (shutdown, shutdown_rx) = broadcast::channel(1);

        let inner = Arc::new(Inner {
            url,
            connected: AtomicBool::new(false),
            writer: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            routed,
            reconnects,
            shutdown,
        });

        tokio::spawn(supervise(inner.clone(), ws, shutdown_rx));

        Ok(Self { inner })
    }

    /// Whether the socket is currently connected.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Join a task's room and fetch its snapshot. Idempotent per task.
    pub async fn join_task(
        &self,
        task_id: i64,
        options: JoinOptions,
    ) -> Result<JoinReply, GatewayError> {
        if !self.is_connected() {
            return Err(GatewayError::NotConnected);
        }

        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(request_id.clone(), tx);

        let envelope = Envelope::new(
            MessageKind::JoinTask,
            Some(task_id),
            serde_json::to_value(options).unwrap_or_default(),
        )
        .with_request_id(request_id.clone());

        if let Err(e) = self.send(envelope).await {
            self.inner.pending.lock().remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(Duration::from_secs(JOIN_TIMEOUT_SECS), rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(GatewayError::Transport("connection lost during join".into())),
            Err(_) => {
                self.inner.pending.lock().remove(&request_id);
                Err(GatewayError::Timeout)
            }
        }
    }

    /// Release a task's room subscription and drop its local subscribers.
    pub async fn leave_task(&self, task_id: i64) -> Result<(), GatewayError> {
        self.inner.subscribers.lock().remove(&task_id);

        if !self.is_connected() {
            // Nothing to release server-side; the room died with the socket.
            return Ok(());
        }
        let envelope = Envelope::new(MessageKind::LeaveTask, Some(task_id), serde_json::Value::Null);
        self.send(envelope).await
    }

    /// Subscribe to a task's live `chat:*` events.
    pub fn subscribe_task(&self, task_id: i64) -> mpsc::Receiver<ChatEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        self.inner
            .subscribers
            .lock()
            .entry(task_id)
            .or_default()
            .push(tx);
        rx
    }

    /// All chat events with their task ids, for cross-task routing.
    pub fn events(&self) -> broadcast::Receiver<RoutedEvent> {
        self.inner.routed.subscribe()
    }

    /// Notification stream that fires after every reconnect.
    pub fn on_reconnect(&self) -> broadcast::Receiver<()> {
        self.inner.reconnects.subscribe()
    }

    /// Close the connection and stop reconnecting.
    pub fn close(&self) {
        let _ = self.inner.shutdown.send(());
    }

    async fn send(&self, envelope: Envelope) -> Result<(), GatewayError> {
        let json = envelope
            .to_json()
            .map_err(|e| GatewayError::Protocol(format!("Serialize error: {e}")))?;
        let sender = self.inner.writer.lock().clone();
        match sender {
            Some(sender) => sender
                .send(Message::Text(json.into()))
                .await
                .map_err(|_| GatewayError::NotConnected),
            None => Err(GatewayError::NotConnected),
        }
    }
}

// ---------------------------------------------------------------------------
// Connection lifecycle
// ---------------------------------------------------------------------------

/// Supervises the connection: runs it, then reconnects with capped backoff
/// until shutdown. The first (already-established) stream is used as-is.
async fn supervise(inner: Arc<Inner>, first: WsStream, mut shutdown: broadcast::Receiver<()>) {
    let mut next = Some(first);
    let mut backoff_ms = RECONNECT_BASE_DELAY_MS;
    let mut first_session = true;

    loop {
        let ws = match next.take() {
            Some(ws) => ws,
            None => match connect_async(&inner.url).await {
                Ok((ws, _)) => {
                    info!("Socket reconnected to {}", inner.url);
                    backoff_ms = RECONNECT_BASE_DELAY_MS;
                    ws
                }
                Err(e) => {
                    debug!("Reconnect attempt failed: {e}");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                        _ = shutdown.recv() => return,
                    }
                    backoff_ms = (backoff_ms * 2).min(RECONNECT_MAX_DELAY_MS);
                    continue;
                }
            },
        };

        inner.connected.store(true, Ordering::SeqCst);
        if !first_session {
            let _ = inner.reconnects.send(());
        }
        first_session = false;

        let clean_shutdown = run_connection(&inner, ws, &mut shutdown).await;

        inner.connected.store(false, Ordering::SeqCst);
        *inner.writer.lock() = None;
        // Outstanding room operations cannot complete on a dead socket.
        inner.pending.lock().clear();

        if clean_shutdown {
            return;
        }
        warn!("Socket disconnected; reconnecting");
    }
}

/// Drive one established connection until it drops or shutdown is requested.
/// Returns `true` on clean shutdown.
async fn run_connection(
    inner: &Arc<Inner>,
    ws: WsStream,
    shutdown: &mut broadcast::Receiver<()>,
) -> bool {
    let (mut sink, mut stream) = ws.split();
    let (writer_tx, mut writer_rx) = mpsc::channel::<Message>(64);
    *inner.writer.lock() = Some(writer_tx);

    let mut heartbeat = tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
    heartbeat.tick().await; // first tick fires immediately; skip it

    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => handle_incoming(inner, &text),
                    Some(Ok(Message::Close(_))) => {
                        debug!("Server closed the socket");
                        return false;
                    }
                    Some(Ok(_)) => {} // Ignore binary/ping/pong frames
                    Some(Err(e)) => {
                        debug!("Socket read error: {e}");
                        return false;
                    }
                    None => return false,
                }
            }
            outgoing = writer_rx.recv() => {
                let Some(msg) = outgoing else { return false };
                if let Err(e) = sink.send(msg).await {
                    debug!("Socket write error: {e}");
                    return false;
                }
            }
            _ = heartbeat.tick() => {
                let ping = Envelope::new(MessageKind::Ping, None, serde_json::Value::Null);
                if let Ok(json) = ping.to_json() {
                    if sink.send(Message::Text(json.into())).await.is_err() {
                        return false;
                    }
                }
            }
            _ = shutdown.recv() => {
                let _ = sink.send(Message::Close(None)).await;
                return true;
            }
        }
    }
}

/// Dispatch one incoming text frame.
fn handle_incoming(inner: &Arc<Inner>, text: &str) {
    let envelope = match Envelope::from_json(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("Bad envelope from server: {e}");
            return;
        }
    };

    match &envelope.kind {
        MessageKind::JoinReply | MessageKind::LeaveReply => {
            let Some(request_id) = envelope.request_id.as_deref() else {
                warn!("Reply without request id");
                return;
            };
            let Some(tx) = inner.pending.lock().remove(request_id) else {
                debug!("Reply for unknown request {request_id}");
                return;
            };
            let reply = serde_json::from_value::<JoinReply>(envelope.payload).unwrap_or_default();
            let _ = tx.send(reply);
        }
        MessageKind::Pong => trace!("Heartbeat acknowledged"),
        kind if kind.is_chat_event() => {
            let Some(event) = ChatEvent::parse(kind, envelope.payload) else {
                warn!("Chat event with malformed payload: {kind:?}");
                return;
            };
            deliver_event(inner, envelope.task_id, event);
        }
        other => debug!("Ignoring server-bound kind {other:?}"),
    }
}

/// Fan an event out to the task's subscribers and the routing stream.
fn deliver_event(inner: &Arc<Inner>, task_id: Option<i64>, event: ChatEvent) {
    if let Some(task_id) = task_id {
        let mut subscribers = inner.subscribers.lock();
        if let Some(list) = subscribers.get_mut(&task_id) {
            list.retain(|tx| match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Dropping event for slow subscriber of task {task_id}");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
            if list.is_empty() {
                subscribers.remove(&task_id);
            }
        }
    }

    let _ = inner.routed.send(RoutedEvent { task_id, event });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
