//! Transport Manager: one persistent WebSocket to the sync server with
//! automatic reconnection and an offline queue.
//!
//! Lifecycle:
//! ```text
//!  Disconnected ──connect()──► Connecting ──ok──► Connected ◄─────────┐
//!       ▲                          │err               │ lost          │ ok
//!       │                          ▼                  ▼               │
//!       └──── disconnect() ◄── (Err returned)    Reconnecting ──retry─┘
//! ```
//! On every (re)connection the pending queue is flushed first, in submission
//! order. A *re*connection then asks for `request-canvas-state` so the local
//! mirror is rebuilt from server truth.
//!
//! Connection state, the pending queue and the live outgoing channel share one
//! lock, so a `send` either lands in the queue before the flush or on the
//! channel after it, never in between.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, InvalidHeaderValue, USER_AGENT};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::backoff::{Backoff, BackoffConfig};
use super::queue::{PendingQueue, DEFAULT_QUEUE_CAPACITY};
use super::Outbox;
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    /// A lost connection came back; a fresh snapshot has been requested.
    Reconnected,
    Disconnected { reason: String },
    /// About to make reconnection attempt `n` (1-based).
    Reconnecting(u32),
    Error(String),
    Message(ServerMessage),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("connection timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid user agent: {0}")]
    InvalidHeader(#[from] InvalidHeaderValue),
    #[error("pending queue full ({0} messages), message dropped")]
    QueueFull(usize),
    #[error("connect cancelled by disconnect")]
    Cancelled,
    #[error("connection attempt ended without connecting")]
    NotConnected,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// `ws://host:port` of the sync server
    pub url: String,
    pub backoff: BackoffConfig,
    pub queue_capacity: usize,
    pub connect_timeout: Duration,
    /// Sent as `User-Agent` so the server can label the device
    pub user_agent: Option<String>,
}

impl TransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            backoff: BackoffConfig::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            connect_timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }

    pub fn for_testing(url: impl Into<String>) -> Self {
        Self {
            backoff: BackoffConfig::for_testing(),
            connect_timeout: Duration::from_secs(2),
            ..Self::new(url)
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}

struct Inner {
    state: ConnectionState,
    /// Mirrors `state` for callers waiting on a transition
    status: watch::Sender<ConnectionState>,
    /// Bumped by every `connect` and `disconnect`; a first connect whose
    /// number is stale by the time its socket opens was cancelled.
    attempt: u64,
    queue: PendingQueue,
    /// Live only while `state == Connected`
    outgoing: Option<mpsc::UnboundedSender<ClientMessage>>,
    subscribers: Vec<mpsc::UnboundedSender<TransportEvent>>,
    supervisor: Option<Supervisor>,
}

impl Inner {
    fn emit(&mut self, event: TransportEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.status.send_replace(state);
    }
}

struct Supervisor {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct TransportManager {
    config: Arc<TransportConfig>,
    inner: Arc<Mutex<Inner>>,
}

impl TransportManager {
    pub fn new(config: TransportConfig) -> Self {
        let queue = PendingQueue::new(config.queue_capacity);
        let (status, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config: Arc::new(config),
            inner: Arc::new(Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                status,
                attempt: 0,
                queue,
                outgoing: None,
                subscribers: Vec::new(),
                supervisor: None,
            })),
        }
    }

    /// Open the connection and resolve once it is live.
    ///
    /// Fails if the first attempt fails or `disconnect` is called before it
    /// completes. After a successful first connect, later drops are retried
    /// in the background. While another connect or a reconnection is in
    /// flight this waits for its outcome instead of dialling again.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let (attempt, mut status) = {
            let mut inner = lock(&self.inner);
            match inner.state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting | ConnectionState::Reconnecting => (None, inner.status.subscribe()),
                ConnectionState::Disconnected => {
                    inner.attempt += 1;
                    inner.set_state(ConnectionState::Connecting);
                    (Some(inner.attempt), inner.status.subscribe())
                }
            }
        };
        let Some(attempt) = attempt else {
            return wait_connected(status).await;
        };

        let result = tokio::select! {
            result = open_socket(&self.config) => result,
            _ = status.wait_for(|s| *s == ConnectionState::Disconnected) => {
                return Err(TransportError::Cancelled);
            }
        };

        let mut inner = lock(&self.inner);
        if inner.attempt != attempt || inner.state != ConnectionState::Connecting {
            // disconnect() ran while the socket was opening; dropping `ws`
            // closes it
            return Err(TransportError::Cancelled);
        }
        let ws = match result {
            Ok(ws) => ws,
            Err(e) => {
                inner.set_state(ConnectionState::Disconnected);
                inner.emit(TransportEvent::Error(e.to_string()));
                return Err(e);
            }
        };

        log::info!("connected to {}", self.config.url);
        let outgoing = go_live(&mut inner, false);
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(supervise(
            Arc::clone(&self.inner),
            Arc::clone(&self.config),
            ws,
            outgoing,
            stop_rx,
        ));
        if let Some(old) = inner.supervisor.replace(Supervisor { stop, task }) {
            old.task.abort();
        }
        Ok(())
    }

    /// Transmit now if connected, otherwise queue for the next connection.
    pub fn send(&self, message: ClientMessage) -> Result<(), TransportError> {
        let mut inner = lock(&self.inner);
        if inner.state == ConnectionState::Connected {
            if let Some(tx) = &inner.outgoing {
                match tx.send(message) {
                    Ok(()) => return Ok(()),
                    // Session task already gone; fall through to the queue
                    Err(mpsc::error::SendError(message)) => return enqueue(&mut inner, message),
                }
            }
        }
        enqueue(&mut inner, message)
    }

    /// Close the connection and stop reconnecting.
    pub async fn disconnect(&self) {
        let supervisor = {
            let mut inner = lock(&self.inner);
            inner.attempt += 1;
            inner.supervisor.take()
        };
        if let Some(Supervisor { stop, mut task }) = supervisor {
            let _ = stop.send(true);
            if tokio::time::timeout(Duration::from_secs(1), &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }

        let mut inner = lock(&self.inner);
        inner.outgoing = None;
        if inner.state != ConnectionState::Disconnected {
            inner.set_state(ConnectionState::Disconnected);
            inner.emit(TransportEvent::Disconnected {
                reason: "client disconnect".to_string(),
            });
        }
        log::info!("disconnected from {}", self.config.url);
    }

    /// Receive every transport event from now on. Drop the receiver to
    /// unsubscribe.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.inner).subscribers.push(tx);
        rx
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner).state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.inner).queue.len()
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }
}

impl Outbox for TransportManager {
    fn enqueue(&self, message: ClientMessage) {
        if let Err(e) = self.send(message) {
            log::warn!("{e}");
        }
    }
}

impl Drop for TransportManager {
    fn drop(&mut self) {
        if let Some(supervisor) = lock(&self.inner).supervisor.take() {
            supervisor.task.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn enqueue(inner: &mut Inner, message: ClientMessage) -> Result<(), TransportError> {
    if inner.queue.enqueue(message) {
        log::debug!("queued message, {} pending", inner.queue.len());
        Ok(())
    } else {
        let capacity = inner.queue.capacity();
        let err = TransportError::QueueFull(capacity);
        inner.emit(TransportEvent::Error(err.to_string()));
        Err(err)
    }
}

async fn wait_connected(mut status: watch::Receiver<ConnectionState>) -> Result<(), TransportError> {
    let state = status
        .wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Disconnected))
        .await
        .map(|s| *s)
        .map_err(|_| TransportError::NotConnected)?;
    match state {
        ConnectionState::Connected => Ok(()),
        _ => Err(TransportError::NotConnected),
    }
}

async fn open_socket(config: &TransportConfig) -> Result<WsStream, TransportError> {
    let mut request = config.url.as_str().into_client_request()?;
    if let Some(user_agent) = &config.user_agent {
        request
            .headers_mut()
            .insert(USER_AGENT, HeaderValue::from_str(user_agent)?);
    }
    let (ws, _) = tokio::time::timeout(
        config.connect_timeout,
        tokio_tungstenite::connect_async(request),
    )
    .await
    .map_err(|_| TransportError::Timeout(config.connect_timeout))??;
    Ok(ws)
}

/// Flush the queue onto a fresh outgoing channel and mark the connection live.
/// Callers hold the lock across the whole step.
fn go_live(inner: &mut Inner, reconnect: bool) -> mpsc::UnboundedReceiver<ClientMessage> {
    let (tx, rx) = mpsc::unbounded_channel();

    if let Some(age) = inner.queue.oldest_age() {
        log::info!(
            "replaying {} queued messages, oldest waited {age:.1?}",
            inner.queue.len()
        );
    }
    let queued = inner.queue.drain();
    for message in queued {
        let _ = tx.send(message);
    }
    if reconnect {
        let _ = tx.send(ClientMessage::RequestCanvasState);
    }

    inner.outgoing = Some(tx);
    inner.set_state(ConnectionState::Connected);
    if reconnect {
        inner.emit(TransportEvent::Reconnected);
    }
    inner.emit(TransportEvent::Connected);
    rx
}

enum SessionEnd {
    Stopped,
    Lost {
        reason: String,
        unsent: Option<ClientMessage>,
    },
}

/// Mark the connection down and put everything not yet written back in the
/// queue, ahead of anything sent afterwards.
fn go_down(
    inner: &Mutex<Inner>,
    mut outgoing: mpsc::UnboundedReceiver<ClientMessage>,
    unsent: Option<ClientMessage>,
    reason: String,
) {
    let mut inner = lock(inner);
    inner.outgoing = None;
    inner.set_state(ConnectionState::Reconnecting);

    let mut requeue: Vec<ClientMessage> = unsent.into_iter().collect();
    while let Ok(message) = outgoing.try_recv() {
        requeue.push(message);
    }
    for message in requeue {
        // Snapshot requests are reissued on reconnect anyway
        if message != ClientMessage::RequestCanvasState && !inner.queue.enqueue(message) {
            log::warn!("pending queue full, dropping unsent message");
        }
    }
    inner.emit(TransportEvent::Disconnected { reason });
}

async fn supervise(
    inner: Arc<Mutex<Inner>>,
    config: Arc<TransportConfig>,
    mut ws: WsStream,
    mut outgoing: mpsc::UnboundedReceiver<ClientMessage>,
    mut stop: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(config.backoff.clone());

    loop {
        let (sink, stream) = ws.split();
        match run_session(&inner, sink, stream, &mut outgoing, &mut stop).await {
            SessionEnd::Stopped => return,
            SessionEnd::Lost { reason, unsent } => {
                log::warn!("connection to {} lost: {reason}", config.url);
                go_down(&inner, outgoing, unsent, reason);
            }
        }

        ws = loop {
            let Some((attempt, delay)) = backoff.next_delay() else {
                let mut guard = lock(&inner);
                guard.set_state(ConnectionState::Disconnected);
                guard.emit(TransportEvent::Error(format!(
                    "giving up after {} reconnection attempts",
                    backoff.attempt()
                )));
                return;
            };
            lock(&inner).emit(TransportEvent::Reconnecting(attempt));
            log::info!("reconnection attempt {attempt} in {delay:?}");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop.changed() => return,
            }
            let result = tokio::select! {
                result = open_socket(&config) => result,
                _ = stop.changed() => return,
            };
            match result {
                Ok(ws) => break ws,
                Err(e) => {
                    log::debug!("reconnection attempt {attempt} failed: {e}");
                    lock(&inner).emit(TransportEvent::Error(e.to_string()));
                }
            }
        };

        log::info!("reconnected to {}", config.url);
        backoff.reset();
        outgoing = go_live(&mut lock(&inner), true);
    }
}

async fn run_session(
    inner: &Mutex<Inner>,
    mut sink: SplitSink<WsStream, Message>,
    mut stream: SplitStream<WsStream>,
    outgoing: &mut mpsc::UnboundedReceiver<ClientMessage>,
    stop: &mut watch::Receiver<bool>,
) -> SessionEnd {
    loop {
        tokio::select! {
            message = outgoing.recv() => {
                let Some(message) = message else {
                    return SessionEnd::Lost { reason: "outgoing channel closed".into(), unsent: None };
                };
                let text = match message.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        log::error!("dropping unencodable {}: {e}", message.event_name());
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::text(text)).await {
                    return SessionEnd::Lost { reason: e.to_string(), unsent: Some(message) };
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match ServerMessage::decode(text.as_str()) {
                    Ok(message) => {
                        lock(inner).emit(TransportEvent::Message(message));
                    }
                    Err(e) => log::warn!("dropping frame from server: {e}"),
                },
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .filter(|r| !r.is_empty())
                        .unwrap_or_else(|| "server closed connection".to_string());
                    return SessionEnd::Lost { reason, unsent: None };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return SessionEnd::Lost { reason: e.to_string(), unsent: None },
                None => return SessionEnd::Lost { reason: "connection closed".into(), unsent: None },
            },
            _ = stop.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                return SessionEnd::Stopped;
            }
        }
    }
}
