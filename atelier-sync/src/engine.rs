//! Broadcast Engine: the single owner of all server-side canvas state.
//!
//! Architecture:
//! ```text
//!  conn task A ─┐                          ┌─► Fanout ─► conn task A
//!  conn task B ─┼─► mpsc<EngineCommand> ──►│ SyncEngine│ ─► conn task B
//!  host / bin  ─┘                          └─┬─────────┘
//!                                            ├─ SessionRegistry
//!                                            ├─ SharedState
//!                                            └─ PersistenceGateway ─► RocksDB
//! ```
//!
//! Commands are handled to completion one at a time. That gives per-session
//! ordering and last-write-wins across sessions without any lock: the store
//! reflects whichever update the engine dequeued last.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::broadcast::{Fanout, Frame};
use crate::persistence::PersistenceGateway;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::session::{ClientMetadata, Session, SessionId, SessionRegistry};
use crate::state::SharedState;
use crate::storage::{StoreError, StoreStats};

/// Default interval of the full-state safety-net write.
pub const DEFAULT_AUTOSAVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub autosave_interval: Duration,
    /// Commands buffered before connection tasks wait on the engine
    pub command_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            autosave_interval: DEFAULT_AUTOSAVE_INTERVAL,
            command_capacity: 4096,
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("sync engine is not running")]
    Stopped,
    #[error("persistence is disabled")]
    PersistenceDisabled,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Server health snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub sessions: usize,
    pub elements: usize,
    pub messages_in: u64,
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub persistence_failures: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StoreStats>,
}

/// Result of a successful connect: the public record plus the session's
/// outbound queue, already holding `users-list` and `canvas-state-sync`.
#[derive(Debug)]
pub struct Connected {
    pub session: Session,
    pub outbound: mpsc::Receiver<Frame>,
}

pub enum EngineCommand {
    Connect {
        meta: ClientMetadata,
        reply: oneshot::Sender<Connected>,
    },
    Inbound {
        session: SessionId,
        message: ClientMessage,
    },
    Disconnect {
        session: SessionId,
    },
    Stats {
        reply: oneshot::Sender<EngineStats>,
    },
    Backup {
        target: Option<PathBuf>,
        reply: oneshot::Sender<Result<PathBuf, EngineError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

pub struct SyncEngine {
    registry: SessionRegistry,
    state: SharedState,
    fanout: Fanout,
    persistence: Option<PersistenceGateway>,
    messages_in: u64,
    autosave: Option<JoinHandle<()>>,
}

impl SyncEngine {
    pub fn new(state: SharedState, fanout: Fanout, persistence: Option<PersistenceGateway>) -> Self {
        Self {
            registry: SessionRegistry::new(),
            state,
            fanout,
            persistence,
            messages_in: 0,
            autosave: None,
        }
    }

    /// In-memory engine with default fan-out capacity.
    pub fn in_memory() -> Self {
        Self::new(SharedState::new(), Fanout::default(), None)
    }

    // ─── Event handling ───────────────────────────────────────────────

    /// Register a session and queue its baseline before anything else.
    pub fn connect(&mut self, meta: &ClientMetadata) -> Connected {
        let id = SessionId::new();
        let session = self.registry.on_connect(id, meta);
        let outbound = self.fanout.attach(id);

        if let Some(frame) = encode(&ServerMessage::UsersList(self.registry.list())) {
            self.fanout.unicast(&id, frame);
        }
        if let Some(frame) = encode(&ServerMessage::CanvasStateSync(self.state.snapshot())) {
            self.fanout.unicast(&id, frame);
        }
        if let Some(frame) = encode(&ServerMessage::UserConnected(session.clone())) {
            self.fanout.broadcast_except(Some(&id), frame);
        }

        log::info!(
            "session {id} connected from {} ({}), {} online",
            session.ip_address,
            session.device_name,
            self.registry.len()
        );
        Connected { session, outbound }
    }

    /// Forget a session and tell everyone else. Unknown ids are ignored.
    pub fn disconnect(&mut self, id: &SessionId) -> Option<Session> {
        self.fanout.detach(id);
        let session = self.registry.on_disconnect(id)?;
        if let Some(frame) = encode(&ServerMessage::UserDisconnected(*id)) {
            self.fanout.broadcast_except(Some(id), frame);
        }
        log::info!("session {id} disconnected, {} online", self.registry.len());
        Some(session)
    }

    /// Apply one inbound event: mutate, persist, relay.
    pub fn handle(&mut self, from: &SessionId, message: ClientMessage) {
        if !self.registry.contains(from) {
            log::debug!("dropping {} from unknown session {from}", message.event_name());
            return;
        }
        self.messages_in += 1;

        let relay = match message {
            ClientMessage::CanvasElementAdd(element) => {
                log::debug!("{from} added {} {}", element.kind, element.id);
                self.upsert(&element);
                ServerMessage::CanvasElementAdd(element)
            }
            ClientMessage::CanvasUpdate(element) => {
                log::debug!("{from} updated {} {}", element.kind, element.id);
                self.upsert(&element);
                ServerMessage::CanvasUpdate(element)
            }
            ClientMessage::CanvasElementRemove(id) => {
                log::debug!("{from} removed {id}");
                self.state.apply_remove(&id);
                if let Some(gw) = &self.persistence {
                    gw.remove(&id);
                }
                ServerMessage::CanvasElementRemove(id)
            }
            ClientMessage::RequestCanvasState => {
                let snapshot = self.state.snapshot();
                log::debug!("sending {} elements to {from}", snapshot.len());
                if let Some(frame) = encode(&ServerMessage::CanvasStateSync(snapshot)) {
                    self.fanout.unicast(from, frame);
                }
                return;
            }
            ClientMessage::UserCursor(position) => {
                self.registry.update_pointer(from, position.clone());
                ServerMessage::UserCursor {
                    user_id: *from,
                    position,
                }
            }
            ClientMessage::ClipboardSync(data) => ServerMessage::ClipboardSync(data),
            ClientMessage::FileUpload(meta) => {
                log::debug!("{from} uploaded {}", meta.filename);
                ServerMessage::FileUpload(meta)
            }
        };

        if let Some(frame) = encode(&relay) {
            self.fanout.broadcast_except(Some(from), frame);
        }
    }

    fn upsert(&mut self, element: &crate::element::Element) {
        self.state.apply_upsert(element.clone());
        if let Some(gw) = &self.persistence {
            gw.persist_one(element);
        }
    }

    // ─── Accessors ────────────────────────────────────────────────────

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn stats(&self) -> EngineStats {
        let fanout = self.fanout.stats();
        EngineStats {
            sessions: self.registry.len(),
            elements: self.state.len(),
            messages_in: self.messages_in,
            messages_sent: fanout.messages_sent,
            messages_dropped: fanout.messages_dropped,
            persistence_failures: self
                .persistence
                .as_ref()
                .map_or(0, PersistenceGateway::failure_count),
            storage: None,
        }
    }

    // ─── Task loop ────────────────────────────────────────────────────

    /// Move the engine onto its own task.
    pub fn spawn(self, config: EngineConfig) -> (EngineHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.command_capacity.max(1));
        let task = tokio::spawn(self.run(rx, config.autosave_interval));
        (EngineHandle { tx }, task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<EngineCommand>, autosave_interval: Duration) {
        let period = autosave_interval.max(Duration::from_millis(10));
        let mut autosave = tokio::time::interval_at(Instant::now() + period, period);
        autosave.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let persistent = self.persistence.is_some();

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => {
                        if let Some(reply) = self.dispatch(cmd) {
                            self.shutdown().await;
                            let _ = reply.send(());
                            return;
                        }
                    }
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
                _ = autosave.tick(), if persistent => self.start_autosave(),
            }
        }
    }

    /// Handle one command. Returns the reply channel when asked to stop.
    fn dispatch(&mut self, cmd: EngineCommand) -> Option<oneshot::Sender<()>> {
        match cmd {
            EngineCommand::Connect { meta, reply } => {
                let connected = self.connect(&meta);
                let id = connected.session.id;
                if reply.send(connected).is_err() {
                    // Connection task went away before the handshake finished
                    self.disconnect(&id);
                }
            }
            EngineCommand::Inbound { session, message } => self.handle(&session, message),
            EngineCommand::Disconnect { session } => {
                self.disconnect(&session);
            }
            EngineCommand::Stats { reply } => {
                let mut stats = self.stats();
                match self.persistence.clone() {
                    Some(gw) => {
                        tokio::spawn(async move {
                            stats.storage = gw
                                .stats()
                                .await
                                .inspect_err(|e| log::warn!("storage stats unavailable: {e}"))
                                .ok();
                            let _ = reply.send(stats);
                        });
                    }
                    None => {
                        let _ = reply.send(stats);
                    }
                }
            }
            EngineCommand::Backup { target, reply } => match self.persistence.clone() {
                Some(gw) => {
                    tokio::spawn(async move {
                        let _ = reply.send(gw.backup(target).await.map_err(EngineError::from));
                    });
                }
                None => {
                    let _ = reply.send(Err(EngineError::PersistenceDisabled));
                }
            },
            EngineCommand::Shutdown { reply } => return Some(reply),
        }
        None
    }

    /// Kick off the periodic batch unless the previous one is still running.
    fn start_autosave(&mut self) {
        let Some(gw) = self.persistence.clone() else {
            return;
        };
        if self.autosave.as_ref().is_some_and(|task| !task.is_finished()) {
            log::debug!("previous autosave still running, skipping tick");
            return;
        }
        let as_of = gw.generation();
        let snapshot = self.state.snapshot();
        self.autosave = Some(tokio::spawn(async move {
            let _ = gw.persist_batch(snapshot, as_of).await;
        }));
    }

    async fn shutdown(&mut self) {
        if let Some(task) = self.autosave.take() {
            let _ = task.await;
        }
        if let Some(gw) = &self.persistence {
            let as_of = gw.generation();
            if let Err(e) = gw.persist_batch(self.state.snapshot(), as_of).await {
                log::error!("final save failed: {e}");
            }
        }
        log::info!(
            "sync engine stopped ({} elements, {} sessions)",
            self.state.len(),
            self.registry.len()
        );
    }
}

fn encode(message: &ServerMessage) -> Option<Frame> {
    match message.encode() {
        Ok(text) => Some(Frame::from(text)),
        Err(e) => {
            log::error!("failed to encode {}: {e}", message.event_name());
            None
        }
    }
}

/// Cloneable front door to a running [`SyncEngine`].
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    pub async fn connect(&self, meta: ClientMetadata) -> Result<Connected, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Connect { meta, reply }).await?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    pub async fn inbound(&self, session: SessionId, message: ClientMessage) -> Result<(), EngineError> {
        self.send(EngineCommand::Inbound { session, message }).await
    }

    pub async fn disconnect(&self, session: SessionId) -> Result<(), EngineError> {
        self.send(EngineCommand::Disconnect { session }).await
    }

    pub async fn stats(&self) -> Result<EngineStats, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Stats { reply }).await?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    pub async fn backup(&self, target: Option<PathBuf>) -> Result<PathBuf, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Backup { target, reply }).await?;
        rx.await.map_err(|_| EngineError::Stopped)?
    }

    /// Stop the engine after a final save. Idempotent.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(EngineCommand::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    async fn send(&self, cmd: EngineCommand) -> Result<(), EngineError> {
        self.tx.send(cmd).await.map_err(|_| EngineError::Stopped)
    }
}
