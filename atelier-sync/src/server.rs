//! WebSocket endpoint for canvas clients.
//!
//! Architecture:
//! ```text
//! Client A ──┐   accept_hdr_async        ┌──────────────┐
//!            ├── conn task (select!) ──► │  SyncEngine  │ ── ElementStore (RocksDB)
//! Client B ──┘        ▲                  └──────┬───────┘
//!                     └──── outbound queue ◄────┘ (Fanout)
//! ```
//!
//! Startup (`bind`) opens storage, restores the shared state and binds the
//! listener; any failure there is fatal. After that, nothing a client does
//! can take the server down: bad frames are dropped, broken sockets only
//! end their own session.

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::USER_AGENT;
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::{Fanout, DEFAULT_SESSION_CAPACITY};
use crate::engine::{
    Connected, EngineConfig, EngineError, EngineHandle, SyncEngine, DEFAULT_AUTOSAVE_INTERVAL,
};
use crate::persistence::PersistenceGateway;
use crate::protocol::ClientMessage;
use crate::session::ClientMetadata;
use crate::state::SharedState;
use crate::storage::{StoreConfig, StoreError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Outbound frames buffered per session before it is detached
    pub broadcast_capacity: usize,
    /// Interval of the full-state safety-net write
    pub autosave_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            storage_path: None,
            broadcast_capacity: DEFAULT_SESSION_CAPACITY,
            autosave_interval: DEFAULT_AUTOSAVE_INTERVAL,
        }
    }
}

impl ServerConfig {
    /// Loopback, ephemeral port, no persistence.
    pub fn for_testing() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..Self::default()
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to open storage: {0}")]
    Storage(#[from] StoreError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A bound, not yet running sync server.
pub struct SyncServer {
    config: ServerConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    engine: EngineHandle,
    engine_task: JoinHandle<()>,
}

impl SyncServer {
    /// Open storage, restore state, start the engine and bind the listener.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let (state, persistence) = match &config.storage_path {
            Some(path) => {
                let gateway = PersistenceGateway::open(StoreConfig::new(path))?;
                let elements = gateway.load()?;
                log::info!(
                    "loaded {} elements from {}",
                    elements.len(),
                    path.display()
                );
                (SharedState::from_elements(elements), Some(gateway))
            }
            None => {
                log::info!("persistence disabled, canvas state is in-memory only");
                (SharedState::new(), None)
            }
        };

        let addr = config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let engine = SyncEngine::new(state, Fanout::new(config.broadcast_capacity), persistence);
        let (engine, engine_task) = engine.spawn(EngineConfig {
            autosave_interval: config.autosave_interval,
            ..EngineConfig::default()
        });

        log::info!("sync server listening on {local_addr}");
        Ok(Self {
            config,
            listener,
            local_addr,
            engine,
            engine_task,
        })
    }

    /// Address actually bound (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Handle for stats, backups and direct engine access.
    pub fn engine(&self) -> EngineHandle {
        self.engine.clone()
    }

    /// Accept connections until `shutdown` resolves, then stop the engine
    /// (which performs a final save).
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<(), ServerError> {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("shutdown requested");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        log::debug!("new TCP connection from {addr}");
                        let engine = self.engine.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, engine).await {
                                log::warn!("connection error from {addr}: {e}");
                            }
                        });
                    }
                    Err(e) => log::warn!("accept failed: {e}"),
                },
            }
        }

        drop(self.listener);
        self.engine.shutdown().await;
        if let Err(e) = self.engine_task.await {
            log::error!("sync engine task failed: {e}");
        }
        Ok(())
    }
}

/// Handshake, register, then pump frames both ways until either side ends.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    engine: EngineHandle,
) -> Result<(), ServerError> {
    let mut user_agent = String::new();
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        if let Some(value) = req.headers().get(USER_AGENT).and_then(|v| v.to_str().ok()) {
            user_agent = value.to_string();
        }
        Ok(resp)
    };
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;

    let Connected {
        session,
        mut outbound,
    } = engine.connect(ClientMetadata::new(addr, user_agent)).await?;
    let id = session.id;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let result: Result<(), ServerError> = async {
        loop {
            tokio::select! {
                frame = outbound.recv() => match frame {
                    Some(frame) => ws_sender.send(Message::text(frame.to_string())).await?,
                    None => {
                        log::info!("session {id} detached by server, closing");
                        break;
                    }
                },
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Text(text))) => match ClientMessage::decode(text.as_str()) {
                        Ok(message) => engine.inbound(id, message).await?,
                        Err(e) => log::warn!("dropping frame from {id}: {e}"),
                    },
                    Some(Ok(Message::Binary(_))) => {
                        log::warn!("dropping binary frame from {id}");
                    }
                    Some(Ok(Message::Ping(data))) => ws_sender.send(Message::Pong(data)).await?,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        log::debug!("websocket error from {id}: {e}");
                        break;
                    }
                    Some(Ok(_)) => {}
                },
            }
        }
        Ok(())
    }
    .await;

    // The engine may already be gone during shutdown
    let _ = engine.disconnect(id).await;
    let _ = ws_sender.close().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr(), "0.0.0.0:8080");
        assert_eq!(config.broadcast_capacity, 1024);
        assert_eq!(config.autosave_interval, Duration::from_secs(30));
        assert!(config.storage_path.is_none());
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let server = SyncServer::bind(ServerConfig::for_testing()).await.unwrap();
        assert_ne!(server.local_addr().port(), 0);
        assert!(server.engine().is_running());
    }

    #[tokio::test]
    async fn test_port_in_use_is_startup_error() {
        let first = SyncServer::bind(ServerConfig::for_testing()).await.unwrap();
        let config = ServerConfig {
            port: first.local_addr().port(),
            ..ServerConfig::for_testing()
        };
        let err = SyncServer::bind(config).await.err().unwrap();
        assert!(matches!(err, ServerError::Bind { .. }));
    }

    #[tokio::test]
    async fn test_unusable_storage_is_startup_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();

        let config = ServerConfig {
            storage_path: Some(blocker.join("db")),
            ..ServerConfig::for_testing()
        };
        let err = SyncServer::bind(config).await.err().unwrap();
        assert!(matches!(err, ServerError::Storage(_)));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let server = SyncServer::bind(ServerConfig::for_testing()).await.unwrap();
        let engine = server.engine();
        server.run(async {}).await.unwrap();
        assert!(!engine.is_running());
    }
}
