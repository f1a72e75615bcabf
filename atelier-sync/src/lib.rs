//! # atelier-sync: real-time canvas synchronisation for Atelier
//!
//! Keeps a shared canvas of notes, files and groups consistent across every
//! client on the local network, and survives both network drops and server
//! restarts.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐    JSON frames     ┌──────────────────┐
//! │ TransportManager │ ◄────────────────► │    SyncServer    │
//! │ + PendingQueue   │  {"event","data"}  │ (conn per task)  │
//! └────────┬─────────┘                    └────────┬─────────┘
//!          │                                       │ EngineHandle
//!          ▼                                       ▼
//! ┌──────────────────┐                    ┌──────────────────┐
//! │   LocalMirror    │                    │    SyncEngine    │── Fanout
//! │ (Origin::Local / │                    │ registry + state │
//! │  Origin::Remote) │                    └────────┬─────────┘
//! └──────────────────┘                             │
//!                                       ┌──────────┴───────────┐
//!                                       │  PersistenceGateway  │
//!                                       │ ElementStore (Rocks) │
//!                                       └──────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`element`]: canvas data model
//! - [`protocol`]: JSON wire events, one enum per direction
//! - [`session`]: connected clients and device labels
//! - [`state`]: authoritative, insertion-ordered element map
//! - [`broadcast`]: per-session bounded outbound queues
//! - [`engine`]: single-owner event loop applying and relaying mutations
//! - [`persistence`] / [`storage`]: durable element store
//! - [`server`]: WebSocket endpoint
//! - [`control`]: line-delimited JSON control channel for a host process
//! - [`client`]: reconnecting transport, optimistic mirror, presence

pub mod broadcast;
pub mod client;
pub mod control;
pub mod element;
pub mod engine;
pub mod persistence;
pub mod protocol;
pub mod server;
pub mod session;
pub mod state;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{Fanout, FanoutStats};
pub use client::{
    ConnectionState, LocalMirror, Mutation, Origin, Outbox, PresenceRoster, TransportConfig,
    TransportError, TransportEvent, TransportManager,
};
pub use element::{
    ClipboardData, ClipboardKind, CursorPosition, Element, ElementContent, ElementKind,
    ElementMetadata, FileMetadata, FileReference, GroupInfo, Point, Size,
};
pub use engine::{EngineConfig, EngineError, EngineHandle, EngineStats, SyncEngine};
pub use persistence::PersistenceGateway;
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
pub use server::{ServerConfig, ServerError, SyncServer};
pub use session::{ClientMetadata, Session, SessionId, SessionRegistry};
pub use state::SharedState;
pub use storage::{ElementStore, StoreConfig, StoreError, StoreStats};
