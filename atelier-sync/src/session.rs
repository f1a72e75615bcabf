//! Session registry: one record per live connection.
//!
//! Sessions exist only while their connection is open. They are never
//! persisted, and their ids are meaningless after disconnect.

use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::element::CursorPosition;

/// Transport-assigned connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// What the transport knows about a peer when it connects.
#[derive(Debug, Clone)]
pub struct ClientMetadata {
    pub address: SocketAddr,
    pub user_agent: String,
}

impl ClientMetadata {
    pub fn new(address: SocketAddr, user_agent: impl Into<String>) -> Self {
        Self {
            address,
            user_agent: user_agent.into(),
        }
    }
}

/// Public view of a live connection, as sent in `users-list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub device_name: String,
    pub ip_address: String,
    pub user_agent: String,
    pub connected_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPosition>,
}

/// Best-effort device classification from a client identity string.
///
/// Order matters: mobile and tablet markers win over the desktop OS family,
/// since mobile user agents also mention Linux or Mac.
pub fn device_label(user_agent: &str) -> &'static str {
    if user_agent.contains("Mobile") {
        "Mobile"
    } else if user_agent.contains("Tablet") || user_agent.contains("iPad") {
        "Tablet"
    } else if user_agent.contains("Windows") {
        "Windows PC"
    } else if user_agent.contains("Mac") {
        "Mac"
    } else if user_agent.contains("Linux") {
        "Linux PC"
    } else {
        "Unknown Device"
    }
}

/// Registry of live sessions, in connection order.
///
/// Mutated only by the engine task. `on_connect` / `on_disconnect` return the
/// change so the engine can relay `user-connected` / `user-disconnected`.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: IndexMap<SessionId, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection and derive its public record.
    pub fn on_connect(&mut self, id: SessionId, meta: &ClientMetadata) -> Session {
        let session = Session {
            id,
            device_name: device_label(&meta.user_agent).to_string(),
            ip_address: meta.address.ip().to_string(),
            user_agent: meta.user_agent.clone(),
            connected_at: Utc::now(),
            cursor: None,
        };
        self.sessions.insert(id, session.clone());
        session
    }

    /// Forget a connection. Returns the removed record, `None` if unknown.
    pub fn on_disconnect(&mut self, id: &SessionId) -> Option<Session> {
        self.sessions.shift_remove(id)
    }

    /// Record the latest pointer position. Returns `false` for unknown ids.
    pub fn update_pointer(&mut self, id: &SessionId, position: CursorPosition) -> bool {
        match self.sessions.get_mut(id) {
            Some(session) => {
                session.cursor = Some(position);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &SessionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// All live sessions in connection order.
    pub fn list(&self) -> Vec<Session> {
        self.sessions.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
