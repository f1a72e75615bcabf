//! JSON event protocol between canvas clients and the sync server.
//!
//! Wire format (one WebSocket text frame per event):
//! ```text
//! ┌───────────────────────────────┬──────────────────────────────┐
//! │ "event": kebab-case name      │ "data": payload (optional)   │
//! └───────────────────────────────┴──────────────────────────────┘
//!   {"event":"canvas-element-add","data":{"id":"note-1",...}}
//!   {"event":"request-canvas-state"}
//! ```
//!
//! Each direction has its own closed enum so a handler can only ever see
//! payloads valid for that direction.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::element::{ClipboardData, CursorPosition, Element, FileMetadata};
use crate::session::{Session, SessionId};

/// Events a client sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Full replacement of an existing element.
    CanvasUpdate(Element),
    CanvasElementAdd(Element),
    /// Element id to delete.
    CanvasElementRemove(String),
    /// Ask for a fresh `canvas-state-sync`.
    RequestCanvasState,
    ClipboardSync(ClipboardData),
    UserCursor(CursorPosition),
    FileUpload(FileMetadata),
}

/// Events the server sends to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Complete store content in insertion order.
    CanvasStateSync(Vec<Element>),
    CanvasUpdate(Element),
    CanvasElementAdd(Element),
    CanvasElementRemove(String),
    ClipboardSync(ClipboardData),
    UserCursor {
        #[serde(rename = "userId")]
        user_id: SessionId,
        position: CursorPosition,
    },
    FileUpload(FileMetadata),
    UsersList(Vec<Session>),
    UserConnected(Session),
    UserDisconnected(SessionId),
}

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(#[source] serde_json::Error),
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),
}

impl ClientMessage {
    /// Wire name of this event, for logs.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::CanvasUpdate(_) => "canvas-update",
            Self::CanvasElementAdd(_) => "canvas-element-add",
            Self::CanvasElementRemove(_) => "canvas-element-remove",
            Self::RequestCanvasState => "request-canvas-state",
            Self::ClipboardSync(_) => "clipboard-sync",
            Self::UserCursor(_) => "user-cursor",
            Self::FileUpload(_) => "file-upload",
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Serialization)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Malformed)
    }
}

impl ServerMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::CanvasStateSync(_) => "canvas-state-sync",
            Self::CanvasUpdate(_) => "canvas-update",
            Self::CanvasElementAdd(_) => "canvas-element-add",
            Self::CanvasElementRemove(_) => "canvas-element-remove",
            Self::ClipboardSync(_) => "clipboard-sync",
            Self::UserCursor { .. } => "user-cursor",
            Self::FileUpload(_) => "file-upload",
            Self::UsersList(_) => "users-list",
            Self::UserConnected(_) => "user-connected",
            Self::UserDisconnected(_) => "user-disconnected",
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Serialization)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Malformed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_add_wire_shape() {
        let msg = ClientMessage::CanvasElementAdd(Element::note("note-1", "hello", "a"));
        let json: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();

        assert_eq!(json["event"], "canvas-element-add");
        assert_eq!(json["data"]["id"], "note-1");
        assert_eq!(json["data"]["content"], "hello");
    }

    #[test]
    fn test_request_state_has_no_payload() {
        let text = ClientMessage::RequestCanvasState.encode().unwrap();
        assert_eq!(text, r#"{"event":"request-canvas-state"}"#);
        assert_eq!(
            ClientMessage::decode(&text).unwrap(),
            ClientMessage::RequestCanvasState
        );
    }

    #[test]
    fn test_decode_browser_remove() {
        let msg = ClientMessage::decode(r#"{"event":"canvas-element-remove","data":"note-9"}"#).unwrap();
        assert_eq!(msg, ClientMessage::CanvasElementRemove("note-9".into()));
        assert_eq!(msg.event_name(), "canvas-element-remove");
    }

    #[test]
    fn test_decode_cursor_without_element() {
        let msg = ClientMessage::decode(r#"{"event":"user-cursor","data":{"x":12.5,"y":-4}}"#).unwrap();
        assert_eq!(msg, ClientMessage::UserCursor(CursorPosition::new(12.5, -4.0)));
    }

    #[test]
    fn test_server_cursor_wire_shape() {
        let id = SessionId::new();
        let msg = ServerMessage::UserCursor {
            user_id: id,
            position: CursorPosition::new(1.0, 2.0),
        };
        let json: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();

        assert_eq!(json["event"], "user-cursor");
        assert_eq!(json["data"]["userId"], id.to_string());
        assert_eq!(json["data"]["position"]["x"], 1.0);
    }

    #[test]
    fn test_user_disconnected_carries_plain_id() {
        let id = SessionId::new();
        let json: serde_json::Value =
            serde_json::from_str(&ServerMessage::UserDisconnected(id).encode().unwrap()).unwrap();
        assert_eq!(json["data"], id.to_string());
    }

    #[test]
    fn test_state_sync_preserves_order() {
        let elements = vec![
            Element::note("c", "", "u"),
            Element::note("a", "", "u"),
            Element::note("b", "", "u"),
        ];
        let text = ServerMessage::CanvasStateSync(elements.clone()).encode().unwrap();
        match ServerMessage::decode(&text).unwrap() {
            ServerMessage::CanvasStateSync(decoded) => assert_eq!(decoded, elements),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_malformed_frames_rejected() {
        assert!(matches!(
            ClientMessage::decode("not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(ClientMessage::decode(r#"{"event":"no-such-event"}"#).is_err());
        // Server-only event is not accepted from clients
        assert!(ClientMessage::decode(r#"{"event":"users-list","data":[]}"#).is_err());
        // Wrong payload type
        assert!(ClientMessage::decode(r#"{"event":"canvas-element-remove","data":42}"#).is_err());
    }
}
