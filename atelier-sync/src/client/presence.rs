//! Who else is on the canvas, and where their pointers are.
//!
//! ```text
//! local pointer move
//!       │
//!       ▼
//! PresenceRoster::update_local_pointer()   (throttled to 30 fps, silent offline)
//!       │
//!       ▼
//! ClientMessage::UserCursor ──► server ──► ServerMessage::UserCursor { userId }
//!                                                   │
//!                                                   ▼
//!                                 remote PresenceRoster::handle_server_message()
//! ```

use std::collections::HashMap;
use std::time::{Duration, Instant};

use indexmap::IndexMap;

use super::transport::TransportEvent;
use crate::element::CursorPosition;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::session::{Session, SessionId};

/// Minimum spacing of outgoing pointer updates (30 fps).
pub const POINTER_EMIT_INTERVAL: Duration = Duration::from_millis(33);

/// Last pointer position reported for a remote user.
#[derive(Debug, Clone, PartialEq)]
pub struct RemotePointer {
    pub position: CursorPosition,
    pub received_at: Instant,
}

impl RemotePointer {
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.received_at.elapsed() > timeout
    }
}

#[derive(Debug)]
pub struct PresenceRoster {
    /// Connected users in connection order
    users: IndexMap<SessionId, Session>,
    pointers: HashMap<SessionId, RemotePointer>,
    connected: bool,
    local_pointer: Option<CursorPosition>,
    last_emit: Option<Instant>,
    emit_interval: Duration,
}

impl Default for PresenceRoster {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceRoster {
    pub fn new() -> Self {
        Self::with_interval(POINTER_EMIT_INTERVAL)
    }

    /// Custom throttle interval (tests).
    pub fn with_interval(emit_interval: Duration) -> Self {
        Self {
            users: IndexMap::new(),
            pointers: HashMap::new(),
            connected: false,
            local_pointer: None,
            last_emit: None,
            emit_interval,
        }
    }

    /// Track connection state from the transport and forward its messages.
    pub fn handle_transport_event(&mut self, event: &TransportEvent) -> bool {
        match event {
            TransportEvent::Connected => {
                self.set_connected(true);
                false
            }
            TransportEvent::Disconnected { .. } => {
                self.set_connected(false);
                false
            }
            TransportEvent::Message(message) => self.handle_server_message(message),
            _ => false,
        }
    }

    /// Apply presence traffic. Returns whether the roster changed.
    pub fn handle_server_message(&mut self, message: &ServerMessage) -> bool {
        match message {
            ServerMessage::UsersList(users) => {
                self.users = users.iter().map(|s| (s.id, s.clone())).collect();
                let users = &self.users;
                self.pointers.retain(|id, _| users.contains_key(id));
                true
            }
            ServerMessage::UserConnected(session) => {
                self.users.insert(session.id, session.clone());
                true
            }
            ServerMessage::UserDisconnected(id) => {
                self.pointers.remove(id);
                self.users.shift_remove(id).is_some()
            }
            ServerMessage::UserCursor { user_id, position } => {
                if let Some(session) = self.users.get_mut(user_id) {
                    session.cursor = Some(position.clone());
                }
                self.pointers.insert(
                    *user_id,
                    RemotePointer {
                        position: position.clone(),
                        received_at: Instant::now(),
                    },
                );
                true
            }
            _ => false,
        }
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Record the local pointer and return a message to send, unless
    /// throttled or offline.
    pub fn update_local_pointer(&mut self, position: CursorPosition) -> Option<ClientMessage> {
        self.local_pointer = Some(position.clone());
        if !self.connected {
            return None;
        }
        if let Some(last) = self.last_emit {
            if last.elapsed() < self.emit_interval {
                return None;
            }
        }
        self.last_emit = Some(Instant::now());
        Some(ClientMessage::UserCursor(position))
    }

    /// Send the latest local pointer regardless of the throttle, e.g. when a
    /// drag ends between ticks.
    pub fn force_local_pointer(&mut self) -> Option<ClientMessage> {
        if !self.connected {
            return None;
        }
        let position = self.local_pointer.clone()?;
        self.last_emit = Some(Instant::now());
        Some(ClientMessage::UserCursor(position))
    }

    pub fn users(&self) -> impl Iterator<Item = &Session> {
        self.users.values()
    }

    pub fn user(&self, id: &SessionId) -> Option<&Session> {
        self.users.get(id)
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn pointer(&self, id: &SessionId) -> Option<&RemotePointer> {
        self.pointers.get(id)
    }

    pub fn pointers(&self) -> impl Iterator<Item = (&SessionId, &RemotePointer)> {
        self.pointers.iter()
    }

    pub fn local_pointer(&self) -> Option<&CursorPosition> {
        self.local_pointer.as_ref()
    }

    /// Forget pointers with no update for `timeout`.
    pub fn cleanup_idle_pointers(&mut self, timeout: Duration) -> Vec<SessionId> {
        let stale: Vec<SessionId> = self
            .pointers
            .iter()
            .filter(|(_, p)| p.is_idle(timeout))
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            self.pointers.remove(id);
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ClientMetadata, SessionRegistry};
    use std::thread;

    fn session(agent: &str) -> Session {
        let meta = ClientMetadata::new("10.0.0.2:50000".parse().unwrap(), agent);
        SessionRegistry::new().on_connect(SessionId::new(), &meta)
    }

    #[test]
    fn test_users_list_join_leave() {
        let mut roster = PresenceRoster::new();
        let a = session("Mozilla/5.0 (Windows NT 10.0)");
        let b = session("Mozilla/5.0 (iPhone; Mobile)");

        assert!(roster.handle_server_message(&ServerMessage::UsersList(vec![a.clone()])));
        assert!(roster.handle_server_message(&ServerMessage::UserConnected(b.clone())));
        assert_eq!(roster.user_count(), 2);
        assert_eq!(roster.user(&b.id).unwrap().device_name, "Mobile");

        assert!(roster.handle_server_message(&ServerMessage::UserDisconnected(a.id)));
        assert!(!roster.handle_server_message(&ServerMessage::UserDisconnected(a.id)));
        let ids: Vec<SessionId> = roster.users().map(|s| s.id).collect();
        assert_eq!(ids, vec![b.id]);
    }

    #[test]
    fn test_remote_pointer_tracked_and_cleared_on_leave() {
        let mut roster = PresenceRoster::new();
        let a = session("curl");
        roster.handle_server_message(&ServerMessage::UserConnected(a.clone()));
        roster.handle_server_message(&ServerMessage::UserCursor {
            user_id: a.id,
            position: CursorPosition::new(1.0, 2.0),
        });

        assert_eq!(roster.pointer(&a.id).unwrap().position, CursorPosition::new(1.0, 2.0));
        assert_eq!(roster.user(&a.id).unwrap().cursor, Some(CursorPosition::new(1.0, 2.0)));

        roster.handle_server_message(&ServerMessage::UserDisconnected(a.id));
        assert!(roster.pointer(&a.id).is_none());
    }

    #[test]
    fn test_users_list_prunes_pointers() {
        let mut roster = PresenceRoster::new();
        let gone = SessionId::new();
        roster.handle_server_message(&ServerMessage::UserCursor {
            user_id: gone,
            position: CursorPosition::new(0.0, 0.0),
        });
        roster.handle_server_message(&ServerMessage::UsersList(vec![session("x")]));
        assert!(roster.pointer(&gone).is_none());
    }

    #[test]
    fn test_no_emission_while_disconnected() {
        let mut roster = PresenceRoster::with_interval(Duration::ZERO);
        assert!(roster.update_local_pointer(CursorPosition::new(1.0, 1.0)).is_none());
        assert!(roster.force_local_pointer().is_none());

        roster.handle_transport_event(&TransportEvent::Connected);
        assert!(roster.update_local_pointer(CursorPosition::new(2.0, 2.0)).is_some());

        roster.handle_transport_event(&TransportEvent::Disconnected {
            reason: "lost".into(),
        });
        assert!(roster.update_local_pointer(CursorPosition::new(3.0, 3.0)).is_none());
        assert_eq!(roster.local_pointer(), Some(&CursorPosition::new(3.0, 3.0)));
    }

    #[test]
    fn test_pointer_throttle() {
        let mut roster = PresenceRoster::with_interval(Duration::from_millis(50));
        roster.set_connected(true);

        assert!(roster.update_local_pointer(CursorPosition::new(1.0, 1.0)).is_some());
        assert!(roster.update_local_pointer(CursorPosition::new(2.0, 2.0)).is_none());

        // Forced send carries the latest throttled position
        assert_eq!(
            roster.force_local_pointer(),
            Some(ClientMessage::UserCursor(CursorPosition::new(2.0, 2.0)))
        );

        thread::sleep(Duration::from_millis(60));
        assert!(roster.update_local_pointer(CursorPosition::new(3.0, 3.0)).is_some());
    }

    #[test]
    fn test_cleanup_idle_pointers() {
        let mut roster = PresenceRoster::new();
        let id = SessionId::new();
        roster.handle_server_message(&ServerMessage::UserCursor {
            user_id: id,
            position: CursorPosition::new(0.0, 0.0),
        });

        assert!(roster.cleanup_idle_pointers(Duration::from_secs(60)).is_empty());
        thread::sleep(Duration::from_millis(20));
        assert_eq!(roster.cleanup_idle_pointers(Duration::from_millis(10)), vec![id]);
        assert!(roster.pointers().next().is_none());
    }
}
