//! Local Optimistic Store: the client's disposable copy of the canvas.
//!
//! Every mutation carries an [`Origin`]. Local mutations are applied at once
//! and forwarded to the outbox; remote ones are applied and never forwarded,
//! which is what keeps a client from echoing the server's relays back to it.

use indexmap::IndexMap;

use super::Outbox;
use crate::element::Element;
use crate::protocol::{ClientMessage, ServerMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Made by this client's user; forwarded to the server.
    Local,
    /// Arrived from the network; applied only.
    Remote,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Add(Element),
    /// Full replacement snapshot for an existing id.
    Update(Element),
    Remove(String),
}

impl Mutation {
    pub fn id(&self) -> &str {
        match self {
            Self::Add(element) | Self::Update(element) => &element.id,
            Self::Remove(id) => id,
        }
    }

    fn into_message(self) -> ClientMessage {
        match self {
            Self::Add(element) => ClientMessage::CanvasElementAdd(element),
            Self::Update(element) => ClientMessage::CanvasUpdate(element),
            Self::Remove(id) => ClientMessage::CanvasElementRemove(id),
        }
    }
}

pub struct LocalMirror<O: Outbox> {
    elements: IndexMap<String, Element>,
    outbox: O,
    revision: u64,
    dirty: bool,
}

impl<O: Outbox> LocalMirror<O> {
    pub fn new(outbox: O) -> Self {
        Self {
            elements: IndexMap::new(),
            outbox,
            revision: 0,
            dirty: false,
        }
    }

    /// Apply a mutation to the mirror. Returns whether the mirror changed.
    ///
    /// Local mutations are forwarded even when they change nothing locally
    /// (e.g. removing an id this mirror never saw), since the server decides.
    pub fn apply(&mut self, mutation: Mutation, origin: Origin) -> bool {
        let changed = match &mutation {
            Mutation::Add(element) | Mutation::Update(element) => {
                // Unknown ids on update are upserted; the snapshot is complete
                self.elements.insert(element.id.clone(), element.clone());
                true
            }
            Mutation::Remove(id) => self.elements.shift_remove(id).is_some(),
        };
        if changed {
            self.mark_dirty();
        }

        if origin == Origin::Local {
            self.outbox.enqueue(mutation.into_message());
        }
        changed
    }

    /// Edit an existing element in place, stamp `updatedAt` and forward the
    /// full result. Returns `false` if `id` is unknown.
    pub fn update_local(&mut self, id: &str, edit: impl FnOnce(&mut Element)) -> bool {
        let Some(element) = self.elements.get_mut(id) else {
            log::debug!("local update for unknown element {id}");
            return false;
        };
        edit(element);
        element.touch();
        let snapshot = element.clone();
        self.mark_dirty();
        self.outbox.enqueue(ClientMessage::CanvasUpdate(snapshot));
        true
    }

    /// Replace the whole mirror with a server snapshot, keeping its order.
    pub fn sync_full_state(&mut self, elements: Vec<Element>) {
        self.elements = elements
            .into_iter()
            .map(|element| (element.id.clone(), element))
            .collect();
        self.mark_dirty();
    }

    /// Feed a message received from the server. Returns whether the mirror
    /// changed; presence and clipboard traffic is ignored here.
    pub fn handle_server_message(&mut self, message: &ServerMessage) -> bool {
        match message {
            ServerMessage::CanvasStateSync(elements) => {
                self.sync_full_state(elements.clone());
                true
            }
            ServerMessage::CanvasElementAdd(element) => {
                self.apply(Mutation::Add(element.clone()), Origin::Remote)
            }
            ServerMessage::CanvasUpdate(element) => {
                self.apply(Mutation::Update(element.clone()), Origin::Remote)
            }
            ServerMessage::CanvasElementRemove(id) => {
                self.apply(Mutation::Remove(id.clone()), Origin::Remote)
            }
            _ => false,
        }
    }

    /// Whether anything changed since the last call; clears the flag.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    /// Monotonic change counter.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn get(&self, id: &str) -> Option<&Element> {
        self.elements.get(id)
    }

    /// Elements in insertion order.
    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.elements.values()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn outbox(&self) -> &O {
        &self.outbox
    }

    fn mark_dirty(&mut self) {
        self.revision += 1;
        self.dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{ElementContent, Point};
    use crate::session::SessionId;
    use tokio::sync::mpsc;

    fn mirror() -> (
        LocalMirror<mpsc::UnboundedSender<ClientMessage>>,
        mpsc::UnboundedReceiver<ClientMessage>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (LocalMirror::new(tx), rx)
    }

    fn sent(rx: &mut mpsc::UnboundedReceiver<ClientMessage>) -> Vec<ClientMessage> {
        let mut out = Vec::new();
        while let Ok(m) = rx.try_recv() {
            out.push(m);
        }
        out
    }

    #[test]
    fn test_local_mutation_is_forwarded() {
        let (mut mirror, mut rx) = mirror();
        let note = Element::note("n1", "hello", "A");

        assert!(mirror.apply(Mutation::Add(note.clone()), Origin::Local));
        assert_eq!(mirror.get("n1"), Some(&note));
        assert_eq!(sent(&mut rx), vec![ClientMessage::CanvasElementAdd(note)]);
    }

    #[test]
    fn test_remote_mutation_is_not_forwarded() {
        let (mut mirror, mut rx) = mirror();
        let note = Element::note("n1", "hello", "B");

        assert!(mirror.apply(Mutation::Add(note.clone()), Origin::Remote));
        assert!(mirror.handle_server_message(&ServerMessage::CanvasUpdate(
            note.clone().with_position(10.0, 20.0)
        )));
        assert!(mirror.handle_server_message(&ServerMessage::CanvasElementRemove("n1".into())));

        assert!(mirror.is_empty());
        assert!(sent(&mut rx).is_empty());
    }

    #[test]
    fn test_remote_update_keeps_other_fields() {
        let (mut mirror, _rx) = mirror();
        let note = Element::note("note-1", "hello", "A");
        mirror.apply(Mutation::Add(note.clone()), Origin::Remote);

        mirror.handle_server_message(&ServerMessage::CanvasUpdate(note.with_position(10.0, 20.0)));
        let current = mirror.get("note-1").unwrap();
        assert_eq!(current.position, Point::new(10.0, 20.0));
        assert_eq!(current.content, ElementContent::Text("hello".into()));
    }

    #[test]
    fn test_update_local_stamps_and_forwards_full_element() {
        let (mut mirror, mut rx) = mirror();
        let note = Element::note("n1", "hello", "A");
        let before = note.metadata.updated_at;
        mirror.apply(Mutation::Add(note), Origin::Remote);

        assert!(mirror.update_local("n1", |e| e.position = Point::new(5.0, 6.0)));
        let messages = sent(&mut rx);
        assert_eq!(messages.len(), 1);
        let ClientMessage::CanvasUpdate(updated) = &messages[0] else {
            panic!("expected canvas-update, got {:?}", messages[0]);
        };
        assert_eq!(updated.position, Point::new(5.0, 6.0));
        assert_eq!(updated.content, ElementContent::Text("hello".into()));
        assert!(updated.metadata.updated_at >= before);

        assert!(!mirror.update_local("missing", |_| {}));
        assert!(sent(&mut rx).is_empty());
    }

    #[test]
    fn test_local_remove_of_unknown_still_forwarded() {
        let (mut mirror, mut rx) = mirror();
        assert!(!mirror.apply(Mutation::Remove("ghost".into()), Origin::Local));
        assert_eq!(sent(&mut rx), vec![ClientMessage::CanvasElementRemove("ghost".into())]);
    }

    #[test]
    fn test_sync_full_state_replaces_in_order() {
        let (mut mirror, mut rx) = mirror();
        mirror.apply(Mutation::Add(Element::note("stale", "x", "A")), Origin::Remote);

        let snapshot = vec![
            Element::note("b", "2", "A"),
            Element::note("a", "1", "A"),
        ];
        assert!(mirror.handle_server_message(&ServerMessage::CanvasStateSync(snapshot)));

        let ids: Vec<&str> = mirror.elements().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert!(mirror.get("stale").is_none());
        assert!(sent(&mut rx).is_empty());
    }

    #[test]
    fn test_dirty_flag_and_revision() {
        let (mut mirror, _rx) = mirror();
        assert!(!mirror.take_dirty());

        mirror.apply(Mutation::Add(Element::note("n", "x", "A")), Origin::Remote);
        assert_eq!(mirror.revision(), 1);
        assert!(mirror.take_dirty());
        assert!(!mirror.take_dirty());

        // No-op remove leaves the revision alone
        mirror.apply(Mutation::Remove("other".into()), Origin::Remote);
        assert_eq!(mirror.revision(), 1);
        assert!(!mirror.take_dirty());
    }

    #[test]
    fn test_presence_messages_ignored() {
        let (mut mirror, _rx) = mirror();
        assert!(!mirror.handle_server_message(&ServerMessage::UserDisconnected(SessionId::new())));
        assert!(!mirror.take_dirty());
    }
}
