//! Client side of the sync protocol.
//!
//! ```text
//! local edit ─► LocalMirror ─(Origin::Local)─► Outbox ─► TransportManager ─► server
//! server ─► TransportEvent::Message ─► LocalMirror (Origin::Remote, not re-sent)
//!                                  └─► PresenceRoster
//! ```

pub mod backoff;
pub mod mirror;
pub mod presence;
pub mod queue;
pub mod transport;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::protocol::ClientMessage;

pub use backoff::{Backoff, BackoffConfig};
pub use mirror::{LocalMirror, Mutation, Origin};
pub use presence::{PresenceRoster, RemotePointer, POINTER_EMIT_INTERVAL};
pub use queue::{PendingQueue, DEFAULT_QUEUE_CAPACITY};
pub use transport::{
    ConnectionState, TransportConfig, TransportError, TransportEvent, TransportManager,
};

/// Where locally originated messages go. Implemented by [`TransportManager`];
/// must never block.
pub trait Outbox {
    fn enqueue(&self, message: ClientMessage);
}

impl<T: Outbox + ?Sized> Outbox for Arc<T> {
    fn enqueue(&self, message: ClientMessage) {
        (**self).enqueue(message)
    }
}

impl<T: Outbox + ?Sized> Outbox for &T {
    fn enqueue(&self, message: ClientMessage) {
        (**self).enqueue(message)
    }
}

impl Outbox for mpsc::UnboundedSender<ClientMessage> {
    fn enqueue(&self, message: ClientMessage) {
        if self.send(message).is_err() {
            log::warn!("outbox receiver dropped, message discarded");
        }
    }
}
