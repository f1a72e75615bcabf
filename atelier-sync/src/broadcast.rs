//! Fan-out of encoded frames to N-1 sessions with backpressure.
//!
//! Each session gets an independent bounded queue of pre-encoded frames.
//! A frame is serialized once and shared across all queues as `Arc<str>`.
//!
//! ```text
//!              ┌──► [queue A] ──► socket A
//!  engine ─────┼──► [queue B] ──► socket B
//!  (encode 1x) └──► [queue C] ──► socket C
//! ```
//!
//! A session whose queue is full is detached instead of skipped: its socket
//! closes and the client resynchronises from a snapshot after reconnecting,
//! so no session ever observes a gapped event stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::session::SessionId;

/// Frames queued per session before it is considered lagging.
pub const DEFAULT_SESSION_CAPACITY: usize = 1024;

pub type Frame = Arc<str>;

/// Statistics for monitoring fan-out health.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_sessions: usize,
}

/// Counters updated on the hot path without locking.
#[derive(Default)]
struct AtomicFanoutStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Per-session outbound queues, owned by the engine task.
pub struct Fanout {
    queues: HashMap<SessionId, mpsc::Sender<Frame>>,
    capacity: usize,
    stats: AtomicFanoutStats,
}

impl Fanout {
    pub fn new(capacity: usize) -> Self {
        Self {
            queues: HashMap::new(),
            capacity: capacity.max(1),
            stats: AtomicFanoutStats::default(),
        }
    }

    /// Create the outbound queue for a session. The receiver belongs to the
    /// session's connection task.
    pub fn attach(&mut self, id: SessionId) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.queues.insert(id, tx);
        rx
    }

    /// Drop a session's queue. Its receiver sees end-of-stream once drained.
    pub fn detach(&mut self, id: &SessionId) -> bool {
        self.queues.remove(id).is_some()
    }

    /// Queue a frame for one session. Returns `false` if it was not delivered.
    pub fn unicast(&mut self, id: &SessionId, frame: Frame) -> bool {
        let Some(tx) = self.queues.get(id) else {
            return false;
        };
        match tx.try_send(frame) {
            Ok(()) => {
                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                self.evict(*id, &e);
                false
            }
        }
    }

    /// Queue a frame for every session except `sender`.
    ///
    /// Returns the number of sessions that accepted the frame.
    pub fn broadcast_except(&mut self, sender: Option<&SessionId>, frame: Frame) -> usize {
        let mut delivered = 0;
        let mut lagging = Vec::new();

        for (id, tx) in &self.queues {
            if Some(id) == sender {
                continue;
            }
            match tx.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => lagging.push((*id, e)),
            }
        }

        self.stats
            .messages_sent
            .fetch_add(delivered as u64, Ordering::Relaxed);
        self.stats
            .messages_dropped
            .fetch_add(lagging.len() as u64, Ordering::Relaxed);
        for (id, e) in lagging {
            self.evict(id, &e);
        }
        delivered
    }

    fn evict(&mut self, id: SessionId, err: &mpsc::error::TrySendError<Frame>) {
        match err {
            mpsc::error::TrySendError::Full(_) => {
                log::warn!("session {id} outbound queue full, detaching for resync");
            }
            mpsc::error::TrySendError::Closed(_) => {
                log::debug!("session {id} outbound queue closed");
            }
        }
        self.queues.remove(&id);
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.queues.contains_key(id)
    }

    pub fn session_count(&self) -> usize {
        self.queues.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> FanoutStats {
        FanoutStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_sessions: self.queues.len(),
        }
    }
}

impl Default for Fanout {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_CAPACITY)
    }
}
