//! Pending-message queue for edits made while disconnected.
//!
//! Messages are replayed in submission order exactly once, on the next
//! successful connection, then the queue is empty again.

use std::collections::VecDeque;
use std::time::Instant;

use crate::protocol::ClientMessage;

/// Default bound on queued messages.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

#[derive(Debug, Clone)]
struct PendingMessage {
    message: ClientMessage,
    queued_at: Instant,
}

#[derive(Debug)]
pub struct PendingQueue {
    queue: VecDeque<PendingMessage>,
    max_size: usize,
}

impl PendingQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue a message. Returns `false` (and drops it) when full.
    pub fn enqueue(&mut self, message: ClientMessage) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(PendingMessage {
            message,
            queued_at: Instant::now(),
        });
        true
    }

    /// Take every queued message, oldest first.
    pub fn drain(&mut self) -> Vec<ClientMessage> {
        self.queue.drain(..).map(|p| p.message).collect()
    }

    /// Age of the oldest queued message.
    pub fn oldest_age(&self) -> Option<std::time::Duration> {
        self.queue.front().map(|p| p.queued_at.elapsed())
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

}

impl Default for PendingQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}
