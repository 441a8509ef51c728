//! Per-provider FIFO request queue.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub enqueued_at: Instant,
}

#[derive(Debug, Default)]
pub struct RequestQueue {
    items: VecDeque<QueueEntry>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self) {
        self.items.push_back(QueueEntry {
            enqueued_at: Instant::now(),
        });
    }

    pub fn pop_front(&mut self) -> Option<QueueEntry> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drop items older than `timeout`, preserving FIFO order for the rest.
    pub fn drain_expired(&mut self, timeout: Duration) {
        self.items.retain(|entry| entry.enqueued_at.elapsed() < timeout);
    }
}
