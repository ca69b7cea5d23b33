//! Bounded history of recently broadcast payloads, replayed to late joiners.

use std::collections::VecDeque;

/// Maximum number of payloads kept for replay.
pub const HISTORY_CAPACITY: usize = 50;

/// FIFO buffer of at most `capacity` payloads, oldest first.
#[derive(Debug)]
pub struct RecentMessageBuffer {
    entries: VecDeque<String>,
    capacity: usize,
}

impl RecentMessageBuffer {
    pub fn new() -> Self {
        Self::with_capacity(HISTORY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends a payload, evicting from the front until within capacity.
    pub fn push(&mut self, payload: String) {
        self.entries.push_back(payload);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    /// Point-in-time copy in insertion order.
    pub fn snapshot(&self) -> Vec<String> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for RecentMessageBuffer {
    fn default() -> Self {
        Self::new()
    }
}
