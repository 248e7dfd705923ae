//! # Log Ring
//!
//! Fixed-capacity FIFO of diagnostic lines. Inserting past capacity evicts
//! the oldest entry.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Number of diagnostic lines kept for replay
pub const LOG_RING_CAPACITY: usize = 15;

/// One diagnostic line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

impl LogMessage {
    /// Stamp `text` with the current time.
    pub fn now(text: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            text: text.into(),
        }
    }
}

/// Bounded, insertion-ordered history of [`LogMessage`]s.
#[derive(Debug, Clone)]
pub struct LogRing {
    entries: VecDeque<LogMessage>,
    capacity: usize,
}

impl Default for LogRing {
    fn default() -> Self {
        Self::with_capacity(LOG_RING_CAPACITY)
    }
}

impl LogRing {
    /// Creates a ring holding at most `capacity` entries (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends an entry, returning the evicted one if the ring was full.
    pub fn push(&mut self, message: LogMessage) -> Option<LogMessage> {
        let evicted = if self.entries.len() == self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(message);
        evicted
    }

    /// Copy of the current contents, oldest first.
    pub fn snapshot(&self) -> Vec<LogMessage> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
