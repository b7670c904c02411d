//! Bounded in-memory window of recently handled messages.
//!
//! The platform may re-deliver an update (reconnects, offset replays).
//! Only the most recent `capacity` keys are remembered; nothing is persisted.

use std::collections::{HashSet, VecDeque};

use crate::pipeline::types::{ChannelId, MessageId, RawMessage};

type SeenKey = (ChannelId, MessageId);

/// FIFO-evicting set of `(source channel, message id)` pairs.
#[derive(Debug)]
pub struct SeenWindow {
    capacity: usize,
    order: VecDeque<SeenKey>,
    seen: HashSet<SeenKey>,
}

impl SeenWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    /// Record a message. Returns `false` if it was already in the window.
    pub fn first_sighting(&mut self, message: &RawMessage) -> bool {
        let key = (message.source_channel.clone(), message.id.clone());
        if self.seen.contains(&key) {
            return false;
        }

        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
