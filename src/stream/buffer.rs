//! Client-side event buffer.
//!
//! Delivery is at-least-once, so a reconnecting client can see the same
//! event twice. The buffer drops anything whose `eventId` it has already
//! accepted and keeps at most `capacity` events, evicting the oldest.

use std::collections::{HashSet, VecDeque};

use crate::domain::{EventId, StreamEvent};

#[derive(Debug)]
pub struct EventBuffer {
    capacity: usize,
    events: VecDeque<StreamEvent>,
    seen: HashSet<EventId>,
}

impl EventBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// Accept an event. Returns false for duplicates.
    pub fn push(&mut self, event: StreamEvent) -> bool {
        if !self.seen.insert(event.event_id.clone()) {
            return false;
        }

        self.events.push_back(event);
        while self.events.len() > self.capacity {
            if let Some(evicted) = self.events.pop_front() {
                self.seen.remove(&evicted.event_id);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Buffered events, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &StreamEvent> {
        self.events.iter()
    }
}
