//! Bounded in-memory event buffer.
//!
//! A FIFO queue with a hard capacity. Producers never wait: when the cap is
//! reached, new events are dropped and the caller decides whether to log.
//! Failed batches re-enter at the front so retries preserve first-in
//! first-out order up to the remaining capacity.

use std::collections::VecDeque;

use crate::event::RequestEvent;

#[derive(Debug)]
pub(crate) struct EventBuffer {
    events: VecDeque<RequestEvent>,
    capacity: usize,
}

impl EventBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        EventBuffer {
            events: VecDeque::new(),
            capacity,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.events.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Appends one event to the back. Returns false when the buffer is at
    /// capacity and the event was dropped.
    pub(crate) fn append(&mut self, event: RequestEvent) -> bool {
        if self.events.len() >= self.capacity {
            return false;
        }
        self.events.push_back(event);
        true
    }

    /// Removes and returns up to `n` events from the front.
    pub(crate) fn drain_front(&mut self, n: usize) -> Vec<RequestEvent> {
        let n = n.min(self.events.len());
        self.events.drain(..n).collect()
    }

    /// Re-inserts a failed batch at the front as one bulk splice.
    ///
    /// Only as many events as the remaining capacity allows are kept; the
    /// tail of the batch is discarded in favor of the newer events already
    /// buffered. Returns the number of discarded events.
    pub(crate) fn prepend_front(&mut self, mut events: Vec<RequestEvent>) -> usize {
        let room = self.capacity.saturating_sub(self.events.len());
        let dropped = events.len().saturating_sub(room);
        events.truncate(room);
        let mut head: VecDeque<RequestEvent> = events.into();
        head.append(&mut self.events);
        self.events = head;
        dropped
    }

    /// Removes and returns every buffered event.
    pub(crate) fn splice_all(&mut self) -> Vec<RequestEvent> {
        self.events.drain(..).collect()
    }
}
