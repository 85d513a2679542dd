//! Writeback buffer.
//!
//! Dirty blocks displaced by fills wait here for the downstream bus.

use std::collections::VecDeque;

use crate::mem::req::MemReq;

/// Bounded buffer of outgoing writebacks.
pub struct WritebackBuffer {
    entries: VecDeque<MemReq>,
    capacity: usize,
}

impl WritebackBuffer {
    /// Creates a buffer of the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
        }
    }

    /// True when no further writeback can be accepted.
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// True when nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Occupancy.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Queues a writeback; the caller must have checked capacity.
    pub fn push(&mut self, req: MemReq) {
        debug_assert!(!self.is_full());
        self.entries.push_back(req);
    }

    /// Removes the oldest writeback for sending downstream.
    pub fn pop(&mut self) -> Option<MemReq> {
        self.entries.pop_front()
    }
}
