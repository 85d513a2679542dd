//! Bus bridge.
//!
//! Joins the interconnect side of the shared cache to the memory bus:
//! a bounded store-and-forward buffer with a fixed crossing latency.
//! When the buffer fills, the upstream bus is blocked until an entry
//! drains.

use std::collections::VecDeque;

use crate::common::Tick;
use crate::mem::req::MemReq;

/// Store-and-forward bridge between two buses.
pub struct BusBridge {
    buffer: VecDeque<(Tick, MemReq)>,
    capacity: usize,
    latency: Tick,
    /// Requests forwarded.
    pub forwarded: u64,
    /// Pushes refused because the buffer was full.
    pub full_rejects: u64,
}

impl BusBridge {
    /// Creates a bridge with the given buffering and crossing latency.
    pub fn new(capacity: usize, latency: Tick) -> Self {
        Self {
            buffer: VecDeque::new(),
            capacity,
            latency,
            forwarded: 0,
            full_rejects: 0,
        }
    }

    /// True when no further request can be accepted; the upstream bus
    /// must block.
    pub fn is_full(&self) -> bool {
        self.buffer.len() >= self.capacity
    }

    /// True when nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Accepts a request crossing the bridge at `now`; it becomes
    /// available on the far side at `now + latency`.
    pub fn push(&mut self, req: MemReq, now: Tick) -> bool {
        if self.is_full() {
            self.full_rejects += 1;
            return false;
        }
        self.buffer.push_back((now + self.latency, req));
        true
    }

    /// Earliest tick the head entry becomes available, if any.
    pub fn next_ready(&self) -> Option<Tick> {
        self.buffer.front().map(|&(t, _)| t)
    }

    /// Removes the head entry once its crossing completed.
    pub fn pop_ready(&mut self, now: Tick) -> Option<MemReq> {
        if self.buffer.front().is_some_and(|&(t, _)| t <= now) {
            self.forwarded += 1;
            return self.buffer.pop_front().map(|(_, req)| req);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::req::MemCmd;

    #[test]
    fn crossing_takes_the_configured_latency() {
        let mut bridge = BusBridge::new(2, 6);
        let req = MemReq::new(MemCmd::Read, 0x100, 64, 0, 10);
        assert!(bridge.push(req, 10));
        assert_eq!(bridge.next_ready(), Some(16));
        assert!(bridge.pop_ready(15).is_none());
        assert!(bridge.pop_ready(16).is_some());
    }

    #[test]
    fn full_bridge_rejects() {
        let mut bridge = BusBridge::new(1, 1);
        assert!(bridge.push(MemReq::new(MemCmd::Read, 0x0, 64, 0, 0), 0));
        assert!(!bridge.push(MemReq::new(MemCmd::Read, 0x40, 64, 0, 0), 0));
        assert_eq!(bridge.full_rejects, 1);
    }
}
