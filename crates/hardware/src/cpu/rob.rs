//! Reorder buffer.
//!
//! Ordered per-thread queues of in-flight instruction sequence numbers.
//! Program order is preserved within each thread, commit happens from the
//! head only, and capacity is bounded globally with an optional
//! per-thread cap. The instruction records themselves live in the core's
//! in-flight map; the ROB tracks order and occupancy.

use std::collections::VecDeque;

use crate::common::ThreadId;

/// The reorder buffer.
pub struct Rob {
    capacity: usize,
    per_thread_cap: Option<usize>,
    queues: Vec<VecDeque<u64>>,
    count: usize,
    last_committed: Vec<Option<u64>>,
}

impl Rob {
    /// Creates a ROB with a shared capacity across `threads` threads.
    pub fn new(capacity: usize, threads: usize, per_thread_cap: Option<usize>) -> Self {
        Self {
            capacity,
            per_thread_cap,
            queues: vec![VecDeque::new(); threads],
            count: 0,
            last_committed: vec![None; threads],
        }
    }

    /// Total occupied entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    /// True when no entries are allocated.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// True when no further entry can be allocated at all.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.count == self.capacity
    }

    /// Occupancy of one thread.
    pub fn thread_len(&self, thread: ThreadId) -> usize {
        self.queues[thread].len()
    }

    /// True when `thread` may not allocate another entry.
    pub fn thread_blocked(&self, thread: ThreadId) -> bool {
        if self.is_full() {
            return true;
        }
        self.per_thread_cap
            .is_some_and(|cap| self.queues[thread].len() >= cap)
    }

    /// Appends an instruction at the tail of its thread's queue.
    /// Returns false when the ROB (or the thread's cap) is full.
    pub fn allocate(&mut self, thread: ThreadId, seq: u64) -> bool {
        if self.thread_blocked(thread) {
            return false;
        }
        debug_assert!(
            self.queues[thread].back().is_none_or(|&tail| tail < seq),
            "ROB allocation out of program order"
        );
        self.queues[thread].push_back(seq);
        self.count += 1;
        true
    }

    /// Sequence number at the head of a thread's queue.
    pub fn head(&self, thread: ThreadId) -> Option<u64> {
        self.queues[thread].front().copied()
    }

    /// Retires the head entry of a thread.
    ///
    /// Head sequence numbers are strictly increasing per thread; a
    /// violation indicates a squash bookkeeping bug and panics.
    pub fn commit_head(&mut self, thread: ThreadId) -> Option<u64> {
        let seq = self.queues[thread].pop_front()?;
        if let Some(last) = self.last_committed[thread] {
            assert!(seq > last, "ROB head sequence went backwards");
        }
        self.last_committed[thread] = Some(seq);
        self.count -= 1;
        Some(seq)
    }

    /// Removes every entry of `thread` younger than `after_seq`
    /// (exclusive), returning them youngest-first for squashing.
    pub fn squash_after(&mut self, thread: ThreadId, after_seq: u64) -> Vec<u64> {
        let queue = &mut self.queues[thread];
        let mut squashed = Vec::new();
        while let Some(&tail) = queue.back() {
            if tail <= after_seq {
                break;
            }
            queue.pop_back();
            self.count -= 1;
            squashed.push(tail);
        }
        squashed
    }

    /// Removes every entry of `thread`, returning them youngest-first.
    pub fn squash_all(&mut self, thread: ThreadId) -> Vec<u64> {
        self.squash_after(thread, 0)
    }

    /// Iterates a thread's entries from head (oldest) to tail.
    pub fn iter_thread(&self, thread: ThreadId) -> impl Iterator<Item = u64> + '_ {
        self.queues[thread].iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_commit_in_order() {
        let mut rob = Rob::new(4, 1, None);
        assert!(rob.allocate(0, 1));
        assert!(rob.allocate(0, 2));
        assert_eq!(rob.head(0), Some(1));
        assert_eq!(rob.commit_head(0), Some(1));
        assert_eq!(rob.commit_head(0), Some(2));
        assert!(rob.is_empty());
    }

    #[test]
    fn full_rob_rejects() {
        let mut rob = Rob::new(2, 1, None);
        assert!(rob.allocate(0, 1));
        assert!(rob.allocate(0, 2));
        assert!(rob.is_full());
        assert!(!rob.allocate(0, 3));
    }

    #[test]
    fn per_thread_cap_blocks_one_thread_only() {
        let mut rob = Rob::new(8, 2, Some(2));
        assert!(rob.allocate(0, 1));
        assert!(rob.allocate(0, 2));
        assert!(!rob.allocate(0, 3));
        assert!(rob.allocate(1, 4));
    }

    #[test]
    fn squash_after_removes_younger_entries() {
        let mut rob = Rob::new(8, 1, None);
        for seq in 1..=5 {
            assert!(rob.allocate(0, seq));
        }
        let squashed = rob.squash_after(0, 2);
        assert_eq!(squashed, vec![5, 4, 3]);
        assert_eq!(rob.len(), 2);
        assert_eq!(rob.commit_head(0), Some(1));
        assert_eq!(rob.commit_head(0), Some(2));
    }

    #[test]
    #[should_panic(expected = "sequence went backwards")]
    fn nonmonotonic_commit_panics() {
        let mut rob = Rob::new(8, 1, None);
        assert!(rob.allocate(0, 5));
        let _ = rob.commit_head(0);
        // Re-allocating an older sequence number and committing it
        // violates the monotonicity invariant.
        rob.queues_push_for_test(0, 3);
        let _ = rob.commit_head(0);
    }

    impl Rob {
        fn queues_push_for_test(&mut self, thread: ThreadId, seq: u64) {
            self.queues[thread].push_back(seq);
            self.count += 1;
        }
    }
}
