//! Instruction queue variants.
//!
//! Three organizations share one contract: `insert` succeeds if space
//! exists, `ready_candidates` yields instructions whose operands are all
//! ready, and `writeback` walks the output-dependence links attached to a
//! producing instruction, marking consumers ready; consumers that became
//! fully ready move onto the ready structures at the next `tick`.
//!
//! The variants differ enough in insertion semantics that dispatch is a
//! sum type rather than dynamic dispatch over a common vtable.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::common::ThreadId;
use crate::config::IqVariant;

/// Why an insertion was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqReject {
    /// No free entry (or the thread's cap is reached).
    Full,
    /// Pre-scheduled variant: the computed use-line sits past the ring.
    LinePastCursor,
}

/// Output-dependence bookkeeping shared by all variants.
#[derive(Default)]
struct DepTracker {
    consumers: HashMap<u64, Vec<u64>>,
    waiting: HashMap<u64, usize>,
}

impl DepTracker {
    fn insert(&mut self, seq: u64, producers: &[u64]) {
        let _ = self.waiting.insert(seq, producers.len());
        for &p in producers {
            self.consumers.entry(p).or_default().push(seq);
        }
    }

    /// Marks `producer`'s consumers one operand readier; returns those
    /// that became fully ready.
    fn writeback(&mut self, producer: u64) -> Vec<u64> {
        let mut now_ready = Vec::new();
        if let Some(consumers) = self.consumers.remove(&producer) {
            for seq in consumers {
                if let Some(count) = self.waiting.get_mut(&seq) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        now_ready.push(seq);
                    }
                }
            }
        }
        now_ready
    }

    fn is_ready(&self, seq: u64) -> bool {
        self.waiting.get(&seq).copied().unwrap_or(0) == 0
    }

    fn remove(&mut self, seq: u64) {
        let _ = self.waiting.remove(&seq);
    }
}

struct Entry {
    thread: ThreadId,
}

/// The instruction queue, one of three organizations.
pub struct InstQueue {
    variant: IqVariant,
    capacity: usize,
    per_thread_cap: Option<usize>,
    thread_counts: Vec<usize>,

    deps: DepTracker,
    entries: HashMap<u64, Entry>,

    // Wakeup results parked until the next tick.
    pending_ready: Vec<u64>,

    // ReadyQueue variant: explicit FIFO of ready instructions.
    ready_queue: VecDeque<u64>,

    // Unordered variant: set of ready instructions, issued oldest-first.
    ready_set: HashSet<u64>,

    // Prescheduled variant.
    lines: Vec<Vec<u64>>,
    active_line: u64,
    issue_buffer: VecDeque<u64>,
    issue_buffer_cap: usize,
    // Absolute line at which each (thread, arch reg) becomes available.
    reg_use_line: Vec<HashMap<usize, u64>>,
}

impl InstQueue {
    /// Creates a queue of the given organization and capacity.
    pub fn new(
        variant: IqVariant,
        capacity: usize,
        threads: usize,
        per_thread_cap: Option<usize>,
        issue_width: usize,
    ) -> Self {
        let ring_len = 64usize;
        Self {
            variant,
            capacity,
            per_thread_cap,
            thread_counts: vec![0; threads],
            deps: DepTracker::default(),
            entries: HashMap::new(),
            pending_ready: Vec::new(),
            ready_queue: VecDeque::new(),
            ready_set: HashSet::new(),
            lines: vec![Vec::new(); ring_len],
            active_line: 0,
            issue_buffer: VecDeque::new(),
            issue_buffer_cap: issue_width * 2,
            reg_use_line: vec![HashMap::new(); threads],
        }
    }

    /// Occupancy.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the queue holds no instructions.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when nothing further can be inserted for `thread`.
    pub fn thread_blocked(&self, thread: ThreadId) -> bool {
        self.entries.len() >= self.capacity
            || self
                .per_thread_cap
                .is_some_and(|cap| self.thread_counts[thread] >= cap)
    }

    /// Inserts a dispatched instruction.
    ///
    /// `producers` lists the still-incomplete instructions feeding this
    /// one. `sched_latency` is the producing latency used by the
    /// pre-scheduled variant to place the instruction's consumers, and
    /// `src_regs`/`dest_regs` are its architectural register indices.
    ///
    /// # Errors
    ///
    /// [`IqReject`] describes why the instruction could not be accepted;
    /// the caller retries next cycle.
    pub fn insert(
        &mut self,
        seq: u64,
        thread: ThreadId,
        producers: &[u64],
        sched_latency: u64,
        src_regs: &[usize],
        dest_regs: &[usize],
    ) -> Result<(), IqReject> {
        if self.thread_blocked(thread) {
            return Err(IqReject::Full);
        }

        if self.variant == IqVariant::Prescheduled {
            // The instruction is placed on the line where its operands
            // become available; its destinations advance their use-lines
            // by the producing latency.
            let regs = &self.reg_use_line[thread];
            let mut line = self.active_line;
            for &r in src_regs {
                line = line.max(regs.get(&r).copied().unwrap_or(0));
            }
            if line >= self.active_line + self.lines.len() as u64 {
                return Err(IqReject::LinePastCursor);
            }
            let bucket = (line % self.lines.len() as u64) as usize;
            self.lines[bucket].push(seq);
            let regs = &mut self.reg_use_line[thread];
            for &r in dest_regs {
                let use_line = line + sched_latency;
                let entry = regs.entry(r).or_insert(0);
                *entry = (*entry).max(use_line);
            }
        }

        self.deps.insert(seq, producers);
        let _ = self.entries.insert(seq, Entry { thread });
        self.thread_counts[thread] += 1;

        if self.variant != IqVariant::Prescheduled && producers.is_empty() {
            self.pending_ready.push(seq);
        }
        tracing::trace!(target: "iq", seq, thread, deps = producers.len(), "insert");
        Ok(())
    }

    /// Wakes the consumers of a completed producer. Newly ready
    /// instructions become issuable at the next tick.
    pub fn writeback(&mut self, producer_seq: u64) {
        let now_ready = self.deps.writeback(producer_seq);
        for seq in now_ready {
            if self.entries.contains_key(&seq) && self.variant != IqVariant::Prescheduled {
                self.pending_ready.push(seq);
            }
        }
    }

    /// Advances per-cycle state: migrates woken instructions onto the
    /// ready structures and, for the pre-scheduled variant, drains the
    /// active line into the issue buffer.
    pub fn tick(&mut self) {
        match self.variant {
            IqVariant::Unordered => {
                for seq in self.pending_ready.drain(..) {
                    let _ = self.ready_set.insert(seq);
                }
            }
            IqVariant::ReadyQueue => {
                for seq in self.pending_ready.drain(..) {
                    self.ready_queue.push_back(seq);
                }
            }
            IqVariant::Prescheduled => {
                if self.issue_buffer.len() < self.issue_buffer_cap {
                    let bucket = (self.active_line % self.lines.len() as u64) as usize;
                    for seq in std::mem::take(&mut self.lines[bucket]) {
                        self.issue_buffer.push_back(seq);
                    }
                    self.active_line += 1;
                }
            }
        }
    }

    /// Instructions eligible for issue this cycle, oldest first, without
    /// removing them.
    pub fn ready_candidates(&self, max: usize) -> Vec<u64> {
        match self.variant {
            IqVariant::Unordered => {
                let mut ready: Vec<u64> = self
                    .ready_set
                    .iter()
                    .copied()
                    .filter(|seq| self.entries.contains_key(seq))
                    .collect();
                ready.sort_unstable();
                ready.truncate(max);
                ready
            }
            IqVariant::ReadyQueue => self
                .ready_queue
                .iter()
                .copied()
                .filter(|seq| self.entries.contains_key(seq))
                .take(max)
                .collect(),
            IqVariant::Prescheduled => self
                .issue_buffer
                .iter()
                .copied()
                .filter(|seq| self.entries.contains_key(seq) && self.deps.is_ready(*seq))
                .take(max)
                .collect(),
        }
    }

    /// True once all of an instruction's operands are ready.
    pub fn is_ready(&self, seq: u64) -> bool {
        self.deps.is_ready(seq)
    }

    /// Removes an instruction after it issued.
    pub fn remove(&mut self, seq: u64) {
        if let Some(entry) = self.entries.remove(&seq) {
            self.thread_counts[entry.thread] -= 1;
        }
        self.deps.remove(seq);
        let _ = self.ready_set.remove(&seq);
        if let Some(pos) = self.ready_queue.iter().position(|&s| s == seq) {
            let _ = self.ready_queue.remove(pos);
        }
        if let Some(pos) = self.issue_buffer.iter().position(|&s| s == seq) {
            let _ = self.issue_buffer.remove(pos);
        }
    }

    /// Removes squashed instructions from every structure.
    pub fn squash(&mut self, seqs: &[u64]) {
        for &seq in seqs {
            self.remove(seq);
            self.pending_ready.retain(|&s| s != seq);
            for line in &mut self.lines {
                line.retain(|&s| s != seq);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iq(variant: IqVariant) -> InstQueue {
        InstQueue::new(variant, 8, 1, None, 4)
    }

    #[test]
    fn independent_instructions_become_ready_next_tick() {
        for variant in [IqVariant::Unordered, IqVariant::ReadyQueue] {
            let mut q = iq(variant);
            q.insert(1, 0, &[], 1, &[], &[1]).unwrap();
            assert!(q.ready_candidates(4).is_empty());
            q.tick();
            assert_eq!(q.ready_candidates(4), vec![1]);
        }
    }

    #[test]
    fn dependent_instruction_waits_for_writeback() {
        let mut q = iq(IqVariant::Unordered);
        q.insert(1, 0, &[], 1, &[], &[5]).unwrap();
        q.insert(2, 0, &[1], 1, &[5], &[6]).unwrap();
        q.tick();
        assert_eq!(q.ready_candidates(4), vec![1]);
        q.remove(1);
        q.writeback(1);
        q.tick();
        assert_eq!(q.ready_candidates(4), vec![2]);
    }

    #[test]
    fn full_queue_rejects() {
        let mut q = InstQueue::new(IqVariant::Unordered, 2, 1, None, 4);
        q.insert(1, 0, &[], 1, &[], &[]).unwrap();
        q.insert(2, 0, &[], 1, &[], &[]).unwrap();
        assert_eq!(q.insert(3, 0, &[], 1, &[], &[]), Err(IqReject::Full));
    }

    #[test]
    fn ready_queue_preserves_wakeup_order() {
        let mut q = iq(IqVariant::ReadyQueue);
        q.insert(3, 0, &[], 1, &[], &[]).unwrap();
        q.insert(1, 0, &[], 1, &[], &[]).unwrap();
        q.tick();
        // Wakeup order, not sequence order.
        assert_eq!(q.ready_candidates(4), vec![3, 1]);
    }

    #[test]
    fn prescheduled_places_consumers_on_later_lines() {
        let mut q = iq(IqVariant::Prescheduled);
        // Producer with a 3-cycle latency writing r1.
        q.insert(1, 0, &[], 3, &[], &[1]).unwrap();
        // Consumer of r1: lands on line 3.
        q.insert(2, 0, &[1], 1, &[1], &[2]).unwrap();
        q.tick(); // drains line 0
        assert_eq!(q.ready_candidates(4), vec![1]);
        q.remove(1);
        q.writeback(1);
        q.tick(); // line 1
        q.tick(); // line 2
        assert!(q.ready_candidates(4).is_empty());
        q.tick(); // line 3 holds the consumer
        assert_eq!(q.ready_candidates(4), vec![2]);
    }

    #[test]
    fn prescheduled_rejects_lines_past_the_ring() {
        let mut q = iq(IqVariant::Prescheduled);
        // Chain long enough to push the use-line past the 64-entry ring.
        q.insert(1, 0, &[], 100, &[], &[1]).unwrap();
        assert_eq!(
            q.insert(2, 0, &[1], 1, &[1], &[2]),
            Err(IqReject::LinePastCursor)
        );
    }

    #[test]
    fn squash_removes_from_all_structures() {
        let mut q = iq(IqVariant::Unordered);
        q.insert(1, 0, &[], 1, &[], &[1]).unwrap();
        q.insert(2, 0, &[1], 1, &[1], &[]).unwrap();
        q.tick();
        q.squash(&[2, 1]);
        assert!(q.is_empty());
        assert!(q.ready_candidates(4).is_empty());
    }
}
