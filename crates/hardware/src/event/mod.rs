//! Discrete-event scheduler.
//!
//! This module provides the single global event queue that drives the
//! simulated clock. It provides:
//! 1. **Ordering:** events are keyed on tick first, then a per-class
//!    priority, then insertion order.
//! 2. **Cancellation:** O(1) descheduling by marking the record invalid;
//!    the heap entry is discarded lazily on pop.
//! 3. **Actions:** a closed enum of everything that can happen, so the
//!    simulator dispatches without boxed closures and records can be
//!    cancelled in place.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::common::error::SimError;
use crate::common::{CpuId, Tick};
use crate::mem::req::MemReq;

/// Pipeline stage driven by a core tick event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Retire from the ROB head.
    Commit,
    /// Drain completed results, resolve branches.
    Writeback,
    /// Select ready instructions and acquire functional units.
    Issue,
    /// Rename and allocate backend entries.
    Dispatch,
    /// Fetch from the instruction stream.
    Fetch,
}

/// Priority class of an event within one tick.
///
/// Commit handlers run before fetch handlers at the same tick so freed
/// resources become visible to fetch within the same cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventClass {
    /// Commit stage ticks.
    Commit,
    /// Writeback stage ticks.
    Writeback,
    /// Issue stage ticks.
    Issue,
    /// Dispatch stage ticks.
    Dispatch,
    /// Fetch stage ticks.
    Fetch,
    /// Bus arbitration, memory controller service, response delivery.
    MemoryController,
    /// End-of-simulation marker.
    SimExit,
}

/// Where a travelling response should be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryDest {
    /// A core's L1 instruction cache.
    L1Inst(CpuId),
    /// A core's L1 data cache.
    L1Data(CpuId),
    /// A shared cache bank.
    LlcBank(usize),
    /// The memory controller.
    MemCtrl,
    /// The issuing core itself (end of the response path).
    Cpu(CpuId),
}

/// The payload of a scheduled event.
#[derive(Debug)]
pub enum EventAction {
    /// Advance one pipeline stage of one core.
    CoreStage {
        /// Core to tick.
        cpu: CpuId,
        /// Stage to run.
        stage: Stage,
    },
    /// Run address-phase arbitration on a bus.
    BusArbitrateAddr {
        /// Index of the bus (0 = interconnect, 1 = memory bus).
        bus: usize,
    },
    /// Run data-phase arbitration on a bus.
    BusArbitrateData {
        /// Index of the bus.
        bus: usize,
    },
    /// Let the memory controller pick and service a request.
    MemCtrlService,
    /// Deliver a response to a component.
    Deliver {
        /// Receiving component.
        dest: DeliveryDest,
        /// The response being delivered.
        req: Box<MemReq>,
    },
    /// Take a performance measurement and consult the policy.
    PolicySample,
    /// Stop the simulation.
    SimExit,
}

/// Handle to a scheduled event; valid until the event fires or is
/// descheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventId {
    slot: usize,
    seq: u64,
}

struct EventRecord {
    action: Option<EventAction>,
    seq: u64,
    cancelled: bool,
}

#[derive(PartialEq, Eq)]
struct HeapKey {
    when: Tick,
    class: EventClass,
    seq: u64,
    slot: usize,
}

impl Ord for HeapKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.when, self.class, self.seq).cmp(&(other.when, other.class, other.seq))
    }
}

impl PartialOrd for HeapKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// The global event queue.
///
/// Single-threaded and cooperative: handlers run to completion and may
/// schedule future work, but never block.
pub struct EventQueue {
    heap: BinaryHeap<Reverse<HeapKey>>,
    records: Vec<EventRecord>,
    free: Vec<usize>,
    now: Tick,
    next_seq: u64,
}

impl EventQueue {
    /// Creates an empty queue at tick zero.
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            records: Vec::new(),
            free: Vec::new(),
            now: 0,
        next_seq: 0,
        }
    }

    /// Current simulated time.
    #[inline]
    pub fn now(&self) -> Tick {
        self.now
    }

    /// Number of live (scheduled, uncancelled) events.
    pub fn len(&self) -> usize {
        self.records.len() - self.free.len()
    }

    /// True when no live events remain.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Schedules `action` to run at `when` with the given priority class.
    ///
    /// Scheduling in the past is a bug in the caller and panics in debug
    /// builds; release builds clamp to `now`.
    pub fn schedule(&mut self, when: Tick, class: EventClass, action: EventAction) -> EventId {
        debug_assert!(when >= self.now, "event scheduled in the past");
        let when = when.max(self.now);
        let seq = self.next_seq;
        self.next_seq += 1;

        let record = EventRecord {
            action: Some(action),
            seq,
            cancelled: false,
        };
        let slot = if let Some(slot) = self.free.pop() {
            self.records[slot] = record;
            slot
        } else {
            self.records.push(record);
            self.records.len() - 1
        };

        tracing::trace!(target: "event", when, ?class, slot, "schedule");
        self.heap.push(Reverse(HeapKey {
            when,
            class,
            seq,
            slot,
        }));
        EventId { slot, seq }
    }

    /// Cancels a scheduled event in O(1). A stale id (already fired or
    /// already cancelled) is ignored.
    pub fn deschedule(&mut self, id: EventId) {
        if let Some(record) = self.records.get_mut(id.slot) {
            if record.seq == id.seq && !record.cancelled {
                record.cancelled = true;
            }
        }
    }

    /// True while the event behind `id` is still pending.
    pub fn is_scheduled(&self, id: EventId) -> bool {
        self.records
            .get(id.slot)
            .is_some_and(|r| r.seq == id.seq && !r.cancelled && r.action.is_some())
    }

    /// Pops the next due event, advancing `now` to its tick.
    ///
    /// Cancelled heap entries are discarded here. Returns `None` when the
    /// queue has drained.
    ///
    /// # Errors
    ///
    /// [`SimError::EventUnderflow`] if an uncancelled entry is found below
    /// the current tick, which indicates scheduler misuse.
    pub fn pop(&mut self) -> Result<Option<(Tick, EventAction)>, SimError> {
        while let Some(Reverse(key)) = self.heap.pop() {
            let record = &mut self.records[key.slot];
            if record.seq != key.seq || record.cancelled {
                // Lazily reclaim cancelled or superseded entries.
                if record.seq == key.seq {
                    record.action = None;
                    self.free.push(key.slot);
                }
                continue;
            }
            if key.when < self.now {
                return Err(SimError::EventUnderflow(self.now));
            }
            self.now = key.when;
            let action = record.action.take();
            self.free.push(key.slot);
            match action {
                Some(action) => return Ok(Some((key.when, action))),
                None => return Err(SimError::EventUnderflow(self.now)),
            }
        }
        Ok(None)
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(cpu: CpuId, stage: Stage) -> EventAction {
        EventAction::CoreStage { cpu, stage }
    }

    #[test]
    fn pops_in_tick_then_class_order() {
        let mut q = EventQueue::new();
        q.schedule(10, EventClass::Fetch, stage(0, Stage::Fetch));
        q.schedule(10, EventClass::Commit, stage(0, Stage::Commit));
        q.schedule(5, EventClass::Dispatch, stage(0, Stage::Dispatch));

        let (t1, a1) = q.pop().unwrap().unwrap();
        assert_eq!(t1, 5);
        assert!(matches!(a1, EventAction::CoreStage { stage: Stage::Dispatch, .. }));

        let (t2, a2) = q.pop().unwrap().unwrap();
        assert_eq!(t2, 10);
        assert!(matches!(a2, EventAction::CoreStage { stage: Stage::Commit, .. }));

        let (t3, a3) = q.pop().unwrap().unwrap();
        assert_eq!(t3, 10);
        assert!(matches!(a3, EventAction::CoreStage { stage: Stage::Fetch, .. }));
    }

    #[test]
    fn ties_break_by_insertion_order() {
        let mut q = EventQueue::new();
        q.schedule(3, EventClass::MemoryController, stage(1, Stage::Fetch));
        q.schedule(3, EventClass::MemoryController, stage(2, Stage::Fetch));
        let (_, a1) = q.pop().unwrap().unwrap();
        let (_, a2) = q.pop().unwrap().unwrap();
        assert!(matches!(a1, EventAction::CoreStage { cpu: 1, .. }));
        assert!(matches!(a2, EventAction::CoreStage { cpu: 2, .. }));
    }

    #[test]
    fn deschedule_discards_lazily() {
        let mut q = EventQueue::new();
        let id = q.schedule(4, EventClass::Issue, stage(0, Stage::Issue));
        q.schedule(6, EventClass::Issue, stage(1, Stage::Issue));
        assert!(q.is_scheduled(id));
        q.deschedule(id);
        assert!(!q.is_scheduled(id));

        let (t, a) = q.pop().unwrap().unwrap();
        assert_eq!(t, 6);
        assert!(matches!(a, EventAction::CoreStage { cpu: 1, .. }));
    }

    #[test]
    fn slot_reuse_does_not_resurrect_old_ids() {
        let mut q = EventQueue::new();
        let id = q.schedule(1, EventClass::Commit, stage(0, Stage::Commit));
        let _ = q.pop().unwrap().unwrap();
        // The slot is reused by a new event; the old id must stay dead.
        let id2 = q.schedule(2, EventClass::Commit, stage(0, Stage::Commit));
        assert!(!q.is_scheduled(id));
        assert!(q.is_scheduled(id2));
        q.deschedule(id);
        assert!(q.is_scheduled(id2));
    }

    #[test]
    fn empty_queue_pops_none() {
        let mut q = EventQueue::new();
        assert!(q.pop().unwrap().is_none());
    }
}
