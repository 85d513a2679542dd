//! Fetch-loss ("floss") cause accounting.
//!
//! Every cycle each stage tags why it stopped early; the tags flow
//! backward so lost fetch bandwidth is attributed to whichever thread
//! owned the wasted slot and to the stage condition that caused it.

use crate::common::ThreadId;

/// Reasons commit may terminate for a thread in a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum CommitEndCause {
    /// Nothing to commit.
    RobEmpty,
    /// Commit bandwidth limit reached.
    Bandwidth,
    /// Store buffer full.
    StoreBufferFull,
    /// Memory barrier at the head.
    MemBarrier,
    /// Head not finished: functional unit still busy (meta-cause).
    Fu,
    /// Head not finished: outstanding data cache miss (meta-cause).
    DCacheMiss,
}

impl CommitEndCause {
    /// Number of commit end causes.
    pub const COUNT: usize = 6;
}

/// Reasons dispatch may terminate in a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum DispatchEndCause {
    /// Out of physical integer registers.
    IntRegFull,
    /// Out of physical floating-point registers.
    FpRegFull,
    /// Fetch queue empty.
    NoInst,
    /// Per-thread ROB cap reached.
    RobCap,
    /// Per-thread IQ cap reached.
    IqCap,
    /// Dispatch bandwidth limit.
    Bandwidth,
    /// Dispatch policy refused the thread.
    Policy,
    /// Serializing instruction waiting for the pipe to drain.
    Serializing,
    /// IQ full (meta-cause).
    IqFull,
    /// LSQ full (meta-cause).
    LsqFull,
    /// ROB full (meta-cause).
    RobFull,
}

impl DispatchEndCause {
    /// Number of dispatch end causes.
    pub const COUNT: usize = 11;
}

/// Reasons fetch may terminate in a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum FetchEndCause {
    /// No loss this cycle.
    None,
    /// Fetch bandwidth exhausted (normal full cycle).
    Bandwidth,
    /// Per-cycle branch limit reached.
    BranchLimit,
    /// PC outside the program image.
    InvalidPc,
    /// Predicted taken with no target available.
    BtbMiss,
    /// Fetch stalled by branch-misprediction recovery.
    BranchRecovery,
    /// Fetch stalled by a fault-induced flush.
    FaultFlush,
    /// Synchronization (serializing instruction in flight).
    Sync,
    /// Thread skipped for low branch confidence.
    LowConfidence,
    /// Thread-selection policy gave the slot away.
    Policy,
    /// Instruction cache miss (meta-cause).
    IMiss,
    /// Fetch queue full (meta-cause).
    QFull,
}

impl FetchEndCause {
    /// Number of fetch end causes.
    pub const COUNT: usize = 12;
}

/// Per-thread accounting of lost slots at each pipe entrance.
#[derive(Debug, Clone)]
pub struct FlossCounters {
    /// Fetch slots lost, per thread per cause.
    pub fetch: Vec<[u64; FetchEndCause::COUNT]>,
    /// Dispatch slots lost, per thread per cause.
    pub dispatch: Vec<[u64; DispatchEndCause::COUNT]>,
    /// Commit slots lost, per thread per cause.
    pub commit: Vec<[u64; CommitEndCause::COUNT]>,
}

impl FlossCounters {
    /// Creates zeroed counters for `threads` threads.
    pub fn new(threads: usize) -> Self {
        Self {
            fetch: vec![[0; FetchEndCause::COUNT]; threads],
            dispatch: vec![[0; DispatchEndCause::COUNT]; threads],
            commit: vec![[0; CommitEndCause::COUNT]; threads],
        }
    }

    /// Charges `slots` lost fetch slots to a thread and cause.
    pub fn charge_fetch(&mut self, thread: ThreadId, cause: FetchEndCause, slots: u64) {
        if cause != FetchEndCause::None && cause != FetchEndCause::Bandwidth {
            self.fetch[thread][cause as usize] += slots;
        }
    }

    /// Charges `slots` lost dispatch slots to a thread and cause.
    pub fn charge_dispatch(&mut self, thread: ThreadId, cause: DispatchEndCause, slots: u64) {
        self.dispatch[thread][cause as usize] += slots;
    }

    /// Charges `slots` lost commit slots to a thread and cause.
    pub fn charge_commit(&mut self, thread: ThreadId, cause: CommitEndCause, slots: u64) {
        self.commit[thread][cause as usize] += slots;
    }

    /// Total fetch slots lost across all causes and threads.
    pub fn total_fetch_loss(&self) -> u64 {
        self.fetch.iter().map(|c| c.iter().sum::<u64>()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bandwidth_and_none_are_not_losses() {
        let mut floss = FlossCounters::new(1);
        floss.charge_fetch(0, FetchEndCause::None, 4);
        floss.charge_fetch(0, FetchEndCause::Bandwidth, 4);
        assert_eq!(floss.total_fetch_loss(), 0);
        floss.charge_fetch(0, FetchEndCause::QFull, 2);
        assert_eq!(floss.total_fetch_loss(), 2);
    }
}
