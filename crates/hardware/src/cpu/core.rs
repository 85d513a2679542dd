//! One out-of-order superscalar core.
//!
//! The core is execution-driven: instructions execute functionally, in
//! program order, at dispatch, so branch outcomes are known as soon as
//! the branch dispatches. A mispredicted branch switches the thread into
//! spec mode, where everything fetched behind it is wrong-path and
//! executes against the copy-on-write overlay; the squash fires when
//! the branch reaches writeback in the timing model.
//!
//! Stage handlers are driven by per-cycle events in the priority order
//! commit, writeback, issue, dispatch, fetch, so newer pipe stages see
//! older-cycle state and freed resources become visible to fetch within
//! the same cycle.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};

use crate::common::error::Fault;
use crate::cpu::inst::ExecContext;
use crate::common::rand::XorShift64;
use crate::common::{Addr, CpuId, ThreadId, Tick};
use crate::config::{CommitModel, Config, FetchPolicy};
use crate::cpu::bpred::{BranchPred, Confidence, LookupResult};
use crate::cpu::context::SpecContext;
use crate::cpu::floss::{CommitEndCause, DispatchEndCause, FetchEndCause, FlossCounters};
use crate::cpu::fu_pool::FuncUnitPool;
use crate::cpu::inst::{DynInst, OpClass, Program, RegClass, RegId};
use crate::cpu::iq::{InstQueue, IqReject};
use crate::cpu::lsq::{LoadIssue, Lsq};
use crate::cpu::rob::Rob;
use crate::cpu::store_buffer::{PendingStore, StoreBuffer};
use crate::mem::req::{MemCmd, MemReq, ReqFlags};
use crate::trace::{PipeStage, PipeTrace};

/// Outcome of a timing access into the memory hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessOutcome {
    /// Serviced locally; data available after the given latency.
    Hit(Tick),
    /// Missed; a response will be delivered later.
    MissPending,
    /// The cache is blocked; retry next cycle.
    Blocked,
}

/// Timing interface the core issues memory operations through.
pub trait CoreMemory {
    /// Data load.
    fn load(&mut self, req: MemReq) -> AccessOutcome;
    /// Data store (store-buffer drain).
    fn store(&mut self, req: MemReq) -> AccessOutcome;
    /// Instruction fetch.
    fn ifetch(&mut self, req: MemReq) -> AccessOutcome;
}

/// Ideal memory with a fixed latency; used by unit tests and the
/// cacheless CLI mode.
pub struct PerfectMemory {
    /// Latency returned for every access.
    pub latency: Tick,
}

impl CoreMemory for PerfectMemory {
    fn load(&mut self, _req: MemReq) -> AccessOutcome {
        AccessOutcome::Hit(self.latency)
    }
    fn store(&mut self, _req: MemReq) -> AccessOutcome {
        AccessOutcome::Hit(self.latency)
    }
    fn ifetch(&mut self, _req: MemReq) -> AccessOutcome {
        AccessOutcome::Hit(self.latency)
    }
}

/// Extra pre-scheduling latency charged when the load hit/miss predictor
/// disagrees with a hit assumption.
const MISS_PENALTY_LINES: u64 = 8;

/// Per-core statistics.
#[derive(Debug, Clone, Default)]
pub struct CoreStats {
    /// Cycles this core was ticked.
    pub cycles: u64,
    /// Committed instructions per thread.
    pub committed: Vec<u64>,
    /// Committed branches.
    pub branches: u64,
    /// Committed conditional branches.
    pub cond_branches: u64,
    /// Branch mispredictions recovered.
    pub mispredicts: u64,
    /// Committed loads.
    pub loads: u64,
    /// Committed stores.
    pub stores: u64,
    /// Instructions squashed.
    pub squashed: u64,
    /// Loads that left the core (L1 misses).
    pub loads_below_l1: u64,
    /// Cycles commit retired nothing while the ROB head waited on memory.
    pub mem_stall_cycles: u64,
    /// Memory responses that arrived during such stalls.
    pub responses_while_stalled: u64,
    /// Instruction fetch stalls waiting on the I-cache.
    pub ifetch_stall_cycles: u64,
    /// Fault-induced pipeline flushes.
    pub fault_flushes: u64,
}

impl CoreStats {
    /// Total committed instructions across threads.
    pub fn committed_total(&self) -> u64 {
        self.committed.iter().sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StallReason {
    BranchRecovery,
    FaultFlush,
}

fn reg_key(reg: RegId) -> usize {
    let class = match reg.class {
        RegClass::Int => 0,
        RegClass::Float => 1,
        RegClass::Misc => 2,
    };
    class * 256 + reg.index
}

/// One out-of-order core.
pub struct Core {
    /// This core's id in the chip.
    pub cpu_id: CpuId,
    threads: usize,

    fetch_width: usize,
    dispatch_width: usize,
    issue_width: usize,
    commit_width: usize,
    ifq_size: usize,
    fetch_policy: FetchPolicy,
    commit_model: CommitModel,
    fault_flush_penalty: Tick,
    line_bytes: usize,
    l1d_hit_latency: Tick,

    /// The branch predictor.
    pub bpred: BranchPred,
    rob: Rob,
    iq: InstQueue,
    lsq: Lsq,
    store_buffer: StoreBuffer,
    fu_pool: FuncUnitPool,
    /// Per-thread execution contexts.
    pub contexts: Vec<SpecContext>,

    programs: Vec<Option<Program>>,
    pcs: Vec<Addr>,
    ifq: Vec<VecDeque<u64>>,
    inflight: HashMap<u64, DynInst>,
    next_fetch_seq: u64,
    next_cp_seq: Vec<u64>,

    create_vec: Vec<HashMap<RegId, u64>>,
    int_regs_free: usize,
    fp_regs_free: usize,

    completions: BinaryHeap<Reverse<(Tick, u64)>>,

    fetch_stall_until: Vec<Tick>,
    stall_reason: Vec<Option<StallReason>>,
    ifetch_pending: Vec<Option<Addr>>,
    last_fetch_line: Vec<Option<Addr>>,
    fetch_rr: usize,
    commit_rr: usize,
    low_conf_branches: Vec<u64>,

    // 2-bit load hit/miss predictor, keyed by load PC.
    hitmiss: HashMap<Addr, u8>,

    rng: XorShift64,
    stalled_on_mem: bool,
    halted: bool,

    /// Fetch/dispatch/commit loss accounting.
    pub floss: FlossCounters,
    /// Core statistics.
    pub stats: CoreStats,
    /// Optional pipe trace.
    pub pipetrace: Option<PipeTrace>,
}

impl Core {
    /// Builds a core from the configuration.
    pub fn new(cpu_id: CpuId, config: &Config, contexts: Vec<SpecContext>) -> Self {
        let threads = config.general.threads_per_cpu;
        let cpu = &config.cpu;
        let mut fu_pool = FuncUnitPool::new(&cpu.fu_pool);
        fu_pool.annotate_memory_units(config.cache.l1d.hit_latency);
        Self {
            cpu_id,
            threads,
            fetch_width: cpu.fetch_width,
            dispatch_width: cpu.dispatch_width,
            issue_width: cpu.issue_width,
            commit_width: cpu.commit_width,
            ifq_size: cpu.ifq_size,
            fetch_policy: cpu.fetch_policy,
            commit_model: cpu.commit_model,
            fault_flush_penalty: cpu.fault_flush_penalty,
            line_bytes: config.cache.l1i.line_bytes,
            l1d_hit_latency: config.cache.l1d.hit_latency,
            bpred: BranchPred::new(&config.bpred, threads),
            rob: Rob::new(cpu.rob_size, threads, cpu.per_thread_cap),
            iq: InstQueue::new(
                cpu.iq_variant,
                cpu.iq_size,
                threads,
                cpu.per_thread_cap,
                cpu.issue_width,
            ),
            lsq: Lsq::new(cpu.lsq_size, threads, cpu.per_thread_cap),
            store_buffer: StoreBuffer::new(cpu.store_buffer_size),
            fu_pool,
            contexts,
            programs: vec![None; threads],
            pcs: vec![0; threads],
            ifq: vec![VecDeque::new(); threads],
            inflight: HashMap::new(),
            next_fetch_seq: 1,
            next_cp_seq: vec![1; threads],
            create_vec: vec![HashMap::new(); threads],
            int_regs_free: cpu.int_phys_regs,
            fp_regs_free: cpu.fp_phys_regs,
            completions: BinaryHeap::new(),
            fetch_stall_until: vec![0; threads],
            stall_reason: vec![None; threads],
            ifetch_pending: vec![None; threads],
            last_fetch_line: vec![None; threads],
            fetch_rr: 0,
            commit_rr: 0,
            low_conf_branches: vec![0; threads],
            hitmiss: HashMap::new(),
            rng: XorShift64::new(config.general.seed ^ (cpu_id as u64 + 1)),
            stalled_on_mem: false,
            halted: false,
            floss: FlossCounters::new(threads),
            stats: CoreStats {
                committed: vec![0; threads],
                ..CoreStats::default()
            },
            pipetrace: None,
        }
    }

    /// Loads a program onto a thread and points fetch at its entry.
    pub fn load_program(&mut self, thread: ThreadId, program: Program) {
        self.pcs[thread] = program.entry();
        self.programs[thread] = Some(program);
    }

    /// True once a workload signalled halt.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// In-flight instruction count (fetched, not yet committed/squashed).
    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    // ------------------------------------------------------------------
    // Commit
    // ------------------------------------------------------------------

    /// Commit stage: runs first within a tick.
    pub fn tick_commit(&mut self, now: Tick, mem: &mut dyn CoreMemory) {
        self.stats.cycles += 1;
        if let Some(trace) = &mut self.pipetrace {
            if trace.new_cycle(now) {
                self.halted = true;
            }
        }

        self.drain_store_buffer(now, mem);

        let mut slots = self.commit_width;
        let mut committed_any = false;
        let mut head_mem_stall = false;
        let mut thread = self.commit_rr % self.threads;
        let mut tried = vec![false; self.threads];

        while slots > 0 {
            if tried.iter().all(|&t| t) {
                break;
            }
            let Some(seq) = self.rob.head(thread) else {
                self.floss
                    .charge_commit(thread, CommitEndCause::RobEmpty, slots as u64);
                tried[thread] = true;
                match self.commit_model {
                    CommitModel::Superscalar => break,
                    _ => {
                        thread = (thread + 1) % self.threads;
                        continue;
                    }
                }
            };

            let inst = &self.inflight[&seq];
            if !inst.completed {
                let cause = if inst.is_mem_ref() && inst.issued {
                    head_mem_stall = true;
                    CommitEndCause::DCacheMiss
                } else {
                    CommitEndCause::Fu
                };
                self.floss.charge_commit(thread, cause, slots as u64);
                tried[thread] = true;
                match self.commit_model {
                    CommitModel::Superscalar | CommitModel::PerThreadStrict => break,
                    _ => {
                        thread = (thread + 1) % self.threads;
                        continue;
                    }
                }
            }

            if inst.static_inst.is_mem_barrier() && !self.store_buffer.is_empty() {
                self.floss
                    .charge_commit(thread, CommitEndCause::MemBarrier, slots as u64);
                tried[thread] = true;
                thread = (thread + 1) % self.threads;
                continue;
            }
            if inst.static_inst.is_store() && self.store_buffer.is_full() {
                self.floss
                    .charge_commit(thread, CommitEndCause::StoreBufferFull, slots as u64);
                tried[thread] = true;
                thread = (thread + 1) % self.threads;
                continue;
            }

            // Retire.
            self.commit_one(now, thread, seq);
            committed_any = true;
            slots -= 1;

            match self.commit_model {
                CommitModel::RoundRobin | CommitModel::SmtFair => {
                    thread = (thread + 1) % self.threads;
                }
                CommitModel::PerThreadStrict | CommitModel::Superscalar => {}
            }
        }

        self.commit_rr = (self.commit_rr + 1) % self.threads.max(1);
        self.stalled_on_mem = !committed_any && head_mem_stall;
        if self.stalled_on_mem {
            self.stats.mem_stall_cycles += 1;
        }
    }

    fn commit_one(&mut self, now: Tick, thread: ThreadId, seq: u64) {
        let committed = self.rob.commit_head(thread);
        debug_assert_eq!(committed, Some(seq));
        let Some(inst) = self.inflight.remove(&seq) else {
            return;
        };
        debug_assert!(!inst.wrong_path, "wrong-path instruction reached commit");

        if inst.static_inst.is_store() {
            self.lsq.remove(thread, seq);
            self.store_buffer.push(PendingStore {
                paddr: inst.phys_eff_addr,
                size: 8,
                thread,
                seq,
            });
            self.stats.stores += 1;
        }
        if inst.static_inst.is_load() {
            self.stats.loads += 1;
        }

        if inst.static_inst.is_control() {
            self.stats.branches += 1;
            if inst.static_inst.is_cond_ctrl() {
                self.stats.cond_branches += 1;
            }
            if let Some(rec) = &inst.bp_update {
                let correct = inst.pred_pc == inst.next_pc;
                self.bpred.update(
                    thread,
                    inst.pc,
                    inst.next_pc,
                    inst.taken,
                    inst.pred_taken,
                    correct,
                    inst.static_inst.as_ref(),
                    rec,
                );
                if rec.conf_result == Some(Confidence::Low) {
                    self.low_conf_branches[thread] =
                        self.low_conf_branches[thread].saturating_sub(1);
                }
            }
        }

        self.release_regs(&inst);
        // Last writer committed: consumers read architectural state.
        for &dest in inst.static_inst.dest_regs() {
            if self.create_vec[thread].get(&dest).copied() == Some(seq) {
                let _ = self.create_vec[thread].remove(&dest);
            }
        }

        self.stats.committed[thread] += 1;

        if let Some(trace) = &mut self.pipetrace {
            trace.move_inst(&inst, PipeStage::Commit, 0, 0, 0);
            trace.delete_inst(&inst);
        }

        // Architected trap path: the faulting instruction counts as
        // committed, everything younger is flushed.
        if inst.fault.is_fault() {
            self.stats.fault_flushes += 1;
            if inst.fault == Fault::ProcessHalt {
                self.halted = true;
                return;
            }
            self.flush_thread(now, thread);
            self.pcs[thread] = inst.next_pc;
            self.fetch_stall_until[thread] = now + self.fault_flush_penalty;
            self.stall_reason[thread] = Some(StallReason::FaultFlush);
        }
    }

    fn drain_store_buffer(&mut self, now: Tick, mem: &mut dyn CoreMemory) {
        let Some(store) = self.store_buffer.peek() else {
            return;
        };
        let mut req = MemReq::new(MemCmd::Write, store.paddr, store.size, self.cpu_id, now);
        req.thread_id = store.thread;
        req.inst_seq = Some(store.seq);
        match mem.store(req) {
            AccessOutcome::Hit(_) | AccessOutcome::MissPending => {
                let _ = self.store_buffer.pop();
            }
            AccessOutcome::Blocked => {}
        }
    }

    // ------------------------------------------------------------------
    // Writeback
    // ------------------------------------------------------------------

    /// Writeback stage: drains due completions, resolves branches, and
    /// triggers misprediction recovery.
    pub fn tick_writeback(&mut self, now: Tick) {
        while let Some(&Reverse((when, seq))) = self.completions.peek() {
            if when > now {
                break;
            }
            let _ = self.completions.pop();
            let Some(inst) = self.inflight.get_mut(&seq) else {
                continue; // squashed while in flight
            };
            if inst.squashed {
                continue;
            }
            inst.executed = true;
            inst.completed = true;

            let thread = inst.thread;
            let is_load = inst.static_inst.is_load();
            let pc = inst.pc;
            let fetched_at = inst.fetched_at;
            let mispredict = inst.mispredict && !inst.wrong_path;
            let next_pc = inst.next_pc;

            if is_load {
                self.lsq.remove(thread, seq);
                // Train the hit/miss predictor on observed latency.
                let took = now.saturating_sub(fetched_at);
                let ctr = self.hitmiss.entry(pc).or_insert(1);
                if took > self.l1d_hit_latency * 4 {
                    *ctr = (*ctr + 1).min(3);
                } else if *ctr > 0 {
                    *ctr -= 1;
                }
            }

            if let Some(trace) = &mut self.pipetrace {
                let inst = &self.inflight[&seq];
                trace.move_inst(inst, PipeStage::Writeback, 0, 0, 0);
            }

            self.iq.writeback(seq);

            if mispredict {
                self.recover(now, thread, seq, next_pc);
            }
        }
    }

    /// Misprediction recovery: walk the ROB from the offending branch,
    /// squash every younger entry, and restore front-end state.
    fn recover(&mut self, now: Tick, thread: ThreadId, branch_seq: u64, target: Addr) {
        tracing::debug!(target: "cpu", cpu = self.cpu_id, thread, branch_seq, redirect = target, "recover");
        let squashed = self.rob.squash_after(thread, branch_seq);
        self.squash_set(thread, &squashed);

        // Fetched-but-undispatched wrong-path instructions.
        let ifq: Vec<u64> = self.ifq[thread].drain(..).collect();
        for seq in ifq {
            if let Some(inst) = self.inflight.remove(&seq) {
                self.stats.squashed += 1;
                if let Some(trace) = &mut self.pipetrace {
                    trace.delete_inst(&inst);
                }
            }
        }

        self.contexts[thread].reset_spec_state();
        if let Some(inst) = self.inflight.get(&branch_seq) {
            if let Some(rec) = &inst.bp_update {
                self.bpred.recover(thread, rec);
            }
        }
        self.low_conf_branches[thread] = 0;
        self.stats.mispredicts += 1;

        self.pcs[thread] = target;
        self.fetch_stall_until[thread] = now + 1;
        self.stall_reason[thread] = Some(StallReason::BranchRecovery);
        self.last_fetch_line[thread] = None;
        self.ifetch_pending[thread] = None;
    }

    /// Squashes a youngest-first list of ROB-resident instructions.
    fn squash_set(&mut self, thread: ThreadId, seqs: &[u64]) {
        self.iq.squash(seqs);
        self.lsq.squash(thread, seqs);
        for &seq in seqs {
            if let Some(mut inst) = self.inflight.remove(&seq) {
                inst.squashed = true;
                // Undo this instruction's speculative memory writes.
                for &block in inst.spec_blocks.iter().rev() {
                    self.contexts[thread].undo_spec_write(block);
                }
                // Restore the create vector in reverse rename order.
                for &(reg, prev) in inst.renamed.iter().rev() {
                    match prev {
                        Some(p) => {
                            let _ = self.create_vec[thread].insert(reg, p);
                        }
                        None => {
                            let _ = self.create_vec[thread].remove(&reg);
                        }
                    }
                }
                self.release_regs(&inst);
                self.stats.squashed += 1;
                if let Some(trace) = &mut self.pipetrace {
                    trace.delete_inst(&inst);
                }
            }
        }
    }

    fn flush_thread(&mut self, now: Tick, thread: ThreadId) {
        let _ = now;
        let squashed = self.rob.squash_all(thread);
        self.squash_set(thread, &squashed);
        let ifq: Vec<u64> = self.ifq[thread].drain(..).collect();
        for seq in ifq {
            if let Some(inst) = self.inflight.remove(&seq) {
                self.stats.squashed += 1;
                if let Some(trace) = &mut self.pipetrace {
                    trace.delete_inst(&inst);
                }
            }
        }
        self.contexts[thread].reset_spec_state();
        self.low_conf_branches[thread] = 0;
        self.last_fetch_line[thread] = None;
        self.ifetch_pending[thread] = None;
    }

    fn release_regs(&mut self, inst: &DynInst) {
        for &dest in inst.static_inst.dest_regs() {
            match dest.class {
                RegClass::Int => self.int_regs_free += 1,
                RegClass::Float => self.fp_regs_free += 1,
                RegClass::Misc => {}
            }
        }
    }

    // ------------------------------------------------------------------
    // Issue
    // ------------------------------------------------------------------

    /// Issue stage: select ready instructions and acquire functional
    /// units; loads access the data cache.
    pub fn tick_issue(&mut self, now: Tick, mem: &mut dyn CoreMemory) {
        self.fu_pool.tick();
        self.iq.tick();

        let mut slots = self.issue_width;
        let candidates = self.iq.ready_candidates(self.issue_width * 2);
        for seq in candidates {
            if slots == 0 {
                break;
            }
            let Some(inst) = self.inflight.get(&seq) else {
                self.iq.remove(seq);
                continue;
            };
            let class = inst.static_inst.op_class();
            let thread = inst.thread;
            let is_load = inst.static_inst.is_load();
            let is_store = inst.static_inst.is_store();
            let eff_addr = inst.eff_addr;
            let phys_addr = inst.phys_eff_addr;
            let wrong_path = inst.wrong_path;

            // Null-class instructions need no functional unit.
            let op_lat = if class == OpClass::Null {
                1
            } else {
                let lat = self.fu_pool.acquire(class);
                assert!(lat != -2, "no functional unit provides {class:?}");
                if lat == -1 {
                    continue; // all capable units busy; retry next cycle
                }
                lat as Tick
            };

            if is_load {
                match self.lsq.check_load(thread, seq, eff_addr, 8) {
                    LoadIssue::Blocked => continue,
                    LoadIssue::Forward(_) => {
                        self.finish_issue(now, seq, self.l1d_hit_latency.max(1));
                    }
                    LoadIssue::Ok => {
                        let mut req =
                            MemReq::new(MemCmd::Read, phys_addr, 8, self.cpu_id, now);
                        req.vaddr = eff_addr;
                        req.thread_id = thread;
                        req.inst_seq = Some(seq);
                        if wrong_path {
                            // Wrong-path accesses still occupy real
                            // resources in the hierarchy.
                            req.flags.set(ReqFlags::NO_ALLOCATE);
                        }
                        match mem.load(req) {
                            AccessOutcome::Hit(lat) => {
                                self.finish_issue(now, seq, lat.max(op_lat));
                            }
                            AccessOutcome::MissPending => {
                                self.stats.loads_below_l1 += 1;
                                self.mark_issued_waiting(seq);
                            }
                            AccessOutcome::Blocked => continue,
                        }
                    }
                }
            } else if is_store {
                // Stores only generate their address at issue; the data
                // drains after commit through the store buffer.
                self.finish_issue(now, seq, op_lat.max(1));
            } else {
                self.finish_issue(now, seq, op_lat.max(1));
            }
            slots -= 1;
        }
    }

    fn finish_issue(&mut self, now: Tick, seq: u64, latency: Tick) {
        self.iq.remove(seq);
        if let Some(inst) = self.inflight.get_mut(&seq) {
            inst.issued = true;
            self.completions.push(Reverse((now + latency, seq)));
            if let Some(trace) = &mut self.pipetrace {
                trace.move_inst(inst, PipeStage::Execute, 0, 0, 0);
            }
        }
    }

    fn mark_issued_waiting(&mut self, seq: u64) {
        self.iq.remove(seq);
        if let Some(inst) = self.inflight.get_mut(&seq) {
            inst.issued = true;
            if let Some(trace) = &mut self.pipetrace {
                trace.move_inst(inst, PipeStage::Execute, 1, 0, 1);
            }
        }
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Dispatch stage: functional execution (program order), rename, and
    /// backend allocation.
    pub fn tick_dispatch(&mut self, now: Tick) {
        let mut slots = self.dispatch_width;
        let mut thread = self.fetch_rr % self.threads.max(1);
        let mut stopped = vec![false; self.threads];

        while slots > 0 && !stopped.iter().all(|&s| s) {
            if self.ifq[thread].is_empty() || stopped[thread] {
                if !stopped[thread] {
                    self.floss
                        .charge_dispatch(thread, DispatchEndCause::NoInst, slots as u64);
                    stopped[thread] = true;
                }
                thread = (thread + 1) % self.threads;
                continue;
            }

            let seq = self.ifq[thread][0];
            match self.try_dispatch_one(now, thread, seq) {
                Ok(()) => {
                    let _ = self.ifq[thread].pop_front();
                    slots -= 1;
                }
                Err(cause) => {
                    self.floss.charge_dispatch(thread, cause, slots as u64);
                    stopped[thread] = true;
                    thread = (thread + 1) % self.threads;
                }
            }
        }
    }

    fn try_dispatch_one(
        &mut self,
        now: Tick,
        thread: ThreadId,
        seq: u64,
    ) -> Result<(), DispatchEndCause> {
        let inst = &self.inflight[&seq];
        let static_inst = inst.static_inst.clone();
        let pc = inst.pc;
        let pred_pc = inst.pred_pc;
        // Wrong-path status is decided here, not at fetch: instructions
        // fetched down a predicted path before the branch dispatched are
        // wrong-path exactly when the thread is in spec mode now.
        let wrong_path = self.contexts[thread].spec_mode() > 0;

        if static_inst.is_serializing() && self.rob.thread_len(thread) > 0 {
            return Err(DispatchEndCause::Serializing);
        }
        if self.rob.thread_blocked(thread) {
            return Err(if self.rob.is_full() {
                DispatchEndCause::RobFull
            } else {
                DispatchEndCause::RobCap
            });
        }
        let is_mem = static_inst.is_load() || static_inst.is_store();
        if is_mem && self.lsq.thread_blocked(thread) {
            return Err(DispatchEndCause::LsqFull);
        }
        let mut int_needed = 0;
        let mut fp_needed = 0;
        for &dest in static_inst.dest_regs() {
            match dest.class {
                RegClass::Int => int_needed += 1,
                RegClass::Float => fp_needed += 1,
                RegClass::Misc => {}
            }
        }
        if int_needed > self.int_regs_free {
            return Err(DispatchEndCause::IntRegFull);
        }
        if fp_needed > self.fp_regs_free {
            return Err(DispatchEndCause::FpRegFull);
        }

        // Rename inputs against the thread's create vector.
        let mut producers = Vec::new();
        for &src in static_inst.src_regs() {
            if let Some(&p) = self.create_vec[thread].get(&src) {
                if self
                    .inflight
                    .get(&p)
                    .is_some_and(|prod| !prod.completed && !prod.squashed)
                {
                    producers.push(p);
                }
            }
        }

        // Pre-scheduled insertion latency: producing latency, plus the
        // cache hit latency for loads, plus a penalty when the hit/miss
        // predictor disagrees with the hit assumption.
        let class = static_inst.op_class();
        let mut sched_latency = u64::from(self.fu_pool.max_op_latency(class).max(1));
        if static_inst.is_load() {
            sched_latency += self.l1d_hit_latency;
            if self.hitmiss.get(&pc).copied().unwrap_or(0) >= 2 {
                sched_latency += MISS_PENALTY_LINES;
            }
        }

        let src_keys: Vec<usize> = static_inst.src_regs().iter().map(|&r| reg_key(r)).collect();
        let dest_keys: Vec<usize> = static_inst.dest_regs().iter().map(|&r| reg_key(r)).collect();

        match self
            .iq
            .insert(seq, thread, &producers, sched_latency, &src_keys, &dest_keys)
        {
            Ok(()) => {}
            Err(IqReject::Full) | Err(IqReject::LinePastCursor) => {
                return Err(DispatchEndCause::IqFull);
            }
        }

        let rob_ok = self.rob.allocate(thread, seq);
        debug_assert!(rob_ok);
        if is_mem {
            let lsq_ok = self.lsq.insert(seq, thread, static_inst.is_store());
            debug_assert!(lsq_ok);
        }

        // Functional (oracle) execution in program order.
        let xc = &mut self.contexts[thread];
        let eff_addr = static_inst.mem_addr(xc);
        let fault = static_inst.execute(xc, pc);
        let taken = if static_inst.is_control() {
            static_inst.branch_taken(xc)
        } else {
            false
        };
        let next_pc = if static_inst.is_control() {
            if taken {
                static_inst.actual_target(xc, pc)
            } else {
                pc + static_inst.size() as Addr
            }
        } else {
            pc + static_inst.size() as Addr
        };
        let spec_blocks = xc.drain_write_log();
        let mispredict = static_inst.is_control() && !wrong_path && next_pc != pred_pc;
        if mispredict {
            xc.enter_spec();
        }

        // Commit rename state and bookkeeping.
        self.int_regs_free -= int_needed;
        self.fp_regs_free -= fp_needed;
        let mut renamed = Vec::new();
        for &dest in static_inst.dest_regs() {
            let prev = self.create_vec[thread].insert(dest, seq);
            renamed.push((dest, prev));
        }

        if let Some(addr) = eff_addr {
            let paddr = self.contexts[thread].translate(addr);
            self.lsq.set_addr(thread, seq, addr, 8);
            if let Some(inst) = self.inflight.get_mut(&seq) {
                inst.eff_addr = addr;
                inst.phys_eff_addr = paddr;
            }
        }

        let Some(inst) = self.inflight.get_mut(&seq) else {
            return Ok(());
        };
        inst.wrong_path = wrong_path;
        inst.fault = if wrong_path { Fault::None } else { fault };
        inst.taken = taken;
        inst.next_pc = next_pc;
        inst.mispredict = mispredict;
        inst.spec_blocks = spec_blocks;
        inst.renamed = renamed;
        inst.waiting_on = producers.len();

        if let Some(trace) = &mut self.pipetrace {
            trace.move_inst(inst, PipeStage::Dispatch, 0, 0, 0);
        }
        tracing::trace!(
            target: "dispatch",
            cpu = self.cpu_id,
            seq,
            pc,
            mispredict,
            "dispatch"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Fetch
    // ------------------------------------------------------------------

    /// Fetch stage: runs last within a tick.
    pub fn tick_fetch(&mut self, now: Tick, mem: &mut dyn CoreMemory) {
        if self.halted {
            return;
        }
        let thread = self.select_fetch_thread();
        self.fetch_rr = (self.fetch_rr + 1) % self.threads.max(1);
        let Some(thread) = thread else {
            return;
        };

        if self.fetch_stall_until[thread] > now {
            let cause = match self.stall_reason[thread] {
                Some(StallReason::FaultFlush) => FetchEndCause::FaultFlush,
                _ => FetchEndCause::BranchRecovery,
            };
            self.floss
                .charge_fetch(thread, cause, self.fetch_width as u64);
            return;
        }
        self.stall_reason[thread] = None;

        if self.ifetch_pending[thread].is_some() {
            self.stats.ifetch_stall_cycles += 1;
            self.floss
                .charge_fetch(thread, FetchEndCause::IMiss, self.fetch_width as u64);
            return;
        }

        let mut fetched = 0u64;
        while fetched < self.fetch_width as u64 {
            if self.ifq[thread].len() >= self.ifq_size {
                self.floss.charge_fetch(
                    thread,
                    FetchEndCause::QFull,
                    self.fetch_width as u64 - fetched,
                );
                break;
            }
            let pc = self.pcs[thread];
            let Some(static_inst) = self.programs[thread].as_ref().and_then(|p| p.fetch(pc))
            else {
                // A wrong-path PC outside the image is lost bandwidth; a
                // finished thread is merely idle.
                let cause = if self.contexts[thread].spec_mode() > 0 {
                    FetchEndCause::InvalidPc
                } else {
                    FetchEndCause::None
                };
                self.floss
                    .charge_fetch(thread, cause, self.fetch_width as u64 - fetched);
                break;
            };

            // One I-cache access per fetched line.
            let line = pc & !(self.line_bytes as Addr - 1);
            if self.last_fetch_line[thread] != Some(line) {
                let mut req = MemReq::new(MemCmd::Read, line, self.line_bytes, self.cpu_id, now);
                req.thread_id = thread;
                req.flags.set(ReqFlags::INST_READ | ReqFlags::CACHE_LINE_FILL);
                match mem.ifetch(req) {
                    AccessOutcome::Hit(_) => {
                        self.last_fetch_line[thread] = Some(line);
                    }
                    AccessOutcome::MissPending => {
                        self.ifetch_pending[thread] = Some(line);
                        self.floss.charge_fetch(
                            thread,
                            FetchEndCause::IMiss,
                            self.fetch_width as u64 - fetched,
                        );
                        break;
                    }
                    AccessOutcome::Blocked => {
                        self.floss.charge_fetch(
                            thread,
                            FetchEndCause::IMiss,
                            self.fetch_width as u64 - fetched,
                        );
                        break;
                    }
                }
            }

            let seq = self.next_fetch_seq;
            self.next_fetch_seq += 1;
            let wrong_path = self.contexts[thread].spec_mode() > 0;
            let cp_seq = if wrong_path {
                self.next_cp_seq[thread]
            } else {
                let s = self.next_cp_seq[thread];
                self.next_cp_seq[thread] += 1;
                s
            };

            let mut inst = DynInst::new(static_inst.clone(), seq, cp_seq, thread, pc, now);
            inst.wrong_path = wrong_path;

            let mut stop_after = false;
            let mut btb_missed = false;
            if static_inst.is_control() {
                let (result, rec, confidence) =
                    self.bpred.lookup(thread, pc, static_inst.as_ref());
                match result {
                    LookupResult::PredictNotTaken => {
                        inst.pred_taken = false;
                        inst.pred_pc = pc + static_inst.size() as Addr;
                    }
                    LookupResult::PredictTakenWithTarget(target) => {
                        inst.pred_taken = true;
                        inst.pred_pc = target;
                        stop_after = true;
                    }
                    LookupResult::PredictTakenNoTarget => {
                        // Predicted taken with nowhere to go: fall through
                        // and let writeback recover.
                        inst.pred_taken = true;
                        inst.pred_pc = pc + static_inst.size() as Addr;
                        btb_missed = true;
                    }
                }
                if confidence == Some(Confidence::Low) {
                    self.low_conf_branches[thread] += 1;
                }
                inst.bp_update = Some(rec);
            }

            self.pcs[thread] = inst.pred_pc;
            if let Some(trace) = &mut self.pipetrace {
                trace.new_inst(&inst);
                trace.move_inst(&inst, PipeStage::Fetch, 0, 0, 0);
            }
            self.ifq[thread].push_back(seq);
            let _ = self.inflight.insert(seq, inst);
            fetched += 1;

            if btb_missed {
                self.floss.charge_fetch(
                    thread,
                    FetchEndCause::BtbMiss,
                    self.fetch_width as u64 - fetched,
                );
                break;
            }
            if stop_after {
                self.floss.charge_fetch(
                    thread,
                    FetchEndCause::BranchLimit,
                    self.fetch_width as u64 - fetched,
                );
                break;
            }
        }
    }

    fn select_fetch_thread(&mut self) -> Option<ThreadId> {
        let eligible: Vec<ThreadId> = (0..self.threads)
            .filter(|&t| self.programs[t].is_some())
            .collect();
        if eligible.is_empty() {
            return None;
        }
        let chosen = match self.fetch_policy {
            FetchPolicy::RoundRobin => eligible[self.fetch_rr % eligible.len()],
            FetchPolicy::InstructionCount => eligible
                .iter()
                .copied()
                .min_by_key(|&t| self.rob.thread_len(t) + self.ifq[t].len())?,
            FetchPolicy::ConfidenceBiased => eligible
                .iter()
                .copied()
                .min_by_key(|&t| self.low_conf_branches[t])?,
            FetchPolicy::Redundant => {
                // The leading thread owns the slot while it has work.
                let lead = eligible[0];
                if self.ifq[lead].len() < self.ifq_size {
                    lead
                } else {
                    eligible[self.fetch_rr % eligible.len()]
                }
            }
            FetchPolicy::Random => eligible[self.rng.next_below(eligible.len())],
        };
        Some(chosen)
    }

    // ------------------------------------------------------------------
    // Memory responses
    // ------------------------------------------------------------------

    /// Delivers a memory response to the core.
    pub fn mem_response(&mut self, now: Tick, req: &MemReq) {
        if req.is_inst_fetch() {
            let line = req.block_addr(self.line_bytes);
            let thread = req.thread_id;
            if self.ifetch_pending.get(thread).copied().flatten() == Some(line) {
                self.ifetch_pending[thread] = None;
                self.last_fetch_line[thread] = Some(line);
            }
            return;
        }
        if self.stalled_on_mem {
            self.stats.responses_while_stalled += 1;
        }
        if let Some(seq) = req.inst_seq {
            if self.inflight.get(&seq).is_some_and(|i| !i.squashed && i.issued) {
                self.completions.push(Reverse((now, seq)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::context::SpecContext;
    use crate::cpu::inst::{SynthInst, SynthStatic};
    use crate::cpu::spec_mem::MainMemory;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn build_core(config: &Config) -> Core {
        let mem = Rc::new(RefCell::new(MainMemory::new()));
        let contexts = (0..config.general.threads_per_cpu)
            .map(|t| SpecContext::new(t, mem.clone()))
            .collect();
        Core::new(0, config, contexts)
    }

    fn nops(n: usize) -> Program {
        Program::new(
            0x1000,
            (0..n).map(|_| SynthStatic::new(SynthInst::Nop)).collect(),
        )
    }

    fn run(core: &mut Core, mem: &mut dyn CoreMemory, cycles: u64) {
        let _ = run_until(core, mem, cycles, u64::MAX);
    }

    /// Runs until `target` instructions commit (or `cycles` elapse) and
    /// returns the cycle of the last commit.
    fn run_until(core: &mut Core, mem: &mut dyn CoreMemory, cycles: u64, target: u64) -> u64 {
        let mut done_at = 0;
        for now in 1..=cycles {
            core.tick_commit(now, mem);
            core.tick_writeback(now);
            core.tick_issue(now, mem);
            core.tick_dispatch(now);
            core.tick_fetch(now, mem);
            if core.stats.committed_total() >= target {
                done_at = now;
                break;
            }
            if core.is_halted() {
                done_at = now;
                break;
            }
        }
        done_at
    }

    #[test]
    fn nop_workload_reaches_width_limited_ipc() {
        // 1024 independent NOPs on a 4-wide machine: committed = 1024 in
        // about 256 cycles, and no fetch bandwidth is lost.
        let config = Config::default();
        let mut core = build_core(&config);
        core.load_program(0, nops(1024));
        let mut mem = PerfectMemory { latency: 1 };
        let done_at = run_until(&mut core, &mut mem, 400, 1024);
        assert_eq!(core.stats.committed_total(), 1024);
        assert!(done_at > 0, "did not finish in 400 cycles");
        assert!(done_at <= 256 + 16, "took {done_at} cycles");
        assert_eq!(core.floss.total_fetch_loss(), 0);
    }

    #[test]
    fn dependent_chain_commits_in_order() {
        let config = Config::default();
        let mut core = build_core(&config);
        let prog = Program::new(
            0x1000,
            vec![
                SynthStatic::new(SynthInst::IntOp {
                    dest: 1,
                    srcs: vec![],
                    class: OpClass::IntAlu,
                }),
                SynthStatic::new(SynthInst::IntOp {
                    dest: 2,
                    srcs: vec![1],
                    class: OpClass::IntAlu,
                }),
                SynthStatic::new(SynthInst::IntOp {
                    dest: 3,
                    srcs: vec![2],
                    class: OpClass::IntAlu,
                }),
            ],
        );
        core.load_program(0, prog);
        let mut mem = PerfectMemory { latency: 1 };
        run(&mut core, &mut mem, 100);
        assert_eq!(core.stats.committed_total(), 3);
        // r1 = 1, r2 = r1 + 1, r3 = r2 + 1.
        assert_eq!(core.contexts[0].arch_int(3), 3);
    }

    #[test]
    fn taken_loop_converges_and_commits_all_iterations() {
        // r1 counts down from 10; bnez loops back to the decrement.
        let config = Config::default();
        let mut core = build_core(&config);
        // dec: r1 = r1 - 1 encoded as add of r2 (-1 two's complement via
        // wrapping): use IntOp with srcs [1, 2] where r2 = -2 so the sum
        // 1 + r1 + r2 = r1 - 1.
        let prog = Program::new(
            0x1000,
            vec![
                SynthStatic::new(SynthInst::IntOp {
                    dest: 1,
                    srcs: vec![1, 2],
                    class: OpClass::IntAlu,
                }),
                SynthStatic::new(SynthInst::CondBranch { src: 1, offset: -4 }),
            ],
        );
        core.load_program(0, prog);
        core.contexts[0].set_arch_int(1, 10);
        core.contexts[0].set_arch_int(2, (-2i64) as u64);
        let mut mem = PerfectMemory { latency: 1 };
        run(&mut core, &mut mem, 2000);
        assert_eq!(core.contexts[0].arch_int(1), 0);
        // 10 decrements + 10 branches.
        assert_eq!(core.stats.committed_total(), 20);
        assert!(core.stats.cond_branches >= 9);
    }

    #[test]
    fn misprediction_recovery_squashes_wrong_path() {
        // A branch that is taken exactly once: the default predictor
        // starts weakly not-taken, so the first execution mispredicts and
        // wrong-path instructions must not corrupt r5.
        let config = Config::default();
        let mut core = build_core(&config);
        let prog = Program::new(
            0x1000,
            vec![
                // 0x1000: branch over the poison write when r1 != 0.
                SynthStatic::new(SynthInst::CondBranch { src: 1, offset: 8 }),
                // 0x1004: wrong path: r5 = poison.
                SynthStatic::new(SynthInst::IntOp {
                    dest: 5,
                    srcs: vec![6],
                    class: OpClass::IntAlu,
                }),
                // 0x1008: target: nop.
                SynthStatic::new(SynthInst::Nop),
            ],
        );
        core.load_program(0, prog);
        core.contexts[0].set_arch_int(1, 1);
        core.contexts[0].set_arch_int(5, 42);
        core.contexts[0].set_arch_int(6, 1000);
        let mut mem = PerfectMemory { latency: 1 };
        run(&mut core, &mut mem, 200);
        // The wrong-path write to r5 was squashed.
        assert_eq!(core.contexts[0].arch_int(5), 42);
        assert!(core.stats.mispredicts >= 1);
        assert!(core.stats.squashed >= 1);
        // Committed: branch + nop (and nothing from the wrong path).
        assert_eq!(core.stats.committed_total(), 2);
    }

    #[test]
    fn rob_sequence_numbers_strictly_increase() {
        let config = Config::default();
        let mut core = build_core(&config);
        core.load_program(0, nops(64));
        let mut mem = PerfectMemory { latency: 1 };
        // Committing runs the monotonicity assertion inside the ROB.
        run(&mut core, &mut mem, 100);
        assert_eq!(core.stats.committed_total(), 64);
    }

    #[test]
    fn store_then_load_forwards_and_commits() {
        let config = Config::default();
        let mut core = build_core(&config);
        let prog = Program::new(
            0x1000,
            vec![
                SynthStatic::new(SynthInst::Store {
                    src: 2,
                    base: 1,
                    offset: 0,
                }),
                SynthStatic::new(SynthInst::Load {
                    dest: 3,
                    base: 1,
                    offset: 0,
                }),
            ],
        );
        core.load_program(0, prog);
        core.contexts[0].set_arch_int(1, 0x2000);
        core.contexts[0].set_arch_int(2, 77);
        let mut mem = PerfectMemory { latency: 2 };
        run(&mut core, &mut mem, 100);
        assert_eq!(core.stats.committed_total(), 2);
        assert_eq!(core.contexts[0].arch_int(3), 77);
        assert_eq!(core.stats.loads, 1);
        assert_eq!(core.stats.stores, 1);
    }

    #[test]
    fn halt_fault_stops_the_core() {
        let config = Config::default();
        let mut core = build_core(&config);
        let prog = Program::new(
            0x1000,
            vec![
                SynthStatic::new(SynthInst::Nop),
                SynthStatic::new(SynthInst::Trap(Fault::ProcessHalt)),
                SynthStatic::new(SynthInst::Nop),
            ],
        );
        core.load_program(0, prog);
        let mut mem = PerfectMemory { latency: 1 };
        run(&mut core, &mut mem, 100);
        assert!(core.is_halted());
        assert_eq!(core.stats.committed_total(), 2);
    }
}
