//! Top-level simulator: cores, memory system, and the event loop.
//!
//! The driver pops every event due at the current tick in priority
//! order; per-core stage events fan out to commit, writeback, issue,
//! dispatch, and fetch (in that order), reschedule themselves one cycle
//! ahead, and the bus/controller events advance their own machines.

use std::cell::RefCell;
use std::rc::Rc;

use crate::common::error::SimError;
use crate::common::{CpuId, ThreadId, Tick};
use crate::config::Config;
use crate::cpu::context::SpecContext;
use crate::cpu::inst::Program;
use crate::cpu::spec_mem::MainMemory;
use crate::cpu::{AccessOutcome, Core, CoreMemory};
use crate::event::{EventAction, EventClass, EventQueue, Stage};
use crate::mem::accounting::{PerformanceMeasurement, Policy};
use crate::mem::bus::BusPhase;
use crate::mem::req::{LatencyKind, MemReq};
use crate::sim::system::{BUS_INTERCONNECT, BUS_MEMORY, MemSystem};
use crate::stats::SimStats;

/// Adapter giving one core timing access to the memory system.
struct CoreMemView<'a> {
    cpu: CpuId,
    now: Tick,
    mem: &'a mut MemSystem,
}

impl CoreMemory for CoreMemView<'_> {
    fn load(&mut self, req: MemReq) -> AccessOutcome {
        self.mem.access_l1d(self.cpu, req, self.now)
    }

    fn store(&mut self, req: MemReq) -> AccessOutcome {
        self.mem.store_l1d(self.cpu, req, self.now)
    }

    fn ifetch(&mut self, req: MemReq) -> AccessOutcome {
        self.mem.access_l1i(self.cpu, req, self.now)
    }
}

/// The simulator.
pub struct Simulator {
    /// The cores.
    pub cores: Vec<Core>,
    /// Everything below the cores.
    pub mem: MemSystem,
    events: EventQueue,
    config: Config,
    policy: Option<Box<dyn Policy>>,
    policy_interval: Tick,
    last_policy_tick: Tick,
    exit_code: i32,
}

impl Simulator {
    /// Builds the machine.
    ///
    /// # Errors
    ///
    /// [`SimError::Config`] when the configuration is inconsistent.
    pub fn new(config: Config) -> Result<Self, SimError> {
        config.validate()?;
        let functional_mem = Rc::new(RefCell::new(MainMemory::new()));
        let cores = (0..config.general.cpu_count)
            .map(|cpu| {
                let contexts = (0..config.general.threads_per_cpu)
                    .map(|t| SpecContext::new(t, functional_mem.clone()))
                    .collect();
                Core::new(cpu, &config, contexts)
            })
            .collect();
        let mem = MemSystem::new(&config);
        Ok(Self {
            cores,
            mem,
            events: EventQueue::new(),
            config,
            policy: None,
            policy_interval: 0,
            last_policy_tick: 0,
            exit_code: 0,
        })
    }

    /// Installs an adaptive policy sampled every `interval` ticks.
    pub fn set_policy(&mut self, policy: Box<dyn Policy>, interval: Tick) {
        self.policy = Some(policy);
        self.policy_interval = interval.max(1);
    }

    /// Loads a program onto a core's thread.
    pub fn load_program(&mut self, cpu: CpuId, thread: ThreadId, program: Program) {
        self.cores[cpu].load_program(thread, program);
    }

    /// Current simulated time.
    pub fn now(&self) -> Tick {
        self.events.now()
    }

    /// Runs to the configured end tick (or until every core halts).
    ///
    /// # Errors
    ///
    /// Propagates simulation-fatal errors from the event queue.
    pub fn run(&mut self) -> Result<SimStats, SimError> {
        // Seed the per-core stage events and the exit marker.
        for cpu in 0..self.cores.len() {
            for (stage, class) in [
                (Stage::Commit, EventClass::Commit),
                (Stage::Writeback, EventClass::Writeback),
                (Stage::Issue, EventClass::Issue),
                (Stage::Dispatch, EventClass::Dispatch),
                (Stage::Fetch, EventClass::Fetch),
            ] {
                let _ = self
                    .events
                    .schedule(1, class, EventAction::CoreStage { cpu, stage });
            }
        }
        let _ = self.events.schedule(
            self.config.general.end_tick,
            EventClass::SimExit,
            EventAction::SimExit,
        );
        if self.policy.is_some() {
            let _ = self.events.schedule(
                self.policy_interval,
                EventClass::MemoryController,
                EventAction::PolicySample,
            );
        }

        loop {
            let Some((now, action)) = self.events.pop()? else {
                break;
            };
            match action {
                EventAction::CoreStage { cpu, stage } => {
                    self.handle_core_stage(cpu, stage, now);
                }
                EventAction::BusArbitrateAddr { bus } => {
                    self.mem
                        .handle_bus_arbitrate(bus, BusPhase::Addr, now, &mut self.events);
                    debug_assert!(bus == BUS_INTERCONNECT || bus == BUS_MEMORY);
                }
                EventAction::BusArbitrateData { bus } => {
                    self.mem
                        .handle_bus_arbitrate(bus, BusPhase::Data, now, &mut self.events);
                }
                EventAction::MemCtrlService => {
                    self.mem.handle_memctrl(now, &mut self.events);
                }
                EventAction::Deliver { dest, req } => {
                    let deliveries = self.mem.handle_deliver(dest, *req, now, &mut self.events);
                    for (cpu, resp) in deliveries.responses {
                        self.cores[cpu].mem_response(now, &resp);
                    }
                }
                EventAction::PolicySample => {
                    self.policy_sample(now);
                }
                EventAction::SimExit => {
                    break;
                }
            }
        }

        Ok(self.collect_stats())
    }

    /// Exit code: zero on reaching the end tick, nonzero after an
    /// invariant violation.
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    fn handle_core_stage(&mut self, cpu: CpuId, stage: Stage, now: Tick) {
        {
            let core = &mut self.cores[cpu];
            let mut view = CoreMemView {
                cpu,
                now,
                mem: &mut self.mem,
            };
            match stage {
                Stage::Commit => core.tick_commit(now, &mut view),
                Stage::Writeback => core.tick_writeback(now),
                Stage::Issue => core.tick_issue(now, &mut view),
                Stage::Dispatch => core.tick_dispatch(now),
                Stage::Fetch => core.tick_fetch(now, &mut view),
            }
        }
        self.mem.pump(now, &mut self.events);

        // Stage events are self-rescheduling while the core runs.
        if !self.cores[cpu].is_halted() {
            let class = match stage {
                Stage::Commit => EventClass::Commit,
                Stage::Writeback => EventClass::Writeback,
                Stage::Issue => EventClass::Issue,
                Stage::Dispatch => EventClass::Dispatch,
                Stage::Fetch => EventClass::Fetch,
            };
            let _ = self
                .events
                .schedule(now + 1, class, EventAction::CoreStage { cpu, stage });
        }
    }

    fn policy_sample(&mut self, now: Tick) {
        let measurement = self.build_measurement(now);
        if let Some(policy) = &mut self.policy {
            let decision = policy.measure(&measurement);
            self.mem.apply_policy(decision.way_quotas, decision.mshr_counts);
        }
        let _ = self.events.schedule(
            now + self.policy_interval,
            EventClass::MemoryController,
            EventAction::PolicySample,
        );
    }

    fn build_measurement(&mut self, now: Tick) -> PerformanceMeasurement {
        let cpus = self.cores.len();
        let mut m = PerformanceMeasurement {
            at_tick: now,
            ..PerformanceMeasurement::default()
        };
        for core in &self.cores {
            m.committed_instructions.push(core.stats.committed_total());
            m.stall_cycles.push(core.stats.mem_stall_cycles);
            m.responses_while_stalled.push(core.stats.responses_while_stalled);
            m.requests_below_l1.push(core.stats.loads_below_l1);
            let mlp = if core.stats.mem_stall_cycles > 0 {
                core.stats.responses_while_stalled as f64 / core.stats.mem_stall_cycles as f64
            } else {
                0.0
            };
            m.mlp_estimate.push(mlp);
        }
        for cpu in 0..cpus {
            let lat = self.mem.intman.average_latencies(cpu);
            m.avg_shared_latency.push(lat[0]);
            let mut breakdown = [0.0; LatencyKind::COUNT];
            breakdown.copy_from_slice(&lat[1..]);
            m.latency_breakdown.push(breakdown);
            let inter = self.mem.intman.average_interference(cpu);
            m.avg_interference.push(inter.iter().sum());
            m.interference_breakdown.push(inter);
        }
        m.cache_measurements = self.mem.cache_interference.miss_measurement_sample();
        let hits: u64 = self.mem.llc.iter().map(|c| c.stats.hits).sum();
        let misses: u64 = self.mem.llc.iter().map(|c| c.stats.misses).sum();
        m.llc_miss_rate = if hits + misses > 0 {
            misses as f64 / (hits + misses) as f64
        } else {
            0.0
        };
        m.bus_utilization = self.mem.membus.utilization(now.max(1));
        m.bank_accesses = self.mem.memctrl.banks.stats.accesses_per_bank.clone();
        m
    }

    fn collect_stats(&mut self) -> SimStats {
        let cpus = self.cores.len();
        SimStats {
            end_tick: self.events.now(),
            cores: self.cores.iter().map(|c| c.stats.clone()).collect(),
            bpred: self.cores.iter().map(|c| c.bpred.stats.clone()).collect(),
            l1i: self.mem.l1i.iter().map(|c| c.stats.clone()).collect(),
            l1d: self.mem.l1d.iter().map(|c| c.stats.clone()).collect(),
            llc: self.mem.llc.iter().map(|c| c.stats.clone()).collect(),
            interconnect: self.mem.interconnect.stats.clone(),
            membus: self.mem.membus.stats.clone(),
            dram: self.mem.memctrl.banks.stats.clone(),
            interference: self.mem.cache_interference.stats.clone(),
            avg_latency: (0..cpus).map(|c| self.mem.intman.average_latencies(c)).collect(),
            avg_interference: (0..cpus)
                .map(|c| self.mem.intman.average_interference(c))
                .collect(),
        }
    }
}
