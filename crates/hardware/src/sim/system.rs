//! The shared memory system.
//!
//! Owns everything below the cores: private L1s, the banked shared
//! cache, the interconnect and memory buses, the bus bridge, the memory
//! controller, and the accounting machinery. All cross-component
//! communication is a request object moving into the destination's
//! queue plus a scheduled handler event; no component re-enters another
//! once a request is handed off.

use crate::common::{Addr, CpuId, Tick};
use crate::config::{Coherence, Config};
use crate::cpu::AccessOutcome;
use crate::event::{DeliveryDest, EventAction, EventClass, EventQueue};
use crate::mem::accounting::InterferenceManager;
use crate::mem::bus::{Bus, BusBridge, BusPhase, Grant, IfaceKind};
use crate::mem::cache::interference::CacheInterference;
use crate::mem::cache::{Cache, CacheAccessResult};
use crate::mem::dram::controller::{CtrlOutcome, MemCtrl};
use crate::mem::req::{LatencyKind, MemCmd, MemReq, ReqFlags};
use crate::trace::DramTrace;

/// Index of the interconnect in bus-event routing.
pub const BUS_INTERCONNECT: usize = 0;
/// Index of the memory bus in bus-event routing.
pub const BUS_MEMORY: usize = 1;

/// Responses ready to be pushed into a core after a handler ran.
#[derive(Debug, Default)]
pub struct CoreDeliveries {
    /// (cpu, response) pairs.
    pub responses: Vec<(CpuId, MemReq)>,
}

/// The memory system below the cores.
pub struct MemSystem {
    cpu_count: usize,
    line_bytes: usize,
    llc_banks: usize,
    l1_coherence: Coherence,

    /// Private instruction caches, one per core.
    pub l1i: Vec<Cache>,
    /// Private data caches, one per core.
    pub l1d: Vec<Cache>,
    /// Shared cache banks.
    pub llc: Vec<Cache>,
    /// The core-to-shared-cache interconnect.
    pub interconnect: Bus,
    /// The shared-cache-to-memory bus.
    pub membus: Bus,
    /// Bridge between the shared cache and the memory bus.
    pub bridge: BusBridge,
    /// The memory controller and DDR2 banks.
    pub memctrl: MemCtrl,
    /// Shadow-tag interference estimator.
    pub cache_interference: CacheInterference,
    /// Latency/interference accounting service.
    pub intman: InterferenceManager,
    /// Optional DRAM access trace.
    pub dram_trace: Option<DramTrace>,

    // Interface ids.
    ic_iface_d: Vec<usize>,
    ic_iface_i: Vec<usize>,
    ic_iface_bank: Vec<usize>,
    mb_iface_bank: Vec<usize>,
    mb_iface_slave: usize,

    // One pending arbitration event per bus and phase.
    arb_pending: [[bool; 2]; 2],
    memctrl_pending: bool,
}

impl MemSystem {
    /// Builds the memory system from the configuration.
    pub fn new(config: &Config) -> Self {
        let cpus = config.general.cpu_count;
        let banks = config.cache.llc_banks;
        let llc_sets = config.cache.llc.sets();
        let bank_sets = (llc_sets / banks).max(1);

        let mut interconnect = Bus::new(
            "interconnect",
            config.bus.width_bytes,
            config.bus.clock,
            config.bus.arbitration,
            cpus,
            banks,
        );
        let mut membus = Bus::new(
            "membus",
            config.bus.width_bytes,
            config.bus.clock,
            config.bus.arbitration,
            cpus,
            banks,
        );

        let ic_iface_d: Vec<usize> = (0..cpus)
            .map(|c| interconnect.add_interface(IfaceKind::CpuMaster(c)))
            .collect();
        let ic_iface_i: Vec<usize> = (0..cpus)
            .map(|c| interconnect.add_interface(IfaceKind::CpuMaster(c)))
            .collect();
        let ic_iface_bank: Vec<usize> = (0..banks)
            .map(|b| interconnect.add_interface(IfaceKind::BankMaster(b)))
            .collect();
        let mb_iface_bank: Vec<usize> = (0..banks)
            .map(|b| membus.add_interface(IfaceKind::BankMaster(b)))
            .collect();
        let mb_iface_slave = membus.add_interface(IfaceKind::Slave);

        Self {
            cpu_count: cpus,
            line_bytes: config.cache.llc.line_bytes,
            llc_banks: banks,
            l1_coherence: config.cache.l1d.coherence,
            l1i: (0..cpus)
                .map(|c| Cache::new(format!("cpu{c}.l1i"), &config.cache.l1i, cpus, None))
                .collect(),
            l1d: (0..cpus)
                .map(|c| Cache::new(format!("cpu{c}.l1d"), &config.cache.l1d, cpus, None))
                .collect(),
            llc: (0..banks)
                .map(|b| Cache::new(format!("llc.bank{b}"), &config.cache.llc, cpus, Some(bank_sets)))
                .collect(),
            interconnect,
            membus,
            bridge: BusBridge::new(16, config.bus.clock),
            memctrl: MemCtrl::new(&config.dram, cpus),
            cache_interference: CacheInterference::new(
                cpus,
                llc_sets,
                config.cache.llc.assoc,
                config.cache.llc.line_bytes,
                config.interference.leader_sets,
                config.interference.policy,
                config.interference.ipp_bits,
                config.general.seed,
            ),
            intman: InterferenceManager::new(
                cpus,
                config.accounting.sample_size,
                config.accounting.reset_interval,
            ),
            dram_trace: None,
            ic_iface_d,
            ic_iface_i,
            ic_iface_bank,
            mb_iface_bank,
            mb_iface_slave,
            arb_pending: [[false; 2]; 2],
            memctrl_pending: false,
        }
    }

    /// Bank holding a block address.
    #[inline]
    pub fn bank_of(&self, paddr: Addr) -> usize {
        ((paddr / self.line_bytes as Addr) % self.llc_banks as Addr) as usize
    }

    // ------------------------------------------------------------------
    // Core-facing access points
    // ------------------------------------------------------------------

    /// Data load from a core.
    pub fn access_l1d(&mut self, cpu: CpuId, req: MemReq, now: Tick) -> AccessOutcome {
        if self.l1d[cpu].is_blocked() {
            return AccessOutcome::Blocked;
        }
        match self.l1d[cpu].access(req, now) {
            CacheAccessResult::Hit(lat) => AccessOutcome::Hit(lat),
            CacheAccessResult::Miss => AccessOutcome::MissPending,
            CacheAccessResult::Blocked => AccessOutcome::Blocked,
            CacheAccessResult::Dropped => AccessOutcome::Hit(1),
        }
    }

    /// Store drain from a core's store buffer.
    pub fn store_l1d(&mut self, cpu: CpuId, req: MemReq, now: Tick) -> AccessOutcome {
        if self.l1d[cpu].is_blocked() {
            return AccessOutcome::Blocked;
        }
        match self.l1d[cpu].access(req, now) {
            CacheAccessResult::Hit(lat) => AccessOutcome::Hit(lat),
            CacheAccessResult::Miss => AccessOutcome::MissPending,
            CacheAccessResult::Blocked => AccessOutcome::Blocked,
            CacheAccessResult::Dropped => AccessOutcome::Hit(1),
        }
    }

    /// Instruction fetch from a core.
    pub fn access_l1i(&mut self, cpu: CpuId, req: MemReq, now: Tick) -> AccessOutcome {
        if self.l1i[cpu].is_blocked() {
            return AccessOutcome::Blocked;
        }
        match self.l1i[cpu].access(req, now) {
            CacheAccessResult::Hit(lat) => AccessOutcome::Hit(lat),
            CacheAccessResult::Miss => AccessOutcome::MissPending,
            CacheAccessResult::Blocked => AccessOutcome::Blocked,
            CacheAccessResult::Dropped => AccessOutcome::Hit(1),
        }
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    /// Moves queued work between components and schedules the events
    /// that keep it flowing. Called after every handler.
    pub fn pump(&mut self, now: Tick, events: &mut EventQueue) {
        // L1 outgoing -> interconnect address phase.
        for cpu in 0..self.cpu_count {
            while let Some(mut req) = self.l1d[cpu].next_outgoing() {
                let entry_wait = now.saturating_sub(req.time);
                req.add_latency(LatencyKind::InterconnectEntry, entry_wait);
                req.entered_mem_sys_at = now;
                self.interconnect
                    .enqueue(BusPhase::Addr, self.ic_iface_d[cpu], req, now);
            }
            while let Some(mut req) = self.l1i[cpu].next_outgoing() {
                let entry_wait = now.saturating_sub(req.time);
                req.add_latency(LatencyKind::InterconnectEntry, entry_wait);
                req.entered_mem_sys_at = now;
                self.interconnect
                    .enqueue(BusPhase::Addr, self.ic_iface_i[cpu], req, now);
            }
        }

        // LLC outgoing -> bridge -> memory bus address phase.
        for bank in 0..self.llc_banks {
            while !self.bridge.is_full() {
                let Some(req) = self.llc[bank].next_outgoing() else {
                    break;
                };
                let _ = self.bridge.push(req, now);
            }
        }
        while let Some(mut req) = self.bridge.pop_ready(now) {
            let bank = self.bank_of(req.paddr);
            req.add_latency(
                LatencyKind::MemoryBusEntry,
                now.saturating_sub(req.time).min(self.bridge_latency()),
            );
            self.membus
                .enqueue(BusPhase::Addr, self.mb_iface_bank[bank], req, now);
        }

        // Unblock the memory bus once the controller has room.
        if self.membus.is_blocked() && !self.memctrl.is_full() {
            self.membus.clear_blocked();
        }

        // Schedule arbitration and controller service.
        self.schedule_arb(BUS_INTERCONNECT, BusPhase::Addr, now, events);
        self.schedule_arb(BUS_INTERCONNECT, BusPhase::Data, now, events);
        self.schedule_arb(BUS_MEMORY, BusPhase::Addr, now, events);
        self.schedule_arb(BUS_MEMORY, BusPhase::Data, now, events);
        if self.memctrl.has_requests() && !self.memctrl_pending {
            self.memctrl_pending = true;
            let _ = events.schedule(now + 1, EventClass::MemoryController, EventAction::MemCtrlService);
        }
        if self.bridge.next_ready().is_some_and(|t| t > now) {
            // Wake up when the bridge head crosses.
            if !self.arb_pending[BUS_MEMORY][0] {
                self.arb_pending[BUS_MEMORY][0] = true;
                let when = self.bridge.next_ready().unwrap_or(now + 1).max(now + 1);
                let _ = events.schedule(
                    when,
                    EventClass::MemoryController,
                    EventAction::BusArbitrateAddr { bus: BUS_MEMORY },
                );
            }
        }
    }

    fn bridge_latency(&self) -> Tick {
        self.interconnect.clock()
    }

    fn schedule_arb(&mut self, bus_idx: usize, phase: BusPhase, now: Tick, events: &mut EventQueue) {
        let phase_idx = usize::from(phase == BusPhase::Data);
        if self.arb_pending[bus_idx][phase_idx] {
            return;
        }
        let bus = if bus_idx == BUS_INTERCONNECT {
            &self.interconnect
        } else {
            &self.membus
        };
        let Some(when) = bus.next_arb_time(phase, now) else {
            return;
        };
        self.arb_pending[bus_idx][phase_idx] = true;
        let action = match phase {
            BusPhase::Addr => EventAction::BusArbitrateAddr { bus: bus_idx },
            BusPhase::Data => EventAction::BusArbitrateData { bus: bus_idx },
        };
        let _ = events.schedule(when, EventClass::MemoryController, action);
    }

    // ------------------------------------------------------------------
    // Event handlers
    // ------------------------------------------------------------------

    /// Handles a bus arbitration event.
    pub fn handle_bus_arbitrate(
        &mut self,
        bus_idx: usize,
        phase: BusPhase,
        now: Tick,
        events: &mut EventQueue,
    ) {
        let phase_idx = usize::from(phase == BusPhase::Data);
        self.arb_pending[bus_idx][phase_idx] = false;

        let blocked = if bus_idx == BUS_INTERCONNECT {
            self.interconnect.is_blocked()
        } else {
            self.membus.is_blocked()
        };
        if blocked {
            return;
        }

        let grant = {
            let bus = if bus_idx == BUS_INTERCONNECT {
                &mut self.interconnect
            } else {
                &mut self.membus
            };
            match phase {
                BusPhase::Addr => bus.arbitrate_addr(now),
                BusPhase::Data => bus.arbitrate_data(now),
            }
        };

        if let Some(grant) = grant {
            match (bus_idx, phase) {
                (BUS_INTERCONNECT, BusPhase::Addr) => {
                    self.granted_ic_addr(grant, now, events);
                }
                (BUS_INTERCONNECT, BusPhase::Data) => {
                    self.granted_ic_data(grant, now, events);
                }
                (BUS_MEMORY, BusPhase::Addr) => {
                    self.granted_mb_addr(grant, now, events);
                }
                (BUS_MEMORY, BusPhase::Data) => {
                    self.granted_mb_data(grant, now, events);
                }
                _ => {}
            }
        }

        self.pump(now, events);
    }

    /// An L1 request won the interconnect address phase: snoop the other
    /// private caches, then deliver to the owning shared-cache bank.
    fn granted_ic_addr(&mut self, grant: Grant, now: Tick, events: &mut EventQueue) {
        let Grant {
            iface,
            mut req,
            queue_wait,
            transfer,
        } = grant;
        req.add_latency(LatencyKind::InterconnectRequestQueue, queue_wait);
        req.add_latency(LatencyKind::InterconnectRequestTransfer, transfer);

        // Snooping caches observe the address phase.
        if self.l1_coherence == Coherence::Snooping && !req.is_inst_fetch() {
            for cpu in 0..self.cpu_count {
                if self.ic_iface_d[cpu] == iface {
                    continue;
                }
                let result = self.l1d[cpu].snoop(&mut req, now);
                if let Some(supplied) = result.supplied {
                    // Dirty data travels as a writeback from the snooper.
                    self.interconnect.enqueue(
                        BusPhase::Addr,
                        self.ic_iface_d[cpu],
                        supplied,
                        now,
                    );
                }
            }
            if req.flags.any(ReqFlags::NACKED) {
                // The originator re-issues on its next grant.
                req.flags.clear(ReqFlags::NACKED);
                self.interconnect.enqueue(BusPhase::Addr, iface, req, now);
                return;
            }
        }

        let bank = self.bank_of(req.paddr);
        let _ = events.schedule(
            now + transfer,
            EventClass::MemoryController,
            EventAction::Deliver {
                dest: DeliveryDest::LlcBank(bank),
                req: Box::new(req),
            },
        );
    }

    /// A response won the interconnect data phase: deliver to the
    /// requesting core's private cache.
    fn granted_ic_data(&mut self, grant: Grant, now: Tick, events: &mut EventQueue) {
        let Grant {
            mut req,
            queue_wait,
            transfer,
            ..
        } = grant;
        req.add_latency(LatencyKind::InterconnectResponseQueue, queue_wait);
        req.add_latency(LatencyKind::InterconnectResponseTransfer, transfer);
        let dest = if req.is_inst_fetch() {
            DeliveryDest::L1Inst(req.true_requester)
        } else {
            DeliveryDest::L1Data(req.true_requester)
        };
        let _ = events.schedule(
            now + transfer,
            EventClass::MemoryController,
            EventAction::Deliver {
                dest,
                req: Box::new(req),
            },
        );
    }

    /// A shared-cache miss won the memory bus address phase.
    fn granted_mb_addr(&mut self, grant: Grant, now: Tick, events: &mut EventQueue) {
        let Grant {
            iface,
            mut req,
            queue_wait,
            transfer,
        } = grant;
        if self.memctrl.is_full() {
            // Failed grant: block the bus until the controller drains.
            self.membus.set_blocked();
            self.membus.enqueue(BusPhase::Addr, iface, req, now);
            return;
        }
        req.add_latency(LatencyKind::MemoryBusQueue, queue_wait);
        let _ = events.schedule(
            now + transfer,
            EventClass::MemoryController,
            EventAction::Deliver {
                dest: DeliveryDest::MemCtrl,
                req: Box::new(req),
            },
        );
    }

    /// A DRAM response won the memory bus data phase: back to the bank.
    fn granted_mb_data(&mut self, grant: Grant, now: Tick, events: &mut EventQueue) {
        let Grant {
            mut req,
            queue_wait,
            transfer,
            ..
        } = grant;
        req.add_latency(LatencyKind::MemoryBusService, transfer);
        req.add_latency(LatencyKind::MemoryBusQueue, queue_wait);
        let bank = self.bank_of(req.paddr);
        let _ = events.schedule(
            now + transfer,
            EventClass::MemoryController,
            EventAction::Deliver {
                dest: DeliveryDest::LlcBank(bank),
                req: Box::new(req),
            },
        );
    }

    /// Handles a delivery event. Responses that finished their journey
    /// are returned for the simulator to hand to the cores.
    pub fn handle_deliver(
        &mut self,
        dest: DeliveryDest,
        req: MemReq,
        now: Tick,
        events: &mut EventQueue,
    ) -> CoreDeliveries {
        let mut out = CoreDeliveries::default();
        match dest {
            DeliveryDest::LlcBank(bank) => {
                if req.is_satisfied() {
                    self.llc_response(bank, req, now);
                } else {
                    self.llc_request(bank, req, now, events);
                }
            }
            DeliveryDest::MemCtrl => {
                if self.memctrl.is_full() {
                    // Hold the request on the bus side until the
                    // controller drains.
                    self.membus.set_blocked();
                    let bank = self.bank_of(req.paddr);
                    self.membus
                        .enqueue(BusPhase::Addr, self.mb_iface_bank[bank], req, now);
                } else {
                    let _ = self.memctrl.insert(req, now);
                }
            }
            DeliveryDest::L1Data(cpu) => {
                let effects = self.l1d[cpu].handle_response(&req, now);
                let hit_lat = self.l1d[cpu].hit_latency();
                for mut target in effects.targets {
                    target.add_latency(LatencyKind::InterconnectDelivery, hit_lat);
                    if target.cmd == MemCmd::Read && !target.cmd.is_prefetch() {
                        let round_trip = (now + hit_lat).saturating_sub(target.time);
                        self.intman.complete_request(&target, round_trip);
                    }
                    out.responses.push((cpu, target));
                }
            }
            DeliveryDest::L1Inst(cpu) => {
                let effects = self.l1i[cpu].handle_response(&req, now);
                for target in effects.targets {
                    out.responses.push((cpu, target));
                }
            }
            DeliveryDest::Cpu(cpu) => {
                out.responses.push((cpu, req));
            }
        }
        self.pump(now, events);
        out
    }

    /// A request reached a shared-cache bank.
    fn llc_request(&mut self, bank: usize, mut req: MemReq, now: Tick, events: &mut EventQueue) {
        let hit_lat = self.llc[bank].hit_latency();

        // Shadow-tag replay for demand reads and writebacks.
        let track = matches!(req.cmd, MemCmd::Read | MemCmd::Writeback)
            && req.true_requester < self.cpu_count;
        if track {
            let would_miss = self.llc[bank]
                .tags
                .find_no_update(req.paddr, req.asid)
                .is_none();
            self.cache_interference.access(&mut req, would_miss, hit_lat, now);
        }

        let response_template = req.clone();
        match self.llc[bank].access(req, now) {
            CacheAccessResult::Hit(lat) => {
                if !response_template.cmd.is_no_response() {
                    let mut resp = response_template;
                    resp.flags.set(ReqFlags::SATISFIED);
                    self.interconnect.enqueue(
                        BusPhase::Data,
                        self.ic_iface_bank[bank],
                        resp,
                        now + lat,
                    );
                }
            }
            CacheAccessResult::Miss => {}
            CacheAccessResult::Blocked => {
                // Retry one bus cycle later.
                let _ = events.schedule(
                    now + self.interconnect.clock(),
                    EventClass::MemoryController,
                    EventAction::Deliver {
                        dest: DeliveryDest::LlcBank(bank),
                        req: Box::new(response_template),
                    },
                );
            }
            CacheAccessResult::Dropped => {}
        }
    }

    /// A fill returned to a shared-cache bank.
    fn llc_response(&mut self, bank: usize, req: MemReq, now: Tick) {
        let hit_lat = self.llc[bank].hit_latency();
        let effects = self.llc[bank].handle_response(&req, now);
        if effects.squashed {
            return;
        }

        // Interference bookkeeping runs on the original tracked request
        // (the first demand-read target), which carries the shadow-miss
        // and interference-miss tags set on the way in.
        let mut targets = effects.targets;
        let wb_policy = self.llc[bank].wb_owner_policy();
        let target_count = targets.len();
        let tracked = targets
            .iter()
            .position(|t| t.cmd == MemCmd::Read && t.true_requester < self.cpu_count);
        if let Some(idx) = tracked {
            let result = self.cache_interference.handle_response(
                &mut targets[idx],
                target_count,
                wb_policy,
                hit_lat,
                now,
            );
            if let Some(extra) = result.capacity_interference {
                self.intman
                    .add_interference(LatencyKind::CacheCapacity, &targets[idx], extra);
            }
            for synthetic in result.private_writebacks {
                // Synthetic alone-mode traffic rides the memory bus.
                self.membus
                    .enqueue(BusPhase::Addr, self.mb_iface_bank[bank], synthetic, now);
            }
        }

        for mut target in targets {
            target.flags.set(ReqFlags::SATISFIED);
            if target.cache_capacity_interference > 0 {
                target.add_interference(
                    LatencyKind::CacheCapacity,
                    target.cache_capacity_interference,
                );
            }
            // Propagate measured segments collected below this level.
            for kind in LatencyKind::ALL {
                let idx = kind as usize;
                target.latency_breakdown[idx] += req.latency_breakdown[idx];
                target.interference_breakdown[idx] += req.interference_breakdown[idx];
            }
            self.interconnect.enqueue(
                BusPhase::Data,
                self.ic_iface_bank[bank],
                target,
                now + hit_lat,
            );
        }
    }

    /// Handles a memory controller service event.
    pub fn handle_memctrl(&mut self, now: Tick, events: &mut EventQueue) {
        self.memctrl_pending = false;
        // Queue wait interference: another core's requests share the
        // controller with this one.
        let outcome = match self.memctrl.service_one(now) {
            Ok(outcome) => outcome,
            Err(err) => panic!("memory controller: {err}"),
        };
        match outcome {
            CtrlOutcome::Serviced {
                mut req,
                latency,
                bank,
            } => {
                req.add_latency(LatencyKind::MemoryBusService, latency);
                let queue_wait = now.saturating_sub(req.inserted_into_memctrl);
                req.add_latency(LatencyKind::MemoryBusQueue, queue_wait);
                if self.queue_holds_other_cpus(req.true_requester) && queue_wait > 0 {
                    req.add_interference(LatencyKind::MemoryBusQueue, queue_wait);
                }
                if let Some(trace) = &mut self.dram_trace {
                    if let Some(result) = req.dram_result {
                        trace.record(&req, bank, result, now);
                    }
                }
                if req.cmd.is_read() {
                    req.flags.set(ReqFlags::SATISFIED);
                    self.membus
                        .enqueue(BusPhase::Data, self.mb_iface_slave, req, now + latency);
                }
            }
            CtrlOutcome::CommandIssued => {
                self.memctrl_pending = true;
                let _ = events.schedule(
                    now + 1,
                    EventClass::MemoryController,
                    EventAction::MemCtrlService,
                );
            }
            CtrlOutcome::Idle => {}
        }
        self.pump(now, events);
    }

    fn queue_holds_other_cpus(&self, cpu: CpuId) -> bool {
        // Approximation: any other core contributed to the queue wait
        // when the controller held more than this request alone.
        self.memctrl.queue_len() > 0 && cpu < self.cpu_count
    }

    /// Applies a policy decision live.
    pub fn apply_policy(&mut self, way_quotas: Option<Vec<usize>>, mshr_counts: Option<Vec<usize>>) {
        if let Some(quotas) = way_quotas {
            for bank in &mut self.llc {
                bank.tags.set_way_quotas(Some(quotas.clone()));
            }
        }
        if let Some(counts) = mshr_counts {
            for (cpu, &count) in counts.iter().enumerate() {
                if cpu < self.l1d.len() {
                    self.l1d[cpu].mshrs.set_limit(count);
                }
            }
        }
    }
}
