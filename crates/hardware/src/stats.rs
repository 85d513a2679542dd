//! Simulation statistics collection and reporting.
//!
//! Aggregates the per-component counters into one report: per-core IPC
//! and pipeline losses, branch prediction, cache behavior, bus
//! utilization, DRAM outcomes, and interference estimates.

use std::fmt::Write as _;

use crate::common::Tick;
use crate::cpu::CoreStats;
use crate::cpu::bpred::BpredStats;
use crate::mem::bus::BusStats;
use crate::mem::cache::CacheStats;
use crate::mem::cache::interference::InterferenceStats;
use crate::mem::dram::DramStats;
use crate::mem::req::LatencyKind;

/// Full end-of-run statistics snapshot.
#[derive(Default)]
pub struct SimStats {
    /// Final simulated tick.
    pub end_tick: Tick,
    /// Per-core pipeline statistics.
    pub cores: Vec<CoreStats>,
    /// Per-core branch predictor statistics.
    pub bpred: Vec<BpredStats>,
    /// L1 instruction cache statistics per core.
    pub l1i: Vec<CacheStats>,
    /// L1 data cache statistics per core.
    pub l1d: Vec<CacheStats>,
    /// Shared cache statistics per bank.
    pub llc: Vec<CacheStats>,
    /// Interconnect statistics.
    pub interconnect: BusStats,
    /// Memory bus statistics.
    pub membus: BusStats,
    /// DRAM statistics.
    pub dram: DramStats,
    /// Shadow-tag interference statistics.
    pub interference: InterferenceStats,
    /// Per-core average shared latency per component.
    pub avg_latency: Vec<[f64; LatencyKind::COUNT + 1]>,
    /// Per-core average interference per component.
    pub avg_interference: Vec<[f64; LatencyKind::COUNT]>,
}

impl SimStats {
    /// Renders the text report.
    pub fn report(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "==== simulation finished at tick {} ====", self.end_tick);

        for (cpu, core) in self.cores.iter().enumerate() {
            let committed = core.committed_total();
            let ipc = committed as f64 / core.cycles.max(1) as f64;
            let _ = writeln!(out, "\n-- cpu {cpu} --");
            let _ = writeln!(out, "cycles:                {}", core.cycles);
            let _ = writeln!(out, "committed:             {committed}");
            let _ = writeln!(out, "ipc:                   {ipc:.3}");
            let _ = writeln!(out, "branches:              {}", core.branches);
            let _ = writeln!(out, "mispredicts:           {}", core.mispredicts);
            let _ = writeln!(out, "squashed:              {}", core.squashed);
            let _ = writeln!(out, "loads / stores:        {} / {}", core.loads, core.stores);
            let _ = writeln!(out, "mem stall cycles:      {}", core.mem_stall_cycles);

            if let Some(bp) = self.bpred.get(cpu) {
                let lookups: u64 = bp.lookups.iter().sum();
                let cond: u64 = bp.cond_predicted.iter().sum();
                let correct: u64 = bp.cond_correct.iter().sum();
                let _ = writeln!(out, "bpred lookups:         {lookups}");
                if cond > 0 {
                    let _ = writeln!(
                        out,
                        "bpred accuracy:        {:.3}",
                        correct as f64 / cond as f64
                    );
                }
            }

            for (name, caches) in [("l1i", &self.l1i), ("l1d", &self.l1d)] {
                if let Some(c) = caches.get(cpu) {
                    let total = c.hits + c.misses;
                    if total > 0 {
                        let _ = writeln!(
                            out,
                            "{name}: {} hits, {} misses ({:.3} miss rate)",
                            c.hits,
                            c.misses,
                            c.misses as f64 / total as f64
                        );
                    }
                }
            }
        }

        let llc_hits: u64 = self.llc.iter().map(|c| c.hits).sum();
        let llc_misses: u64 = self.llc.iter().map(|c| c.misses).sum();
        let _ = writeln!(out, "\n-- shared cache --");
        let _ = writeln!(out, "hits / misses:         {llc_hits} / {llc_misses}");
        if llc_hits + llc_misses > 0 {
            let _ = writeln!(
                out,
                "miss rate:             {:.3}",
                llc_misses as f64 / (llc_hits + llc_misses) as f64
            );
        }
        let wb: u64 = self.llc.iter().map(|c| c.writebacks).sum();
        let _ = writeln!(out, "writebacks:            {wb}");

        let _ = writeln!(out, "\n-- buses --");
        for (name, bus) in [("interconnect", &self.interconnect), ("membus", &self.membus)] {
            let _ = writeln!(
                out,
                "{name}: {} grants, {} null grants, {} use cycles, {} queue cycles",
                bus.total_requests, bus.null_grants, bus.use_cycles, bus.queue_cycles
            );
        }

        let _ = writeln!(out, "\n-- dram --");
        let _ = writeln!(
            out,
            "reads / writes:        {} / {}",
            self.dram.reads, self.dram.writes
        );
        let _ = writeln!(
            out,
            "page hits:             r {} / w {}",
            self.dram.page_hits[0], self.dram.page_hits[1]
        );
        let _ = writeln!(
            out,
            "page misses:           r {} / w {}",
            self.dram.page_misses[0], self.dram.page_misses[1]
        );
        let _ = writeln!(
            out,
            "page conflicts:        r {} / w {}",
            self.dram.page_conflicts[0], self.dram.page_conflicts[1]
        );
        let _ = writeln!(out, "per-bank accesses:     {:?}", self.dram.accesses_per_bank);

        if !self.avg_latency.is_empty() {
            let _ = writeln!(out, "\n-- shared latency (avg per request) --");
            for (cpu, lat) in self.avg_latency.iter().enumerate() {
                let _ = writeln!(out, "cpu {cpu} total: {:.2}", lat[0]);
                for kind in LatencyKind::ALL {
                    let measured = lat[kind as usize + 1];
                    let inter = self.avg_interference[cpu][kind as usize];
                    if measured > 0.0 || inter > 0.0 {
                        let _ = writeln!(
                            out,
                            "  {:<22} {measured:>8.2}  (interference {inter:.2})",
                            kind.as_str()
                        );
                    }
                }
            }
        }
        out
    }
}
