//! Configuration system for the simulator.
//!
//! This module defines all configuration structures and enums used to
//! parameterize the machine. It provides:
//! 1. **Defaults:** baseline hardware constants (pipeline widths, cache
//!    geometry, DDR2 timings, predictor topology).
//! 2. **Structures:** hierarchical config for general, cpu, branch
//!    predictor, caches, interference, bus, DRAM, and accounting.
//! 3. **Enums:** queue variants, commit models, arbitration and
//!    interference policies.
//!
//! Configuration is supplied as JSON (`serde_json`) or built from
//! `Config::default()`; `Config::validate` rejects inconsistent
//! geometries before any hardware is constructed.

use serde::Deserialize;

use crate::common::Tick;
use crate::common::error::SimError;

/// Default configuration constants for the simulator.
mod defaults {
    use crate::common::Tick;

    /// Simulated cycles to run when no end tick is configured.
    pub const END_TICK: Tick = 1_000_000;

    /// Number of cores in the chip multiprocessor.
    pub const CPU_COUNT: usize = 1;

    /// Hardware threads per core.
    pub const THREADS_PER_CPU: usize = 1;

    /// Pipeline width used for fetch/decode/dispatch/issue/commit.
    pub const PIPE_WIDTH: usize = 4;

    /// Instruction fetch queue entries per thread.
    pub const IFQ_SIZE: usize = 32;

    /// Instruction queue entries.
    pub const IQ_SIZE: usize = 64;

    /// Reorder buffer entries.
    pub const ROB_SIZE: usize = 128;

    /// Load/store queue entries.
    pub const LSQ_SIZE: usize = 32;

    /// Store buffer entries.
    pub const STORE_BUFFER_SIZE: usize = 16;

    /// Physical integer registers shared by all threads of a core.
    pub const INT_PHYS_REGS: usize = 256;

    /// Physical floating-point registers shared by all threads of a core.
    pub const FP_PHYS_REGS: usize = 256;

    /// Fixed penalty in cycles for a fault-induced pipeline flush.
    pub const FAULT_FLUSH_PENALTY: Tick = 8;

    /// Global history bits of the hybrid predictor.
    pub const GLOBAL_HIST_BITS: u32 = 12;

    /// Local history registers (power of two).
    pub const LOCAL_HIST_REGS: usize = 1024;

    /// Local history bits per register.
    pub const LOCAL_HIST_BITS: u32 = 10;

    /// Meta/chooser table index bits.
    pub const META_INDEX_BITS: u32 = 12;

    /// Branch target buffer sets.
    pub const BTB_SETS: usize = 512;

    /// Branch target buffer associativity.
    pub const BTB_ASSOC: usize = 4;

    /// Return address stack depth.
    pub const RAS_SIZE: usize = 16;

    /// Confidence counter width in bits.
    pub const CONF_CTR_BITS: u32 = 4;

    /// L1 cache size in bytes (32 KiB).
    pub const L1_SIZE: usize = 32 * 1024;

    /// Shared cache size in bytes (2 MiB).
    pub const LLC_SIZE: usize = 2 * 1024 * 1024;

    /// Cache line size in bytes.
    pub const CACHE_LINE: usize = 64;

    /// L1 associativity.
    pub const L1_ASSOC: usize = 4;

    /// Shared cache associativity.
    pub const LLC_ASSOC: usize = 8;

    /// L1 hit latency in cycles.
    pub const L1_LATENCY: Tick = 2;

    /// Shared cache hit latency in cycles.
    pub const LLC_LATENCY: Tick = 12;

    /// Miss status handling registers per cache.
    pub const MSHR_COUNT: usize = 8;

    /// Merge targets per MSHR.
    pub const MSHR_TARGETS: usize = 4;

    /// Writeback buffer entries per cache.
    pub const WB_BUFFERS: usize = 8;

    /// Shared cache bank count.
    pub const LLC_BANKS: usize = 4;

    /// Number of sampled leader sets (0 selects a full shadow map).
    pub const LEADER_SETS: usize = 64;

    /// Fixed-point bits for interference probabilities.
    pub const IPP_BITS: u32 = 6;

    /// Bus width in bytes.
    pub const BUS_WIDTH: usize = 8;

    /// CPU cycles per bus cycle.
    pub const BUS_CLOCK: Tick = 4;

    /// DDR2 banks.
    pub const DRAM_BANKS: usize = 8;

    /// Row access strobe latency (cycles).
    pub const T_RAS: Tick = 40;

    /// Column access strobe latency (cycles).
    pub const T_CAS: Tick = 12;

    /// Precharge latency (cycles).
    pub const T_PRECHARGE: Tick = 12;

    /// Minimum activate-to-precharge window (cycles).
    pub const T_ACT_TO_PRE: Tick = 48;

    /// Write latency (cycles).
    pub const T_WRITE: Tick = 12;

    /// Write recovery time (cycles).
    pub const T_WRITE_RECOVERY: Tick = 12;

    /// Internal read-to-precharge spacing (cycles).
    pub const T_READ_TO_PRE: Tick = 8;

    /// Internal write-to-read turnaround (cycles).
    pub const T_WRITE_TO_READ: Tick = 8;

    /// Activate-to-activate spacing across banks (cycles).
    pub const T_ROW_TO_ROW: Tick = 8;

    /// Read-to-write bus turnaround (cycles).
    pub const T_READ_TO_WRITE: Tick = 8;

    /// Data burst transfer time (cycles).
    pub const T_DATA: Tick = 16;

    /// Page size in address bits (2^bits bytes per DRAM page).
    pub const PAGE_BITS: u32 = 10;

    /// Maximum simultaneously active banks.
    pub const MAX_ACTIVE_BANKS: usize = 4;

    /// Memory controller read queue entries.
    pub const MEMCTRL_QUEUE: usize = 64;

    /// Interference manager sample window (requests per trace line).
    pub const SAMPLE_SIZE: u64 = 4096;
}

/// Instruction queue organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum IqVariant {
    /// Unordered pool scanned for ready instructions.
    #[default]
    Unordered,
    /// Explicit ready list maintained by wakeup.
    ReadyQueue,
    /// Latency-predicting line buckets drained in order.
    Prescheduled,
}

/// Commit thread-selection model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum CommitModel {
    /// Rotate between threads each commit slot.
    #[default]
    RoundRobin,
    /// Drain one thread completely before considering the next.
    PerThreadStrict,
    /// Weighted fair share across threads.
    SmtFair,
    /// One thread owns the whole commit width each cycle.
    Superscalar,
}

/// Fetch thread-selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum FetchPolicy {
    /// Rotate between threads each cycle.
    #[default]
    RoundRobin,
    /// Prefer the thread with the fewest in-flight instructions.
    InstructionCount,
    /// Bias toward threads with high branch confidence.
    ConfidenceBiased,
    /// Redundant execution: the leading thread owns every fetch slot;
    /// trailing threads fetch only when the leader has nothing.
    Redundant,
    /// Uniform random selection.
    Random,
}

/// Branch predictor class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum BpredClass {
    /// Hybrid global/local with a meta chooser.
    #[default]
    Comb,
    /// Two-level predictor with global history only.
    Global,
    /// Two-level predictor with per-branch local history.
    Local,
}

/// Confidence counter decay policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ConfCounterType {
    /// Clear the counter on a misprediction.
    #[default]
    Reset,
    /// Decrement the counter on a misprediction.
    Saturating,
}

/// Cache coherence protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum Coherence {
    /// No coherence (private or single-master caches).
    #[default]
    None,
    /// Snooping MSI over the shared bus.
    Snooping,
    /// Directory protocol with per-block sharer vectors.
    Directory,
}

/// Hardware prefetcher attached to a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum PrefetcherKind {
    /// No prefetching.
    #[default]
    None,
    /// Tagged prefetch: fetch the next line on a demand miss or on a hit
    /// to a line the prefetcher brought in.
    Tagged,
}

/// Writeback ownership attribution for the shared cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum WritebackOwnerPolicy {
    /// Charge the core that originally fetched the block.
    #[default]
    Owner,
    /// Charge the core whose miss evicted the block.
    Replacer,
    /// Drive writeback attribution from shadow-tag estimates.
    ShadowTags,
}

/// Bus arbitration discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum Arbitration {
    /// Oldest request first, interface id breaking ties.
    #[default]
    Fcfs,
    /// Network fair queuing over virtual finish tags.
    Nfq,
    /// Time-multiplexed ownership slots.
    TimeMultiplexed,
}

/// Interference probability insertion policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum InterferenceProbabilityPolicy {
    /// Fixed-width wrapping counter compared against the probability.
    #[default]
    CounterFixed,
    /// Uniform random draw per access.
    FullRandomFloat,
    /// A scheduled count of "next N accesses are interference".
    SequentialInsert,
}

/// Memory controller scheduling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum MemCtrlPolicy {
    /// Requests served strictly in arrival order.
    InOrder,
    /// Ready (open-page) requests first, reads before writebacks.
    #[default]
    ReadyFirst,
}

/// Root configuration structure containing all simulator settings.
///
/// # Examples
///
/// ```
/// use cmpsim_core::config::Config;
///
/// let config = Config::default();
/// assert_eq!(config.cpu.fetch_width, 4);
/// config.validate().unwrap();
/// ```
///
/// Deserializing from JSON:
///
/// ```
/// use cmpsim_core::config::{Arbitration, Config};
///
/// let json = r#"{
///     "general": { "cpu_count": 4, "end_tick": 500000 },
///     "bus": { "arbitration": "Nfq" }
/// }"#;
/// let config: Config = serde_json::from_str(json).unwrap();
/// assert_eq!(config.general.cpu_count, 4);
/// assert_eq!(config.bus.arbitration, Arbitration::Nfq);
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General simulation settings.
    pub general: GeneralConfig,
    /// Core pipeline configuration.
    pub cpu: CpuConfig,
    /// Branch predictor topology.
    pub bpred: BpredConfig,
    /// Cache hierarchy configuration.
    pub cache: CacheHierarchyConfig,
    /// Shadow tags and interference estimation.
    pub interference: InterferenceConfig,
    /// Interconnect and memory bus parameters.
    pub bus: BusConfig,
    /// DDR2 timing and controller parameters.
    pub dram: DramConfig,
    /// Interference manager sampling.
    pub accounting: AccountingConfig,
}

impl Config {
    /// Checks the configuration for inconsistencies that would corrupt the
    /// timing model.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::Config`] naming the first offending parameter.
    pub fn validate(&self) -> Result<(), SimError> {
        fn pow2(name: &str, v: usize) -> Result<(), SimError> {
            if v == 0 || !v.is_power_of_two() {
                return Err(SimError::Config(format!(
                    "{name} must be a nonzero power of two, got {v}"
                )));
            }
            Ok(())
        }
        fn nonzero(name: &str, v: usize) -> Result<(), SimError> {
            if v == 0 {
                return Err(SimError::Config(format!("{name} must be nonzero")));
            }
            Ok(())
        }

        nonzero("general.cpu_count", self.general.cpu_count)?;
        nonzero("general.threads_per_cpu", self.general.threads_per_cpu)?;
        nonzero("cpu.fetch_width", self.cpu.fetch_width)?;
        nonzero("cpu.dispatch_width", self.cpu.dispatch_width)?;
        nonzero("cpu.issue_width", self.cpu.issue_width)?;
        nonzero("cpu.commit_width", self.cpu.commit_width)?;
        nonzero("cpu.rob_size", self.cpu.rob_size)?;
        nonzero("cpu.iq_size", self.cpu.iq_size)?;
        nonzero("cpu.lsq_size", self.cpu.lsq_size)?;

        pow2("bpred.local_hist_regs", self.bpred.local_hist_regs)?;
        pow2("bpred.btb_sets", self.bpred.btb_sets)?;
        nonzero("bpred.btb_assoc", self.bpred.btb_assoc)?;
        nonzero("bpred.ras_size", self.bpred.ras_size)?;

        for (name, c) in [
            ("cache.l1i", &self.cache.l1i),
            ("cache.l1d", &self.cache.l1d),
            ("cache.llc", &self.cache.llc),
        ] {
            pow2(&format!("{name}.line_bytes"), c.line_bytes)?;
            nonzero(&format!("{name}.assoc"), c.assoc)?;
            nonzero(&format!("{name}.mshrs"), c.mshrs)?;
            nonzero(&format!("{name}.targets_per_mshr"), c.targets_per_mshr)?;
            let sets = c.size_bytes / (c.line_bytes * c.assoc);
            pow2(&format!("{name} set count"), sets)?;
            if let Some(quotas) = &c.way_partitioning {
                let total: usize = quotas.iter().sum();
                if total > c.assoc {
                    return Err(SimError::Config(format!(
                        "{name}.way_partitioning allocates {total} ways of {}",
                        c.assoc
                    )));
                }
            }
        }
        pow2("cache.llc_banks", self.cache.llc_banks)?;

        let llc_sets = self.cache.llc.size_bytes / (self.cache.llc.line_bytes * self.cache.llc.assoc);
        let shadow_sets = llc_sets / self.general.cpu_count;
        if self.interference.leader_sets != 0 {
            if shadow_sets % self.interference.leader_sets != 0 {
                return Err(SimError::Config(format!(
                    "shadow set count {shadow_sets} is not divisible by \
                     interference.leader_sets {}",
                    self.interference.leader_sets
                )));
            }
        }

        pow2("dram.num_banks", self.dram.num_banks)?;
        nonzero("dram.max_active_banks", self.dram.max_active_banks)?;
        nonzero("bus.width_bytes", self.bus.width_bytes)?;
        if self.bus.clock == 0 {
            return Err(SimError::Config("bus.clock must be nonzero".into()));
        }
        if self.accounting.sample_size == 0 {
            return Err(SimError::Config("accounting.sample_size must be nonzero".into()));
        }
        Ok(())
    }
}

/// General simulation settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Tick at which the simulation ends.
    pub end_tick: Tick,
    /// Number of cores.
    pub cpu_count: usize,
    /// Hardware threads per core.
    pub threads_per_cpu: usize,
    /// Seed for the deterministic PRNG.
    pub seed: u64,
    /// Pipe trace sampling range `(first, last)` in ticks, if tracing.
    pub pipetrace_range: Option<(Tick, Tick)>,
    /// Emit the DRAM access trace.
    pub dram_trace: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            end_tick: defaults::END_TICK,
            cpu_count: defaults::CPU_COUNT,
            threads_per_cpu: defaults::THREADS_PER_CPU,
            seed: 240_000,
            pipetrace_range: None,
            dram_trace: false,
        }
    }
}

/// One operation class provided by a functional unit.
#[derive(Debug, Clone, Deserialize)]
pub struct OpDescConfig {
    /// Operation class name (matches [`crate::cpu::inst::OpClass`]).
    pub op_class: String,
    /// Result latency in cycles.
    pub op_lat: u32,
    /// Issue (pipelining) latency in cycles.
    pub issue_lat: u32,
}

/// A group of identical functional units.
#[derive(Debug, Clone, Deserialize)]
pub struct FuDescConfig {
    /// How many copies of this unit exist.
    pub count: usize,
    /// Capabilities of each copy.
    pub ops: Vec<OpDescConfig>,
}

/// Core pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CpuConfig {
    /// Instructions fetched per cycle.
    pub fetch_width: usize,
    /// Instructions decoded per cycle.
    pub decode_width: usize,
    /// Instructions dispatched per cycle.
    pub dispatch_width: usize,
    /// Instructions issued per cycle.
    pub issue_width: usize,
    /// Instructions committed per cycle.
    pub commit_width: usize,
    /// Instruction fetch queue entries per thread.
    pub ifq_size: usize,
    /// Instruction queue entries.
    pub iq_size: usize,
    /// Reorder buffer entries.
    pub rob_size: usize,
    /// Load/store queue entries.
    pub lsq_size: usize,
    /// Store buffer entries.
    pub store_buffer_size: usize,
    /// Optional per-thread cap on ROB/IQ/LSQ occupancy.
    pub per_thread_cap: Option<usize>,
    /// Instruction queue organization.
    pub iq_variant: IqVariant,
    /// Commit thread-selection model.
    pub commit_model: CommitModel,
    /// Fetch thread-selection policy.
    pub fetch_policy: FetchPolicy,
    /// Physical integer registers.
    pub int_phys_regs: usize,
    /// Physical floating-point registers.
    pub fp_phys_regs: usize,
    /// Fixed penalty for fault-induced flushes.
    pub fault_flush_penalty: Tick,
    /// Functional unit inventory; empty selects the default pool.
    pub fu_pool: Vec<FuDescConfig>,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            fetch_width: defaults::PIPE_WIDTH,
            decode_width: defaults::PIPE_WIDTH,
            dispatch_width: defaults::PIPE_WIDTH,
            issue_width: defaults::PIPE_WIDTH,
            commit_width: defaults::PIPE_WIDTH,
            ifq_size: defaults::IFQ_SIZE,
            iq_size: defaults::IQ_SIZE,
            rob_size: defaults::ROB_SIZE,
            lsq_size: defaults::LSQ_SIZE,
            store_buffer_size: defaults::STORE_BUFFER_SIZE,
            per_thread_cap: None,
            iq_variant: IqVariant::default(),
            commit_model: CommitModel::default(),
            fetch_policy: FetchPolicy::default(),
            int_phys_regs: defaults::INT_PHYS_REGS,
            fp_phys_regs: defaults::FP_PHYS_REGS,
            fault_flush_penalty: defaults::FAULT_FLUSH_PENALTY,
            fu_pool: Vec::new(),
        }
    }
}

/// Confidence predictor configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConfidenceConfig {
    /// Enable the confidence predictor.
    pub enabled: bool,
    /// Counter table index bits (0 selects the static state-triple table).
    pub index_bits: u32,
    /// Counter width in bits.
    pub ctr_bits: u32,
    /// High-confidence threshold; negative selects static assignment.
    pub threshold: i32,
    /// XOR history into the index instead of concatenating.
    pub xor: bool,
    /// Misprediction decay policy.
    pub ctr_type: ConfCounterType,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            index_bits: 10,
            ctr_bits: defaults::CONF_CTR_BITS,
            threshold: 8,
            xor: true,
            ctr_type: ConfCounterType::default(),
        }
    }
}

/// Branch predictor topology.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BpredConfig {
    /// Predictor class.
    pub class: BpredClass,
    /// Global history register bits.
    pub global_hist_bits: u32,
    /// Global prediction table index bits.
    pub global_index_bits: u32,
    /// XOR global history into the index instead of concatenating.
    pub global_xor: bool,
    /// Number of local history registers (power of two).
    pub local_hist_regs: usize,
    /// Local history bits per register.
    pub local_hist_bits: u32,
    /// Local prediction table index bits.
    pub local_index_bits: u32,
    /// XOR local history into the index.
    pub local_xor: bool,
    /// Meta table index bits.
    pub meta_index_bits: u32,
    /// XOR history into the meta index.
    pub meta_xor: bool,
    /// BTB set count (power of two).
    pub btb_sets: usize,
    /// BTB associativity.
    pub btb_assoc: usize,
    /// Return address stack depth.
    pub ras_size: usize,
    /// Confidence predictor settings.
    pub confidence: ConfidenceConfig,
}

impl Default for BpredConfig {
    fn default() -> Self {
        Self {
            class: BpredClass::default(),
            global_hist_bits: defaults::GLOBAL_HIST_BITS,
            global_index_bits: defaults::GLOBAL_HIST_BITS,
            global_xor: true,
            local_hist_regs: defaults::LOCAL_HIST_REGS,
            local_hist_bits: defaults::LOCAL_HIST_BITS,
            local_index_bits: defaults::LOCAL_HIST_BITS,
            local_xor: false,
            meta_index_bits: defaults::META_INDEX_BITS,
            meta_xor: true,
            btb_sets: defaults::BTB_SETS,
            btb_assoc: defaults::BTB_ASSOC,
            ras_size: defaults::RAS_SIZE,
            confidence: ConfidenceConfig::default(),
        }
    }
}

/// Individual cache level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Total size in bytes.
    pub size_bytes: usize,
    /// Line size in bytes.
    pub line_bytes: usize,
    /// Associativity.
    pub assoc: usize,
    /// Hit latency in cycles.
    pub hit_latency: Tick,
    /// Miss status handling registers.
    pub mshrs: usize,
    /// Merge targets per MSHR.
    pub targets_per_mshr: usize,
    /// Writeback buffer entries.
    pub wb_buffers: usize,
    /// Coherence protocol.
    pub coherence: Coherence,
    /// Hardware prefetcher.
    pub prefetcher: PrefetcherKind,
    /// Per-core way quotas (shared cache only).
    pub way_partitioning: Option<Vec<usize>>,
    /// Writeback attribution policy (shared cache only).
    pub writeback_owner_policy: WritebackOwnerPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            size_bytes: defaults::L1_SIZE,
            line_bytes: defaults::CACHE_LINE,
            assoc: defaults::L1_ASSOC,
            hit_latency: defaults::L1_LATENCY,
            mshrs: defaults::MSHR_COUNT,
            targets_per_mshr: defaults::MSHR_TARGETS,
            wb_buffers: defaults::WB_BUFFERS,
            coherence: Coherence::default(),
            prefetcher: PrefetcherKind::default(),
            way_partitioning: None,
            writeback_owner_policy: WritebackOwnerPolicy::default(),
        }
    }
}

impl CacheConfig {
    /// Number of sets implied by the geometry.
    #[inline]
    pub fn sets(&self) -> usize {
        self.size_bytes / (self.line_bytes * self.assoc)
    }
}

/// Cache hierarchy configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheHierarchyConfig {
    /// Private L1 instruction cache.
    pub l1i: CacheConfig,
    /// Private L1 data cache.
    pub l1d: CacheConfig,
    /// Shared last-level cache (per bank geometry is `llc / llc_banks`).
    pub llc: CacheConfig,
    /// Shared cache bank count.
    pub llc_banks: usize,
}

impl Default for CacheHierarchyConfig {
    fn default() -> Self {
        Self {
            l1i: CacheConfig::default(),
            l1d: CacheConfig::default(),
            llc: CacheConfig {
                size_bytes: defaults::LLC_SIZE,
                assoc: defaults::LLC_ASSOC,
                hit_latency: defaults::LLC_LATENCY,
                ..CacheConfig::default()
            },
            llc_banks: defaults::LLC_BANKS,
        }
    }
}

/// Shadow tags and interference estimation configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InterferenceConfig {
    /// Sampled leader sets per shadow tag array (0 = full map).
    pub leader_sets: usize,
    /// Probabilistic insertion policy.
    pub policy: InterferenceProbabilityPolicy,
    /// Fixed-point probability resolution in bits.
    pub ipp_bits: u32,
}

impl Default for InterferenceConfig {
    fn default() -> Self {
        Self {
            leader_sets: defaults::LEADER_SETS,
            policy: InterferenceProbabilityPolicy::default(),
            ipp_bits: defaults::IPP_BITS,
        }
    }
}

/// Interconnect / memory bus configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Bus width in bytes.
    pub width_bytes: usize,
    /// CPU cycles per bus cycle.
    pub clock: Tick,
    /// Arbitration discipline.
    pub arbitration: Arbitration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            width_bytes: defaults::BUS_WIDTH,
            clock: defaults::BUS_CLOCK,
            arbitration: Arbitration::default(),
        }
    }
}

/// DDR2 timing and memory controller configuration.
///
/// All timings are in CPU cycles.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DramConfig {
    /// Number of banks.
    pub num_banks: usize,
    /// Row access strobe latency.
    pub ras_latency: Tick,
    /// Column access strobe latency.
    pub cas_latency: Tick,
    /// Precharge latency.
    pub precharge_latency: Tick,
    /// Minimum activate-to-precharge window.
    pub min_activate_to_precharge: Tick,
    /// Write latency.
    pub write_latency: Tick,
    /// Write recovery time.
    pub write_recovery: Tick,
    /// Internal read-to-precharge spacing.
    pub internal_read_to_precharge: Tick,
    /// Internal write-to-read turnaround.
    pub internal_write_to_read: Tick,
    /// Activate-to-activate spacing across banks.
    pub row_to_row: Tick,
    /// Read-to-write bus turnaround.
    pub read_to_write_turnaround: Tick,
    /// Data burst transfer time.
    pub data_time: Tick,
    /// Page size in address bits.
    pub page_bits: u32,
    /// Maximum simultaneously active banks.
    pub max_active_banks: usize,
    /// When set, data commands return this constant and open/close are free.
    pub static_latency: Option<Tick>,
    /// Controller queue capacity.
    pub queue_size: usize,
    /// Controller scheduling policy.
    pub policy: MemCtrlPolicy,
}

impl Default for DramConfig {
    fn default() -> Self {
        Self {
            num_banks: defaults::DRAM_BANKS,
            ras_latency: defaults::T_RAS,
            cas_latency: defaults::T_CAS,
            precharge_latency: defaults::T_PRECHARGE,
            min_activate_to_precharge: defaults::T_ACT_TO_PRE,
            write_latency: defaults::T_WRITE,
            write_recovery: defaults::T_WRITE_RECOVERY,
            internal_read_to_precharge: defaults::T_READ_TO_PRE,
            internal_write_to_read: defaults::T_WRITE_TO_READ,
            row_to_row: defaults::T_ROW_TO_ROW,
            read_to_write_turnaround: defaults::T_READ_TO_WRITE,
            data_time: defaults::T_DATA,
            page_bits: defaults::PAGE_BITS,
            max_active_banks: defaults::MAX_ACTIVE_BANKS,
            static_latency: None,
            queue_size: defaults::MEMCTRL_QUEUE,
            policy: MemCtrlPolicy::default(),
        }
    }
}

/// Interference manager sampling configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AccountingConfig {
    /// Requests per core between trace emissions.
    pub sample_size: u64,
    /// Drop accumulators every this many samples, if set.
    pub reset_interval: Option<u64>,
}

impl Default for AccountingConfig {
    fn default() -> Self {
        Self {
            sample_size: defaults::SAMPLE_SIZE,
            reset_interval: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_non_power_of_two_banks() {
        let mut config = Config::default();
        config.dram.num_banks = 6;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_oversubscribed_partitioning() {
        let mut config = Config::default();
        config.cache.llc.way_partitioning = Some(vec![5, 5]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn json_round_trip_overrides() {
        let json = r#"{
            "cpu": { "fetch_width": 8, "iq_variant": "Prescheduled" },
            "dram": { "static_latency": 120 }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.cpu.fetch_width, 8);
        assert_eq!(config.cpu.iq_variant, IqVariant::Prescheduled);
        assert_eq!(config.dram.static_latency, Some(120));
    }
}
