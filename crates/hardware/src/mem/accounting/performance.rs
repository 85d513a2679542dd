//! Performance measurements and the policy interface.
//!
//! Policy modules are external collaborators: the simulator hands them a
//! periodic [`PerformanceMeasurement`] snapshot and applies whatever
//! quotas they return, live, without re-instantiating any hardware.

use crate::common::Tick;
use crate::mem::cache::interference::CacheMissMeasurements;
use crate::mem::req::LatencyKind;

/// Snapshot of system performance over one policy period.
#[derive(Debug, Clone, Default)]
pub struct PerformanceMeasurement {
    /// Committed instructions per core.
    pub committed_instructions: Vec<u64>,
    /// Cycles each core spent stalled on shared-mode memory.
    pub stall_cycles: Vec<u64>,
    /// Outstanding-miss parallelism estimate per core (average
    /// responses in flight while stalled).
    pub mlp_estimate: Vec<f64>,
    /// Memory responses that arrived while the core was stalled.
    pub responses_while_stalled: Vec<u64>,
    /// Loads that left each core's private hierarchy.
    pub requests_below_l1: Vec<u64>,
    /// Average shared-mode round-trip latency per core.
    pub avg_shared_latency: Vec<f64>,
    /// Average interference estimate per core.
    pub avg_interference: Vec<f64>,
    /// Per-component shared latency breakdown per core.
    pub latency_breakdown: Vec<[f64; LatencyKind::COUNT]>,
    /// Per-component interference breakdown per core.
    pub interference_breakdown: Vec<[f64; LatencyKind::COUNT]>,
    /// Shared cache miss measurements per core.
    pub cache_measurements: Vec<CacheMissMeasurements>,
    /// Shared cache miss rate over the period.
    pub llc_miss_rate: f64,
    /// Memory bus utilization over the period.
    pub bus_utilization: f64,
    /// Accesses per DRAM bank over the period.
    pub bank_accesses: Vec<u64>,
    /// Tick the snapshot was taken.
    pub at_tick: Tick,
}

/// Resource quotas returned by a policy.
#[derive(Debug, Clone, Default)]
pub struct PolicyDecision {
    /// Per-core shared-cache way quotas; `None` leaves partitioning
    /// unchanged.
    pub way_quotas: Option<Vec<usize>>,
    /// Per-core MSHR allocations; `None` leaves them unchanged.
    pub mshr_counts: Option<Vec<usize>>,
}

/// An adaptive resource policy.
///
/// Implementations may keep state between calls; the same instance
/// receives every measurement for the lifetime of the run.
pub trait Policy {
    /// Consumes one measurement period and returns new quotas.
    fn measure(&mut self, measurement: &PerformanceMeasurement) -> PolicyDecision;

    /// Name for traces and reports.
    fn name(&self) -> &str;
}

/// The do-nothing policy.
#[derive(Debug, Default)]
pub struct NoPolicy;

impl Policy for NoPolicy {
    fn measure(&mut self, _measurement: &PerformanceMeasurement) -> PolicyDecision {
        PolicyDecision::default()
    }

    fn name(&self) -> &str {
        "none"
    }
}
