//! Adaptive miss-handling-architecture service.
//!
//! Periodically inspects memory bus utilization and widens or narrows
//! per-core MSHR allocations: under heavy contention the core hurting
//! the others most loses miss parallelism; under light load everyone
//! gets their full complement back.

use crate::common::Tick;

use super::performance::{PerformanceMeasurement, Policy, PolicyDecision};

/// Tuning for the adaptive MHA.
#[derive(Debug, Clone)]
pub struct AdaptiveMhaConfig {
    /// Bus utilization above which MSHRs are reduced.
    pub high_threshold: f64,
    /// Bus utilization below which MSHRs are restored.
    pub low_threshold: f64,
    /// Full MSHR complement per core.
    pub max_mshrs: usize,
    /// Floor below which a core is never throttled.
    pub min_mshrs: usize,
    /// Ticks between decisions (informational; the caller schedules).
    pub sample_interval: Tick,
}

impl Default for AdaptiveMhaConfig {
    fn default() -> Self {
        Self {
            high_threshold: 0.85,
            low_threshold: 0.55,
            max_mshrs: 8,
            min_mshrs: 1,
            sample_interval: 100_000,
        }
    }
}

/// The adaptive MHA policy.
pub struct AdaptiveMha {
    config: AdaptiveMhaConfig,
    current: Vec<usize>,
    /// Decisions that reduced a core's MSHRs.
    pub reductions: u64,
    /// Decisions that restored MSHRs.
    pub restorations: u64,
}

impl AdaptiveMha {
    /// Creates the policy for `cpu_count` cores at full allocation.
    pub fn new(config: AdaptiveMhaConfig, cpu_count: usize) -> Self {
        let current = vec![config.max_mshrs; cpu_count];
        Self {
            config,
            current,
            reductions: 0,
            restorations: 0,
        }
    }

    /// Current allocation per core.
    pub fn allocations(&self) -> &[usize] {
        &self.current
    }

    fn most_intensive_core(&self, m: &PerformanceMeasurement) -> Option<usize> {
        // The core generating the most traffic below its private
        // hierarchy is the one throttled first.
        m.requests_below_l1
            .iter()
            .enumerate()
            .filter(|&(cpu, _)| self.current[cpu] > self.config.min_mshrs)
            .max_by_key(|&(_, &reqs)| reqs)
            .map(|(cpu, _)| cpu)
    }
}

impl Policy for AdaptiveMha {
    fn measure(&mut self, m: &PerformanceMeasurement) -> PolicyDecision {
        if m.bus_utilization > self.config.high_threshold {
            if let Some(victim) = self.most_intensive_core(m) {
                self.current[victim] = (self.current[victim] / 2).max(self.config.min_mshrs);
                self.reductions += 1;
                tracing::debug!(
                    target: "interference",
                    victim,
                    mshrs = self.current[victim],
                    "adaptive MHA reduction"
                );
                return PolicyDecision {
                    way_quotas: None,
                    mshr_counts: Some(self.current.clone()),
                };
            }
        } else if m.bus_utilization < self.config.low_threshold {
            let mut changed = false;
            for alloc in &mut self.current {
                if *alloc < self.config.max_mshrs {
                    *alloc = (*alloc * 2).min(self.config.max_mshrs);
                    changed = true;
                }
            }
            if changed {
                self.restorations += 1;
                return PolicyDecision {
                    way_quotas: None,
                    mshr_counts: Some(self.current.clone()),
                };
            }
        }
        PolicyDecision::default()
    }

    fn name(&self) -> &str {
        "adaptive-mha"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn measurement(util: f64, reqs: Vec<u64>) -> PerformanceMeasurement {
        PerformanceMeasurement {
            bus_utilization: util,
            requests_below_l1: reqs,
            ..PerformanceMeasurement::default()
        }
    }

    #[test]
    fn high_utilization_halves_the_heaviest_core() {
        let mut mha = AdaptiveMha::new(AdaptiveMhaConfig::default(), 2);
        let decision = mha.measure(&measurement(0.95, vec![10, 500]));
        assert_eq!(decision.mshr_counts, Some(vec![8, 4]));
        assert_eq!(mha.reductions, 1);
    }

    #[test]
    fn low_utilization_restores() {
        let mut mha = AdaptiveMha::new(AdaptiveMhaConfig::default(), 2);
        let _ = mha.measure(&measurement(0.95, vec![10, 500]));
        let decision = mha.measure(&measurement(0.30, vec![10, 10]));
        assert_eq!(decision.mshr_counts, Some(vec![8, 8]));
    }

    #[test]
    fn mid_band_leaves_allocations_alone() {
        let mut mha = AdaptiveMha::new(AdaptiveMhaConfig::default(), 2);
        let decision = mha.measure(&measurement(0.70, vec![10, 10]));
        assert!(decision.mshr_counts.is_none());
    }

    #[test]
    fn never_throttles_below_the_floor() {
        let mut mha = AdaptiveMha::new(AdaptiveMhaConfig::default(), 1);
        for _ in 0..10 {
            let _ = mha.measure(&measurement(0.99, vec![100]));
        }
        assert_eq!(mha.allocations(), &[1]);
    }
}
