//! Shadow-tag cache interference estimation.
//!
//! Each core owns a parallel LRU tag array sized as its alone-mode share
//! of the shared cache. Every shared-cache access is replayed into the
//! issuing core's shadow tags; a shared miss that hits in the shadow is
//! a capacity interference miss. When the shadow is sampled (leader
//! sets), individual accesses are instead tagged probabilistically, and
//! synthetic private writebacks model the bus traffic the core would
//! generate running alone.

use crate::common::counter::{FixedPointProbability, FixedWidthCounter};
use crate::common::rand::XorShift64;
use crate::common::{Addr, CpuId, Tick};
use crate::config::{InterferenceProbabilityPolicy, WritebackOwnerPolicy};
use crate::mem::cache::tags::{TagStore, blk};
use crate::mem::req::{MemCmd, MemReq};

/// Per-window miss measurements handed to policy modules.
#[derive(Debug, Clone, Default)]
pub struct CacheMissMeasurements {
    /// Shared-cache read misses in the window.
    pub read_misses: u64,
    /// Shared-cache writeback misses in the window.
    pub wb_misses: u64,
    /// Estimated interference misses.
    pub interference_misses: u64,
    /// Shared-cache accesses.
    pub accesses: u64,
    /// Writebacks generated.
    pub writebacks: u64,
    /// Cumulative miss estimate per LRU stack depth.
    pub cumulative_misses: Vec<u64>,
}

/// Effects of replaying a response into the shadow tags.
#[derive(Debug, Default)]
pub struct InterferenceResponse {
    /// Extra round-trip ticks to charge as cache-capacity interference.
    pub capacity_interference: Option<Tick>,
    /// Synthetic private writebacks to inject onto the bus.
    pub private_writebacks: Vec<MemReq>,
}

/// Per-core interference statistics.
#[derive(Debug, Clone, Default)]
pub struct InterferenceStats {
    /// Extra latency charged to capacity interference.
    pub extra_miss_latency: Vec<Tick>,
    /// Responses that carried an interference-miss tag.
    pub extra_responses: Vec<u64>,
    /// Accesses tagged as interference misses.
    pub extra_misses: Vec<u64>,
    /// Writebacks detected in the shadow tags.
    pub shadow_writebacks: Vec<u64>,
    /// Estimated shadow accesses (constituency-scaled).
    pub estimated_accesses: Vec<u64>,
    /// Estimated shadow misses (constituency-scaled).
    pub estimated_misses: Vec<u64>,
}

struct SampleCounters {
    private_misses: i64,
    shared_misses: i64,
    private_writebacks: i64,
    shared_responses: i64,
}

/// The shadow-tag interference estimator for the shared cache.
pub struct CacheInterference {
    cpu_count: usize,
    line_bytes: usize,
    shadow_sets: usize,
    num_leader_sets: usize,
    sets_in_constituency: usize,
    policy: InterferenceProbabilityPolicy,

    shadow_tags: Vec<TagStore>,
    do_insertion: Vec<bool>,

    request_counters: Vec<FixedWidthCounter>,
    response_counters: Vec<FixedWidthCounter>,
    sequential_reads: Vec<i64>,
    sequential_writebacks: Vec<i64>,

    samples: Vec<SampleCounters>,
    interference_prob: Vec<FixedPointProbability>,
    private_wb_prob: Vec<FixedPointProbability>,

    misses_since_interference: Vec<u64>,
    responses_since_priv_wb: Vec<u64>,

    read_miss_acc: Vec<u64>,
    wb_miss_acc: Vec<u64>,
    interference_miss_acc: Vec<u64>,
    access_acc: Vec<u64>,
    writeback_acc: Vec<u64>,

    rng: XorShift64,
    /// Statistics.
    pub stats: InterferenceStats,
}

impl CacheInterference {
    /// Builds shadow tags for `cpu_count` cores over a shared cache of
    /// `llc_sets x assoc` blocks. `leader_sets == 0` selects a full map.
    ///
    /// # Panics
    ///
    /// When the shadow set count is not divisible by `leader_sets`; the
    /// configuration validator rejects this earlier.
    pub fn new(
        cpu_count: usize,
        llc_sets: usize,
        assoc: usize,
        line_bytes: usize,
        leader_sets: usize,
        policy: InterferenceProbabilityPolicy,
        prob_bits: u32,
        seed: u64,
    ) -> Self {
        // Each core's alone-mode share of the shared cache.
        let shadow_sets = (llc_sets / cpu_count).max(1);
        let num_leader_sets = if leader_sets == 0 {
            shadow_sets
        } else {
            leader_sets.min(shadow_sets)
        };
        assert!(
            shadow_sets % num_leader_sets == 0,
            "shadow set count must be divisible by the number of leader sets"
        );
        let full_map = num_leader_sets == shadow_sets;
        let counter_bits = match policy {
            InterferenceProbabilityPolicy::CounterFixed => prob_bits,
            _ => prob_bits.max(1),
        };
        Self {
            cpu_count,
            line_bytes,
            shadow_sets,
            num_leader_sets,
            sets_in_constituency: shadow_sets / num_leader_sets,
            policy,
            shadow_tags: (0..cpu_count)
                .map(|_| TagStore::new(shadow_sets, assoc, line_bytes, cpu_count, None))
                .collect(),
            do_insertion: vec![
                full_map || policy == InterferenceProbabilityPolicy::SequentialInsert;
                cpu_count
            ],
            request_counters: vec![FixedWidthCounter::new(false, counter_bits); cpu_count],
            response_counters: vec![FixedWidthCounter::new(false, counter_bits); cpu_count],
            sequential_reads: vec![0; cpu_count],
            sequential_writebacks: vec![0; cpu_count],
            samples: (0..cpu_count)
                .map(|_| SampleCounters {
                    private_misses: 0,
                    shared_misses: 0,
                    private_writebacks: 0,
                    shared_responses: 0,
                })
                .collect(),
            interference_prob: vec![FixedPointProbability::new(prob_bits); cpu_count],
            private_wb_prob: vec![FixedPointProbability::new(prob_bits); cpu_count],
            misses_since_interference: vec![0; cpu_count],
            responses_since_priv_wb: vec![0; cpu_count],
            read_miss_acc: vec![0; cpu_count],
            wb_miss_acc: vec![0; cpu_count],
            interference_miss_acc: vec![0; cpu_count],
            access_acc: vec![0; cpu_count],
            writeback_acc: vec![0; cpu_count],
            rng: XorShift64::new(seed),
            stats: InterferenceStats {
                extra_miss_latency: vec![0; cpu_count],
                extra_responses: vec![0; cpu_count],
                extra_misses: vec![0; cpu_count],
                shadow_writebacks: vec![0; cpu_count],
                estimated_accesses: vec![0; cpu_count],
                estimated_misses: vec![0; cpu_count],
            },
        }
    }

    /// Shadow sets per core.
    pub fn shadow_sets(&self) -> usize {
        self.shadow_sets
    }

    /// True for sets that represent their constituency in sampled mode.
    pub fn is_leader_set(&self, set: usize) -> bool {
        if self.num_leader_sets == self.shadow_sets {
            return true;
        }
        let constituency = set / self.sets_in_constituency;
        let leader = constituency * self.sets_in_constituency
            + (constituency % self.sets_in_constituency);
        leader == set
    }

    /// Current interference probability for a core (fixed point).
    pub fn interference_probability(&self, cpu: CpuId) -> &FixedPointProbability {
        &self.interference_prob[cpu]
    }

    /// Shadow-tag hit ratio estimate for a core.
    pub fn shadow_hit_ratio(&self, cpu: CpuId) -> f64 {
        let acc = self.stats.estimated_accesses[cpu];
        if acc == 0 {
            return 0.0;
        }
        1.0 - (self.stats.estimated_misses[cpu] as f64 / acc as f64)
    }

    /// Replays a shared-cache access into the issuing core's shadow
    /// tags; may tag `req` as an interference miss.
    pub fn access(&mut self, req: &mut MemReq, is_cache_miss: bool, hit_lat: Tick, now: Tick) {
        debug_assert!(req.cmd == MemCmd::Read || req.cmd == MemCmd::Writeback);
        let cpu = req.true_requester;
        self.access_acc[cpu] += 1;
        if is_cache_miss {
            if req.cmd == MemCmd::Read {
                self.read_miss_acc[cpu] += 1;
            } else {
                self.wb_miss_acc[cpu] += 1;
            }
        }

        let set = self.shadow_tags[cpu].extract_set(req.paddr);
        let leader = self.is_leader_set(set);

        let shadow_hit = match self.shadow_tags[cpu].find(req.paddr, req.asid) {
            Some(shadow_blk) => {
                if req.cmd == MemCmd::Writeback {
                    shadow_blk.status |= blk::MODIFIED;
                }
                true
            }
            None => false,
        };
        req.shadow_miss = !shadow_hit;

        if leader {
            let scale = self.sets_in_constituency as u64;
            if shadow_hit {
                if is_cache_miss {
                    // Shared miss, shadow hit: these are the accesses the
                    // sampled policies tag probabilistically.
                    self.sequential_reads[cpu] += scale as i64;
                    self.interference_miss_acc[cpu] += scale;
                }
            } else {
                self.samples[cpu].private_misses += scale as i64;
                self.stats.estimated_misses[cpu] += scale;
            }
            self.stats.estimated_accesses[cpu] += scale;
        }
        if is_cache_miss {
            self.samples[cpu].shared_misses += 1;
            self.misses_since_interference[cpu] += 1;
            if shadow_hit {
                self.misses_since_interference[cpu] = 0;
            }
        }

        if self.do_insertion[cpu] && self.cpu_count > 1 {
            let tag_it = if self.num_leader_sets == self.shadow_sets {
                shadow_hit && is_cache_miss
            } else {
                let prob = self.interference_prob[cpu];
                self.add_as_interference(&prob, cpu, true)
            };
            if tag_it {
                req.interference_miss_at = now + hit_lat;
                self.stats.extra_misses[cpu] += 1;
            }
        }
    }

    fn add_as_interference(
        &mut self,
        prob: &FixedPointProbability,
        cpu: CpuId,
        use_request_counter: bool,
    ) -> bool {
        match self.policy {
            InterferenceProbabilityPolicy::CounterFixed => {
                let counter = if use_request_counter {
                    &mut self.request_counters[cpu]
                } else {
                    &mut self.response_counters[cpu]
                };
                let insert = prob.do_insertion(counter);
                counter.inc();
                insert
            }
            InterferenceProbabilityPolicy::FullRandomFloat => self.rng.next_f64() < prob.as_f64(),
            InterferenceProbabilityPolicy::SequentialInsert => {
                let counter = if use_request_counter {
                    &mut self.sequential_reads[cpu]
                } else {
                    &mut self.sequential_writebacks[cpu]
                };
                if *counter > 0 {
                    *counter -= 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Replays a shared-cache fill into the shadow tags and charges any
    /// tagged interference miss.
    pub fn handle_response(
        &mut self,
        req: &mut MemReq,
        writebacks: usize,
        wb_policy: WritebackOwnerPolicy,
        hit_lat: Tick,
        now: Tick,
    ) -> InterferenceResponse {
        debug_assert_eq!(req.cmd, MemCmd::Read);
        let cpu = req.true_requester;
        let mut out = InterferenceResponse::default();

        self.samples[cpu].shared_responses += 1;
        self.responses_since_priv_wb[cpu] += 1;
        self.writeback_acc[cpu] += writebacks as u64;

        if self.shadow_tags[cpu].find_no_update(req.paddr, req.asid).is_none() {
            if let Some(wb) = self.shadow_replacement(req, wb_policy, now) {
                out.private_writebacks.push(wb);
            }
        }

        // Charge the extra round trip of a tagged interference miss.
        if req.interference_miss_at > 0 && self.cpu_count > 1 {
            let extra = (now + hit_lat).saturating_sub(req.interference_miss_at);
            req.cache_capacity_interference += extra;
            self.stats.extra_miss_latency[cpu] += extra;
            self.stats.extra_responses[cpu] += 1;
            out.capacity_interference = Some(extra);
        }

        if self.do_insertion[cpu]
            && self.cpu_count > 1
            && self.num_leader_sets < self.shadow_sets
            && wb_policy == WritebackOwnerPolicy::ShadowTags
        {
            let prob = self.private_wb_prob[cpu];
            if self.add_as_interference(&prob, cpu, false) {
                let set = self.shadow_tags[cpu].extract_set(req.paddr);
                out.private_writebacks
                    .push(self.make_private_writeback(cpu, crate::common::INVAL_ADDR, Some(set), now));
            }
        }

        out
    }

    fn shadow_replacement(
        &mut self,
        req: &MemReq,
        wb_policy: WritebackOwnerPolicy,
        now: Tick,
    ) -> Option<MemReq> {
        let cpu = req.true_requester;
        let set = self.shadow_tags[cpu].extract_set(req.paddr);
        let leader = self.is_leader_set(set);

        let (_, old) = self.shadow_tags[cpu].replace(req.paddr, req.asid, cpu);
        if !(old.is_valid() && old.is_modified()) {
            return None;
        }

        if self.num_leader_sets == self.shadow_sets {
            self.stats.shadow_writebacks[cpu] += 1;
            // Full map: a dirty shadow eviction is exactly one
            // alone-mode writeback; inject it when attribution is driven
            // by the shadow tags.
            if wb_policy == WritebackOwnerPolicy::ShadowTags {
                let addr = self.shadow_tags[cpu].regenerate_addr(old.tag, old.set);
                return Some(self.make_private_writeback(cpu, addr, None, now));
            }
        } else if leader {
            let scale = self.sets_in_constituency as i64;
            self.samples[cpu].private_writebacks += scale;
            self.sequential_writebacks[cpu] += scale;
            self.stats.shadow_writebacks[cpu] += scale as u64;
        }
        None
    }

    fn make_private_writeback(
        &self,
        cpu: CpuId,
        addr: Addr,
        set: Option<usize>,
        now: Tick,
    ) -> MemReq {
        let mut wb = MemReq::new(MemCmd::VirtualPrivateWriteback, addr, self.line_bytes, cpu, now);
        wb.true_requester = cpu;
        wb.shared_cache_set = set;
        wb
    }

    /// Recomputes the per-core probabilities from the sample window and
    /// resets the window. Enables probabilistic insertion from the first
    /// computation on.
    pub fn compute_interference_probabilities(&mut self, cpu: CpuId) {
        let s = &mut self.samples[cpu];
        let read_interference = s.shared_misses - s.private_misses;
        self.interference_prob[cpu].compute(read_interference, s.shared_misses);
        s.private_misses = 0;
        s.shared_misses = 0;

        self.private_wb_prob[cpu].compute(s.private_writebacks, s.shared_responses);
        s.private_writebacks = 0;
        s.shared_responses = 0;

        self.do_insertion[cpu] = true;
    }

    /// Drains the accumulated miss measurements for all cores.
    pub fn miss_measurement_sample(&mut self) -> Vec<CacheMissMeasurements> {
        let mut out = Vec::with_capacity(self.cpu_count);
        for cpu in 0..self.cpu_count {
            let hits = self.shadow_tags[cpu].hit_distribution();
            let cumulative: Vec<u64> = hits
                .iter()
                .scan(0u64, |acc, &h| {
                    *acc += h;
                    Some(self.access_acc[cpu].saturating_sub(*acc))
                })
                .collect();
            self.shadow_tags[cpu].reset_hit_counters();
            out.push(CacheMissMeasurements {
                read_misses: self.read_miss_acc[cpu],
                wb_misses: self.wb_miss_acc[cpu],
                interference_misses: self.interference_miss_acc[cpu],
                accesses: self.access_acc[cpu],
                writebacks: self.writeback_acc[cpu],
                cumulative_misses: cumulative,
            });
            self.read_miss_acc[cpu] = 0;
            self.wb_miss_acc[cpu] = 0;
            self.interference_miss_acc[cpu] = 0;
            self.access_acc[cpu] = 0;
            self.writeback_acc[cpu] = 0;
        }
        out
    }

    /// Serializes every shadow tag array (checkpointing).
    pub fn serialize(&self, out: &mut dyn std::io::Write) -> Result<(), crate::common::error::SimError> {
        for tags in &self.shadow_tags {
            tags.serialize(out)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator(cpus: usize, leader_sets: usize) -> CacheInterference {
        // 64-set shared cache, 4-way, 64B lines.
        CacheInterference::new(
            cpus,
            64,
            4,
            64,
            leader_sets,
            InterferenceProbabilityPolicy::CounterFixed,
            6,
            1,
        )
    }

    fn read(addr: Addr, cpu: CpuId) -> MemReq {
        let mut req = MemReq::new(MemCmd::Read, addr, 64, cpu, 0);
        req.true_requester = cpu;
        req
    }

    #[test]
    fn leader_sets_tile_the_constituencies() {
        let est = estimator(2, 8);
        // 32 shadow sets, 8 leaders, constituency of 4.
        assert_eq!(est.shadow_sets(), 32);
        let leaders: Vec<usize> = (0..32).filter(|&s| est.is_leader_set(s)).collect();
        assert_eq!(leaders.len(), 8);
        // One leader per constituency.
        for (i, &leader) in leaders.iter().enumerate() {
            assert_eq!(leader / 4, i);
        }
    }

    #[test]
    fn full_map_tags_shadow_hit_shared_miss() {
        let mut est = estimator(2, 0);
        // Warm the shadow for core 0.
        let mut warm = read(0x1000, 0);
        est.access(&mut warm, true, 10, 100);
        assert!(warm.shadow_miss);
        assert_eq!(warm.interference_miss_at, 0);
        // Fill the shadow via the response path.
        let mut resp = warm.clone();
        let _ = est.handle_response(&mut resp, 0, WritebackOwnerPolicy::Owner, 10, 150);
        // Same block again: shared miss but shadow hit -> tagged.
        let mut again = read(0x1000, 0);
        est.access(&mut again, true, 10, 200);
        assert!(!again.shadow_miss);
        assert_eq!(again.interference_miss_at, 210);
        assert_eq!(est.stats.extra_misses[0], 1);
    }

    #[test]
    fn tagged_response_charges_capacity_interference() {
        let mut est = estimator(2, 0);
        let mut req = read(0x2000, 1);
        req.interference_miss_at = 150;
        req.shadow_miss = true;
        let out = est.handle_response(&mut req, 0, WritebackOwnerPolicy::Owner, 10, 300);
        // (300 + 10) - 150 = 160 extra ticks.
        assert_eq!(out.capacity_interference, Some(160));
        assert_eq!(est.stats.extra_miss_latency[1], 160);
    }

    #[test]
    fn probability_matches_window_counts() {
        let mut est = estimator(2, 0);
        // 10 shared misses, 4 private (shadow) misses.
        est.samples[0].shared_misses = 10;
        est.samples[0].private_misses = 4;
        est.compute_interference_probabilities(0);
        let p = est.interference_probability(0);
        // (10 - 4) / 10 = 0.6 to within one LSB of 6-bit fixed point.
        assert!((p.as_f64() - 0.6).abs() < 1.0 / 64.0);
    }

    #[test]
    fn probability_saturation_rules() {
        let mut est = estimator(2, 0);
        // shared <= private -> zero.
        est.samples[0].shared_misses = 4;
        est.samples[0].private_misses = 9;
        est.compute_interference_probabilities(0);
        assert_eq!(est.interference_probability(0).raw(), 0);
        // shared == 0 -> saturates to max.
        est.samples[1].shared_misses = 0;
        est.samples[1].private_misses = 0;
        est.compute_interference_probabilities(1);
        assert_eq!(est.interference_probability(1).raw(), 63);
    }

    #[test]
    fn dirty_shadow_eviction_injects_private_writeback() {
        let mut est = estimator(2, 0);
        // Fill one shadow set completely with dirty blocks, then evict.
        let set_stride = (32 * 64) as Addr;
        for i in 0..4 {
            let addr = 0x10_0000 + i * set_stride;
            let mut req = read(addr, 0);
            est.access(&mut req, true, 10, 100);
            let _ = est.handle_response(&mut req, 0, WritebackOwnerPolicy::ShadowTags, 10, 120);
            let mut wb = MemReq::new(MemCmd::Writeback, addr, 64, 0, 130);
            wb.true_requester = 0;
            est.access(&mut wb, false, 10, 130);
        }
        // A fifth block evicts a dirty shadow block.
        let mut req = read(0x10_0000 + 4 * set_stride, 0);
        est.access(&mut req, true, 10, 200);
        let out = est.handle_response(&mut req, 0, WritebackOwnerPolicy::ShadowTags, 10, 220);
        assert_eq!(out.private_writebacks.len(), 1);
        assert_eq!(
            out.private_writebacks[0].cmd,
            MemCmd::VirtualPrivateWriteback
        );
        assert_eq!(est.stats.shadow_writebacks[0], 1);
    }

    #[test]
    fn single_core_never_tags() {
        let mut est = estimator(1, 0);
        let mut req = read(0x1000, 0);
        est.access(&mut req, true, 10, 100);
        let mut resp = req.clone();
        let _ = est.handle_response(&mut resp, 0, WritebackOwnerPolicy::Owner, 10, 120);
        let mut again = read(0x1000, 0);
        est.access(&mut again, true, 10, 200);
        assert_eq!(again.interference_miss_at, 0);
    }
}
