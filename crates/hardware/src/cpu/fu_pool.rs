//! Functional unit pool.
//!
//! Each unit advertises a capability bitset over op classes with
//! per-class operation and issue latencies. Acquiring a unit parks it in
//! a power-of-two release ring for its issue latency; `tick` advances the
//! ring one slot and returns expired units to the free list.
//!
//! `acquire` keeps the pool's classic return contract: the operation
//! latency on success, `-1` when every capable unit is busy, `-2` when no
//! unit in the pool ever provides the class (a permanent routing error).

use crate::common::Tick;
use crate::config::FuDescConfig;
use crate::cpu::inst::OpClass;

/// One functional unit.
#[derive(Debug, Clone)]
struct FuncUnit {
    capabilities: u16,
    op_lat: [u32; OpClass::COUNT],
    issue_lat: [u32; OpClass::COUNT],
}

impl FuncUnit {
    fn new() -> Self {
        Self {
            capabilities: 0,
            op_lat: [0; OpClass::COUNT],
            issue_lat: [0; OpClass::COUNT],
        }
    }

    fn add_capability(&mut self, op: OpClass, op_lat: u32, issue_lat: u32) {
        assert!(
            op_lat > 0 && issue_lat > 0,
            "zero-cycle functional unit latency"
        );
        self.capabilities |= 1 << op as usize;
        self.op_lat[op as usize] = op_lat;
        self.issue_lat[op as usize] = issue_lat;
    }

    #[inline]
    fn provides(&self, op: OpClass) -> bool {
        self.capabilities & (1 << op as usize) != 0
    }
}

/// A pool of functional units with a scheduled-release ring.
pub struct FuncUnitPool {
    units: Vec<FuncUnit>,
    free: Vec<usize>,
    busy_ring: Vec<Vec<usize>>,
    ring_pos: usize,
    ring_mask: usize,
    capability_mask: u16,
    max_op_lat: [u32; OpClass::COUNT],
    /// Units acquired since the last statistics reset.
    pub acquires: u64,
}

impl FuncUnitPool {
    /// Builds the pool from the configured inventory; an empty inventory
    /// selects the default superscalar mix.
    pub fn new(descs: &[FuDescConfig]) -> Self {
        let descs = if descs.is_empty() {
            default_inventory()
        } else {
            descs.to_vec()
        };

        let mut units = Vec::new();
        let mut capability_mask = 0u16;
        let mut max_op_lat = [0u32; OpClass::COUNT];
        let mut max_latency = 0u32;

        for desc in &descs {
            if desc.count == 0 {
                continue;
            }
            let mut unit = FuncUnit::new();
            for op in &desc.ops {
                let Some(class) = OpClass::from_name(&op.op_class) else {
                    continue;
                };
                capability_mask |= 1 << class as usize;
                unit.add_capability(class, op.op_lat, op.issue_lat);
                max_op_lat[class as usize] = max_op_lat[class as usize].max(op.op_lat);
                max_latency = max_latency.max(op.op_lat).max(op.issue_lat);
            }
            for _ in 0..desc.count {
                units.push(unit.clone());
            }
        }

        let ring_len = (max_latency as usize + 1).next_power_of_two().max(16);
        let free = (0..units.len()).collect();
        Self {
            units,
            free,
            busy_ring: vec![Vec::new(); ring_len],
            ring_pos: 0,
            ring_mask: ring_len - 1,
            capability_mask,
            max_op_lat,
            acquires: 0,
        }
    }

    /// Number of units in the pool.
    pub fn num_units(&self) -> usize {
        self.units.len()
    }

    /// Number of currently free units.
    pub fn num_free(&self) -> usize {
        self.free.len()
    }

    /// Worst-case operation latency for a class across the pool.
    pub fn max_op_latency(&self, op: OpClass) -> u32 {
        self.max_op_lat[op as usize]
    }

    /// Pins memory-port operation latencies to the connected L1 hit
    /// latency so pipeline timing stays consistent with the cache.
    pub fn annotate_memory_units(&mut self, hit_latency: Tick) {
        let lat = hit_latency.max(1) as u32;
        self.max_op_lat[OpClass::MemRead as usize] = lat;
        self.max_op_lat[OpClass::MemWrite as usize] = lat;
        for unit in &mut self.units {
            if unit.provides(OpClass::MemRead) {
                unit.op_lat[OpClass::MemRead as usize] = lat;
            }
            if unit.provides(OpClass::MemWrite) {
                unit.op_lat[OpClass::MemWrite as usize] = lat;
            }
        }
    }

    /// Acquires a unit for `op`.
    ///
    /// Returns the operation latency in cycles, `-1` when all capable
    /// units are busy this cycle, or `-2` when the pool never provides
    /// the class.
    pub fn acquire(&mut self, op: OpClass) -> i32 {
        if self.capability_mask & (1 << op as usize) == 0 {
            return -2;
        }

        let Some(pos) = self
            .free
            .iter()
            .position(|&u| self.units[u].provides(op))
        else {
            return -1;
        };
        let unit = self.free.remove(pos);
        let issue_lat = self.units[unit].issue_lat[op as usize] as usize;
        let op_lat = self.units[unit].op_lat[op as usize];

        // Slot zero releases next tick (latency one), so park the unit at
        // issue_lat - 1 from the current ring position.
        let slot = (self.ring_pos + issue_lat - 1) & self.ring_mask;
        self.busy_ring[slot].push(unit);
        self.acquires += 1;
        op_lat as i32
    }

    /// Advances the release ring one cycle, returning expired units to
    /// the free list.
    pub fn tick(&mut self) {
        let expired = std::mem::take(&mut self.busy_ring[self.ring_pos]);
        for unit in expired {
            self.free.push(unit);
        }
        self.ring_pos = (self.ring_pos + 1) & self.ring_mask;
    }
}

fn default_inventory() -> Vec<FuDescConfig> {
    use crate::config::OpDescConfig;
    fn op(op_class: &str, op_lat: u32, issue_lat: u32) -> OpDescConfig {
        OpDescConfig {
            op_class: op_class.into(),
            op_lat,
            issue_lat,
        }
    }
    vec![
        FuDescConfig {
            count: 4,
            ops: vec![op("IntAlu", 1, 1)],
        },
        FuDescConfig {
            count: 1,
            ops: vec![op("IntMult", 3, 1), op("IntDiv", 20, 19)],
        },
        FuDescConfig {
            count: 2,
            ops: vec![op("FloatAdd", 2, 1), op("FloatCmp", 2, 1), op("FloatCvt", 2, 1)],
        },
        FuDescConfig {
            count: 1,
            ops: vec![
                op("FloatMult", 4, 1),
                op("FloatDiv", 12, 12),
                op("FloatSqrt", 24, 24),
            ],
        },
        FuDescConfig {
            count: 2,
            ops: vec![
                op("MemRead", 1, 1),
                op("MemWrite", 1, 1),
                op("IprAccess", 1, 1),
                op("InstPrefetch", 1, 1),
            ],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_class_is_a_routing_error() {
        let mut pool = FuncUnitPool::new(&[]);
        // The default pool has no unit for the null class.
        assert_eq!(pool.acquire(OpClass::Null), -2);
    }

    #[test]
    fn acquire_returns_op_latency() {
        let mut pool = FuncUnitPool::new(&[]);
        assert_eq!(pool.acquire(OpClass::IntMult), 3);
    }

    #[test]
    fn exhausted_units_return_busy() {
        let mut pool = FuncUnitPool::new(&[]);
        // Four ALUs in the default pool.
        for _ in 0..4 {
            assert_eq!(pool.acquire(OpClass::IntAlu), 1);
        }
        assert_eq!(pool.acquire(OpClass::IntAlu), -1);
    }

    #[test]
    fn tick_releases_after_issue_latency() {
        let mut pool = FuncUnitPool::new(&[]);
        for _ in 0..4 {
            let _ = pool.acquire(OpClass::IntAlu);
        }
        assert_eq!(pool.acquire(OpClass::IntAlu), -1);
        // Issue latency 1: the units come back on the next tick.
        pool.tick();
        assert_eq!(pool.acquire(OpClass::IntAlu), 1);
    }

    #[test]
    fn unpipelined_divider_stays_busy() {
        let mut pool = FuncUnitPool::new(&[]);
        assert_eq!(pool.acquire(OpClass::IntDiv), 20);
        // Issue latency 19: busy for 18 more ticks, free on the 19th.
        for _ in 0..18 {
            pool.tick();
            assert_eq!(pool.acquire(OpClass::IntDiv), -1);
        }
        pool.tick();
        assert_eq!(pool.acquire(OpClass::IntDiv), 20);
    }

    #[test]
    fn memory_units_annotated_from_l1() {
        let mut pool = FuncUnitPool::new(&[]);
        pool.annotate_memory_units(3);
        assert_eq!(pool.acquire(OpClass::MemRead), 3);
        assert_eq!(pool.max_op_latency(OpClass::MemWrite), 3);
    }
}
