//! Set-associative LRU tag store.
//!
//! Blocks are owned by the tag array; lookups hand out indices that are
//! only valid for the duration of one operation. The store supports
//! per-core way quotas (static partitioning of the shared cache) and the
//! line-per-block serialization format used for checkpoints.

use std::io::{BufRead, Write};

use crate::common::error::SimError;
use crate::common::{Addr, CpuId};

/// Block state bits.
pub mod blk {
    /// Block holds valid data.
    pub const VALID: u8 = 0x1;
    /// Block differs from memory.
    pub const MODIFIED: u8 = 0x2;
    /// Block may be written without an upgrade.
    pub const WRITABLE: u8 = 0x4;
}

/// One cache block's metadata.
#[derive(Debug, Clone, Default)]
pub struct CacheBlock {
    /// Tag bits of the cached address.
    pub tag: Addr,
    /// Set this block belongs to.
    pub set: usize,
    /// State bits (`blk::*`).
    pub status: u8,
    /// Address-space id.
    pub asid: usize,
    /// Per-sharer bit vector under directory coherence.
    pub sharers: u64,
    /// Core that originally fetched the block, for writeback
    /// attribution.
    pub origin_cpu: CpuId,
    /// Block was brought in by a prefetch and not yet demanded.
    pub prefetched: bool,
}

impl CacheBlock {
    /// Valid bit.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.status & blk::VALID != 0
    }

    /// Modified (dirty) bit.
    #[inline]
    pub fn is_modified(&self) -> bool {
        self.status & blk::MODIFIED != 0
    }

    /// Writable bit.
    #[inline]
    pub fn is_writable(&self) -> bool {
        self.status & blk::WRITABLE != 0
    }
}

/// Set-associative LRU tag array.
pub struct TagStore {
    sets: usize,
    assoc: usize,
    line_bytes: usize,
    set_shift: u32,
    set_mask: Addr,
    blocks: Vec<CacheBlock>,
    // Way order per set, most recently used first.
    order: Vec<Vec<usize>>,
    // Per-core way quotas; None disables partitioning.
    way_quotas: Option<Vec<usize>>,
    // Hits per LRU stack distance, for alone-performance estimation.
    hit_dist: Vec<u64>,
    cpu_count: usize,
}

impl TagStore {
    /// Creates a tag store of `sets x assoc` blocks.
    pub fn new(
        sets: usize,
        assoc: usize,
        line_bytes: usize,
        cpu_count: usize,
        way_quotas: Option<Vec<usize>>,
    ) -> Self {
        debug_assert!(sets.is_power_of_two() && line_bytes.is_power_of_two());
        let mut blocks = vec![CacheBlock::default(); sets * assoc];
        for set in 0..sets {
            for way in 0..assoc {
                blocks[set * assoc + way].set = set;
            }
        }
        Self {
            sets,
            assoc,
            line_bytes,
            set_shift: line_bytes.trailing_zeros(),
            set_mask: sets as Addr - 1,
            blocks,
            order: (0..sets).map(|_| (0..assoc).collect()).collect(),
            way_quotas,
            hit_dist: vec![0; assoc],
            cpu_count,
        }
    }

    /// Number of sets.
    #[inline]
    pub fn num_sets(&self) -> usize {
        self.sets
    }

    /// Associativity.
    #[inline]
    pub fn assoc(&self) -> usize {
        self.assoc
    }

    /// Set index of an address.
    #[inline]
    pub fn extract_set(&self, addr: Addr) -> usize {
        ((addr >> self.set_shift) & self.set_mask) as usize
    }

    /// Tag bits of an address.
    #[inline]
    pub fn extract_tag(&self, addr: Addr) -> Addr {
        addr >> (self.set_shift + self.sets.trailing_zeros())
    }

    /// Rebuilds a block-aligned address from tag and set.
    pub fn regenerate_addr(&self, tag: Addr, set: usize) -> Addr {
        (tag << (self.set_shift + self.sets.trailing_zeros()))
            | ((set as Addr) << self.set_shift)
    }

    /// Replaces per-core way quotas at run time (adaptive policies).
    pub fn set_way_quotas(&mut self, quotas: Option<Vec<usize>>) {
        self.way_quotas = quotas;
    }

    /// Looks up a block and promotes it to MRU on hit.
    pub fn find(&mut self, addr: Addr, asid: usize) -> Option<&mut CacheBlock> {
        let set = self.extract_set(addr);
        let tag = self.extract_tag(addr);
        let order = &mut self.order[set];
        let pos = order.iter().position(|&way| {
            let b = &self.blocks[set * self.assoc + way];
            b.is_valid() && b.tag == tag && b.asid == asid
        })?;
        self.hit_dist[pos] += 1;
        let way = order.remove(pos);
        order.insert(0, way);
        Some(&mut self.blocks[set * self.assoc + way])
    }

    /// Looks up a block without disturbing replacement state.
    pub fn find_no_update(&self, addr: Addr, asid: usize) -> Option<&CacheBlock> {
        let set = self.extract_set(addr);
        let tag = self.extract_tag(addr);
        self.blocks[set * self.assoc..(set + 1) * self.assoc]
            .iter()
            .find(|b| b.is_valid() && b.tag == tag && b.asid == asid)
    }

    /// Raw index of a block, without LRU update.
    pub fn find_idx(&self, addr: Addr, asid: usize) -> Option<usize> {
        let set = self.extract_set(addr);
        let tag = self.extract_tag(addr);
        (0..self.assoc)
            .map(|way| set * self.assoc + way)
            .find(|&idx| {
                let b = &self.blocks[idx];
                b.is_valid() && b.tag == tag && b.asid == asid
            })
    }

    /// Mutable lookup without LRU update (coherence state changes).
    pub fn find_no_update_mut(&mut self, addr: Addr, asid: usize) -> Option<&mut CacheBlock> {
        let set = self.extract_set(addr);
        let tag = self.extract_tag(addr);
        self.blocks[set * self.assoc..(set + 1) * self.assoc]
            .iter_mut()
            .find(|b| b.is_valid() && b.tag == tag && b.asid == asid)
    }

    /// Selects a victim way for a fill by `cpu`, honoring way quotas,
    /// and returns the evicted block's previous contents.
    ///
    /// The returned block is already re-tagged for `addr`; the caller
    /// inspects the copy to fabricate a writeback if it was dirty.
    pub fn replace(&mut self, addr: Addr, asid: usize, cpu: CpuId) -> (usize, CacheBlock) {
        let set = self.extract_set(addr);
        let tag = self.extract_tag(addr);
        let way = self.pick_victim(set, cpu);

        let order = &mut self.order[set];
        let pos = order
            .iter()
            .position(|&w| w == way)
            .unwrap_or(self.assoc - 1);
        let way = order.remove(pos);
        order.insert(0, way);

        let idx = set * self.assoc + way;
        let old = self.blocks[idx].clone();
        self.blocks[idx] = CacheBlock {
            tag,
            set,
            status: blk::VALID,
            asid,
            sharers: 0,
            origin_cpu: cpu,
            prefetched: false,
        };
        (idx, old)
    }

    fn pick_victim(&self, set: usize, cpu: CpuId) -> usize {
        let order = &self.order[set];

        // Invalid ways first, regardless of partitioning.
        for &way in order.iter().rev() {
            if !self.blocks[set * self.assoc + way].is_valid() {
                return way;
            }
        }

        if let Some(quotas) = &self.way_quotas {
            let quota = quotas.get(cpu).copied().unwrap_or(0);
            let owned = order
                .iter()
                .filter(|&&w| self.blocks[set * self.assoc + w].origin_cpu == cpu)
                .count();
            if owned >= quota && quota > 0 {
                // At quota: evict this core's own LRU block.
                for &way in order.iter().rev() {
                    if self.blocks[set * self.assoc + way].origin_cpu == cpu {
                        return way;
                    }
                }
            } else {
                // Below quota: evict the LRU block of a core over quota,
                // falling back to global LRU.
                for &way in order.iter().rev() {
                    let owner = self.blocks[set * self.assoc + way].origin_cpu;
                    if owner != cpu {
                        let owner_quota = quotas.get(owner).copied().unwrap_or(0);
                        let owner_count = order
                            .iter()
                            .filter(|&&w| self.blocks[set * self.assoc + w].origin_cpu == owner)
                            .count();
                        if owner_count > owner_quota {
                            return way;
                        }
                    }
                }
            }
        }

        *order.last().unwrap_or(&0)
    }

    /// Mutable access to a block by raw index (fill path).
    pub fn block_mut(&mut self, idx: usize) -> &mut CacheBlock {
        &mut self.blocks[idx]
    }

    /// Hits per LRU stack distance since the last reset.
    pub fn hit_distribution(&self) -> Vec<u64> {
        self.hit_dist.clone()
    }

    /// Clears the per-distance hit counters.
    pub fn reset_hit_counters(&mut self) {
        self.hit_dist.iter_mut().for_each(|c| *c = 0);
    }

    /// Invalidates a block if present; returns the old contents.
    pub fn invalidate(&mut self, addr: Addr, asid: usize) -> Option<CacheBlock> {
        let set = self.extract_set(addr);
        let tag = self.extract_tag(addr);
        for way in 0..self.assoc {
            let idx = set * self.assoc + way;
            let b = &mut self.blocks[idx];
            if b.is_valid() && b.tag == tag && b.asid == asid {
                let old = b.clone();
                b.status = 0;
                return Some(old);
            }
        }
        None
    }

    /// Writes one line per block: `set tag state lru-position origin-cpu`
    /// after a geometry header.
    pub fn serialize(&self, out: &mut dyn Write) -> Result<(), SimError> {
        writeln!(out, "{} {} {}", self.cpu_count, self.sets, self.assoc)
            .map_err(|e| SimError::Serialize(e.to_string()))?;
        for set in 0..self.sets {
            for (lru_pos, &way) in self.order[set].iter().enumerate() {
                let b = &self.blocks[set * self.assoc + way];
                if b.is_valid() {
                    writeln!(out, "{} {} {} {} {}", set, b.tag, b.status, lru_pos, b.origin_cpu)
                        .map_err(|e| SimError::Serialize(e.to_string()))?;
                }
            }
        }
        Ok(())
    }

    /// Restores a tag array serialized by [`TagStore::serialize`]; only
    /// an exact geometry match is accepted.
    ///
    /// # Errors
    ///
    /// [`SimError::CheckpointGeometry`] on any mismatch,
    /// [`SimError::Serialize`] on malformed input.
    pub fn unserialize(&mut self, input: &mut dyn BufRead) -> Result<(), SimError> {
        let mut header = String::new();
        let _ = input
            .read_line(&mut header)
            .map_err(|e| SimError::Serialize(e.to_string()))?;
        let parts: Vec<usize> = header
            .split_whitespace()
            .map(str::parse)
            .collect::<Result<_, _>>()
            .map_err(|e: std::num::ParseIntError| SimError::Serialize(e.to_string()))?;
        let [cpu_count, sets, assoc] = parts[..] else {
            return Err(SimError::Serialize("bad checkpoint header".into()));
        };
        if sets != self.sets || assoc != self.assoc || cpu_count != self.cpu_count {
            return Err(SimError::CheckpointGeometry {
                expected_sets: self.sets,
                expected_assoc: self.assoc,
                found_sets: sets,
                found_assoc: assoc,
            });
        }

        for b in &mut self.blocks {
            b.status = 0;
        }
        let mut per_set: Vec<Vec<(Addr, u8, usize, CpuId)>> = vec![Vec::new(); self.sets];
        for line in input.lines() {
            let line = line.map_err(|e| SimError::Serialize(e.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            let [set, tag, state, lru_pos, origin] = fields[..] else {
                return Err(SimError::Serialize(format!("bad checkpoint line: {line}")));
            };
            let set: usize = set
                .parse()
                .map_err(|_| SimError::Serialize(format!("bad set in: {line}")))?;
            if set >= self.sets {
                return Err(SimError::Serialize(format!("set out of range: {line}")));
            }
            per_set[set].push((
                tag.parse()
                    .map_err(|_| SimError::Serialize(format!("bad tag in: {line}")))?,
                state
                    .parse()
                    .map_err(|_| SimError::Serialize(format!("bad state in: {line}")))?,
                lru_pos
                    .parse()
                    .map_err(|_| SimError::Serialize(format!("bad lru in: {line}")))?,
                origin
                    .parse()
                    .map_err(|_| SimError::Serialize(format!("bad origin in: {line}")))?,
            ));
        }
        for (set, mut entries) in per_set.into_iter().enumerate() {
            entries.sort_by_key(|&(_, _, lru_pos, _)| lru_pos);
            let mut order = Vec::new();
            for (way, (tag, state, _, origin)) in entries.into_iter().enumerate() {
                if way >= self.assoc {
                    return Err(SimError::Serialize(format!("too many blocks in set {set}")));
                }
                let idx = set * self.assoc + way;
                self.blocks[idx] = CacheBlock {
                    tag,
                    set,
                    status: state,
                    asid: 0,
                    sharers: 0,
                    origin_cpu: origin,
                    prefetched: false,
                };
                order.push(way);
            }
            for way in 0..self.assoc {
                if !order.contains(&way) {
                    order.push(way);
                }
            }
            self.order[set] = order;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> TagStore {
        // 4 sets x 2 ways x 64B lines.
        TagStore::new(4, 2, 64, 1, None)
    }

    #[test]
    fn fill_then_find() {
        let mut tags = store();
        let (_, old) = tags.replace(0x1000, 0, 0);
        assert!(!old.is_valid());
        assert!(tags.find(0x1000, 0).is_some());
        assert!(tags.find(0x2000, 0).is_none());
    }

    #[test]
    fn lru_evicts_least_recent() {
        let mut tags = store();
        // Same set: addresses differing only above set bits.
        let a = 0x1000;
        let b = a + 4 * 64; // next address in the same set
        let c = b + 4 * 64;
        let _ = tags.replace(a, 0, 0);
        let _ = tags.replace(b, 0, 0);
        // Touch `a` so `b` becomes LRU.
        assert!(tags.find(a, 0).is_some());
        let (_, evicted) = tags.replace(c, 0, 0);
        assert_eq!(evicted.tag, tags.extract_tag(b));
        assert!(tags.find(a, 0).is_some());
        assert!(tags.find(b, 0).is_none());
    }

    #[test]
    fn regenerate_inverts_extract() {
        let tags = store();
        let addr = 0x0003_2940;
        let block = addr & !63;
        let set = tags.extract_set(addr);
        let tag = tags.extract_tag(addr);
        assert_eq!(tags.regenerate_addr(tag, set), block);
    }

    #[test]
    fn way_quota_keeps_core_within_share() {
        // 2 cores, 4 ways, quota 2 each.
        let mut tags = TagStore::new(4, 4, 64, 2, Some(vec![2, 2]));
        let set_stride = 4 * 64;
        // Core 0 fills two ways of set 0.
        let _ = tags.replace(0x0000, 0, 0);
        let _ = tags.replace(set_stride as Addr, 0, 0);
        // Core 1 fills two ways.
        let _ = tags.replace(2 * set_stride as Addr, 0, 1);
        let _ = tags.replace(3 * set_stride as Addr, 0, 1);
        // Core 0 at quota: its next fill must evict one of its own.
        let (_, evicted) = tags.replace(4 * set_stride as Addr, 0, 0);
        assert_eq!(evicted.origin_cpu, 0);
    }

    #[test]
    fn serialize_round_trips() {
        let mut tags = store();
        let _ = tags.replace(0x1000, 0, 0);
        let _ = tags.replace(0x2040, 0, 0);
        if let Some(b) = tags.find_no_update_mut(0x1000, 0) {
            b.status |= blk::MODIFIED;
        }
        let mut buf = Vec::new();
        tags.serialize(&mut buf).unwrap();

        let mut restored = store();
        restored.unserialize(&mut &buf[..]).unwrap();
        assert!(restored.find_no_update(0x1000, 0).is_some_and(|b| b.is_modified()));
        assert!(restored.find_no_update(0x2040, 0).is_some());
    }

    #[test]
    fn unserialize_rejects_geometry_mismatch() {
        let mut tags = store();
        let _ = tags.replace(0x1000, 0, 0);
        let mut buf = Vec::new();
        tags.serialize(&mut buf).unwrap();

        let mut other = TagStore::new(8, 2, 64, 1, None);
        assert!(matches!(
            other.unserialize(&mut &buf[..]),
            Err(SimError::CheckpointGeometry { .. })
        ));
    }

    #[test]
    fn hit_distribution_tracks_stack_distance() {
        let mut tags = store();
        let _ = tags.replace(0x1000, 0, 0);
        let _ = tags.find(0x1000, 0); // MRU hit
        let dist = tags.hit_distribution();
        assert_eq!(dist[0], 1);
        assert_eq!(dist[1], 0);
    }
}
