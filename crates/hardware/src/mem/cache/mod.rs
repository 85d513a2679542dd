//! Cache with MSHRs, writeback buffering, coherence, and prefetch.
//!
//! One `Cache` type serves as private L1 (instruction or data) and as a
//! bank of the shared last-level cache; the differences are carried by
//! configuration (coherence protocol, way partitioning, writeback
//! attribution).
//!
//! The access contract: `access` returns hit/miss/blocked; misses
//! allocate or merge an MSHR and push a fetch onto the outgoing queue
//! for the downstream bus. `handle_response` fills the block, drains
//! merged targets, and fabricates writebacks for displaced dirty blocks.

pub mod coherence;
pub mod copy;
pub mod interference;
pub mod mshr;
pub mod prefetch;
pub mod tags;
pub mod wb_buffer;

use std::collections::VecDeque;

use crate::common::{Addr, Tick};
use crate::config::{CacheConfig, WritebackOwnerPolicy};
use crate::mem::req::{MemCmd, MemReq, ReqFlags};

use self::coherence::{Protocol, SnoopAction};
use self::copy::CopyState;
use self::mshr::{MshrFile, MshrReject};
use self::prefetch::Prefetcher;
use self::tags::{TagStore, blk};
use self::wb_buffer::WritebackBuffer;

/// Blocking conditions a cache can be in; a nonzero set blocks upstream
/// interfaces until the condition clears.
pub mod blocked {
    /// All MSHRs allocated.
    pub const NO_MSHRS: u8 = 0x1;
    /// A target list filled up.
    pub const NO_TARGETS: u8 = 0x2;
    /// Writeback buffer full.
    pub const NO_WB_BUFFERS: u8 = 0x4;
    /// A copy operation holds the cache.
    pub const BLOCKED_COPY: u8 = 0x8;
}

/// Result of a timing access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAccessResult {
    /// Hit; respond after the hit latency.
    Hit(Tick),
    /// Miss; an MSHR tracks it and a response will arrive later.
    Miss,
    /// The cache cannot accept the request; retry next cycle.
    Blocked,
    /// A hard prefetch was dropped under pressure.
    Dropped,
}

/// Effects of filling a response.
#[derive(Debug, Default)]
pub struct ResponseEffects {
    /// Merged targets to answer upstream.
    pub targets: Vec<MemReq>,
    /// Tick the miss started service (for latency accounting).
    pub service_start: Tick,
    /// The response was entirely squashed and dropped.
    pub squashed: bool,
}

/// Result of observing a bus request.
#[derive(Debug)]
pub struct SnoopResult {
    /// Protocol action taken.
    pub action: SnoopAction,
    /// Writeback fabricated to supply modified data.
    pub supplied: Option<MemReq>,
}

/// Cache statistics.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Demand hits.
    pub hits: u64,
    /// Demand misses.
    pub misses: u64,
    /// Accesses merged into an existing MSHR.
    pub mshr_merges: u64,
    /// Writebacks fabricated for displaced dirty blocks.
    pub writebacks: u64,
    /// Hard prefetches dropped for lack of resources.
    pub prefetches_dropped: u64,
    /// Write hits that required an ownership upgrade.
    pub upgrades: u64,
    /// Snoops answered with data.
    pub snoop_supplies: u64,
    /// Snoops NACKed.
    pub snoop_nacks: u64,
    /// Cycles spent with a nonzero blocked set.
    pub blocked_cycles: u64,
}

/// A cache level (or one bank of the shared cache).
pub struct Cache {
    name: String,
    hit_latency: Tick,
    line_bytes: usize,
    /// Tag array.
    pub tags: TagStore,
    /// Miss status registers.
    pub mshrs: MshrFile,
    /// Writeback buffer.
    pub wb_buffer: WritebackBuffer,
    protocol: Protocol,
    prefetcher: Prefetcher,
    wb_owner_policy: WritebackOwnerPolicy,
    outgoing: VecDeque<MemReq>,
    blocked_set: u8,
    /// Statistics.
    pub stats: CacheStats,
}

impl Cache {
    /// Builds a cache from its configuration. For a shared-cache bank,
    /// `sets_override` carries the per-bank set count.
    pub fn new(
        name: impl Into<String>,
        config: &CacheConfig,
        cpu_count: usize,
        sets_override: Option<usize>,
    ) -> Self {
        let sets = sets_override.unwrap_or_else(|| config.sets());
        Self {
            name: name.into(),
            hit_latency: config.hit_latency,
            line_bytes: config.line_bytes,
            tags: TagStore::new(
                sets,
                config.assoc,
                config.line_bytes,
                cpu_count,
                config.way_partitioning.clone(),
            ),
            mshrs: MshrFile::new(config.mshrs, config.targets_per_mshr),
            wb_buffer: WritebackBuffer::new(config.wb_buffers),
            protocol: Protocol::new(config.coherence),
            prefetcher: Prefetcher::new(config.prefetcher, config.line_bytes),
            wb_owner_policy: config.writeback_owner_policy,
            outgoing: VecDeque::new(),
            blocked_set: 0,
            stats: CacheStats::default(),
        }
    }

    /// Cache name for traces and diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured hit latency.
    #[inline]
    pub fn hit_latency(&self) -> Tick {
        self.hit_latency
    }

    /// Line size in bytes.
    #[inline]
    pub fn line_bytes(&self) -> usize {
        self.line_bytes
    }

    /// Current blocking-condition set (`blocked::*` bits).
    pub fn blocked_set(&self) -> u8 {
        self.blocked_set
    }

    /// True while any blocking condition holds.
    pub fn is_blocked(&self) -> bool {
        self.blocked_set != 0
    }

    /// Writeback attribution policy.
    pub fn wb_owner_policy(&self) -> WritebackOwnerPolicy {
        self.wb_owner_policy
    }

    fn block_addr(&self, addr: Addr) -> Addr {
        addr & !(self.line_bytes as Addr - 1)
    }

    fn update_blocked(&mut self) {
        let mut set = 0;
        if self.mshrs.is_full() {
            set |= blocked::NO_MSHRS;
        }
        if self.wb_buffer.is_full() {
            set |= blocked::NO_WB_BUFFERS;
        }
        let copy_active = self
            .mshrs
            .handles()
            .iter()
            .any(|&h| self.mshrs.get(h).copy.is_some());
        if copy_active {
            set |= blocked::BLOCKED_COPY;
        }
        // NO_TARGETS is sticky until a response clears it.
        self.blocked_set = set | (self.blocked_set & blocked::NO_TARGETS);
    }

    /// Timing access.
    pub fn access(&mut self, mut req: MemReq, now: Tick) -> CacheAccessResult {
        let block_addr = self.block_addr(req.paddr);

        if req.cmd == MemCmd::Copy {
            return self.start_copy(req, now);
        }

        if req.cmd.is_write() && req.cmd != MemCmd::Write {
            // Writeback arriving from the level above.
            return self.accept_writeback(req, now);
        }

        // Demand read/write or prefetch.
        let hit = {
            let asid = req.asid;
            match self.tags.find(req.paddr, asid) {
                Some(block) => {
                    let was_prefetched = block.prefetched;
                    block.prefetched = false;
                    if req.cmd == MemCmd::Write && self.protocol.needs_upgrade(block) {
                        None // fall into the miss path as an upgrade
                    } else {
                        if req.cmd == MemCmd::Write {
                            block.status |= blk::MODIFIED;
                        }
                        Some(was_prefetched)
                    }
                }
                None => None,
            }
        };

        if let Some(was_prefetched) = hit {
            self.stats.hits += 1;
            let prefetches = self.prefetcher.observe(
                req.paddr,
                req.true_requester,
                req.asid,
                false,
                was_prefetched,
                now,
            );
            self.queue_prefetches(prefetches, now);
            tracing::trace!(target: "cache", cache = %self.name, paddr = req.paddr, "hit");
            return CacheAccessResult::Hit(self.hit_latency);
        }

        // Miss path.
        let is_upgrade = req.cmd == MemCmd::Write
            && self
                .tags
                .find_no_update(req.paddr, req.asid)
                .is_some_and(|b| !b.is_writable());
        if is_upgrade {
            self.stats.upgrades += 1;
        } else {
            self.stats.misses += 1;
        }
        if !req.cmd.is_prefetch() {
            let prefetches =
                self.prefetcher
                    .observe(req.paddr, req.true_requester, req.asid, true, false, now);
            self.queue_prefetches(prefetches, now);
        }

        if let Some(handle) = self.mshrs.find(block_addr, req.asid) {
            // Invariant: merge into the existing MSHR, never a second one.
            req.mshr = Some(handle);
            match self.mshrs.add_target(handle, req) {
                Ok(()) => {
                    self.stats.mshr_merges += 1;
                    CacheAccessResult::Miss
                }
                Err(MshrReject::NoTargets) => {
                    self.blocked_set |= blocked::NO_TARGETS;
                    CacheAccessResult::Blocked
                }
                Err(MshrReject::NoMshrs) => CacheAccessResult::Blocked,
            }
        } else {
            if self.mshrs.is_full() {
                self.update_blocked();
                if req.cmd == MemCmd::HardPrefetch {
                    self.stats.prefetches_dropped += 1;
                    return CacheAccessResult::Dropped;
                }
                return CacheAccessResult::Blocked;
            }
            let asid = req.asid;
            let cmd_down = if is_upgrade {
                MemCmd::Upgrade
            } else if req.cmd == MemCmd::Write && self.protocol.kind() != crate::config::Coherence::None
            {
                MemCmd::ReadEx
            } else if req.cmd == MemCmd::HardPrefetch || req.cmd == MemCmd::SoftPrefetch {
                req.cmd
            } else {
                MemCmd::Read
            };
            let true_requester = req.true_requester;
            let thread = req.thread_id;
            let inst_fetch = req.is_inst_fetch();
            let Ok(handle) = self.mshrs.allocate(block_addr, asid, req, now) else {
                return CacheAccessResult::Blocked;
            };

            let mut down = MemReq::new(cmd_down, block_addr, self.line_bytes, true_requester, now);
            down.asid = asid;
            down.true_requester = true_requester;
            down.thread_id = thread;
            down.mshr = Some(handle);
            down.flags.set(ReqFlags::CACHE_LINE_FILL);
            if inst_fetch {
                down.flags.set(ReqFlags::INST_READ);
            }
            self.mshrs.get_mut(handle).in_service = true;
            self.outgoing.push_back(down);
            self.update_blocked();
            tracing::trace!(target: "cache", cache = %self.name, paddr = block_addr, "miss");
            CacheAccessResult::Miss
        }
    }

    fn accept_writeback(&mut self, mut req: MemReq, _now: Tick) -> CacheAccessResult {
        if let Some(block) = self.tags.find(req.paddr, req.asid) {
            block.status |= blk::MODIFIED;
            self.stats.hits += 1;
            return CacheAccessResult::Hit(self.hit_latency);
        }
        if self.wb_buffer.is_full() {
            self.update_blocked();
            return CacheAccessResult::Blocked;
        }
        req.paddr = self.block_addr(req.paddr);
        self.wb_buffer.push(req);
        self.update_blocked();
        CacheAccessResult::Hit(self.hit_latency)
    }

    fn start_copy(&mut self, req: MemReq, now: Tick) -> CacheAccessResult {
        let src = self.block_addr(req.paddr);
        let dest = self.block_addr(req.dest);
        if self.mshrs.is_full() || self.mshrs.find(src, req.asid).is_some() {
            self.update_blocked();
            return CacheAccessResult::Blocked;
        }
        let asid = req.asid;
        let requester = req.true_requester;
        let Ok(handle) = self.mshrs.allocate(src, asid, req, now) else {
            return CacheAccessResult::Blocked;
        };
        self.mshrs.get_mut(handle).copy = Some(CopyState::new(src, dest));
        self.mshrs.get_mut(handle).in_service = true;

        let mut down = MemReq::new(MemCmd::Read, src, self.line_bytes, requester, now);
        down.asid = asid;
        down.mshr = Some(handle);
        down.flags.set(ReqFlags::CACHE_LINE_FILL | ReqFlags::COPY_SOURCE1);
        self.outgoing.push_back(down);
        self.update_blocked();
        CacheAccessResult::Miss
    }

    /// Fills a returning block and drains the MSHR's targets.
    pub fn handle_response(&mut self, resp: &MemReq, now: Tick) -> ResponseEffects {
        let block_addr = self.block_addr(resp.paddr);
        // The carried handle may belong to another level's MSHR file;
        // trust it only when it names this block, else fall back to the
        // address map.
        let handle = resp
            .mshr
            .filter(|&h| {
                self.mshrs.handles().contains(&h) && {
                    let m = self.mshrs.get(h);
                    (m.block_addr == block_addr && m.asid == resp.asid)
                        || m.copy
                            .as_ref()
                            .is_some_and(|c| c.src == block_addr || c.dest == block_addr)
                }
            })
            .or_else(|| self.mshrs.find(block_addr, resp.asid));
        let Some(handle) = handle else {
            return ResponseEffects::default();
        };

        // Copy operations advance their state machine instead of filling.
        if self.mshrs.get(handle).copy.is_some() {
            return self.step_copy(handle, now);
        }

        let Ok(mshr) = self.mshrs.deallocate(handle) else {
            return ResponseEffects::default();
        };
        self.blocked_set &= !blocked::NO_TARGETS;
        self.update_blocked();

        if mshr.squashed {
            // Squashed in flight: free the MSHR without forwarding.
            return ResponseEffects {
                targets: Vec::new(),
                service_start: mshr.service_start,
                squashed: true,
            };
        }

        // Fill. Upgrades find the block already resident and transition
        // in place; ordinary fills evict as needed.
        let idx = match self.tags.find_idx(block_addr, mshr.asid) {
            Some(idx) => idx,
            None => {
                let (idx, old) = self.tags.replace(block_addr, mshr.asid, resp.true_requester);
                if old.is_valid() && old.is_modified() {
                    self.make_writeback(&old, now);
                }
                idx
            }
        };
        let status = self.protocol.fill_state(resp);
        let first_cmd = mshr.targets.first().map(|t| t.cmd);
        {
            let block = self.tags.block_mut(idx);
            block.status = status;
            block.prefetched = matches!(
                first_cmd,
                Some(MemCmd::HardPrefetch) | Some(MemCmd::SoftPrefetch)
            );
        }
        let exclusive = resp.cmd == MemCmd::ReadEx || resp.cmd == MemCmd::Upgrade;
        let requester = resp.true_requester;
        {
            let block = self.tags.block_mut(idx);
            self.protocol.record_sharer(block, requester, exclusive);
        }

        // Drain targets: writes dirty the freshly filled block.
        let mut targets = mshr.targets;
        for t in &mut targets {
            if t.cmd.is_write() || t.cmd == MemCmd::Write {
                self.tags.block_mut(idx).status |= blk::MODIFIED | blk::WRITABLE;
            }
            t.flags.set(ReqFlags::SATISFIED);
        }

        ResponseEffects {
            targets,
            service_start: mshr.service_start,
            squashed: false,
        }
    }

    fn step_copy(&mut self, handle: usize, now: Tick) -> ResponseEffects {
        let (done, next_req) = {
            let line_bytes = self.line_bytes;
            let mshr = self.mshrs.get_mut(handle);
            let Some(copy) = mshr.copy.as_mut() else {
                return ResponseEffects::default();
            };
            let dest = copy.dest;
            let dest_dirty = false; // checked against tags below
            let finished = copy.step(dest_dirty);
            let phase = copy.phase;
            let req = if finished {
                None
            } else {
                // Next phase needs another round trip for the destination.
                let mut down = MemReq::new(MemCmd::Read, dest, line_bytes, 0, now);
                down.mshr = Some(handle);
                down.flags.set(ReqFlags::COPY_DEST1);
                Some((phase, down))
            };
            (finished, req)
        };

        if done {
            if let Ok(mshr) = self.mshrs.deallocate(handle) {
                self.update_blocked();
                let mut targets = mshr.targets;
                for t in &mut targets {
                    t.flags.set(ReqFlags::SATISFIED);
                }
                return ResponseEffects {
                    targets,
                    service_start: mshr.service_start,
                    squashed: false,
                };
            }
            return ResponseEffects::default();
        }
        if let Some((_, down)) = next_req {
            self.outgoing.push_back(down);
        }
        ResponseEffects::default()
    }

    fn make_writeback(&mut self, old: &tags::CacheBlock, now: Tick) {
        let addr = self.tags.regenerate_addr(old.tag, old.set);
        let owner = match self.wb_owner_policy {
            // Owner: the core that originally fetched the block.
            // ShadowTags attribution replaces real writebacks with
            // synthetic ones; the real traffic still needs a sender, so
            // fall back to the recorded origin.
            WritebackOwnerPolicy::Owner | WritebackOwnerPolicy::ShadowTags => old.origin_cpu,
            // Replacer attribution is patched in by the caller, which
            // knows the current miss-bringer; default to origin here.
            WritebackOwnerPolicy::Replacer => old.origin_cpu,
        };
        let mut wb = MemReq::new(MemCmd::Writeback, addr, self.line_bytes, owner, now);
        wb.asid = old.asid;
        wb.true_requester = owner;
        self.stats.writebacks += 1;
        if self.wb_buffer.is_full() {
            // Overflow straight to the outgoing queue rather than losing
            // the data; the blocked set already throttles new misses.
            self.outgoing.push_back(wb);
        } else {
            self.wb_buffer.push(wb);
        }
        self.update_blocked();
    }

    /// Observes a request on the shared bus.
    pub fn snoop(&mut self, req: &mut MemReq, now: Tick) -> SnoopResult {
        let block_addr = self.block_addr(req.paddr);
        let upgrade_in_service = self
            .mshrs
            .find(block_addr, req.asid)
            .is_some_and(|h| {
                self.mshrs
                    .get(h)
                    .targets
                    .first()
                    .is_some_and(|t| t.cmd.is_invalidate() || t.cmd == MemCmd::Write)
            });
        let block = self.tags.find_no_update(req.paddr, req.asid);
        let action = self.protocol.snoop_action(req, block, upgrade_in_service);

        let mut supplied = None;
        match action {
            SnoopAction::None => {}
            SnoopAction::Nack => {
                req.flags.set(ReqFlags::NACKED);
                self.stats.snoop_nacks += 1;
            }
            SnoopAction::AssertShared => {
                req.flags.set(ReqFlags::SHARED_LINE);
            }
            SnoopAction::SupplyData => {
                req.flags.set(ReqFlags::SHARED_LINE);
                self.stats.snoop_supplies += 1;
                if let Some(b) = self.tags.find_no_update_mut(req.paddr, req.asid) {
                    // Downgrade to shared; the dirty data travels as a
                    // writeback.
                    b.status &= !(blk::MODIFIED | blk::WRITABLE);
                }
                supplied = Some(self.fabricate_supply(block_addr, req.asid, now));
            }
            SnoopAction::Invalidate => {
                let _ = self.tags.invalidate(req.paddr, req.asid);
            }
            SnoopAction::SupplyAndInvalidate => {
                self.stats.snoop_supplies += 1;
                if let Some(old) = self.tags.invalidate(req.paddr, req.asid) {
                    if old.is_modified() {
                        supplied = Some(self.fabricate_supply(block_addr, old.asid, now));
                    }
                }
            }
        }
        SnoopResult { action, supplied }
    }

    fn fabricate_supply(&mut self, block_addr: Addr, asid: usize, now: Tick) -> MemReq {
        let mut wb = MemReq::new(MemCmd::Writeback, block_addr, self.line_bytes, 0, now);
        wb.asid = asid;
        self.stats.writebacks += 1;
        wb
    }

    /// Next request to send downstream, misses before buffered
    /// writebacks.
    pub fn next_outgoing(&mut self) -> Option<MemReq> {
        if let Some(req) = self.outgoing.pop_front() {
            self.update_blocked();
            return Some(req);
        }
        let wb = self.wb_buffer.pop();
        if wb.is_some() {
            self.update_blocked();
        }
        wb
    }

    /// True when something is waiting for the downstream bus.
    pub fn has_outgoing(&self) -> bool {
        !self.outgoing.is_empty() || !self.wb_buffer.is_empty()
    }

    fn queue_prefetches(&mut self, reqs: Vec<MemReq>, now: Tick) {
        for req in reqs {
            // Prefetch into this cache: allocate an MSHR if one is free
            // and the block is absent; otherwise drop silently.
            let block_addr = self.block_addr(req.paddr);
            if self.tags.find_no_update(req.paddr, req.asid).is_some()
                || self.mshrs.find(block_addr, req.asid).is_some()
                || self.mshrs.is_full()
            {
                continue;
            }
            let asid = req.asid;
            let requester = req.true_requester;
            if let Ok(handle) = self.mshrs.allocate(block_addr, asid, req, now) {
                let mut down =
                    MemReq::new(MemCmd::HardPrefetch, block_addr, self.line_bytes, requester, now);
                down.asid = asid;
                down.mshr = Some(handle);
                down.flags.set(ReqFlags::CACHE_LINE_FILL);
                self.mshrs.get_mut(handle).in_service = true;
                self.outgoing.push_back(down);
            }
        }
        self.update_blocked();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Coherence;

    fn config() -> CacheConfig {
        CacheConfig {
            size_bytes: 4096,
            line_bytes: 64,
            assoc: 2,
            hit_latency: 2,
            mshrs: 2,
            targets_per_mshr: 2,
            wb_buffers: 2,
            ..CacheConfig::default()
        }
    }

    fn read(addr: Addr) -> MemReq {
        MemReq::new(MemCmd::Read, addr, 8, 0, 0)
    }

    fn fill(cache: &mut Cache, addr: Addr, now: Tick) {
        assert_eq!(cache.access(read(addr), now), CacheAccessResult::Miss);
        let mut resp = cache.next_outgoing().unwrap();
        resp.flags.set(ReqFlags::SATISFIED);
        let effects = cache.handle_response(&resp, now + 10);
        assert_eq!(effects.targets.len(), 1);
    }

    #[test]
    fn miss_then_fill_then_hit() {
        let mut cache = Cache::new("l1d", &config(), 1, None);
        fill(&mut cache, 0x1000, 0);
        assert_eq!(cache.access(read(0x1000), 20), CacheAccessResult::Hit(2));
        assert_eq!(cache.stats.hits, 1);
        assert_eq!(cache.stats.misses, 1);
    }

    #[test]
    fn concurrent_accesses_merge_into_one_mshr() {
        let mut cache = Cache::new("l1d", &config(), 1, None);
        assert_eq!(cache.access(read(0x1000), 0), CacheAccessResult::Miss);
        assert_eq!(cache.access(read(0x1008), 1), CacheAccessResult::Miss);
        assert_eq!(cache.mshrs.in_use(), 1);
        assert_eq!(cache.stats.mshr_merges, 1);
        // Only one downstream fetch was generated.
        let down = cache.next_outgoing().unwrap();
        assert!(cache.next_outgoing().is_none());
        // The fill answers both targets.
        let effects = cache.handle_response(&down, 20);
        assert_eq!(effects.targets.len(), 2);
    }

    #[test]
    fn target_overflow_blocks() {
        let mut cache = Cache::new("l1d", &config(), 1, None);
        assert_eq!(cache.access(read(0x1000), 0), CacheAccessResult::Miss);
        assert_eq!(cache.access(read(0x1008), 0), CacheAccessResult::Miss);
        assert_eq!(cache.access(read(0x1010), 0), CacheAccessResult::Blocked);
        assert!(cache.blocked_set() & blocked::NO_TARGETS != 0);
        // The response clears the condition.
        let down = cache.next_outgoing().unwrap();
        let _ = cache.handle_response(&down, 20);
        assert!(cache.blocked_set() & blocked::NO_TARGETS == 0);
    }

    #[test]
    fn mshr_exhaustion_blocks_demand_and_drops_prefetch() {
        let mut cache = Cache::new("l1d", &config(), 1, None);
        assert_eq!(cache.access(read(0x1000), 0), CacheAccessResult::Miss);
        assert_eq!(cache.access(read(0x2000), 0), CacheAccessResult::Miss);
        assert_eq!(cache.access(read(0x3000), 0), CacheAccessResult::Blocked);
        let pf = MemReq::new(MemCmd::HardPrefetch, 0x4000, 64, 0, 0);
        assert_eq!(cache.access(pf, 0), CacheAccessResult::Dropped);
    }

    #[test]
    fn dirty_eviction_fabricates_writeback() {
        let mut cache = Cache::new("l1d", &config(), 1, None);
        // Write-allocate then dirty the block.
        fill(&mut cache, 0x1000, 0);
        let mut wreq = read(0x1000);
        wreq.cmd = MemCmd::Write;
        assert!(matches!(cache.access(wreq, 20), CacheAccessResult::Hit(_)));

        // Evict by filling both ways of the set, then a third.
        let set_stride = 32 * 64; // 32 sets
        fill(&mut cache, 0x1000 + set_stride, 30);
        fill(&mut cache, 0x1000 + 2 * set_stride, 40);
        assert_eq!(cache.stats.writebacks, 1);
        // The writeback is queued for downstream.
        let wb = cache.next_outgoing();
        assert!(wb.is_some_and(|r| r.cmd == MemCmd::Writeback && r.paddr == 0x1000));
    }

    #[test]
    fn squashed_mshr_response_is_dropped() {
        let mut cache = Cache::new("l1d", &config(), 1, None);
        assert_eq!(cache.access(read(0x1000), 0), CacheAccessResult::Miss);
        cache.mshrs.squash(0x1000, 0);
        let down = cache.next_outgoing().unwrap();
        let effects = cache.handle_response(&down, 20);
        assert!(effects.squashed);
        assert!(effects.targets.is_empty());
        assert_eq!(cache.mshrs.in_use(), 0);
        // The block was not filled.
        assert!(cache.tags.find_no_update(0x1000, 0).is_none());
    }

    #[test]
    fn snoop_on_modified_supplies_and_downgrades() {
        let mut cfg = config();
        cfg.coherence = Coherence::Snooping;
        let mut cache = Cache::new("l1d", &cfg, 2, None);
        fill(&mut cache, 0x1000, 0);
        let mut wreq = read(0x1000);
        wreq.cmd = MemCmd::Write;
        // With snooping, the first fill was not shared so it is writable.
        assert!(matches!(cache.access(wreq, 10), CacheAccessResult::Hit(_)));

        let mut snooped = read(0x1000);
        snooped.cpu_id = 1;
        let result = cache.snoop(&mut snooped, 20);
        assert_eq!(result.action, SnoopAction::SupplyData);
        assert!(snooped.flags.any(ReqFlags::SHARED_LINE));
        assert!(result.supplied.is_some());
        // Our copy is now shared, not modified.
        let b = cache.tags.find_no_update(0x1000, 0).unwrap();
        assert!(!b.is_modified());
    }

    #[test]
    fn copy_spawns_state_machine_on_mshr() {
        let mut cache = Cache::new("l2", &config(), 1, None);
        let mut req = MemReq::new(MemCmd::Copy, 0x1000, 64, 0, 0);
        req.dest = 0x2000;
        assert_eq!(cache.access(req, 0), CacheAccessResult::Miss);
        assert!(cache.blocked_set() & blocked::BLOCKED_COPY != 0);
        // Source fetch goes downstream.
        let src_fetch = cache.next_outgoing().unwrap();
        assert_eq!(src_fetch.paddr, 0x1000);
        // Stepping through the phases issues the destination round trip
        // and finally completes, freeing the MSHR.
        let _ = cache.handle_response(&src_fetch, 10);
        let dest_req = cache.next_outgoing().unwrap();
        assert_eq!(dest_req.paddr, 0x2000);
        let _ = cache.handle_response(&dest_req, 20);
        let dest_req2 = cache.next_outgoing().unwrap();
        let effects = cache.handle_response(&dest_req2, 30);
        assert_eq!(effects.targets.len(), 1);
        assert_eq!(cache.mshrs.in_use(), 0);
        assert!(cache.blocked_set() & blocked::BLOCKED_COPY == 0);
    }
}
