//! Hardware prefetcher.
//!
//! Tagged prefetch: a demand miss, or a demand hit on a block the
//! prefetcher brought in, triggers a prefetch of the next sequential
//! lines. Generated requests are hard prefetches; the cache may drop
//! them freely under pressure.

use crate::common::{Addr, CpuId, Tick};
use crate::config::PrefetcherKind;
use crate::mem::req::{MemCmd, MemReq};

/// Prefetch request generator attached to a cache.
pub struct Prefetcher {
    kind: PrefetcherKind,
    degree: usize,
    line_bytes: usize,
    /// Prefetches generated.
    pub issued: u64,
}

impl Prefetcher {
    /// Creates a prefetcher of the configured kind.
    pub fn new(kind: PrefetcherKind, line_bytes: usize) -> Self {
        Self {
            kind,
            degree: 1,
            line_bytes,
            issued: 0,
        }
    }

    /// Reacts to a demand access. `was_miss` reports a demand miss;
    /// `hit_prefetched` reports a demand hit on a prefetched block.
    /// Returns the prefetch requests to issue.
    pub fn observe(
        &mut self,
        addr: Addr,
        cpu: CpuId,
        asid: usize,
        was_miss: bool,
        hit_prefetched: bool,
        now: Tick,
    ) -> Vec<MemReq> {
        if self.kind == PrefetcherKind::None || !(was_miss || hit_prefetched) {
            return Vec::new();
        }
        let line = addr & !(self.line_bytes as Addr - 1);
        let mut out = Vec::with_capacity(self.degree);
        for i in 1..=self.degree {
            let target = line + (i * self.line_bytes) as Addr;
            let mut req = MemReq::new(MemCmd::HardPrefetch, target, self.line_bytes, cpu, now);
            req.asid = asid;
            req.true_requester = cpu;
            out.push(req);
            self.issued += 1;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_prefetches_next_line_on_miss() {
        let mut pf = Prefetcher::new(PrefetcherKind::Tagged, 64);
        let reqs = pf.observe(0x1008, 0, 0, true, false, 10);
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].paddr, 0x1040);
        assert_eq!(reqs[0].cmd, MemCmd::HardPrefetch);
    }

    #[test]
    fn hit_on_prefetched_block_retriggers() {
        let mut pf = Prefetcher::new(PrefetcherKind::Tagged, 64);
        assert_eq!(pf.observe(0x1000, 0, 0, false, true, 0).len(), 1);
    }

    #[test]
    fn plain_hit_is_quiet() {
        let mut pf = Prefetcher::new(PrefetcherKind::Tagged, 64);
        assert!(pf.observe(0x1000, 0, 0, false, false, 0).is_empty());
        let mut none = Prefetcher::new(PrefetcherKind::None, 64);
        assert!(none.observe(0x1000, 0, 0, true, false, 0).is_empty());
    }
}
