//! Miss status handling registers.
//!
//! One MSHR tracks one outstanding block miss; further accesses to the
//! same block merge as targets. For any block address there is at most
//! one active MSHR in a cache at a time.

use std::collections::HashMap;

use crate::common::error::SimError;
use crate::common::{Addr, Tick};
use crate::mem::req::MemReq;

/// Why an MSHR operation could not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MshrReject {
    /// No free MSHR.
    NoMshrs,
    /// The matching MSHR's target list is full.
    NoTargets,
}

/// One outstanding miss.
#[derive(Debug)]
pub struct Mshr {
    /// Block address being fetched.
    pub block_addr: Addr,
    /// Address-space id.
    pub asid: usize,
    /// Sent to the lower level and awaiting a response.
    pub in_service: bool,
    /// Tick the miss began service.
    pub service_start: Tick,
    /// The original request plus merged targets.
    pub targets: Vec<MemReq>,
    /// All targets were squashed; the response frees the MSHR without
    /// forwarding.
    pub squashed: bool,
    /// In-progress copy operation state riding on this MSHR.
    pub copy: Option<super::copy::CopyState>,
}

/// The MSHR file of one cache.
pub struct MshrFile {
    slots: Vec<Option<Mshr>>,
    by_addr: HashMap<(Addr, usize), usize>,
    target_cap: usize,
    limit: usize,
}

impl MshrFile {
    /// Creates a file with `count` MSHRs of `target_cap` targets each.
    pub fn new(count: usize, target_cap: usize) -> Self {
        Self {
            slots: (0..count).map(|_| None).collect(),
            by_addr: HashMap::new(),
            target_cap,
            limit: count,
        }
    }

    /// Restricts the usable MSHR count without reshaping the file;
    /// adaptive policies mutate this live. Outstanding misses above a
    /// lowered limit drain naturally.
    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit.clamp(1, self.slots.len());
    }

    /// Currently usable MSHR count.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Number of free MSHRs under the current limit.
    pub fn free(&self) -> usize {
        let unallocated = self.slots.iter().filter(|s| s.is_none()).count();
        let over_limit = (self.slots.len() - self.limit).min(unallocated);
        unallocated - over_limit
    }

    /// True when every usable MSHR is allocated.
    pub fn is_full(&self) -> bool {
        self.free() == 0
    }

    /// Number of allocated MSHRs.
    pub fn in_use(&self) -> usize {
        self.slots.len() - self.free()
    }

    /// Handle of the active MSHR for a block, if any.
    pub fn find(&self, block_addr: Addr, asid: usize) -> Option<usize> {
        self.by_addr.get(&(block_addr, asid)).copied()
    }

    /// Allocates an MSHR for a block miss.
    ///
    /// # Errors
    ///
    /// [`MshrReject::NoMshrs`] when the file is full. Allocating a block
    /// that already has an MSHR is an invariant violation and panics;
    /// callers must merge via [`MshrFile::add_target`].
    pub fn allocate(
        &mut self,
        block_addr: Addr,
        asid: usize,
        req: MemReq,
        now: Tick,
    ) -> Result<usize, MshrReject> {
        assert!(
            !self.by_addr.contains_key(&(block_addr, asid)),
            "second MSHR allocated for block {block_addr:#x}"
        );
        let Some(slot) = self.slots.iter().position(|s| s.is_none()) else {
            return Err(MshrReject::NoMshrs);
        };
        self.slots[slot] = Some(Mshr {
            block_addr,
            asid,
            in_service: false,
            service_start: now,
            targets: vec![req],
            squashed: false,
            copy: None,
        });
        let _ = self.by_addr.insert((block_addr, asid), slot);
        Ok(slot)
    }

    /// Merges an additional access into an existing MSHR.
    ///
    /// # Errors
    ///
    /// [`MshrReject::NoTargets`] when the bounded target list is full.
    pub fn add_target(&mut self, handle: usize, req: MemReq) -> Result<(), MshrReject> {
        let target_cap = self.target_cap;
        let mshr = self.get_mut(handle);
        if mshr.targets.len() >= target_cap {
            return Err(MshrReject::NoTargets);
        }
        mshr.targets.push(req);
        Ok(())
    }

    /// Borrows an allocated MSHR.
    pub fn get(&self, handle: usize) -> &Mshr {
        self.slots[handle]
            .as_ref()
            .unwrap_or_else(|| panic!("stale MSHR handle {handle}"))
    }

    /// Mutably borrows an allocated MSHR.
    pub fn get_mut(&mut self, handle: usize) -> &mut Mshr {
        self.slots[handle]
            .as_mut()
            .unwrap_or_else(|| panic!("stale MSHR handle {handle}"))
    }

    /// Frees an MSHR, returning its contents.
    ///
    /// # Errors
    ///
    /// [`SimError::Mshr`] when the handle is stale (a leak or double
    /// free).
    pub fn deallocate(&mut self, handle: usize) -> Result<Mshr, SimError> {
        let mshr = self.slots[handle]
            .take()
            .ok_or_else(|| SimError::Mshr(format!("double free of MSHR {handle}")))?;
        let _ = self.by_addr.remove(&(mshr.block_addr, mshr.asid));
        Ok(mshr)
    }

    /// Marks every target of a block's MSHR squashed; the eventual
    /// response frees the MSHR without forwarding data.
    pub fn squash(&mut self, block_addr: Addr, asid: usize) {
        if let Some(&slot) = self.by_addr.get(&(block_addr, asid)) {
            if let Some(mshr) = self.slots[slot].as_mut() {
                mshr.squashed = true;
            }
        }
    }

    /// Iterates allocated MSHR handles.
    pub fn handles(&self) -> Vec<usize> {
        (0..self.slots.len())
            .filter(|&i| self.slots[i].is_some())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::req::MemCmd;

    fn req(addr: Addr) -> MemReq {
        MemReq::new(MemCmd::Read, addr, 64, 0, 0)
    }

    #[test]
    fn allocate_find_deallocate() {
        let mut file = MshrFile::new(2, 4);
        let h = file.allocate(0x1000, 0, req(0x1000), 5).unwrap();
        assert_eq!(file.find(0x1000, 0), Some(h));
        assert_eq!(file.in_use(), 1);
        let mshr = file.deallocate(h).unwrap();
        assert_eq!(mshr.targets.len(), 1);
        assert_eq!(file.find(0x1000, 0), None);
    }

    #[test]
    fn exhaustion_rejects() {
        let mut file = MshrFile::new(1, 4);
        let _ = file.allocate(0x1000, 0, req(0x1000), 0).unwrap();
        assert_eq!(
            file.allocate(0x2000, 0, req(0x2000), 0),
            Err(MshrReject::NoMshrs)
        );
    }

    #[test]
    fn targets_merge_until_cap() {
        let mut file = MshrFile::new(1, 2);
        let h = file.allocate(0x1000, 0, req(0x1000), 0).unwrap();
        assert!(file.add_target(h, req(0x1008)).is_ok());
        assert_eq!(file.add_target(h, req(0x1010)), Err(MshrReject::NoTargets));
    }

    #[test]
    #[should_panic(expected = "second MSHR")]
    fn double_allocation_is_an_invariant_violation() {
        let mut file = MshrFile::new(2, 4);
        let _ = file.allocate(0x1000, 0, req(0x1000), 0).unwrap();
        let _ = file.allocate(0x1000, 0, req(0x1000), 0);
    }

    #[test]
    fn squash_marks_targets() {
        let mut file = MshrFile::new(1, 4);
        let h = file.allocate(0x1000, 0, req(0x1000), 0).unwrap();
        file.squash(0x1000, 0);
        assert!(file.get(h).squashed);
    }
}
