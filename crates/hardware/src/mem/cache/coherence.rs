//! Coherence protocol state functions.
//!
//! The protocol is a pure function family over block state and incoming
//! commands: the cache calls `fill_state` when installing a block,
//! `snoop_action` when observing a bus request, and `needs_upgrade` when
//! a write hits a non-writable block.

use crate::config::Coherence;
use crate::mem::cache::tags::{CacheBlock, blk};
use crate::mem::req::{MemCmd, MemReq, ReqFlags};

/// What a snooping cache must do in response to an observed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnoopAction {
    /// Nothing; the line is not here or the command does not concern us.
    None,
    /// Assert the shared line so the requester fills in shared state.
    AssertShared,
    /// Supply the modified data and transition per the protocol.
    SupplyData,
    /// Invalidate our copy.
    Invalidate,
    /// Supply data and invalidate (read-exclusive hit on Modified).
    SupplyAndInvalidate,
    /// NACK: the request collides with an in-service conflicting upgrade.
    Nack,
}

/// Protocol dispatcher.
#[derive(Debug, Clone, Copy)]
pub struct Protocol {
    kind: Coherence,
}

impl Protocol {
    /// Creates the protocol of the given kind.
    pub fn new(kind: Coherence) -> Self {
        Self { kind }
    }

    /// Protocol kind.
    pub fn kind(&self) -> Coherence {
        self.kind
    }

    /// Status bits for a block being filled by `req`.
    pub fn fill_state(&self, req: &MemReq) -> u8 {
        match self.kind {
            Coherence::None => {
                // No sharing: every fill is writable.
                let mut status = blk::VALID | blk::WRITABLE;
                if req.cmd.is_write() {
                    status |= blk::MODIFIED;
                }
                status
            }
            Coherence::Snooping | Coherence::Directory => {
                let mut status = blk::VALID;
                let exclusive = req.cmd == MemCmd::ReadEx
                    || req.cmd == MemCmd::Upgrade
                    || req.flags.any(ReqFlags::PF_EXCLUSIVE);
                let shared = req.flags.any(ReqFlags::SHARED_LINE);
                if exclusive || !shared {
                    status |= blk::WRITABLE;
                }
                if exclusive {
                    status |= blk::MODIFIED;
                }
                status
            }
        }
    }

    /// True when a store hit on this block must issue an upgrade first.
    pub fn needs_upgrade(&self, block: &CacheBlock) -> bool {
        match self.kind {
            Coherence::None => false,
            Coherence::Snooping | Coherence::Directory => !block.is_writable(),
        }
    }

    /// Reaction of a cache holding `block` (or not) to a snooped request.
    ///
    /// `upgrade_in_service` reports whether this cache has a pending
    /// upgrade or invalidate for the same block, which NACKs conflicting
    /// snoops.
    pub fn snoop_action(
        &self,
        req: &MemReq,
        block: Option<&CacheBlock>,
        upgrade_in_service: bool,
    ) -> SnoopAction {
        if self.kind == Coherence::None {
            return SnoopAction::None;
        }
        if req.cmd.is_invalidate() && upgrade_in_service {
            return SnoopAction::Nack;
        }
        let Some(block) = block else {
            return SnoopAction::None;
        };
        match req.cmd {
            MemCmd::Read => {
                if block.is_modified() {
                    SnoopAction::SupplyData
                } else {
                    SnoopAction::AssertShared
                }
            }
            MemCmd::ReadEx => {
                if block.is_modified() {
                    SnoopAction::SupplyAndInvalidate
                } else {
                    SnoopAction::Invalidate
                }
            }
            MemCmd::Upgrade | MemCmd::Invalidate => SnoopAction::Invalidate,
            _ => SnoopAction::None,
        }
    }

    /// Updates the per-sharer bit vector on a directory-tracked block.
    pub fn record_sharer(&self, block: &mut CacheBlock, cpu: usize, exclusive: bool) {
        if self.kind != Coherence::Directory {
            return;
        }
        if exclusive {
            block.sharers = 1 << cpu;
        } else {
            block.sharers |= 1 << cpu;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(addr: u64) -> MemReq {
        MemReq::new(MemCmd::Read, addr, 64, 0, 0)
    }

    #[test]
    fn no_coherence_fills_writable() {
        let p = Protocol::new(Coherence::None);
        let status = p.fill_state(&read(0x100));
        assert_ne!(status & blk::WRITABLE, 0);
    }

    #[test]
    fn shared_line_fill_is_not_writable() {
        let p = Protocol::new(Coherence::Snooping);
        let mut req = read(0x100);
        req.flags.set(ReqFlags::SHARED_LINE);
        let status = p.fill_state(&req);
        assert_eq!(status & blk::WRITABLE, 0);
        assert_ne!(status & blk::VALID, 0);
    }

    #[test]
    fn modified_owner_supplies_data_on_snoop() {
        let p = Protocol::new(Coherence::Snooping);
        let block = CacheBlock {
            status: blk::VALID | blk::MODIFIED | blk::WRITABLE,
            ..CacheBlock::default()
        };
        assert_eq!(
            p.snoop_action(&read(0x100), Some(&block), false),
            SnoopAction::SupplyData
        );
    }

    #[test]
    fn conflicting_upgrade_nacks() {
        let p = Protocol::new(Coherence::Snooping);
        let mut req = read(0x100);
        req.cmd = MemCmd::Upgrade;
        assert_eq!(p.snoop_action(&req, None, true), SnoopAction::Nack);
    }

    #[test]
    fn directory_tracks_sharers() {
        let p = Protocol::new(Coherence::Directory);
        let mut block = CacheBlock::default();
        p.record_sharer(&mut block, 1, false);
        p.record_sharer(&mut block, 3, false);
        assert_eq!(block.sharers, 0b1010);
        p.record_sharer(&mut block, 2, true);
        assert_eq!(block.sharers, 0b100);
    }
}
