//! Time-multiplexed arbitration.
//!
//! A counter modulo `cpu_count + bank_count` names the owner of the
//! current bus slot. CPU-owned slots go to the oldest request belonging
//! to that CPU (including bank reads destined for it); bank slots are
//! reserved for writebacks from that bank. An unclaimed slot advances
//! the bus clock as a null grant.

use crate::common::Tick;
use crate::mem::req::MemCmd;

use super::{Bus, IfaceKind};

impl Bus {
    fn slot_count(&self) -> u64 {
        (self.cpu_count + self.bank_count) as u64
    }

    /// Picks the address-phase winner for the current time slot.
    pub(super) fn pick_tdm_addr(&mut self, now: Tick) -> Option<usize> {
        let elapsed = (now - self.last_addr_arb) / self.clock;
        self.cur_addr_slot = (self.cur_addr_slot + elapsed) % self.slot_count();
        self.pick_for_slot(self.cur_addr_slot, /*data=*/ false, now)
    }

    /// Picks the data-phase winner; the slot counter only advances past
    /// cycles not consumed by the previous transfer.
    pub(super) fn pick_tdm_data(&mut self, now: Tick) -> Option<usize> {
        if self.last_data_arb != 0 {
            let mut increment = ((now - self.last_data_arb) / self.clock) as i64;
            if self.last_transfer_cycles > 0 {
                increment -= self.last_transfer_cycles - 1;
            }
            let slots = self.slot_count() as i64;
            let bumped = (self.cur_data_slot as i64 + increment).rem_euclid(slots);
            self.cur_data_slot = bumped as u64;
        }
        self.last_transfer_cycles = -1;
        self.pick_for_slot(self.cur_data_slot, /*data=*/ true, now)
    }

    fn pick_for_slot(&self, slot: u64, data: bool, now: Tick) -> Option<usize> {
        let queues = if data { &self.data_q } else { &self.addr_q };

        if (slot as usize) < self.cpu_count {
            // CPU slot: oldest eligible request belonging to this CPU,
            // from its own interface or a bank read destined for it.
            let cpu = slot as usize;
            let mut best: Option<(Tick, usize)> = None;
            for (iface, q) in queues.iter().enumerate() {
                let Some(entry) = q.front() else { continue };
                if entry.ready >= now {
                    continue;
                }
                let belongs = match self.ifaces[iface] {
                    IfaceKind::CpuMaster(c) => c == cpu,
                    IfaceKind::BankMaster(_) | IfaceKind::Slave => {
                        !matches!(
                            entry.req.cmd,
                            MemCmd::Writeback | MemCmd::VirtualPrivateWriteback
                        ) && entry.req.true_requester == cpu
                    }
                };
                if belongs && best.is_none_or(|(t, _)| entry.ready < t) {
                    best = Some((entry.ready, iface));
                }
            }
            best.map(|(_, iface)| iface)
        } else {
            // Dedicated writeback slot for one bank.
            let bank = slot as usize - self.cpu_count;
            for (iface, q) in queues.iter().enumerate() {
                if self.ifaces[iface] != IfaceKind::BankMaster(bank) {
                    continue;
                }
                let Some(entry) = q.front() else { continue };
                if entry.ready < now
                    && matches!(
                        entry.req.cmd,
                        MemCmd::Writeback | MemCmd::VirtualPrivateWriteback
                    )
                {
                    return Some(iface);
                }
            }
            None
        }
    }
}
