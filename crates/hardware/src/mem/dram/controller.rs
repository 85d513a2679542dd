//! Memory controller.
//!
//! Buffers pending requests and drives the bank array one command per
//! service event: opening and closing pages with fabricated
//! Activate/Close commands and issuing the data command once the page is
//! open. The scheduling policy is pluggable: strict arrival order, or
//! open-page-first with reads ahead of writebacks.

use std::collections::VecDeque;

use crate::common::Tick;
use crate::common::error::SimError;
use crate::config::{DramConfig, MemCtrlPolicy};
use crate::mem::req::{MemCmd, MemReq};

use super::DdrBanks;

/// Outcome of one controller service step.
#[derive(Debug)]
pub enum CtrlOutcome {
    /// A data command completed scheduling; the response is due after
    /// `latency`.
    Serviced {
        /// The serviced request.
        req: MemReq,
        /// Data latency from the bank model.
        latency: Tick,
        /// Bank that serviced it.
        bank: usize,
    },
    /// An open/close command was issued; call again next cycle.
    CommandIssued,
    /// Nothing to do.
    Idle,
}

/// The memory controller.
pub struct MemCtrl {
    queue: VecDeque<MemReq>,
    queue_cap: usize,
    policy: MemCtrlPolicy,
    /// The bank array.
    pub banks: DdrBanks,
    next_seq: u64,
    /// Requests accepted.
    pub inserted: u64,
    /// Inserts refused because the queue was full.
    pub full_rejects: u64,
}

impl MemCtrl {
    /// Builds the controller and its banks.
    pub fn new(config: &DramConfig, cpu_count: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            queue_cap: config.queue_size,
            policy: config.policy,
            banks: DdrBanks::new(config, cpu_count),
            next_seq: 0,
            inserted: 0,
            full_rejects: 0,
        }
    }

    /// True when the queue cannot accept another request; the memory
    /// bus blocks until an entry drains.
    pub fn is_full(&self) -> bool {
        self.queue.len() >= self.queue_cap
    }

    /// True while requests are pending.
    pub fn has_requests(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Queue occupancy.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Accepts a request into the controller queue.
    pub fn insert(&mut self, mut req: MemReq, now: Tick) -> bool {
        if self.is_full() {
            self.full_rejects += 1;
            return false;
        }
        req.inserted_into_memctrl = now;
        req.memctrl_seq = self.next_seq;
        self.next_seq += 1;
        self.inserted += 1;
        tracing::trace!(target: "dram", paddr = req.paddr, cmd = ?req.cmd, "memctrl insert");
        self.queue.push_back(req);
        true
    }

    fn choose(&self, now: Tick) -> Option<usize> {
        if self.queue.is_empty() {
            return None;
        }
        match self.policy {
            MemCtrlPolicy::InOrder => Some(0),
            MemCtrlPolicy::ReadyFirst => {
                // Ready reads, then ready writebacks, then oldest.
                let ready_read = self.queue.iter().position(|r| {
                    r.cmd.is_read() && self.banks.is_ready(r.paddr, now)
                });
                if ready_read.is_some() {
                    return ready_read;
                }
                let ready = self
                    .queue
                    .iter()
                    .position(|r| self.banks.is_ready(r.paddr, now));
                if ready.is_some() {
                    return ready;
                }
                // Open-page matches that are merely not ready yet still
                // beat reopening a row.
                let open = self
                    .queue
                    .iter()
                    .position(|r| self.banks.is_active(r.paddr));
                open.or(Some(0))
            }
        }
    }

    /// Runs one service step.
    ///
    /// # Errors
    ///
    /// Propagates [`SimError::BankState`] from the bank model; such an
    /// error is a scheduling bug and aborts the simulation.
    pub fn service_one(&mut self, now: Tick) -> Result<CtrlOutcome, SimError> {
        let Some(pos) = self.choose(now) else {
            return Ok(CtrlOutcome::Idle);
        };
        let paddr = self.queue[pos].paddr;
        let bank = self.banks.bank_of(paddr);

        if self.banks.is_active(paddr) {
            // Page open: issue the data command.
            let mut req = self
                .queue
                .remove(pos)
                .unwrap_or_else(|| unreachable!("chosen index out of range"));
            let latency = self.banks.command(&mut req, now)?;
            return Ok(CtrlOutcome::Serviced { req, latency, bank });
        }

        if self.banks.bank_is_closed(paddr) {
            if self.banks.active_banks() >= self.banks.max_active() {
                // Over the activation budget: close the stalest open bank.
                if let Some(&victim) = self.banks.open_banks().first() {
                    let victim_addr = self.bank_probe_addr(victim);
                    let mut close = MemReq::new(MemCmd::Close, victim_addr, 0, 0, now);
                    let _ = self.banks.command(&mut close, now)?;
                    return Ok(CtrlOutcome::CommandIssued);
                }
            }
            let mut activate = MemReq::new(MemCmd::Activate, paddr, 0, 0, now);
            let _ = self.banks.command(&mut activate, now)?;
            return Ok(CtrlOutcome::CommandIssued);
        }

        // Wrong page open: close it, remembering the displaced page for
        // the access trace.
        let old_page_addr = self.bank_probe_addr(bank);
        self.queue[pos].old_addr = old_page_addr;
        let mut close = MemReq::new(MemCmd::Close, paddr, 0, 0, now);
        let _ = self.banks.command(&mut close, now)?;
        Ok(CtrlOutcome::CommandIssued)
    }

    /// Reconstructs an address inside a bank's open page.
    fn bank_probe_addr(&self, bank: usize) -> crate::common::Addr {
        self.banks.open_page(bank) << self.banks.page_bits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Addr;

    fn ctrl() -> MemCtrl {
        let config = DramConfig {
            num_banks: 4,
            page_bits: 10,
            max_active_banks: 2,
            queue_size: 8,
            ..DramConfig::default()
        };
        MemCtrl::new(&config, 1)
    }

    fn read(addr: Addr) -> MemReq {
        MemReq::new(MemCmd::Read, addr, 64, 0, 0)
    }

    #[test]
    fn idle_bank_is_activated_then_serviced() {
        let mut ctrl = ctrl();
        assert!(ctrl.insert(read(0x4000), 10));
        // First step activates.
        assert!(matches!(
            ctrl.service_one(11).unwrap(),
            CtrlOutcome::CommandIssued
        ));
        // Second step issues the read.
        match ctrl.service_one(12).unwrap() {
            CtrlOutcome::Serviced { req, latency, .. } => {
                assert_eq!(req.paddr, 0x4000);
                assert!(latency > 0);
            }
            other => panic!("expected service, got {other:?}"),
        }
        assert!(!ctrl.has_requests());
    }

    #[test]
    fn wrong_page_is_closed_first_and_old_address_recorded() {
        let mut ctrl = ctrl();
        assert!(ctrl.insert(read(0x4000), 0));
        let _ = ctrl.service_one(1).unwrap(); // activate
        let _ = ctrl.service_one(2).unwrap(); // read
        // Same bank, different page (page stride = banks * page size).
        assert!(ctrl.insert(read(0x4000 + 4 * 1024), 100));
        assert!(matches!(
            ctrl.service_one(101).unwrap(),
            CtrlOutcome::CommandIssued // close
        ));
        assert_eq!(ctrl.queue[0].old_addr, 0x4000);
        // Then activate, then service.
        let _ = ctrl.service_one(300).unwrap();
        assert!(matches!(
            ctrl.service_one(400).unwrap(),
            CtrlOutcome::Serviced { .. }
        ));
    }

    #[test]
    fn ready_first_prefers_open_page_reads() {
        let mut ctrl = ctrl();
        // Open a page with a first read.
        assert!(ctrl.insert(read(0x4000), 0));
        let _ = ctrl.service_one(1).unwrap();
        let _ = ctrl.service_one(2).unwrap();
        // Queue: a closed-bank read first, then an open-page read.
        assert!(ctrl.insert(read(0x0400), 100)); // bank 1, idle
        assert!(ctrl.insert(read(0x4040), 100)); // bank 0, open page
        match ctrl.service_one(200).unwrap() {
            CtrlOutcome::Serviced { req, .. } => assert_eq!(req.paddr, 0x4040),
            other => panic!("expected the open-page read, got {other:?}"),
        }
    }

    #[test]
    fn full_queue_rejects() {
        let mut ctrl = ctrl();
        for i in 0..8 {
            assert!(ctrl.insert(read(0x1_0000 + i * 64), 0));
        }
        assert!(!ctrl.insert(read(0x9000), 0));
        assert_eq!(ctrl.full_rejects, 1);
    }

    #[test]
    fn activation_budget_closes_stalest_bank() {
        let mut ctrl = ctrl();
        // Open two banks (the budget).
        for addr in [0x0000u64, 0x0400] {
            assert!(ctrl.insert(read(addr), 0));
        }
        let mut now = 1;
        while ctrl.has_requests() {
            let _ = ctrl.service_one(now).unwrap();
            now += 1;
        }
        assert_eq!(ctrl.banks.active_banks(), 2);
        // A third bank's request must close one first.
        assert!(ctrl.insert(read(0x0800), now));
        let mut saw_close = false;
        for _ in 0..6 {
            match ctrl.service_one(now).unwrap() {
                CtrlOutcome::Serviced { .. } => break,
                CtrlOutcome::CommandIssued => saw_close = true,
                CtrlOutcome::Idle => break,
            }
            now += 1;
        }
        assert!(saw_close);
        assert!(ctrl.banks.active_banks() <= 2);
    }
}
