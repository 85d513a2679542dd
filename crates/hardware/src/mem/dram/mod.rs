//! DDR2 bank timing model.
//!
//! Every simulated memory command is a four-state bank update: banks
//! move between Idle, Active, Read, and Written under Activate, Close,
//! Read, and Write commands, and the model returns the data latency of
//! read/write commands given the bank's timing state. Open/close
//! commands return zero latency but advance the timing bookkeeping.

pub mod controller;

use crate::common::error::SimError;
use crate::common::{Addr, CpuId, Tick};
use crate::config::DramConfig;
use crate::mem::req::{DramResult, MemCmd, MemReq};

/// State of one DDR2 bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BankState {
    /// Precharged; no open page.
    Idle,
    /// Row activated, no data command yet.
    Active,
    /// Last data command was a read.
    Read,
    /// Last data command was a write.
    Written,
}

impl BankState {
    fn name(self) -> &'static str {
        match self {
            BankState::Idle => "Idle",
            BankState::Active => "Active",
            BankState::Read => "Read",
            BankState::Written => "Written",
        }
    }
}

/// DRAM statistics.
#[derive(Debug, Clone, Default)]
pub struct DramStats {
    /// Read data commands.
    pub reads: u64,
    /// Write data commands.
    pub writes: u64,
    /// Open-page read hits.
    pub read_hits: u64,
    /// Open-page write hits.
    pub write_hits: u64,
    /// Reads that hit an open page behind a write (turnaround paid).
    pub slow_read_hits: u64,
    /// Writes that hit an open page behind a read (turnaround paid).
    pub slow_write_hits: u64,
    /// Page hit outcomes, reads then writes.
    pub page_hits: [u64; 2],
    /// Page miss outcomes, reads then writes.
    pub page_misses: [u64; 2],
    /// Page conflict outcomes, reads then writes.
    pub page_conflicts: [u64; 2],
    /// Data commands that waited on an incomplete activation.
    pub non_overlap_activates: u64,
    /// Accesses per bank.
    pub accesses_per_bank: Vec<u64>,
    /// Data commands per requesting core.
    pub requests_per_cpu: Vec<u64>,
    /// Page hits per requesting core.
    pub hits_per_cpu: Vec<u64>,
    /// Page misses per requesting core.
    pub misses_per_cpu: Vec<u64>,
    /// Page conflicts per requesting core.
    pub conflicts_per_cpu: Vec<u64>,
    /// Total data latency returned.
    pub total_latency: Tick,
}

/// The bank array.
pub struct DdrBanks {
    num_banks: usize,
    page_bits: u32,
    max_active_banks: usize,
    ras: Tick,
    cas: Tick,
    precharge: Tick,
    min_activate_to_precharge: Tick,
    write_latency: Tick,
    write_recovery: Tick,
    internal_read_to_precharge: Tick,
    internal_write_to_read: Tick,
    row_to_row: Tick,
    read_to_write_turnaround: Tick,
    data_time: Tick,
    static_latency: Option<Tick>,

    state: Vec<BankState>,
    open_page: Vec<Addr>,
    activate_time: Vec<Tick>,
    close_time: Vec<Tick>,
    ready_time: Vec<Tick>,
    last_cmd_finish: Vec<Tick>,
    in_conflict: Vec<bool>,
    active_count: usize,

    /// Statistics.
    pub stats: DramStats,
}

impl DdrBanks {
    /// Builds the bank array from the DRAM configuration.
    pub fn new(config: &DramConfig, cpu_count: usize) -> Self {
        Self {
            num_banks: config.num_banks,
            page_bits: config.page_bits,
            max_active_banks: config.max_active_banks,
            ras: config.ras_latency,
            cas: config.cas_latency,
            precharge: config.precharge_latency,
            min_activate_to_precharge: config.min_activate_to_precharge,
            write_latency: config.write_latency,
            write_recovery: config.write_recovery,
            internal_read_to_precharge: config.internal_read_to_precharge,
            internal_write_to_read: config.internal_write_to_read,
            row_to_row: config.row_to_row,
            read_to_write_turnaround: config.read_to_write_turnaround,
            data_time: config.data_time,
            static_latency: config.static_latency,
            state: vec![BankState::Idle; config.num_banks],
            open_page: vec![0; config.num_banks],
            activate_time: vec![0; config.num_banks],
            close_time: vec![0; config.num_banks],
            ready_time: vec![0; config.num_banks],
            last_cmd_finish: vec![0; config.num_banks],
            in_conflict: vec![false; config.num_banks],
            active_count: 0,
            stats: DramStats {
                accesses_per_bank: vec![0; config.num_banks],
                requests_per_cpu: vec![0; cpu_count],
                hits_per_cpu: vec![0; cpu_count],
                misses_per_cpu: vec![0; cpu_count],
                conflicts_per_cpu: vec![0; cpu_count],
                ..DramStats::default()
            },
        }
    }

    /// Bank addressed by a physical address.
    #[inline]
    pub fn bank_of(&self, paddr: Addr) -> usize {
        ((paddr >> self.page_bits) % self.num_banks as Addr) as usize
    }

    /// Page number of a physical address.
    #[inline]
    pub fn page_of(&self, paddr: Addr) -> Addr {
        paddr >> self.page_bits
    }

    /// Number of currently active banks.
    pub fn active_banks(&self) -> usize {
        self.active_count
    }

    /// Configured activation budget.
    pub fn max_active(&self) -> usize {
        self.max_active_banks
    }

    /// Page size in address bits.
    pub fn page_bits(&self) -> u32 {
        self.page_bits
    }

    /// Currently open page of a bank (meaningful while not idle).
    pub fn open_page(&self, bank: usize) -> Addr {
        self.open_page[bank]
    }

    /// True when the bank holding `paddr` is open on the right page.
    pub fn is_active(&self, paddr: Addr) -> bool {
        let bank = self.bank_of(paddr);
        self.state[bank] != BankState::Idle && self.open_page[bank] == self.page_of(paddr)
    }

    /// True when the bank holding `paddr` is precharged.
    pub fn bank_is_closed(&self, paddr: Addr) -> bool {
        self.state[self.bank_of(paddr)] == BankState::Idle
    }

    /// True when a data command to `paddr` would start immediately.
    pub fn is_ready(&self, paddr: Addr, now: Tick) -> bool {
        let bank = self.bank_of(paddr);
        self.state[bank] != BankState::Idle
            && self.open_page[bank] == self.page_of(paddr)
            && self.ready_time[bank] <= now
    }

    /// State of a bank (tests and the controller's close selection).
    pub fn bank_state(&self, bank: usize) -> BankState {
        self.state[bank]
    }

    /// Banks currently open, oldest activation first.
    pub fn open_banks(&self) -> Vec<usize> {
        let mut open: Vec<usize> = (0..self.num_banks)
            .filter(|&b| self.state[b] != BankState::Idle)
            .collect();
        open.sort_by_key(|&b| self.activate_time[b]);
        open
    }

    /// Applies one command, returning its data latency (zero for
    /// open/close commands).
    ///
    /// # Errors
    ///
    /// [`SimError::BankState`] on an impossible transition; this is a
    /// controller bug.
    pub fn command(&mut self, req: &mut MemReq, now: Tick) -> Result<Tick, SimError> {
        debug_assert!(matches!(
            req.cmd,
            MemCmd::Read | MemCmd::Writeback | MemCmd::Write | MemCmd::VirtualPrivateWriteback
                | MemCmd::Activate
                | MemCmd::Close
        ));

        if let Some(static_lat) = self.static_latency {
            return Ok(match req.cmd {
                MemCmd::Activate | MemCmd::Close => 0,
                _ => static_lat,
            });
        }

        let bank = self.bank_of(req.paddr);
        let page = self.page_of(req.paddr);
        let old_state = self.state[bank];
        self.stats.accesses_per_bank[bank] += 1;

        match req.cmd {
            MemCmd::Close => return self.close(bank, now).map(|()| 0),
            MemCmd::Activate => return self.activate(bank, page, now).map(|()| 0),
            _ => {}
        }

        let is_write = req.cmd.is_write();
        if self.state[bank] == BankState::Idle || self.open_page[bank] != page {
            return Err(SimError::BankState {
                bank,
                cmd: if is_write { "Write" } else { "Read" },
                state: self.state[bank].name(),
                at: now,
            });
        }

        let mut latency;
        let mut is_hit = false;
        if is_write {
            self.stats.writes += 1;
            match self.state[bank] {
                BankState::Read => {
                    self.state[bank] = BankState::Written;
                    // Bus turnaround gates the first write beat.
                    let gate = self.read_to_write_turnaround + self.write_latency;
                    let offset = now.saturating_sub(self.ready_time[bank]);
                    latency = if offset <= gate {
                        self.data_time + (gate - offset)
                    } else {
                        self.data_time
                    };
                    self.stats.write_hits += 1;
                    self.stats.slow_write_hits += 1;
                }
                BankState::Active => {
                    self.state[bank] = BankState::Written;
                    self.ready_time[bank] = self.activate_time[bank] + self.write_latency;
                    latency = self.data_time;
                }
                BankState::Written => {
                    latency = self.data_time;
                    self.stats.write_hits += 1;
                    is_hit = true;
                }
                BankState::Idle => unreachable!(),
            }
        } else {
            self.stats.reads += 1;
            match self.state[bank] {
                BankState::Read => {
                    latency = self.data_time;
                    self.stats.read_hits += 1;
                    is_hit = true;
                }
                BankState::Active => {
                    self.state[bank] = BankState::Read;
                    self.ready_time[bank] = self.activate_time[bank] + self.cas;
                    latency = self.data_time;
                }
                BankState::Written => {
                    self.state[bank] = BankState::Read;
                    let gate = self.internal_write_to_read + self.cas;
                    let since = now.saturating_sub(self.last_cmd_finish[bank]);
                    latency = if since <= gate {
                        self.data_time + (gate - since)
                    } else {
                        self.data_time
                    };
                    self.stats.read_hits += 1;
                    self.stats.slow_read_hits += 1;
                }
                BankState::Idle => unreachable!(),
            }
        }

        if req.true_requester < self.stats.requests_per_cpu.len() {
            self.stats.requests_per_cpu[req.true_requester] += 1;
        }

        // Wait for the activation, or for burst-to-burst spacing when an
        // open-page hit chains behind an earlier burst.
        if now < self.ready_time[bank] {
            latency += self.ready_time[bank] - now;
            if !is_hit {
                self.stats.non_overlap_activates += 1;
            }
        }

        self.classify(req, bank, is_hit, is_write);
        self.in_conflict[bank] = false;

        // Ready-time advancement for burst chaining.
        let new_state = self.state[bank];
        let same_direction = (old_state == BankState::Read && new_state == BankState::Read)
            || (old_state == BankState::Written && new_state == BankState::Written);
        let switched = (old_state == BankState::Read && new_state == BankState::Written)
            || (old_state == BankState::Written && new_state == BankState::Read);
        if same_direction {
            self.ready_time[bank] = if self.ready_time[bank] >= now {
                self.ready_time[bank] + self.data_time
            } else {
                now + self.data_time
            };
        } else if switched {
            self.ready_time[bank] = now + (latency - self.data_time);
        }

        self.stats.total_latency += latency;
        self.last_cmd_finish[bank] = now + latency;
        tracing::trace!(target: "dram", bank, page, latency, hit = is_hit, "data command");
        Ok(latency)
    }

    fn activate(&mut self, bank: usize, page: Addr, now: Tick) -> Result<(), SimError> {
        if self.state[bank] != BankState::Idle {
            return Err(SimError::BankState {
                bank,
                cmd: "Activate",
                state: self.state[bank].name(),
                at: now,
            });
        }
        // A close still in flight when the next activate arrives is a
        // page conflict; the latch holds until the following data
        // command is classified.
        if self.close_time[bank] >= now && self.close_time[bank] != 0 {
            self.in_conflict[bank] = true;
        }
        self.active_count += 1;
        assert!(
            self.active_count <= self.max_active_banks,
            "active bank budget exceeded"
        );

        // Residual close latency delays the activate.
        let mut start = now;
        if now < self.close_time[bank] {
            start += self.close_time[bank] - now;
        }
        // Activate-to-activate spacing across banks.
        let last_activate = self.activate_time.iter().copied().max().unwrap_or(0);
        if last_activate > 0 && start < last_activate + self.row_to_row {
            start = last_activate + self.row_to_row;
        }
        self.activate_time[bank] = start + self.ras;
        self.state[bank] = BankState::Active;
        self.open_page[bank] = page;
        tracing::trace!(target: "dram", bank, page, ready = self.activate_time[bank], "activate");
        Ok(())
    }

    fn close(&mut self, bank: usize, now: Tick) -> Result<(), SimError> {
        if self.state[bank] == BankState::Idle {
            return Err(SimError::BankState {
                bank,
                cmd: "Close",
                state: "Idle",
                at: now,
            });
        }
        self.active_count -= 1;

        // The precharge command waits for any in-flight read/write tail.
        let prech_cmd = match self.state[bank] {
            BankState::Read => {
                self.ready_time[bank].max(now) + self.internal_read_to_precharge
            }
            BankState::Written => {
                self.ready_time[bank].max(now) + self.data_time + self.write_recovery
            }
            BankState::Active => self.activate_time[bank].max(now),
            BankState::Idle => unreachable!(),
        };

        // And for the minimum activate-to-precharge window.
        let act_to_prech = prech_cmd.saturating_sub(self.activate_time[bank]);
        let mut close_latency = 0;
        if act_to_prech < self.min_activate_to_precharge {
            close_latency = self.min_activate_to_precharge - act_to_prech;
        }
        close_latency += self.precharge;
        self.close_time[bank] = prech_cmd + close_latency;
        self.state[bank] = BankState::Idle;
        tracing::trace!(target: "dram", bank, idle_at = self.close_time[bank], "close");
        Ok(())
    }

    fn classify(&mut self, req: &mut MemReq, bank: usize, is_hit: bool, is_write: bool) {
        let kind = usize::from(is_write);
        let cpu: CpuId = req.true_requester;
        let counted = cpu < self.stats.hits_per_cpu.len();
        if self.in_conflict[bank] {
            debug_assert!(!is_hit);
            req.dram_result = Some(DramResult::Conflict);
            self.stats.page_conflicts[kind] += 1;
            if counted {
                self.stats.conflicts_per_cpu[cpu] += 1;
            }
        } else if is_hit {
            req.dram_result = Some(DramResult::Hit);
            self.stats.page_hits[kind] += 1;
            if counted {
                self.stats.hits_per_cpu[cpu] += 1;
            }
        } else {
            req.dram_result = Some(DramResult::Miss);
            self.stats.page_misses[kind] += 1;
            if counted {
                self.stats.misses_per_cpu[cpu] += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DramConfig {
        DramConfig {
            num_banks: 4,
            ras_latency: 40,
            cas_latency: 12,
            precharge_latency: 12,
            min_activate_to_precharge: 48,
            write_latency: 12,
            write_recovery: 12,
            internal_read_to_precharge: 8,
            internal_write_to_read: 8,
            row_to_row: 8,
            read_to_write_turnaround: 8,
            data_time: 16,
            page_bits: 10,
            max_active_banks: 4,
            static_latency: None,
            ..DramConfig::default()
        }
    }

    fn read(addr: Addr, cpu: usize) -> MemReq {
        let mut req = MemReq::new(MemCmd::Read, addr, 64, cpu, 0);
        req.true_requester = cpu;
        req
    }

    fn activate(addr: Addr) -> MemReq {
        MemReq::new(MemCmd::Activate, addr, 0, 0, 0)
    }

    fn close(addr: Addr) -> MemReq {
        MemReq::new(MemCmd::Close, addr, 0, 0, 0)
    }

    #[test]
    fn read_from_idle_bank_waits_ras_plus_cas() {
        let mut banks = DdrBanks::new(&config(), 1);
        // Activate at t=100: row ready at 140; CAS makes data ready at
        // 152; a read issued at 100 waits 52 cycles plus the burst.
        assert_eq!(banks.command(&mut activate(0x4000), 100).unwrap(), 0);
        let mut req = read(0x4000, 0);
        let latency = banks.command(&mut req, 100).unwrap();
        assert_eq!(latency, 16 + 52);
        assert_eq!(req.dram_result, Some(DramResult::Miss));
    }

    #[test]
    fn read_before_ras_expires_waits_the_remainder() {
        // Property: a read issued at T' < T + RAS after an activate at T
        // waits at least RAS - (T' - T).
        let mut banks = DdrBanks::new(&config(), 1);
        let _ = banks.command(&mut activate(0x4000), 100).unwrap();
        let mut req = read(0x4000, 0);
        let t_prime = 120; // 20 cycles into the 40-cycle RAS
        let latency = banks.command(&mut req, t_prime).unwrap();
        // ready_time = 152, so the wait is 32 >= RAS - 20 = 20.
        assert!(latency >= 16 + (40 - 20));
    }

    #[test]
    fn back_to_back_open_page_reads_cost_data_time() {
        let mut banks = DdrBanks::new(&config(), 1);
        let _ = banks.command(&mut activate(0x4000), 0).unwrap();
        let mut first = read(0x4000, 0);
        let lat1 = banks.command(&mut first, 200).unwrap();
        assert_eq!(lat1, 16); // activation long since complete
        let mut second = read(0x4008, 0);
        let lat2 = banks.command(&mut second, 300).unwrap();
        assert_eq!(lat2, 16);
        assert_eq!(second.dram_result, Some(DramResult::Hit));
        assert_eq!(banks.stats.read_hits, 1);
    }

    #[test]
    fn burst_chaining_extends_ready_time() {
        let mut banks = DdrBanks::new(&config(), 1);
        let _ = banks.command(&mut activate(0x4000), 0).unwrap();
        let mut first = read(0x4000, 0);
        let _ = banks.command(&mut first, 200).unwrap();
        let mut second = read(0x4008, 0);
        let lat2 = banks.command(&mut second, 201).unwrap();
        assert_eq!(lat2, 16);
        assert_eq!(second.dram_result, Some(DramResult::Hit));
        // The second burst pushed the ready time forward; a third read
        // chained right behind it pays the burst-to-burst spacing.
        let mut third = read(0x4010, 0);
        let lat3 = banks.command(&mut third, 205).unwrap();
        assert_eq!(lat3, 16 + (217 - 205));
        assert_eq!(third.dram_result, Some(DramResult::Hit));
    }

    #[test]
    fn write_to_read_pays_turnaround() {
        let mut banks = DdrBanks::new(&config(), 1);
        let _ = banks.command(&mut activate(0x4000), 0).unwrap();
        let mut w = MemReq::new(MemCmd::Writeback, 0x4000, 64, 0, 0);
        let _ = banks.command(&mut w, 200).unwrap();
        // Read right behind the write: internal write-to-read + CAS gate.
        let mut r = read(0x4008, 0);
        let lat = banks.command(&mut r, 220).unwrap();
        assert!(lat > 16, "turnaround not charged: {lat}");
        assert_eq!(banks.stats.slow_read_hits, 1);
    }

    #[test]
    fn activate_while_closing_is_a_conflict() {
        let mut banks = DdrBanks::new(&config(), 1);
        let _ = banks.command(&mut activate(0x4000), 0).unwrap();
        let mut first = read(0x4000, 0);
        let _ = banks.command(&mut first, 100).unwrap();
        // Close the bank; the precharge completes well in the future.
        let _ = banks.command(&mut close(0x4000), 150).unwrap();
        let closing_until = banks.close_time[banks.bank_of(0x4000)];
        assert!(closing_until > 160);
        // Re-activate before the close finished: conflict.
        let _ = banks.command(&mut activate(0x8000), 160).unwrap();
        let mut req = read(0x8000, 0);
        let _ = banks.command(&mut req, 160).unwrap();
        assert_eq!(req.dram_result, Some(DramResult::Conflict));
        assert_eq!(banks.stats.page_conflicts[0], 1);
        assert_eq!(banks.stats.conflicts_per_cpu[0], 1);
    }

    #[test]
    fn impossible_transitions_are_fatal() {
        let mut banks = DdrBanks::new(&config(), 1);
        // Read from an idle bank.
        let mut req = read(0x4000, 0);
        assert!(matches!(
            banks.command(&mut req, 0),
            Err(SimError::BankState { .. })
        ));
        // Close an idle bank.
        assert!(matches!(
            banks.command(&mut close(0x4000), 0),
            Err(SimError::BankState { .. })
        ));
        // Double activate.
        let _ = banks.command(&mut activate(0x4000), 0).unwrap();
        assert!(matches!(
            banks.command(&mut activate(0x4000), 10),
            Err(SimError::BankState { .. })
        ));
    }

    #[test]
    fn static_latency_mode_short_circuits() {
        let mut cfg = config();
        cfg.static_latency = Some(120);
        let mut banks = DdrBanks::new(&cfg, 1);
        let mut req = read(0x4000, 0);
        assert_eq!(banks.command(&mut req, 0).unwrap(), 120);
        assert_eq!(banks.command(&mut activate(0x8000), 0).unwrap(), 0);
    }

    #[test]
    fn bank_addressing_uses_page_bits() {
        let banks = DdrBanks::new(&config(), 1);
        assert_eq!(banks.bank_of(0x0000), 0);
        assert_eq!(banks.bank_of(0x0400), 1);
        assert_eq!(banks.bank_of(0x0800), 2);
        assert_eq!(banks.bank_of(0x1000), 0);
        assert_eq!(banks.page_of(0x0400), 1);
    }
}
