//! Network-fair-queuing arbitration.
//!
//! Every requester cardinality (CPU id for reads, bank id for
//! writebacks) carries a virtual finish tag. A request's start tag is
//! the later of its request time and its sender's finish tag; the
//! eligible request with the minimum start tag wins, and the winner's
//! finish tag advances by one full rotation of slots.

use crate::common::Tick;

use super::Bus;

impl Bus {
    /// Picks the address-phase winner under NFQ.
    ///
    /// Priority: lowest virtual start tag, then earliest actual request
    /// time, then lowest interface id.
    pub(super) fn pick_nfq(&mut self, now: Tick) -> Option<usize> {
        let mut lowest_clock = Tick::MAX;
        let mut lowest_req_time = Tick::MAX;
        let mut grant: Option<(usize, usize, Tick)> = None;

        for iface in 0..self.addr_q.len() {
            let Some(entry) = self.addr_q[iface].front() else {
                continue;
            };
            if entry.ready >= now {
                continue;
            }
            let sender = self.sender_id(iface, &entry.req);
            let start = entry.ready.max(self.addr_finish_tags[sender]);

            let update = start < lowest_clock
                || (start == lowest_clock && entry.ready < lowest_req_time);
            if update {
                lowest_clock = start;
                lowest_req_time = entry.ready;
                grant = Some((iface, sender, start));
            }
        }

        let (iface, sender, start) = grant?;
        // Advance the winner's finish tag by one slot rotation.
        self.addr_finish_tags[sender] =
            start + self.clock * (self.cpu_count + self.bank_count) as Tick;
        Some(iface)
    }
}
