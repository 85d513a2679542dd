//! Memory request representation.
//!
//! A [`MemReq`] is the unit of communication between caches, buses, the
//! memory controller, and the accounting machinery. It is exclusively
//! owned by whichever component has it queued; ownership transfers on
//! every hand-off, and clones happen only at coherence fork points (a
//! writeback fabricated from a fill, or a synthetic private writeback for
//! shadow-tag accounting).

use crate::common::{Addr, CpuId, INVAL_ADDR, ThreadId, Tick};

/// Memory command carried by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemCmd {
    /// Demand read.
    Read,
    /// Demand write.
    Write,
    /// Software-requested prefetch; allocates, droppable under pressure.
    SoftPrefetch,
    /// Hardware prefetch; may be rejected without retry.
    HardPrefetch,
    /// Dirty block writeback.
    Writeback,
    /// Invalidate a block in other caches.
    Invalidate,
    /// Read with intent to modify.
    ReadEx,
    /// Ownership upgrade for a block already held shared.
    Upgrade,
    /// Block copy pseudo-operation.
    Copy,
    /// Cancelled request travelling back to free resources.
    Squash,
    /// DRAM bank activate (controller-fabricated).
    Activate,
    /// DRAM bank precharge/close (controller-fabricated).
    Close,
    /// Directory: owner writes the block back to the home node.
    DirOwnerWriteback,
    /// Directory: sharer drops its copy.
    DirSharerWriteback,
    /// Directory: redirect a read to the current owner.
    DirRedirectRead,
    /// Directory: transfer ownership to a new core.
    DirOwnerTransfer,
    /// Synthetic writeback fabricated from shadow-tag estimates.
    VirtualPrivateWriteback,
}

impl MemCmd {
    /// True for commands that read data.
    #[inline]
    pub fn is_read(self) -> bool {
        matches!(
            self,
            MemCmd::Read | MemCmd::ReadEx | MemCmd::SoftPrefetch | MemCmd::HardPrefetch
                | MemCmd::DirRedirectRead
        )
    }

    /// True for commands that write data.
    #[inline]
    pub fn is_write(self) -> bool {
        matches!(
            self,
            MemCmd::Write
                | MemCmd::Writeback
                | MemCmd::DirOwnerWriteback
                | MemCmd::DirSharerWriteback
                | MemCmd::VirtualPrivateWriteback
        )
    }

    /// True for commands that invalidate remote copies.
    #[inline]
    pub fn is_invalidate(self) -> bool {
        matches!(self, MemCmd::Invalidate | MemCmd::ReadEx | MemCmd::Upgrade)
    }

    /// True for commands that expect no response.
    #[inline]
    pub fn is_no_response(self) -> bool {
        matches!(
            self,
            MemCmd::Writeback
                | MemCmd::Squash
                | MemCmd::DirOwnerWriteback
                | MemCmd::DirSharerWriteback
                | MemCmd::VirtualPrivateWriteback
        )
    }

    /// True for directory protocol messages.
    #[inline]
    pub fn is_directory(self) -> bool {
        matches!(
            self,
            MemCmd::DirOwnerWriteback
                | MemCmd::DirSharerWriteback
                | MemCmd::DirRedirectRead
                | MemCmd::DirOwnerTransfer
        )
    }

    /// True for hardware or software prefetches.
    #[inline]
    pub fn is_prefetch(self) -> bool {
        matches!(self, MemCmd::SoftPrefetch | MemCmd::HardPrefetch)
    }

    /// Short name used in traces.
    pub fn as_str(self) -> &'static str {
        match self {
            MemCmd::Read => "read",
            MemCmd::Write => "write",
            MemCmd::SoftPrefetch => "soft_pf",
            MemCmd::HardPrefetch => "hard_pf",
            MemCmd::Writeback => "writeback",
            MemCmd::Invalidate => "invalidate",
            MemCmd::ReadEx => "read_ex",
            MemCmd::Upgrade => "upgrade",
            MemCmd::Copy => "copy",
            MemCmd::Squash => "squash",
            MemCmd::Activate => "activate",
            MemCmd::Close => "close",
            MemCmd::DirOwnerWriteback => "dir_owner_wb",
            MemCmd::DirSharerWriteback => "dir_sharer_wb",
            MemCmd::DirRedirectRead => "dir_redirect_read",
            MemCmd::DirOwnerTransfer => "dir_owner_transfer",
            MemCmd::VirtualPrivateWriteback => "virtual_priv_wb",
        }
    }
}

/// Bit-mask flags carried on a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReqFlags(u32);

impl ReqFlags {
    /// Access must bypass the caches.
    pub const UNCACHEABLE: u32 = 0x0001;
    /// Locked (atomic) access.
    pub const LOCKED: u32 = 0x0002;
    /// Prefetch requesting exclusive state.
    pub const PF_EXCLUSIVE: u32 = 0x0004;
    /// Do not allocate a block on fill.
    pub const NO_ALLOCATE: u32 = 0x0008;
    /// The request has been satisfied by some level.
    pub const SATISFIED: u32 = 0x0010;
    /// The request was NACKed by a snooper.
    pub const NACKED: u32 = 0x0020;
    /// Another cache holds the line; fill in shared state.
    pub const SHARED_LINE: u32 = 0x0040;
    /// Copy state machine: first source block pending.
    pub const COPY_SOURCE1: u32 = 0x0080;
    /// Copy state machine: second source block pending.
    pub const COPY_SOURCE2: u32 = 0x0100;
    /// Copy state machine: first destination block pending.
    pub const COPY_DEST1: u32 = 0x0200;
    /// Copy state machine: second destination block pending.
    pub const COPY_DEST2: u32 = 0x0400;
    /// Instruction fetch.
    pub const INST_READ: u32 = 0x0800;
    /// Data payload is compressed.
    pub const COMPRESSED: u32 = 0x1000;
    /// Full cache line fill.
    pub const CACHE_LINE_FILL: u32 = 0x2000;

    /// All four copy-pending bits.
    pub const COPY_PENDING_MASK: u32 =
        Self::COPY_SOURCE1 | Self::COPY_SOURCE2 | Self::COPY_DEST1 | Self::COPY_DEST2;

    /// Set the given flag bits.
    #[inline]
    pub fn set(&mut self, bits: u32) {
        self.0 |= bits;
    }

    /// Clear the given flag bits.
    #[inline]
    pub fn clear(&mut self, bits: u32) {
        self.0 &= !bits;
    }

    /// True when any of the given bits are set.
    #[inline]
    pub fn any(&self, bits: u32) -> bool {
        self.0 & bits != 0
    }
}

/// Pipeline segment of the shared memory system, used to index latency
/// and interference breakdown vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum LatencyKind {
    /// Waiting to enter the interconnect.
    InterconnectEntry,
    /// Queued for the interconnect address phase.
    InterconnectRequestQueue,
    /// Address/request transfer on the interconnect.
    InterconnectRequestTransfer,
    /// Queued for the interconnect data phase (response side).
    InterconnectResponseQueue,
    /// Response transfer on the interconnect.
    InterconnectResponseTransfer,
    /// Delivery from the interconnect back to the core.
    InterconnectDelivery,
    /// Extra round trips caused by shared-cache capacity contention.
    CacheCapacity,
    /// Waiting to enter the memory bus.
    MemoryBusEntry,
    /// Queued at the memory controller.
    MemoryBusQueue,
    /// DRAM service time.
    MemoryBusService,
}

impl LatencyKind {
    /// Number of latency components.
    pub const COUNT: usize = 10;

    /// All components, in breakdown-vector order.
    pub const ALL: [LatencyKind; Self::COUNT] = [
        LatencyKind::InterconnectEntry,
        LatencyKind::InterconnectRequestQueue,
        LatencyKind::InterconnectRequestTransfer,
        LatencyKind::InterconnectResponseQueue,
        LatencyKind::InterconnectResponseTransfer,
        LatencyKind::InterconnectDelivery,
        LatencyKind::CacheCapacity,
        LatencyKind::MemoryBusEntry,
        LatencyKind::MemoryBusQueue,
        LatencyKind::MemoryBusService,
    ];

    /// Stable name used in trace headers.
    pub fn as_str(self) -> &'static str {
        match self {
            LatencyKind::InterconnectEntry => "ic_entry",
            LatencyKind::InterconnectRequestQueue => "ic_request_queue",
            LatencyKind::InterconnectRequestTransfer => "ic_request_transfer",
            LatencyKind::InterconnectResponseQueue => "ic_response_queue",
            LatencyKind::InterconnectResponseTransfer => "ic_response_transfer",
            LatencyKind::InterconnectDelivery => "ic_delivery",
            LatencyKind::CacheCapacity => "cache_capacity",
            LatencyKind::MemoryBusEntry => "bus_entry",
            LatencyKind::MemoryBusQueue => "bus_queue",
            LatencyKind::MemoryBusService => "bus_service",
        }
    }
}

/// Outcome of a DRAM data command, recorded for statistics and tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DramResult {
    /// Open-page hit.
    Hit,
    /// Page had to be activated.
    Miss,
    /// Activation collided with a scheduled close.
    Conflict,
}

impl DramResult {
    /// Trace column value.
    pub fn as_str(self) -> &'static str {
        match self {
            DramResult::Hit => "hit",
            DramResult::Miss => "miss",
            DramResult::Conflict => "conflict",
        }
    }
}

/// A memory operation travelling through the hierarchy.
#[derive(Debug, Clone)]
pub struct MemReq {
    /// Virtual address.
    pub vaddr: Addr,
    /// Physical address.
    pub paddr: Addr,
    /// Command.
    pub cmd: MemCmd,
    /// Access size in bytes.
    pub size: usize,
    /// Issuing core.
    pub cpu_id: CpuId,
    /// Requester identity preserved across cache-level boundaries; a
    /// writeback fabricated at the shared cache keeps the id of the core
    /// being charged for it.
    pub true_requester: CpuId,
    /// Address space id.
    pub asid: usize,
    /// Issuing hardware thread.
    pub thread_id: ThreadId,
    /// Tick the request was created.
    pub time: Tick,
    /// Flag mask.
    pub flags: ReqFlags,
    /// Measured latency per memory-system segment.
    pub latency_breakdown: [Tick; LatencyKind::COUNT],
    /// Estimated interference per memory-system segment.
    pub interference_breakdown: [Tick; LatencyKind::COUNT],
    /// Handle of the MSHR currently servicing this request, if any.
    pub mshr: Option<usize>,
    /// Sequence number of the originating dynamic instruction.
    pub inst_seq: Option<u64>,
    /// Destination address for copy operations.
    pub dest: Addr,
    /// Address of the block this request displaced (DRAM trace).
    pub old_addr: Addr,
    /// Tick the request entered the shared memory system.
    pub entered_mem_sys_at: Tick,
    /// Tick the request was inserted into the memory controller.
    pub inserted_into_memctrl: Tick,
    /// Memory controller sequence number.
    pub memctrl_seq: u64,
    /// DRAM access outcome.
    pub dram_result: Option<DramResult>,
    /// Tick at which this access was tagged an interference miss
    /// (zero = untagged).
    pub interference_miss_at: Tick,
    /// Accumulated cache-capacity interference charged to this request.
    pub cache_capacity_interference: Tick,
    /// Fixed shared-cache set for synthetic writebacks with no address.
    pub shared_cache_set: Option<usize>,
    /// The access missed in the requester's shadow tags.
    pub shadow_miss: bool,
}

impl MemReq {
    /// Creates a request with all bookkeeping fields cleared.
    pub fn new(cmd: MemCmd, paddr: Addr, size: usize, cpu_id: CpuId, time: Tick) -> Self {
        Self {
            vaddr: paddr,
            paddr,
            cmd,
            size,
            cpu_id,
            true_requester: cpu_id,
            asid: 0,
            thread_id: 0,
            time,
            flags: ReqFlags::default(),
            latency_breakdown: [0; LatencyKind::COUNT],
            interference_breakdown: [0; LatencyKind::COUNT],
            mshr: None,
            inst_seq: None,
            dest: INVAL_ADDR,
            old_addr: INVAL_ADDR,
            entered_mem_sys_at: time,
            inserted_into_memctrl: 0,
            memctrl_seq: 0,
            dram_result: None,
            interference_miss_at: 0,
            cache_capacity_interference: 0,
            shared_cache_set: None,
            shadow_miss: false,
        }
    }

    /// Adds measured latency to one breakdown component.
    #[inline]
    pub fn add_latency(&mut self, kind: LatencyKind, ticks: Tick) {
        self.latency_breakdown[kind as usize] += ticks;
    }

    /// Adds estimated interference to one breakdown component.
    #[inline]
    pub fn add_interference(&mut self, kind: LatencyKind, ticks: Tick) {
        self.interference_breakdown[kind as usize] += ticks;
    }

    /// True when this request was marked satisfied by some level.
    #[inline]
    pub fn is_satisfied(&self) -> bool {
        self.flags.any(ReqFlags::SATISFIED)
    }

    /// True for instruction-fetch requests.
    #[inline]
    pub fn is_inst_fetch(&self) -> bool {
        self.flags.any(ReqFlags::INST_READ)
    }

    /// Block-aligns the physical address for the given line size.
    #[inline]
    pub fn block_addr(&self, line_bytes: usize) -> Addr {
        self.paddr & !(line_bytes as Addr - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_predicates() {
        assert!(MemCmd::Read.is_read());
        assert!(!MemCmd::Read.is_write());
        assert!(MemCmd::Writeback.is_write());
        assert!(MemCmd::Writeback.is_no_response());
        assert!(MemCmd::Upgrade.is_invalidate());
        assert!(MemCmd::DirRedirectRead.is_directory());
        assert!(MemCmd::HardPrefetch.is_prefetch());
    }

    #[test]
    fn flags_set_and_clear() {
        let mut flags = ReqFlags::default();
        flags.set(ReqFlags::SATISFIED | ReqFlags::SHARED_LINE);
        assert!(flags.any(ReqFlags::SATISFIED));
        flags.clear(ReqFlags::SATISFIED);
        assert!(!flags.any(ReqFlags::SATISFIED));
        assert!(flags.any(ReqFlags::SHARED_LINE));
    }

    #[test]
    fn block_alignment() {
        let req = MemReq::new(MemCmd::Read, 0x1234, 8, 0, 0);
        assert_eq!(req.block_addr(64), 0x1200);
    }
}
