//! Error and fault definitions.
//!
//! Two unrelated failure families live here:
//! 1. **`SimError`:** simulation-fatal conditions that indicate an
//!    implementation or configuration bug. These abort the run.
//! 2. **`Fault`:** architectural faults raised by instruction execution.
//!    These are data, carried on the dynamic instruction and propagated
//!    through the pipeline like any other completion signal.

use thiserror::Error;

use super::Tick;

/// Simulation-fatal error; aborts the run with a diagnostic.
#[derive(Debug, Error)]
pub enum SimError {
    /// Inconsistent or out-of-range configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// A DRAM bank was commanded into an impossible state transition.
    #[error("bank {bank}: illegal {cmd} in state {state} at tick {at}")]
    BankState {
        /// Bank index.
        bank: usize,
        /// Command that was attempted.
        cmd: &'static str,
        /// State the bank was in.
        state: &'static str,
        /// Tick of the offending command.
        at: Tick,
    },

    /// The event queue was popped while empty, or an event fired in the past.
    #[error("event queue underflow at tick {0}")]
    EventUnderflow(Tick),

    /// Bus arbitration invariant violation (e.g. grant with no request).
    #[error("bus arbitration error: {0}")]
    BusArbitration(String),

    /// An MSHR was leaked or double-allocated for the same block.
    #[error("MSHR accounting error: {0}")]
    Mshr(String),

    /// Checkpoint geometry does not match the configured tag array.
    #[error(
        "checkpoint mismatch: expected {expected_sets} sets x {expected_assoc} ways, \
         found {found_sets} x {found_assoc}"
    )]
    CheckpointGeometry {
        /// Sets in the running configuration.
        expected_sets: usize,
        /// Associativity in the running configuration.
        expected_assoc: usize,
        /// Sets recorded in the checkpoint.
        found_sets: usize,
        /// Associativity recorded in the checkpoint.
        found_assoc: usize,
    },

    /// Malformed checkpoint or trace input.
    #[error("serialization error: {0}")]
    Serialize(String),
}

/// Architectural fault codes returned by instruction execution.
///
/// Non-speculative faults take the architected trap path at commit and
/// count as committed; speculative faults are recorded on the instruction
/// and discarded at squash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fault {
    /// No fault; the common case.
    #[default]
    None,
    /// Processor reset.
    Reset,
    /// Unrecoverable machine check.
    MachineCheck,
    /// Arithmetic trap (divide by zero and friends).
    Arithmetic,
    /// Asynchronous interrupt delivered at a commit boundary.
    Interrupt,
    /// Data TLB miss.
    DtbMiss,
    /// Data TLB miss while servicing a data TLB miss.
    NestedDtbMiss,
    /// Misaligned data access.
    Alignment,
    /// Data page fault.
    DtbPageFault,
    /// Data access violation.
    DtbAccessViolation,
    /// Instruction TLB miss.
    ItbMiss,
    /// Instruction page fault.
    ItbPageFault,
    /// Instruction access violation.
    ItbAccessViolation,
    /// Opcode not implemented by this machine.
    UnimplementedOpcode,
    /// Floating-point unit disabled.
    FpDisabled,
    /// Privileged library call.
    PalCall,
    /// Integer overflow trap.
    IntegerOverflow,
    /// Out-of-range access to simulated memory.
    FakeMem,
    /// Workload requested the processor halt.
    ProcessHalt,
}

impl Fault {
    /// Returns true when this is an actual fault rather than `Fault::None`.
    #[inline]
    pub fn is_fault(self) -> bool {
        self != Fault::None
    }
}
