//! Static and dynamic instruction representation.
//!
//! Instruction decoding and ISA semantics live outside this crate; the
//! pipeline sees instructions only through the [`StaticInst`] trait. The
//! crate ships a synthetic instruction set ([`SynthInst`]) sufficient to
//! drive the timing model in the CLI and the test suite.

use std::fmt;
use std::rc::Rc;

use crate::common::error::Fault;
use crate::common::{Addr, INVAL_ADDR, ThreadId};

/// Coarse operation category used to route an instruction to a
/// functional unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum OpClass {
    /// No functional unit required (NOPs, direct jumps).
    Null,
    /// Integer ALU operation.
    IntAlu,
    /// Integer multiply.
    IntMult,
    /// Integer divide.
    IntDiv,
    /// Floating-point add/subtract.
    FloatAdd,
    /// Floating-point compare.
    FloatCmp,
    /// Floating-point convert.
    FloatCvt,
    /// Floating-point multiply.
    FloatMult,
    /// Floating-point divide.
    FloatDiv,
    /// Floating-point square root.
    FloatSqrt,
    /// Memory read port.
    MemRead,
    /// Memory write port.
    MemWrite,
    /// Internal processor register access.
    IprAccess,
    /// Instruction prefetch.
    InstPrefetch,
}

impl OpClass {
    /// Number of operation classes.
    pub const COUNT: usize = 14;

    /// Parses a configuration name into an op class.
    pub fn from_name(name: &str) -> Option<OpClass> {
        Some(match name {
            "IntAlu" => OpClass::IntAlu,
            "IntMult" => OpClass::IntMult,
            "IntDiv" => OpClass::IntDiv,
            "FloatAdd" => OpClass::FloatAdd,
            "FloatCmp" => OpClass::FloatCmp,
            "FloatCvt" => OpClass::FloatCvt,
            "FloatMult" => OpClass::FloatMult,
            "FloatDiv" => OpClass::FloatDiv,
            "FloatSqrt" => OpClass::FloatSqrt,
            "MemRead" => OpClass::MemRead,
            "MemWrite" => OpClass::MemWrite,
            "IprAccess" => OpClass::IprAccess,
            "InstPrefetch" => OpClass::InstPrefetch,
            _ => return None,
        })
    }
}

/// Register file class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegClass {
    /// Integer register file.
    Int,
    /// Floating-point register file.
    Float,
    /// Miscellaneous (control) registers.
    Misc,
}

/// Architectural register identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegId {
    /// Register file.
    pub class: RegClass,
    /// Index within the file.
    pub index: usize,
}

impl RegId {
    /// Integer register shorthand.
    pub const fn int(index: usize) -> Self {
        Self {
            class: RegClass::Int,
            index,
        }
    }

    /// Floating-point register shorthand.
    pub const fn float(index: usize) -> Self {
        Self {
            class: RegClass::Float,
            index,
        }
    }
}

/// Execution context an instruction runs against.
///
/// The pipeline calls through this to read and write architectural
/// state, resolve translations, and perform functional loads/stores.
/// Implementations must distinguish speculative from non-speculative
/// accesses via [`ExecContext::misspeculating`].
pub trait ExecContext {
    /// Reads an integer register.
    fn read_int(&self, reg: usize) -> u64;
    /// Writes an integer register.
    fn set_int(&mut self, reg: usize, val: u64);
    /// Reads a floating-point register (raw bits).
    fn read_float(&self, reg: usize) -> u64;
    /// Writes a floating-point register (raw bits).
    fn set_float(&mut self, reg: usize, val: u64);
    /// Reads a miscellaneous register.
    fn read_misc(&self, reg: usize) -> u64;
    /// Writes a miscellaneous register.
    fn set_misc(&mut self, reg: usize, val: u64);
    /// Resolves a virtual address to a physical address.
    fn translate(&self, vaddr: Addr) -> Addr;
    /// Functional load; returns the value and any fault.
    fn mem_read(&mut self, vaddr: Addr, size: usize, flags: u32) -> (u64, Fault);
    /// Functional store.
    fn mem_write(&mut self, vaddr: Addr, val: u64, size: usize, flags: u32) -> Fault;
    /// True while the context is executing down a speculative path.
    fn misspeculating(&self) -> bool;
}

/// Decoded-instruction surface the pipeline depends on.
pub trait StaticInst: fmt::Debug {
    /// Functional unit routing class.
    fn op_class(&self) -> OpClass;
    /// Source registers.
    fn src_regs(&self) -> &[RegId];
    /// Destination registers.
    fn dest_regs(&self) -> &[RegId];
    /// Instruction size in bytes.
    fn size(&self) -> usize {
        4
    }
    /// Branch target for a direct control instruction at `pc`.
    fn branch_target(&self, pc: Addr) -> Addr {
        pc + self.size() as Addr
    }
    /// Executes the instruction against the context.
    fn execute(&self, xc: &mut dyn ExecContext, pc: Addr) -> Fault;
    /// Human-readable mnemonic for traces.
    fn disassemble(&self) -> String;
    /// Actual direction of a control instruction given current state.
    fn branch_taken(&self, _xc: &dyn ExecContext) -> bool {
        self.is_uncond_ctrl()
    }
    /// Actual target of a control instruction given current state
    /// (covers indirect targets such as returns).
    fn actual_target(&self, _xc: &dyn ExecContext, pc: Addr) -> Addr {
        self.branch_target(pc)
    }
    /// Effective address of a memory reference given current state.
    fn mem_addr(&self, _xc: &dyn ExecContext) -> Option<Addr> {
        None
    }

    /// Loads data from memory.
    fn is_load(&self) -> bool {
        false
    }
    /// Stores data to memory.
    fn is_store(&self) -> bool {
        false
    }
    /// Any control transfer.
    fn is_control(&self) -> bool {
        false
    }
    /// Conditional control transfer.
    fn is_cond_ctrl(&self) -> bool {
        false
    }
    /// Unconditional control transfer.
    fn is_uncond_ctrl(&self) -> bool {
        false
    }
    /// Function call.
    fn is_call(&self) -> bool {
        false
    }
    /// Function return.
    fn is_return(&self) -> bool {
        false
    }
    /// Must drain the pipeline before dispatch.
    fn is_serializing(&self) -> bool {
        false
    }
    /// Memory barrier.
    fn is_mem_barrier(&self) -> bool {
        false
    }
    /// Must not execute speculatively.
    fn is_non_speculative(&self) -> bool {
        false
    }
    /// Software prefetch.
    fn is_prefetch(&self) -> bool {
        false
    }
    /// Block copy pseudo-instruction.
    fn is_copy(&self) -> bool {
        false
    }
}

/// Shared handle to a decoded instruction.
pub type StaticInstPtr = Rc<dyn StaticInst>;

/// Synthetic instruction set used by the CLI workloads and tests.
#[derive(Debug, Clone)]
pub enum SynthInst {
    /// No operation.
    Nop,
    /// Integer operation `dest = op(srcs)`; the concrete function is a
    /// wrapping sum, which is enough to create real dependence chains.
    IntOp {
        /// Destination register.
        dest: usize,
        /// Source registers.
        srcs: Vec<usize>,
        /// Routing class (`IntAlu`, `IntMult`, `IntDiv`).
        class: OpClass,
    },
    /// Load `dest = mem[base + offset]`.
    Load {
        /// Destination register.
        dest: usize,
        /// Base address register.
        base: usize,
        /// Byte offset.
        offset: i64,
    },
    /// Store `mem[base + offset] = src`.
    Store {
        /// Value register.
        src: usize,
        /// Base address register.
        base: usize,
        /// Byte offset.
        offset: i64,
    },
    /// Conditional branch, taken when `src != 0`, to `pc + offset`.
    CondBranch {
        /// Condition register.
        src: usize,
        /// Signed target offset from the branch PC.
        offset: i64,
    },
    /// Unconditional direct jump to `pc + offset`.
    Jump {
        /// Signed target offset from the jump PC.
        offset: i64,
    },
    /// Call: jumps to `pc + offset`, return address is architectural.
    Call {
        /// Signed target offset.
        offset: i64,
    },
    /// Return to the address in the link register (integer register 31).
    Return,
    /// Memory barrier.
    MemBarrier,
    /// Raise the given fault at execute.
    Trap(Fault),
}

/// Link register used by [`SynthInst::Call`] and [`SynthInst::Return`].
pub const LINK_REG: usize = 31;

impl SynthInst {
    fn srcs_vec(&self) -> Vec<RegId> {
        match self {
            SynthInst::IntOp { srcs, .. } => srcs.iter().map(|&s| RegId::int(s)).collect(),
            SynthInst::Load { base, .. } => vec![RegId::int(*base)],
            SynthInst::Store { src, base, .. } => vec![RegId::int(*src), RegId::int(*base)],
            SynthInst::CondBranch { src, .. } => vec![RegId::int(*src)],
            SynthInst::Return => vec![RegId::int(LINK_REG)],
            _ => Vec::new(),
        }
    }

    fn dests_vec(&self) -> Vec<RegId> {
        match self {
            SynthInst::IntOp { dest, .. } | SynthInst::Load { dest, .. } => {
                vec![RegId::int(*dest)]
            }
            SynthInst::Call { .. } => vec![RegId::int(LINK_REG)],
            _ => Vec::new(),
        }
    }
}

/// A [`SynthInst`] plus its precomputed register lists, implementing
/// [`StaticInst`].
#[derive(Debug)]
pub struct SynthStatic {
    inst: SynthInst,
    srcs: Vec<RegId>,
    dests: Vec<RegId>,
}

impl SynthStatic {
    /// Wraps a synthetic instruction into a shareable static instruction.
    pub fn new(inst: SynthInst) -> StaticInstPtr {
        let srcs = inst.srcs_vec();
        let dests = inst.dests_vec();
        Rc::new(Self { inst, srcs, dests })
    }
}

impl StaticInst for SynthStatic {
    fn op_class(&self) -> OpClass {
        match &self.inst {
            SynthInst::Nop | SynthInst::Jump { .. } | SynthInst::MemBarrier => OpClass::Null,
            SynthInst::IntOp { class, .. } => *class,
            SynthInst::Load { .. } => OpClass::MemRead,
            SynthInst::Store { .. } => OpClass::MemWrite,
            SynthInst::CondBranch { .. } | SynthInst::Call { .. } | SynthInst::Return => {
                OpClass::IntAlu
            }
            SynthInst::Trap(_) => OpClass::IntAlu,
        }
    }

    fn src_regs(&self) -> &[RegId] {
        &self.srcs
    }

    fn dest_regs(&self) -> &[RegId] {
        &self.dests
    }

    fn branch_target(&self, pc: Addr) -> Addr {
        match &self.inst {
            SynthInst::CondBranch { offset, .. }
            | SynthInst::Jump { offset }
            | SynthInst::Call { offset } => pc.wrapping_add_signed(*offset),
            _ => pc + self.size() as Addr,
        }
    }

    fn execute(&self, xc: &mut dyn ExecContext, pc: Addr) -> Fault {
        match &self.inst {
            SynthInst::Nop | SynthInst::Jump { .. } | SynthInst::MemBarrier => Fault::None,
            SynthInst::IntOp { dest, srcs, .. } => {
                let mut acc = 1u64;
                for &s in srcs {
                    acc = acc.wrapping_add(xc.read_int(s));
                }
                xc.set_int(*dest, acc);
                Fault::None
            }
            SynthInst::Load { dest, base, offset } => {
                let vaddr = xc.read_int(*base).wrapping_add_signed(*offset);
                let (val, fault) = xc.mem_read(vaddr, 8, 0);
                if !fault.is_fault() {
                    xc.set_int(*dest, val);
                }
                fault
            }
            SynthInst::Store { src, base, offset } => {
                let vaddr = xc.read_int(*base).wrapping_add_signed(*offset);
                let val = xc.read_int(*src);
                xc.mem_write(vaddr, val, 8, 0)
            }
            SynthInst::CondBranch { .. } => Fault::None,
            SynthInst::Call { .. } => {
                xc.set_int(LINK_REG, pc + self.size() as Addr);
                Fault::None
            }
            SynthInst::Return => Fault::None,
            SynthInst::Trap(fault) => *fault,
        }
    }

    fn disassemble(&self) -> String {
        match &self.inst {
            SynthInst::Nop => "nop".into(),
            SynthInst::IntOp { dest, srcs, class } => {
                format!("{class:?} r{dest}, {srcs:?}")
            }
            SynthInst::Load { dest, base, offset } => format!("ld r{dest}, {offset}(r{base})"),
            SynthInst::Store { src, base, offset } => format!("st r{src}, {offset}(r{base})"),
            SynthInst::CondBranch { src, offset } => format!("bnez r{src}, {offset}"),
            SynthInst::Jump { offset } => format!("j {offset}"),
            SynthInst::Call { offset } => format!("call {offset}"),
            SynthInst::Return => "ret".into(),
            SynthInst::MemBarrier => "membar".into(),
            SynthInst::Trap(fault) => format!("trap {fault:?}"),
        }
    }

    fn is_load(&self) -> bool {
        matches!(self.inst, SynthInst::Load { .. })
    }

    fn is_store(&self) -> bool {
        matches!(self.inst, SynthInst::Store { .. })
    }

    fn is_control(&self) -> bool {
        matches!(
            self.inst,
            SynthInst::CondBranch { .. }
                | SynthInst::Jump { .. }
                | SynthInst::Call { .. }
                | SynthInst::Return
        )
    }

    fn is_cond_ctrl(&self) -> bool {
        matches!(self.inst, SynthInst::CondBranch { .. })
    }

    fn is_uncond_ctrl(&self) -> bool {
        matches!(
            self.inst,
            SynthInst::Jump { .. } | SynthInst::Call { .. } | SynthInst::Return
        )
    }

    fn is_call(&self) -> bool {
        matches!(self.inst, SynthInst::Call { .. })
    }

    fn is_return(&self) -> bool {
        matches!(self.inst, SynthInst::Return)
    }

    fn is_mem_barrier(&self) -> bool {
        matches!(self.inst, SynthInst::MemBarrier)
    }

    fn is_non_speculative(&self) -> bool {
        matches!(self.inst, SynthInst::Trap(_))
    }

    fn branch_taken(&self, xc: &dyn ExecContext) -> bool {
        match &self.inst {
            SynthInst::CondBranch { src, .. } => xc.read_int(*src) != 0,
            _ => self.is_uncond_ctrl(),
        }
    }

    fn actual_target(&self, xc: &dyn ExecContext, pc: Addr) -> Addr {
        match &self.inst {
            SynthInst::Return => xc.read_int(LINK_REG),
            _ => self.branch_target(pc),
        }
    }

    fn mem_addr(&self, xc: &dyn ExecContext) -> Option<Addr> {
        match &self.inst {
            SynthInst::Load { base, offset, .. } | SynthInst::Store { base, offset, .. } => {
                Some(xc.read_int(*base).wrapping_add_signed(*offset))
            }
            _ => None,
        }
    }
}

/// A straight-line program of static instructions, addressed by PC.
#[derive(Clone)]
pub struct Program {
    base: Addr,
    insts: Vec<StaticInstPtr>,
}

impl Program {
    /// Builds a program starting at `base`.
    pub fn new(base: Addr, insts: Vec<StaticInstPtr>) -> Self {
        Self { base, insts }
    }

    /// First instruction address.
    #[inline]
    pub fn entry(&self) -> Addr {
        self.base
    }

    /// Number of instructions.
    pub fn len(&self) -> usize {
        self.insts.len()
    }

    /// True when the program has no instructions.
    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    /// Fetches the instruction at `pc`, if inside the program image.
    pub fn fetch(&self, pc: Addr) -> Option<StaticInstPtr> {
        if pc < self.base || (pc - self.base) % 4 != 0 {
            return None;
        }
        self.insts.get(((pc - self.base) / 4) as usize).cloned()
    }
}

/// A dynamic (in-flight) instruction.
#[derive(Debug, Clone)]
pub struct DynInst {
    /// Decoded instruction.
    pub static_inst: StaticInstPtr,
    /// Fetch-order sequence number, unique per core.
    pub fetch_seq: u64,
    /// Correct-path sequence number (not advanced on wrong-path fetches).
    pub cp_seq: u64,
    /// Issuing hardware thread.
    pub thread: ThreadId,
    /// Instruction address.
    pub pc: Addr,
    /// Architecturally next address, filled at execute.
    pub next_pc: Addr,
    /// Predicted next address.
    pub pred_pc: Addr,
    /// Predicted direction for conditional branches.
    pub pred_taken: bool,
    /// Actual direction, valid once executed.
    pub taken: bool,
    /// Effective virtual address for memory references.
    pub eff_addr: Addr,
    /// Effective physical address for memory references.
    pub phys_eff_addr: Addr,
    /// Readiness of each source operand.
    pub src_ready: Vec<bool>,
    /// Producing instructions this one still waits on.
    pub waiting_on: usize,
    /// Issued to a functional unit.
    pub issued: bool,
    /// Finished executing.
    pub executed: bool,
    /// Result written back and visible to consumers.
    pub completed: bool,
    /// Retired.
    pub committed: bool,
    /// Squashed by misprediction or fault recovery.
    pub squashed: bool,
    /// Fault raised at execute, delivered at commit.
    pub fault: Fault,
    /// Branch predictor snapshot for recovery, if a prediction was made.
    pub bp_update: Option<crate::cpu::bpred::BpUpdateRec>,
    /// Tick the instruction entered the machine.
    pub fetched_at: crate::common::Tick,
    /// Fetched down a mispredicted path; will never commit.
    pub wrong_path: bool,
    /// This control instruction was discovered mispredicted; recovery
    /// fires when it reaches writeback.
    pub mispredict: bool,
    /// Speculative memory blocks this instruction wrote (for undo).
    pub spec_blocks: Vec<crate::common::Addr>,
    /// Create-vector entries this instruction displaced at rename,
    /// restored in reverse order on squash.
    pub renamed: Vec<(RegId, Option<u64>)>,
}

impl DynInst {
    /// Creates an in-flight record for a fetched instruction.
    pub fn new(
        static_inst: StaticInstPtr,
        fetch_seq: u64,
        cp_seq: u64,
        thread: ThreadId,
        pc: Addr,
        fetched_at: crate::common::Tick,
    ) -> Self {
        let nsrc = static_inst.src_regs().len();
        Self {
            static_inst,
            fetch_seq,
            cp_seq,
            thread,
            pc,
            next_pc: pc + 4,
            pred_pc: pc + 4,
            pred_taken: false,
            taken: false,
            eff_addr: INVAL_ADDR,
            phys_eff_addr: INVAL_ADDR,
            src_ready: vec![false; nsrc],
            waiting_on: 0,
            issued: false,
            executed: false,
            completed: false,
            committed: false,
            squashed: false,
            fault: Fault::None,
            bp_update: None,
            fetched_at,
            wrong_path: false,
            mispredict: false,
            spec_blocks: Vec::new(),
            renamed: Vec::new(),
        }
    }

    /// True once every source operand is ready.
    #[inline]
    pub fn operands_ready(&self) -> bool {
        self.waiting_on == 0
    }

    /// True for loads and stores.
    #[inline]
    pub fn is_mem_ref(&self) -> bool {
        self.static_inst.is_load() || self.static_inst.is_store()
    }
}
