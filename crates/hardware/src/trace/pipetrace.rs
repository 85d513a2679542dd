//! Pipeline trace writer.
//!
//! Line format, emitted only while the cycle is inside the sampled range:
//!
//! ```text
//! @ <tick>
//! + <seq> <pc_hex> <addr_hex> <disasm>  [T<thread>, CP#<cpseq>]
//! * <seq> <stage> <events_hex> <miss_lat> <longest_hex>  [T<thread>, CP#<cpseq>]
//! - <seq>  [T<thread>, CP#<cpseq>]
//! ```
//!
//! Stages are `IF, DA, EX, WB, CT`, in that order for every instruction.

use std::io::Write;

use crate::common::{INVAL_ADDR, Tick};
use crate::cpu::inst::DynInst;

/// Pipeline stage identifiers in trace order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PipeStage {
    /// Instruction fetch.
    Fetch,
    /// Dispatch/allocate.
    Dispatch,
    /// Execute.
    Execute,
    /// Writeback.
    Writeback,
    /// Commit.
    Commit,
}

impl PipeStage {
    fn name(self) -> &'static str {
        match self {
            PipeStage::Fetch => "IF",
            PipeStage::Dispatch => "DA",
            PipeStage::Execute => "EX",
            PipeStage::Writeback => "WB",
            PipeStage::Commit => "CT",
        }
    }
}

/// Pipe trace over a sampled cycle range.
pub struct PipeTrace {
    sink: Box<dyn Write>,
    first: Tick,
    last: Tick,
    active: bool,
    exit_when_done: bool,
    done: bool,
}

impl PipeTrace {
    /// Creates a trace writing to `sink`, sampling `[first, last]`.
    pub fn new(sink: Box<dyn Write>, first: Tick, last: Tick, exit_when_done: bool) -> Self {
        Self {
            sink,
            first,
            last,
            active: false,
            exit_when_done,
            done: false,
        }
    }

    /// Call once per cycle; emits the cycle marker while sampling.
    /// Returns true when the range has been passed and the trace asked
    /// the simulation to stop.
    pub fn new_cycle(&mut self, cycle: Tick) -> bool {
        if cycle >= self.first && cycle <= self.last {
            self.active = true;
            let _ = writeln!(self.sink, "@ {cycle}");
        } else {
            self.active = false;
            if cycle > self.last && !self.done {
                self.done = true;
                let _ = self.sink.flush();
                return self.exit_when_done;
            }
        }
        false
    }

    /// Records a newly fetched instruction.
    pub fn new_inst(&mut self, inst: &DynInst) {
        if !self.active {
            return;
        }
        let addr = if inst.eff_addr == INVAL_ADDR {
            0
        } else {
            inst.eff_addr
        };
        let _ = writeln!(
            self.sink,
            "+ {} 0x{:x} 0x{:016x} {}  [T{}, CP#{}]",
            inst.fetch_seq,
            inst.pc,
            addr,
            inst.static_inst.disassemble(),
            inst.thread,
            inst.cp_seq,
        );
    }

    /// Records a stage transition.
    pub fn move_inst(
        &mut self,
        inst: &DynInst,
        stage: PipeStage,
        events: u32,
        miss_latency: u32,
        longest_event: u32,
    ) {
        if !self.active {
            return;
        }
        let lat = if events != 0 { miss_latency } else { 0 };
        let _ = writeln!(
            self.sink,
            "* {} {} 0x{:04x} {} 0x{:04x}  [T{}, CP#{}]",
            inst.fetch_seq,
            stage.name(),
            events,
            lat,
            longest_event,
            inst.thread,
            inst.cp_seq,
        );
    }

    /// Records an instruction leaving the machine (commit or squash).
    pub fn delete_inst(&mut self, inst: &DynInst) {
        if !self.active {
            return;
        }
        let _ = writeln!(
            self.sink,
            "- {}  [T{}, CP#{}]",
            inst.fetch_seq, inst.thread, inst.cp_seq,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::inst::{DynInst, SynthInst, SynthStatic};
    use std::cell::RefCell;
    use std::rc::Rc;

    struct SharedSink(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn capture() -> (Rc<RefCell<Vec<u8>>>, Box<dyn Write>) {
        let buf = Rc::new(RefCell::new(Vec::new()));
        (buf.clone(), Box::new(SharedSink(buf)))
    }

    fn inst(seq: u64) -> DynInst {
        DynInst::new(SynthStatic::new(SynthInst::Nop), seq, seq, 0, 0x1000, 0)
    }

    #[test]
    fn emits_all_four_record_kinds_inside_range() {
        let (buf, sink) = capture();
        let mut trace = PipeTrace::new(sink, 10, 20, false);
        let i = inst(7);

        assert!(!trace.new_cycle(10));
        trace.new_inst(&i);
        trace.move_inst(&i, PipeStage::Dispatch, 0, 0, 0);
        trace.delete_inst(&i);

        let text = String::from_utf8(buf.borrow().clone()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "@ 10");
        assert!(lines[1].starts_with("+ 7 0x1000 0x0000000000000000 nop"));
        assert!(lines[1].ends_with("[T0, CP#7]"));
        assert!(lines[2].starts_with("* 7 DA 0x0000 0 0x0000"));
        assert!(lines[3].starts_with("- 7"));
    }

    #[test]
    fn silent_outside_range() {
        let (buf, sink) = capture();
        let mut trace = PipeTrace::new(sink, 10, 20, false);
        assert!(!trace.new_cycle(5));
        trace.new_inst(&inst(1));
        assert!(buf.borrow().is_empty());
    }

    #[test]
    fn exit_mode_requests_stop_past_range() {
        let (_, sink) = capture();
        let mut trace = PipeTrace::new(sink, 10, 20, true);
        assert!(!trace.new_cycle(15));
        assert!(trace.new_cycle(21));
        // The stop is only requested once.
        assert!(!trace.new_cycle(22));
    }
}
