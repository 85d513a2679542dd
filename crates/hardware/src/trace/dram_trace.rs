//! DRAM access trace.
//!
//! CSV with one row per data command serviced by the bank model:
//! `Address, Bank, Result, InsertedAt, OldAddress, Seq, Cmd`.

use std::io::Write;

use crate::common::{Addr, INVAL_ADDR, Tick};
use crate::mem::req::{DramResult, MemReq};

/// DRAM access trace writer.
pub struct DramTrace {
    sink: Box<dyn Write>,
}

impl DramTrace {
    /// Creates a trace and writes the header row.
    pub fn new(mut sink: Box<dyn Write>) -> Self {
        let _ = writeln!(sink, "Address,Bank,Result,InsertedAt,OldAddress,Seq,Cmd");
        Self { sink }
    }

    /// Records one serviced data command.
    pub fn record(&mut self, req: &MemReq, bank: usize, result: DramResult, _now: Tick) {
        let old: Addr = if req.old_addr == INVAL_ADDR {
            0
        } else {
            req.old_addr
        };
        let _ = writeln!(
            self.sink,
            "{},{},{},{},{},{},{}",
            req.paddr,
            bank,
            result.as_str(),
            req.inserted_into_memctrl,
            old,
            req.memctrl_seq,
            req.cmd.as_str(),
        );
    }

    /// Flushes the sink.
    pub fn flush(&mut self) {
        let _ = self.sink.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::req::MemCmd;
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

    #[test]
    fn rows_follow_the_header_columns() {
        let buf = Rc::new(RefCell::new(Vec::new()));
        let mut trace = DramTrace::new(Box::new(SharedSink(buf.clone())));
        let mut req = MemReq::new(MemCmd::Read, 0x4000, 64, 0, 100);
        req.inserted_into_memctrl = 90;
        req.memctrl_seq = 3;
        trace.record(&req, 2, DramResult::Hit, 120);

        let text = String::from_utf8(buf.borrow().clone()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Address,Bank,Result,InsertedAt,OldAddress,Seq,Cmd");
        assert_eq!(lines[1], "16384,2,hit,90,0,3,read");
    }
}
