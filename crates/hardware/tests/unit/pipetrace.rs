//! Pipe-trace faithfulness through the full system.
//!
//! Between the `+` and `-` lines of a sequence number, every stage
//! transition appears as a `*` line in the five-stage order with
//! non-decreasing ticks.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Write;
use std::rc::Rc;

use cmpsim_core::Config;
use cmpsim_core::Simulator;
use cmpsim_core::cpu::inst::{Program, SynthInst, SynthStatic};
use cmpsim_core::trace::PipeTrace;

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

fn stage_rank(stage: &str) -> Option<usize> {
    ["IF", "DA", "EX", "WB", "CT"]
        .iter()
        .position(|&s| s == stage)
}

#[test]
fn stage_lines_are_ordered_with_nondecreasing_ticks() {
    let mut config = Config::default();
    config.general.end_tick = 20_000;
    let mut sim = Simulator::new(config).unwrap();
    sim.load_program(
        0,
        0,
        Program::new(
            0x1000,
            (0..32).map(|_| SynthStatic::new(SynthInst::Nop)).collect(),
        ),
    );

    let buf = Rc::new(RefCell::new(Vec::new()));
    sim.cores[0].pipetrace = Some(PipeTrace::new(
        Box::new(SharedSink(buf.clone())),
        1,
        10_000,
        false,
    ));

    let stats = sim.run().unwrap();
    assert_eq!(stats.cores[0].committed_total(), 32);

    let text = String::from_utf8(buf.borrow().clone()).unwrap();
    let mut now = 0u64;
    let mut created: HashMap<u64, bool> = HashMap::new();
    let mut deleted: HashMap<u64, bool> = HashMap::new();
    // Per sequence number: (last stage rank, last tick).
    let mut last: HashMap<u64, (usize, u64)> = HashMap::new();

    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.first() {
            Some(&"@") => {
                let tick: u64 = fields[1].parse().unwrap();
                assert!(tick >= now, "cycle markers went backwards");
                now = tick;
            }
            Some(&"+") => {
                let seq: u64 = fields[1].parse().unwrap();
                assert!(!created.contains_key(&seq), "duplicate + for {seq}");
                let _ = created.insert(seq, true);
            }
            Some(&"*") => {
                let seq: u64 = fields[1].parse().unwrap();
                assert!(created.contains_key(&seq), "* before + for {seq}");
                assert!(!deleted.contains_key(&seq), "* after - for {seq}");
                let rank = stage_rank(fields[2]).unwrap_or_else(|| {
                    panic!("unknown stage {} in: {line}", fields[2]);
                });
                if let Some(&(prev_rank, prev_tick)) = last.get(&seq) {
                    assert!(
                        rank >= prev_rank,
                        "seq {seq} moved backwards: {prev_rank} -> {rank}"
                    );
                    assert!(now >= prev_tick, "seq {seq} ticks went backwards");
                }
                let _ = last.insert(seq, (rank, now));
            }
            Some(&"-") => {
                let seq: u64 = fields[1].parse().unwrap();
                assert!(created.contains_key(&seq), "- before + for {seq}");
                let _ = deleted.insert(seq, true);
            }
            _ => {}
        }
    }

    // Everything created inside the range was eventually deleted, and
    // committed instructions walked all five stages.
    assert!(!created.is_empty(), "trace recorded nothing");
    let full_walks = last
        .values()
        .filter(|&&(rank, _)| rank == stage_rank("CT").unwrap_or(4))
        .count();
    assert!(full_walks > 0, "no instruction reached CT in the trace");
}
