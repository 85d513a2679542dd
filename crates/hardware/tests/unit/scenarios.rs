//! Full-system scenarios: cores, caches, buses, and DRAM together.

use cmpsim_core::Config;
use cmpsim_core::Simulator;
use cmpsim_core::cpu::inst::{OpClass, Program, SynthInst, SynthStatic};

fn nops(n: usize) -> Program {
    Program::new(
        0x1000,
        (0..n).map(|_| SynthStatic::new(SynthInst::Nop)).collect(),
    )
}

fn streaming_loads(n: usize, stride: i64) -> Program {
    Program::new(
        0x1000,
        (0..n)
            .map(|i| {
                SynthStatic::new(SynthInst::Load {
                    dest: 2,
                    base: 1,
                    offset: i as i64 * stride,
                })
            })
            .collect(),
    )
}

#[test]
fn nop_workload_commits_everything_through_the_full_system() {
    // 1024 NOPs through real caches: instruction misses cost real
    // round trips, but every instruction still commits.
    let mut config = Config::default();
    config.general.end_tick = 60_000;
    let mut sim = Simulator::new(config).unwrap();
    sim.load_program(0, 0, nops(1024));
    let stats = sim.run().unwrap();
    assert_eq!(stats.cores[0].committed_total(), 1024);
    // The I-stream touched 64-byte lines; misses went below the L1.
    assert!(stats.l1i[0].misses > 0);
    assert!(stats.dram.reads > 0);
}

#[test]
fn a_single_load_miss_travels_to_dram_and_back() {
    let mut config = Config::default();
    config.general.end_tick = 20_000;
    let mut sim = Simulator::new(config).unwrap();
    sim.load_program(0, 0, streaming_loads(1, 64));
    sim.cores[0].contexts[0].set_arch_int(1, 0x10_0000);
    let stats = sim.run().unwrap();
    assert_eq!(stats.cores[0].committed_total(), 1);
    assert_eq!(stats.cores[0].loads, 1);
    assert_eq!(stats.l1d[0].misses, 1);
    // One instruction line plus one data line from DRAM.
    assert!(stats.dram.reads >= 2);
    // The round trip was attributed to latency components.
    let lat = &stats.avg_latency[0];
    assert!(lat[0] > 0.0, "no shared latency recorded");
}

#[test]
fn streaming_scan_reuses_open_dram_pages() {
    // Sequential lines in the same DRAM page: after the first activate,
    // subsequent fetches are open-page hits.
    let mut config = Config::default();
    config.general.end_tick = 120_000;
    config.cache.llc.size_bytes = 64 * 1024; // keep the LLC small
    let mut sim = Simulator::new(config).unwrap();
    sim.load_program(0, 0, streaming_loads(64, 64));
    sim.cores[0].contexts[0].set_arch_int(1, 0x10_0000);
    let stats = sim.run().unwrap();
    assert_eq!(stats.cores[0].committed_total(), 64);
    let hits = stats.dram.page_hits[0];
    let misses = stats.dram.page_misses[0];
    assert!(hits > 0, "no open-page hits: {hits} hits, {misses} misses");
}

#[test]
fn dependent_chain_still_commits_with_real_memory() {
    let mut config = Config::default();
    config.general.end_tick = 30_000;
    let mut sim = Simulator::new(config).unwrap();
    let prog = Program::new(
        0x1000,
        (0..64)
            .map(|i| {
                SynthStatic::new(SynthInst::IntOp {
                    dest: 1 + (i % 4),
                    srcs: vec![1 + ((i + 3) % 4)],
                    class: OpClass::IntAlu,
                })
            })
            .collect(),
    );
    sim.load_program(0, 0, prog);
    let stats = sim.run().unwrap();
    assert_eq!(stats.cores[0].committed_total(), 64);
}

#[test]
fn branchy_loop_commits_and_trains_the_predictor() {
    let mut config = Config::default();
    config.general.end_tick = 60_000;
    let mut sim = Simulator::new(config).unwrap();
    let prog = Program::new(
        0x1000,
        vec![
            SynthStatic::new(SynthInst::IntOp {
                dest: 1,
                srcs: vec![1, 2],
                class: OpClass::IntAlu,
            }),
            SynthStatic::new(SynthInst::CondBranch { src: 1, offset: -4 }),
        ],
    );
    sim.load_program(0, 0, prog);
    sim.cores[0].contexts[0].set_arch_int(1, 100);
    sim.cores[0].contexts[0].set_arch_int(2, (-2i64) as u64);
    let stats = sim.run().unwrap();
    // 100 decrements + 100 branches.
    assert_eq!(stats.cores[0].committed_total(), 200);
    let cond: u64 = stats.bpred[0].cond_predicted.iter().sum();
    let correct: u64 = stats.bpred[0].cond_correct.iter().sum();
    assert_eq!(cond, 100);
    // A backward loop branch trains quickly; most predictions land.
    assert!(correct * 10 >= cond * 8, "{correct}/{cond} correct");
}

#[test]
fn two_cores_share_the_memory_system() {
    let mut config = Config::default();
    config.general.cpu_count = 2;
    config.general.end_tick = 100_000;
    let mut sim = Simulator::new(config).unwrap();
    sim.load_program(0, 0, streaming_loads(128, 64));
    sim.load_program(1, 0, streaming_loads(128, 64));
    sim.cores[0].contexts[0].set_arch_int(1, 0x10_0000);
    sim.cores[1].contexts[0].set_arch_int(1, 0x80_0000);
    let stats = sim.run().unwrap();
    assert_eq!(stats.cores[0].committed_total(), 128);
    assert_eq!(stats.cores[1].committed_total(), 128);
    // Both cores generated DRAM traffic over shared banks.
    assert!(stats.dram.requests_per_cpu[0] > 0);
    assert!(stats.dram.requests_per_cpu[1] > 0);
}
