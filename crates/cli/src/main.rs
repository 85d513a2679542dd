//! Command-line front end for the simulator.
//!
//! Loads a JSON configuration (or the defaults), builds one of the
//! bundled synthetic workloads onto every core, runs to the configured
//! end tick, and prints the statistics report.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};

use cmpsim_core::Config;
use cmpsim_core::Simulator;
use cmpsim_core::cpu::inst::{OpClass, Program, SynthInst, SynthStatic};
use cmpsim_core::trace::{DramTrace, PipeTrace};

/// Bundled synthetic workloads.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Workload {
    /// Independent NOPs; measures front-end width.
    Nops,
    /// A dependent integer chain; measures backend latency.
    Chain,
    /// A streaming load scan; stresses caches and DRAM.
    Stream,
    /// A tight conditional loop; exercises branch prediction.
    Loop,
}

#[derive(Parser, Debug)]
#[command(name = "cmpsim", about = "Cycle-accurate CMP timing simulator", version)]
struct Args {
    /// JSON configuration file; defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Workload to run on every core.
    #[arg(short, long, value_enum, default_value_t = Workload::Stream)]
    workload: Workload,

    /// Instructions per workload instance.
    #[arg(short = 'n', long, default_value_t = 10_000)]
    length: usize,

    /// Override the end tick.
    #[arg(long)]
    end_tick: Option<u64>,

    /// Directory for trace files (DRAM access trace, pipe trace, and
    /// per-core latency/interference traces).
    #[arg(long)]
    trace_dir: Option<PathBuf>,
}

fn build_workload(kind: Workload, length: usize, cpu: usize) -> Program {
    let base = 0x1000;
    let insts = match kind {
        Workload::Nops => (0..length).map(|_| SynthStatic::new(SynthInst::Nop)).collect(),
        Workload::Chain => (0..length)
            .map(|i| {
                SynthStatic::new(SynthInst::IntOp {
                    dest: 1 + (i % 8),
                    srcs: vec![1 + ((i + 7) % 8)],
                    class: OpClass::IntAlu,
                })
            })
            .collect(),
        Workload::Stream => {
            // r1 walks a per-core region one word per load.
            let mut insts = Vec::with_capacity(length);
            for i in 0..length {
                insts.push(SynthStatic::new(SynthInst::Load {
                    dest: 2,
                    base: 1,
                    offset: (i as i64) * 8,
                }));
            }
            let _ = cpu;
            insts
        }
        Workload::Loop => {
            // r1 counts down; the backward branch is taken until zero.
            vec![
                SynthStatic::new(SynthInst::IntOp {
                    dest: 1,
                    srcs: vec![1, 2],
                    class: OpClass::IntAlu,
                }),
                SynthStatic::new(SynthInst::CondBranch { src: 1, offset: -4 }),
            ]
        }
    };
    Program::new(base, insts)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config: Config = match &args.config {
        Some(path) => {
            let text = match fs::read_to_string(path) {
                Ok(text) => text,
                Err(err) => {
                    eprintln!("cmpsim: cannot read {}: {err}", path.display());
                    return ExitCode::from(2);
                }
            };
            match serde_json::from_str(&text) {
                Ok(config) => config,
                Err(err) => {
                    eprintln!("cmpsim: bad configuration: {err}");
                    return ExitCode::from(2);
                }
            }
        }
        None => Config::default(),
    };
    if let Some(end) = args.end_tick {
        config.general.end_tick = end;
    }

    let cpu_count = config.general.cpu_count;
    let dram_trace_enabled = config.general.dram_trace || args.trace_dir.is_some();
    let pipetrace_range = config.general.pipetrace_range;
    let mut sim = match Simulator::new(config) {
        Ok(sim) => sim,
        Err(err) => {
            eprintln!("cmpsim: {err}");
            return ExitCode::from(2);
        }
    };

    if let Some(dir) = &args.trace_dir {
        if let Err(err) = fs::create_dir_all(dir) {
            eprintln!("cmpsim: cannot create {}: {err}", dir.display());
            return ExitCode::from(2);
        }
        let open = |name: &str| fs::File::create(dir.join(name));
        match (open("latency_trace.csv"), open("interference_trace.csv")) {
            (Ok(lat), Ok(est)) => {
                sim.mem.intman.attach_traces(Box::new(lat), Box::new(est));
            }
            (Err(err), _) | (_, Err(err)) => {
                eprintln!("cmpsim: cannot open trace file: {err}");
                return ExitCode::from(2);
            }
        }
        if dram_trace_enabled {
            match open("dram_access_trace.csv") {
                Ok(file) => sim.mem.dram_trace = Some(DramTrace::new(Box::new(file))),
                Err(err) => {
                    eprintln!("cmpsim: cannot open dram trace: {err}");
                    return ExitCode::from(2);
                }
            }
        }
        if let Some((first, last)) = pipetrace_range {
            match open("pipetrace.txt") {
                Ok(file) => {
                    sim.cores[0].pipetrace =
                        Some(PipeTrace::new(Box::new(file), first, last, false));
                }
                Err(err) => {
                    eprintln!("cmpsim: cannot open pipe trace: {err}");
                    return ExitCode::from(2);
                }
            }
        }
    }

    for cpu in 0..cpu_count {
        let program = build_workload(args.workload, args.length, cpu);
        sim.load_program(cpu, 0, program);
        // Seed stream bases so cores touch distinct regions.
        sim.cores[cpu].contexts[0].set_arch_int(1, 0x10_0000 + (cpu as u64) * 0x10_0000);
        sim.cores[cpu].contexts[0].set_arch_int(2, (-2i64) as u64);
    }

    match sim.run() {
        Ok(stats) => {
            println!("{}", stats.report());
            ExitCode::from(u8::try_from(sim.exit_code()).unwrap_or(1))
        }
        Err(err) => {
            eprintln!("cmpsim: simulation aborted: {err}");
            ExitCode::from(1)
        }
    }
}
