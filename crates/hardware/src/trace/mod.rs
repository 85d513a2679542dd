//! Observability traces.
//!
//! Two line-oriented text traces:
//! 1. **Pipe trace:** per-instruction stage movement over a sampled
//!    cycle range.
//! 2. **DRAM access trace:** CSV of every data command's bank outcome.
//!
//! Both write through [`std::io::Write`] sinks so tests capture them in
//! memory and the CLI writes files.

mod dram_trace;
mod pipetrace;

pub use dram_trace::DramTrace;
pub use pipetrace::{PipeStage, PipeTrace};
