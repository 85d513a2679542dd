//! Shared memory system: requests, caches, buses, DRAM, accounting.

/// Interference accounting and policy hooks.
pub mod accounting;
/// Split-transaction buses and the bus bridge.
pub mod bus;
/// Caches, MSHRs, coherence, and shadow tags.
pub mod cache;
/// DDR2 banks and the memory controller.
pub mod dram;
/// Memory request representation.
pub mod req;
