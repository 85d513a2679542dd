//! Interference accounting and adaptive policy hooks.
//!
//! The interference manager is the process-wide service that attributes
//! shared-mode latency to components and estimates alone-mode latency;
//! policy modules consume periodic performance measurements and return
//! resource quotas.

mod adaptive_mha;
mod interference_manager;
mod performance;

pub use adaptive_mha::{AdaptiveMha, AdaptiveMhaConfig};
pub use interference_manager::InterferenceManager;
pub use performance::{NoPolicy, PerformanceMeasurement, Policy, PolicyDecision};
