//! Integration test entry point.
//!
//! Cross-component scenarios live under `unit/`, organized by the
//! subsystem they exercise end to end.

mod unit;
