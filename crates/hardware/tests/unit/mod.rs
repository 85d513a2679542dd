//! Cross-component scenario tests.

mod interference;
mod pipetrace;
mod properties;
mod scenarios;
