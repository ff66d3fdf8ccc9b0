//! Deterministic exerciser for a hugepage-aware page allocator.
//!
//! An input is a 13-byte header followed by 9-byte operation frames. The
//! header configures a fresh allocator instance, the frames drive it, and
//! every step is checked against an independent ledger of live spans.
//! [`driver::fuzz_one_input`] is the libFuzzer entry point.

extern crate libc;

pub mod config;
pub mod driver;
pub mod frame;
pub mod header;
pub mod interpreter;
pub mod invariant;
pub mod ledger;
pub mod subject;
pub mod sync;
pub mod util;

pub use driver::{fuzz_one_input, run_one_input, run_with, RunOutcome, RunReport};
pub use invariant::InvariantViolation;
