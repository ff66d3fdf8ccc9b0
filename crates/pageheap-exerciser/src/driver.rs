//! Top-level entry points.
//!
//! One call runs one input from start to finish: gate on length, decode the
//! header, construct a fresh subject, dispatch every frame, hand back
//! whatever is still live, and check that the subject ends up with nothing
//! in use.

use crate::config::RuntimeConfig;
use crate::frame::frames;
use crate::header::{decode_header, HEADER_LEN};
use crate::interpreter::{Interpreter, OpCounts};
use crate::invariant::{check_accounting, check_drained, fatal, InvariantViolation};
use crate::subject::{self, BackingStats, HugePageAwareAllocator, PageAllocator, SubjectConfig};
use crate::sync::pageheap_lock;
use crate::util::Length;
use tracing::{debug, info};

/// Shorter inputs have no complete header.
pub const MIN_INPUT_LEN: usize = HEADER_LEN;

/// Longer inputs are ignored.
pub const MAX_INPUT_LEN: usize = 100_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The input length was out of range; nothing ran.
    Skipped,
    Completed(RunReport),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub config: SubjectConfig,
    pub ops: OpCounts,
    /// Largest number of spans live at once.
    pub peak_live_spans: usize,
    /// Spans still live when the operations ran out.
    pub forced_releases: usize,
    /// Subject stats after cleanup.
    pub final_stats: BackingStats,
    /// Bytes after the last whole frame.
    pub trailing_bytes: usize,
}

/// Run `data` against the default subject with the process configuration.
pub fn run_one_input(data: &[u8]) -> Result<RunOutcome, InvariantViolation> {
    run_with::<HugePageAwareAllocator>(data, RuntimeConfig::global())
}

/// Run `data` against a fresh `A`.
pub fn run_with<A: PageAllocator>(
    data: &[u8],
    runtime: &RuntimeConfig,
) -> Result<RunOutcome, InvariantViolation> {
    if !(MIN_INPUT_LEN..=MAX_INPUT_LEN).contains(&data.len()) {
        debug!(len = data.len(), "input length out of range, skipping");
        return Ok(RunOutcome::Skipped);
    }
    let Some((header, body)) = data.split_first_chunk::<HEADER_LEN>() else {
        return Ok(RunOutcome::Skipped);
    };
    let config = decode_header(header, runtime.numa_partitions);
    debug!(?config, "decoded header");

    // Dropping the box frees the storage only; the subject is never torn down.
    let subject = subject::construct::<A>(&config);
    let mut interp = Interpreter::new(&*subject, runtime.scratch_bytes);

    let ops = frames(body);
    let trailing_bytes = ops.remainder().len();
    interp.run(ops)?;

    let forced_releases = interp.release_all()?;
    check_drained(interp.ledger().allocated())?;
    let final_stats = {
        let guard = pageheap_lock();
        subject.stats(&guard)
    };
    check_accounting(&final_stats, Length::ZERO)?;

    let report = RunReport {
        config,
        ops: interp.counts(),
        peak_live_spans: interp.peak_live_spans(),
        forced_releases,
        final_stats,
        trailing_bytes,
    };
    info!(
        tag = %report.config.tag,
        ops = report.ops.total(),
        peak_live_spans = report.peak_live_spans,
        forced_releases = report.forced_releases,
        system_bytes = report.final_stats.system_bytes,
        "run complete"
    );
    Ok(RunOutcome::Completed(report))
}

/// libFuzzer entry point. Any violation terminates the process.
pub fn fuzz_one_input(data: &[u8]) -> i32 {
    match run_one_input(data) {
        Ok(_) => 0,
        Err(violation) => fatal(&violation),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{encode_frame, OP_ALLOCATE, OP_CHECK_STATS};

    fn input(header: [u8; HEADER_LEN], frames: &[(u8, u64)]) -> Vec<u8> {
        let mut data = header.to_vec();
        for &(opcode, value) in frames {
            data.extend_from_slice(&encode_frame(opcode, value));
        }
        data
    }

    #[test]
    fn length_gate() {
        let runtime = RuntimeConfig::default();
        for len in [0, 1, 12, MAX_INPUT_LEN + 1] {
            let data = vec![0u8; len];
            assert_eq!(
                run_with::<HugePageAwareAllocator>(&data, &runtime),
                Ok(RunOutcome::Skipped),
                "len {len}"
            );
        }
    }

    #[test]
    fn header_only_input_runs_no_ops() {
        let runtime = RuntimeConfig::default();
        let outcome = run_with::<HugePageAwareAllocator>(&[0u8; HEADER_LEN], &runtime).unwrap();
        let RunOutcome::Completed(report) = outcome else {
            panic!("header-only input was skipped");
        };
        assert_eq!(report.ops.total(), 0);
        assert_eq!(report.final_stats, BackingStats::default());
    }

    #[test]
    fn leftover_spans_are_forced_back() {
        let runtime = RuntimeConfig::default();
        let mut data = input(
            [3, 0, 100, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
            &[
                (OP_ALLOCATE, (1 << 48) | 5),
                (OP_ALLOCATE, (2 << 32) | 7),
                (OP_CHECK_STATS, 0),
            ],
        );
        data.extend_from_slice(&[9, 9, 9]);
        let RunOutcome::Completed(report) = run_with::<HugePageAwareAllocator>(&data, &runtime)
            .unwrap()
        else {
            panic!("skipped");
        };
        assert_eq!(report.forced_releases, 2);
        assert_eq!(report.peak_live_spans, 2);
        assert_eq!(report.trailing_bytes, 3);
        assert_eq!(report.ops.get(OP_ALLOCATE), 2);
        let s = report.final_stats;
        assert_eq!(s.system_bytes - s.free_bytes - s.unmapped_bytes, 0);
    }

    #[test]
    fn fuzz_entry_returns_zero() {
        assert_eq!(fuzz_one_input(&[]), 0);
        assert_eq!(fuzz_one_input(&input([0; HEADER_LEN], &[(OP_CHECK_STATS, 0)])), 0);
    }
}
