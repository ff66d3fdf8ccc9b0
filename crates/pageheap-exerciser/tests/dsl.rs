//! End-to-end properties of the byte-stream interpreter, run against the
//! default page heap.

use pageheap_exerciser::config::RuntimeConfig;
use pageheap_exerciser::driver::{run_with, RunOutcome, RunReport, MAX_INPUT_LEN};
use pageheap_exerciser::frame::{
    encode_frame, frames, Op, MAX_REQUEST_PAGES, OP_ALLOCATE, OP_CHECK_STATS, OP_DEALLOCATE,
    OP_PRINT, OP_PRINT_PBTXT, OP_RELEASE, OP_RELEASE_BREAKING,
};
use pageheap_exerciser::header::HEADER_LEN;
use pageheap_exerciser::interpreter::Interpreter;
use pageheap_exerciser::subject::{self, HugePageAwareAllocator, PageAllocator, SubjectConfig};
use pageheap_exerciser::sync::pageheap_lock;
use pageheap_exerciser::util::{Length, PAGE_SIZE};

const PLAIN: u64 = 1 << 48;

/// Simple seeded PRNG
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    fn bytes(&mut self, n: usize) -> Vec<u8> {
        (0..n).map(|_| self.next() as u8).collect()
    }
}

fn run(data: &[u8]) -> RunOutcome {
    run_with::<HugePageAwareAllocator>(data, &RuntimeConfig::default())
        .unwrap_or_else(|v| panic!("violation: {v}"))
}

fn completed(data: &[u8]) -> RunReport {
    match run(data) {
        RunOutcome::Completed(report) => report,
        RunOutcome::Skipped => panic!("input of {} bytes was skipped", data.len()),
    }
}

fn input(header: [u8; HEADER_LEN], ops: &[(u8, u64)]) -> Vec<u8> {
    let mut data = header.to_vec();
    for &(opcode, value) in ops {
        data.extend_from_slice(&encode_frame(opcode, value));
    }
    data
}

#[test]
fn out_of_range_lengths_do_nothing() {
    assert_eq!(run(&[]), RunOutcome::Skipped);
    assert_eq!(run(&[0xFF; HEADER_LEN - 1]), RunOutcome::Skipped);
    assert_eq!(run(&vec![0u8; MAX_INPUT_LEN + 1]), RunOutcome::Skipped);
    assert!(matches!(run(&[0; HEADER_LEN]), RunOutcome::Completed(_)));
}

#[test]
fn longest_accepted_input_runs() {
    let mut rng = Rng(7);
    let data = rng.bytes(MAX_INPUT_LEN);
    let report = completed(&data);
    assert_eq!(
        report.ops.total() as usize,
        (MAX_INPUT_LEN - HEADER_LEN) / 9
    );
}

#[test]
fn replay_is_deterministic() {
    for seed in 0..32 {
        let mut rng = Rng(seed);
        let len = HEADER_LEN + (rng.next() as usize % 4000);
        let data = rng.bytes(len);
        assert_eq!(completed(&data), completed(&data), "seed {seed}");
    }
}

#[test]
fn every_header_decodes() {
    for b in 0..=255u8 {
        let mut header = [b; HEADER_LEN];
        header[4] = b.wrapping_mul(31);
        let report = completed(&input(
            header,
            &[
                (OP_ALLOCATE, PLAIN | (u64::from(b) << 16) | 9),
                (OP_CHECK_STATS, 0),
            ],
        ));
        assert_eq!(report.forced_releases, 1);
        assert_eq!(report.config.reserved, [b; 8]);
    }
}

#[test]
fn clamped_requests_for_every_raw_value() {
    for raw in 0..=u16::MAX as u64 {
        match Op::from_parts(OP_ALLOCATE, (raw << 32) | raw) {
            Op::Allocate {
                length,
                align: Some(align),
                ..
            } => {
                let expected = raw.clamp(1, MAX_REQUEST_PAGES as u64) as usize;
                assert_eq!(length.raw_num(), expected);
                assert_eq!(align.raw_num(), expected);
            }
            op => panic!("unexpected {op:?}"),
        }
    }
}

#[test]
fn ledger_balances_after_any_sequence() {
    let config = SubjectConfig::default();
    for seed in 100..120 {
        let mut rng = Rng(seed);
        let body = rng.bytes(9 * 300);
        let a = subject::construct::<HugePageAwareAllocator>(&config);
        let mut interp = Interpreter::new(&*a, 1 << 12);

        let mut granted = Length::ZERO;
        let mut released = Length::ZERO;
        for op in frames(&body) {
            let before = interp.ledger().allocated();
            interp.step(op).unwrap();
            let after = interp.ledger().allocated();
            if after > before {
                granted += after - before;
            } else {
                released += before - after;
            }
        }
        assert_eq!(granted - released, interp.ledger().allocated());
        let live: usize = interp
            .ledger()
            .spans()
            .iter()
            .map(|s| s.span.num_pages().raw_num())
            .sum();
        assert_eq!(live, interp.ledger().allocated().raw_num());

        interp.release_all().unwrap();
        assert!(interp.ledger().allocated().is_zero());
    }
}

#[test]
fn allocate_five_pages_then_check() {
    let report = completed(&input(
        [0; HEADER_LEN],
        &[(OP_ALLOCATE, PLAIN | (3 << 16) | 5), (OP_CHECK_STATS, 0)],
    ));
    assert_eq!(report.ops.get(OP_ALLOCATE), 1);
    assert_eq!(report.forced_releases, 1);
}

#[test]
fn breaking_release_reclaims_freed_pages() {
    let a = subject::construct::<HugePageAwareAllocator>(&SubjectConfig::default());
    let mut interp = Interpreter::new(&*a, 1 << 12);
    let body = input(
        [0; HEADER_LEN],
        &[
            (OP_ALLOCATE, PLAIN | 40),
            (OP_ALLOCATE, PLAIN | 8),
            (OP_DEALLOCATE, 0),
        ],
    );
    interp.run(frames(&body[HEADER_LEN..])).unwrap();

    let unmapped_before = {
        let guard = pageheap_lock();
        a.stats(&guard).unmapped_bytes
    };
    interp
        .step(Op::ReleaseBreaking {
            pages: Length::new(40),
        })
        .unwrap();
    let guard = pageheap_lock();
    let stats = a.stats(&guard);
    assert!(stats.unmapped_bytes - unmapped_before >= 40 * PAGE_SIZE as u64);
    drop(guard);
    interp.release_all().unwrap();
}

#[test]
fn deallocate_with_nothing_live_is_a_no_op() {
    let report = completed(&input(
        [0; HEADER_LEN],
        &[
            (OP_DEALLOCATE, u64::MAX),
            (OP_DEALLOCATE, 0),
            (OP_CHECK_STATS, 0),
        ],
    ));
    assert_eq!(report.ops.get(OP_DEALLOCATE), 2);
    assert_eq!(report.peak_live_spans, 0);
    assert_eq!(report.final_stats.system_bytes, 0);
}

#[test]
fn mixed_workload_under_every_region_and_lifetime_setting() {
    let ops: Vec<(u8, u64)> = (0..200u64)
        .map(|i| match i % 8 {
            0 | 1 | 2 => (OP_ALLOCATE, (i << 16) | (i * 37 % 300) | ((i % 2) << 48)),
            3 => (OP_DEALLOCATE, i * 7),
            4 => (OP_RELEASE, i),
            5 => (OP_RELEASE_BREAKING, i * 3),
            6 => (if i % 16 == 6 { OP_PRINT } else { OP_PRINT_PBTXT }, i),
            _ => (OP_CHECK_STATS, 0),
        })
        .collect();
    for region in [0u8, 200] {
        for mode in [0u8, 100, 200] {
            for strategy in [0u8, 200] {
                let header = [4, region, mode, strategy, 3, 0, 0, 0, 0, 0, 0, 0, 0];
                let report = completed(&input(header, &ops));
                assert_eq!(report.ops.total(), 200);
            }
        }
    }
}
