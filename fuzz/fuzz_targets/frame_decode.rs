#![no_main]

use libfuzzer_sys::fuzz_target;
use pageheap_exerciser::frame::{frames, Op, FRAME_LEN, MAX_REQUEST_PAGES};

// Every byte string decodes to a well-formed operation sequence.
fuzz_target!(|data: &[u8]| {
    let ops = frames(data);
    assert_eq!(ops.len(), data.len() / FRAME_LEN);
    assert_eq!(ops.remainder().len(), data.len() % FRAME_LEN);

    for (op, frame) in ops.zip(data.chunks_exact(FRAME_LEN)) {
        assert_eq!(op.opcode(), frame[0] & 0x7);
        match op {
            Op::Allocate { length, align, .. } => {
                assert!((1..=MAX_REQUEST_PAGES).contains(&length.raw_num()));
                if let Some(align) = align {
                    assert!((1..=MAX_REQUEST_PAGES).contains(&align.raw_num()));
                }
                assert_eq!(align.is_some(), frame[7] & 1 == 0);
            }
            Op::Release { pages } | Op::ReleaseBreaking { pages } => {
                assert_eq!(pages.raw_num(), frame[1] as usize);
            }
            Op::Print { everything } => assert_eq!(everything, frame[1] & 1 == 0),
            _ => {}
        }
    }
});
