//! Operation frames.
//!
//! After the header, the input is read [`FRAME_LEN`] bytes at a time:
//!
//! ```text
//! [i + 0]       opcode; only the low three bits are significant
//! [i + 1..i + 9] little-endian u64 operand
//! ```
//!
//! The operand is a source of deterministic entropy whose meaning depends on
//! the opcode. Each field is pulled out by one of the extractors below so the
//! bit layout lives in exactly one place.

use crate::util::{Length, PAGES_PER_HUGE_PAGE};
use core::slice::ChunksExact;

pub const FRAME_LEN: usize = 9;
pub const OPCODE_MASK: u8 = 0x7;

/// Largest length or alignment an allocate frame can request.
pub const MAX_REQUEST_PAGES: usize = PAGES_PER_HUGE_PAGE.raw_num() - 1;

pub const OP_ALLOCATE: u8 = 0;
pub const OP_DEALLOCATE: u8 = 1;
pub const OP_RELEASE: u8 = 2;
pub const OP_RELEASE_BREAKING: u8 = 3;
pub const OP_PRINT_PBTXT: u8 = 4;
pub const OP_PRINT: u8 = 5;
pub const OP_CHECK_STATS: u8 = 6;
pub const OP_RESERVED: u8 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// `align` is `None` for a plain allocation.
    Allocate {
        length: Length,
        objects: usize,
        align: Option<Length>,
    },
    /// Releases the live span at `selector % live_spans`.
    Deallocate { selector: u64 },
    /// Release without breaking up partially used hugepages.
    Release { pages: Length },
    /// Release, breaking up hugepages if needed.
    ReleaseBreaking { pages: Length },
    PrintPbtxt,
    Print { everything: bool },
    CheckStats,
    /// Opcode 7 has no handler.
    Reserved,
}

impl Op {
    pub fn decode(frame: &[u8; FRAME_LEN]) -> Op {
        let mut operand = [0u8; 8];
        operand.copy_from_slice(&frame[1..]);
        Op::from_parts(frame[0], u64::from_le_bytes(operand))
    }

    pub fn from_parts(opcode: u8, value: u64) -> Op {
        match opcode & OPCODE_MASK {
            OP_ALLOCATE => Op::Allocate {
                length: alloc_length(value),
                objects: alloc_objects(value),
                align: alloc_uses_alignment(value).then(|| alloc_alignment(value)),
            },
            OP_DEALLOCATE => Op::Deallocate { selector: value },
            OP_RELEASE => Op::Release {
                pages: release_pages(value),
            },
            OP_RELEASE_BREAKING => Op::ReleaseBreaking {
                pages: release_pages(value),
            },
            OP_PRINT_PBTXT => Op::PrintPbtxt,
            OP_PRINT => Op::Print {
                everything: print_everything(value),
            },
            OP_CHECK_STATS => Op::CheckStats,
            _ => Op::Reserved,
        }
    }

    pub const fn opcode(&self) -> u8 {
        match self {
            Op::Allocate { .. } => OP_ALLOCATE,
            Op::Deallocate { .. } => OP_DEALLOCATE,
            Op::Release { .. } => OP_RELEASE,
            Op::ReleaseBreaking { .. } => OP_RELEASE_BREAKING,
            Op::PrintPbtxt => OP_PRINT_PBTXT,
            Op::Print { .. } => OP_PRINT,
            Op::CheckStats => OP_CHECK_STATS,
            Op::Reserved => OP_RESERVED,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Op::Allocate { align: Some(_), .. } => "allocate_aligned",
            Op::Allocate { align: None, .. } => "allocate",
            Op::Deallocate { .. } => "deallocate",
            Op::Release { .. } => "release",
            Op::ReleaseBreaking { .. } => "release_breaking",
            Op::PrintPbtxt => "print_pbtxt",
            Op::Print { .. } => "print",
            Op::CheckStats => "check_stats",
            Op::Reserved => "reserved",
        }
    }
}

/// Clamp a raw page count into `[1, MAX_REQUEST_PAGES]`.
#[inline]
pub fn clamp_request(raw: u64) -> Length {
    Length::new(raw.clamp(1, MAX_REQUEST_PAGES as u64) as usize)
}

/// `value[0:15]`: pages to allocate, clamped.
#[inline]
pub fn alloc_length(value: u64) -> Length {
    clamp_request(value & 0xFFFF)
}

/// `value[16:31]`: objects the span will hold.
#[inline]
pub fn alloc_objects(value: u64) -> usize {
    ((value >> 16) & 0xFFFF) as usize
}

/// `value[32:47]`: alignment in pages, clamped.
#[inline]
pub fn alloc_alignment(value: u64) -> Length {
    clamp_request((value >> 32) & 0xFFFF)
}

/// `value[48]`: 0 selects the aligned path, 1 the plain one.
/// `value[49:63]` are reserved.
#[inline]
pub fn alloc_uses_alignment(value: u64) -> bool {
    (value >> 48) & 0x1 == 0
}

/// `value[0:7]`: pages to release. `value[8:63]` are reserved.
#[inline]
pub fn release_pages(value: u64) -> Length {
    Length::new((value & 0xFF) as usize)
}

/// `value[0]`: 0 prints everything, 1 a summary. `value[1:63]` are reserved.
#[inline]
pub fn print_everything(value: u64) -> bool {
    value & 0x1 == 0
}

/// Assemble one frame. Used to build seed corpora and test inputs.
pub fn encode_frame(opcode: u8, value: u64) -> [u8; FRAME_LEN] {
    let mut frame = [0u8; FRAME_LEN];
    frame[0] = opcode;
    frame[1..].copy_from_slice(&value.to_le_bytes());
    frame
}

/// Decoded operations of an input body, in order. A trailing partial frame
/// is ignored.
pub struct Frames<'a> {
    chunks: ChunksExact<'a, u8>,
}

pub fn frames(body: &[u8]) -> Frames<'_> {
    Frames {
        chunks: body.chunks_exact(FRAME_LEN),
    }
}

impl<'a> Frames<'a> {
    /// Bytes left over after the last whole frame.
    pub fn remainder(&self) -> &'a [u8] {
        self.chunks.remainder()
    }
}

impl Iterator for Frames<'_> {
    type Item = Op;

    fn next(&mut self) -> Option<Op> {
        let frame: &[u8; FRAME_LEN] = self.chunks.next()?.try_into().ok()?;
        Some(Op::decode(frame))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.chunks.size_hint()
    }
}

impl ExactSizeIterator for Frames<'_> {}
