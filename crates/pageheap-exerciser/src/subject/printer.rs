//! Bounded diagnostic output.
//!
//! Dumps are written into a caller-provided scratch buffer. Output that does
//! not fit is dropped, and the printer remembers how much space it would have
//! needed.

use core::fmt::{self, Write};

pub struct Printer<'a> {
    buf: &'a mut [u8],
    len: usize,
    required: usize,
}

impl<'a> Printer<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Printer {
            buf,
            len: 0,
            required: 0,
        }
    }

    /// Bytes written so far.
    pub fn as_str(&self) -> &str {
        // Only whole characters are ever copied in.
        core::str::from_utf8(&self.buf[..self.len]).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes the output would have taken with an unbounded buffer.
    pub fn space_required(&self) -> usize {
        self.required
    }

    pub fn truncated(&self) -> bool {
        self.required > self.len
    }
}

impl Write for Printer<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.required += s.len();
        let avail = self.buf.len() - self.len;
        let mut n = s.len().min(avail);
        while !s.is_char_boundary(n) {
            n -= 1;
        }
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegionKind {
    Top,
    Nested,
}

/// A protobuf-text region. Nested regions close their brace when dropped.
pub struct PbtxtRegion<'p, 'b> {
    out: &'p mut Printer<'b>,
    kind: RegionKind,
}

impl<'p, 'b> PbtxtRegion<'p, 'b> {
    pub fn top(out: &'p mut Printer<'b>) -> Self {
        PbtxtRegion {
            out,
            kind: RegionKind::Top,
        }
    }

    pub fn print_i64(&mut self, key: &str, value: i64) {
        let _ = self.out.write_fmt(format_args!(" {key}: {value}"));
    }

    pub fn print_u64(&mut self, key: &str, value: u64) {
        let _ = self.out.write_fmt(format_args!(" {key}: {value}"));
    }

    pub fn print_bool(&mut self, key: &str, value: bool) {
        let _ = self.out.write_fmt(format_args!(" {key}: {value}"));
    }

    /// An unquoted enum-style value.
    pub fn print_raw(&mut self, key: &str, value: &str) {
        let _ = self.out.write_fmt(format_args!(" {key}: {value}"));
    }

    pub fn sub_region(&mut self, key: &str) -> PbtxtRegion<'_, 'b> {
        let _ = self.out.write_fmt(format_args!(" {key} {{"));
        PbtxtRegion {
            out: &mut *self.out,
            kind: RegionKind::Nested,
        }
    }
}

impl Drop for PbtxtRegion<'_, '_> {
    fn drop(&mut self) {
        if self.kind == RegionKind::Nested {
            let _ = self.out.write_str(" }");
        }
    }
}
