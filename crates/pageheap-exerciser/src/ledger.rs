//! Spans the interpreter currently holds.
//!
//! The ledger is the independent side of the accounting check: it only knows
//! what the subject granted, never how the subject laid it out.

use crate::invariant::InvariantViolation;
use crate::subject::Span;
use crate::util::Length;

/// A live span and the object count it was requested with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanInfo {
    pub span: Span,
    pub objects_per_span: usize,
}

#[derive(Debug, Default)]
pub struct Ledger {
    spans: Vec<SpanInfo>,
    allocated: Length,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, span: Span, objects_per_span: usize) {
        self.allocated += span.num_pages();
        self.spans.push(SpanInfo {
            span,
            objects_per_span,
        });
    }

    /// Remove the entry at `index`, moving the last entry into its place.
    ///
    /// Panics if `index` is out of bounds.
    pub fn release_at(&mut self, index: usize) -> Result<SpanInfo, InvariantViolation> {
        let info = self.spans.swap_remove(index);
        self.debit(info)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.spans.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Total pages of all live spans.
    #[inline]
    pub fn allocated(&self) -> Length {
        self.allocated
    }

    pub fn spans(&self) -> &[SpanInfo] {
        &self.spans
    }

    /// Hand back every entry, last first, debiting each as it goes.
    pub fn drain(&mut self) -> Drain<'_> {
        Drain { ledger: self }
    }

    fn debit(&mut self, info: SpanInfo) -> Result<SpanInfo, InvariantViolation> {
        let allocated = self.allocated;
        let releasing = info.span.num_pages();
        self.allocated = allocated
            .checked_sub(releasing)
            .ok_or(InvariantViolation::LedgerUnderflow {
                allocated,
                releasing,
            })?;
        Ok(info)
    }
}

pub struct Drain<'a> {
    ledger: &'a mut Ledger,
}

impl Iterator for Drain<'_> {
    type Item = Result<SpanInfo, InvariantViolation>;

    fn next(&mut self) -> Option<Self::Item> {
        let info = self.ledger.spans.pop()?;
        Some(self.ledger.debit(info))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.ledger.len(), Some(self.ledger.len()))
    }
}

impl ExactSizeIterator for Drain<'_> {}
