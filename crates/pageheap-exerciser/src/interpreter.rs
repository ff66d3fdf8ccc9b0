//! Executes decoded operations against a subject.
//!
//! The interpreter owns the ledger and is the only thing that takes the page
//! heap lock on the subject's behalf. Deallocation, both release paths and
//! the stats read run under the lock; allocation and the dumps lock inside
//! the subject.

use crate::frame::{Op, OPCODE_MASK};
use crate::invariant::{check_accounting, check_release_floor, InvariantViolation};
use crate::ledger::Ledger;
use crate::subject::{PageAllocator, PbtxtRegion, Printer};
use crate::sync::pageheap_lock;
use crate::util::Length;
use tracing::{debug, trace};

const OPCODES: usize = OPCODE_MASK as usize + 1;

/// How many operations of each opcode a run executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpCounts([u64; OPCODES]);

impl OpCounts {
    #[inline]
    pub fn get(&self, opcode: u8) -> u64 {
        self.0[(opcode & OPCODE_MASK) as usize]
    }

    pub fn total(&self) -> u64 {
        self.0.iter().sum()
    }

    fn record(&mut self, op: &Op) {
        self.0[op.opcode() as usize] += 1;
    }
}

pub struct Interpreter<'s, A: PageAllocator> {
    subject: &'s A,
    ledger: Ledger,
    /// Destination of the dump operations. Never read back.
    scratch: Vec<u8>,
    counts: OpCounts,
    peak_live_spans: usize,
}

impl<'s, A: PageAllocator> Interpreter<'s, A> {
    pub fn new(subject: &'s A, scratch_bytes: usize) -> Self {
        Interpreter {
            subject,
            ledger: Ledger::new(),
            scratch: vec![0; scratch_bytes],
            counts: OpCounts::default(),
            peak_live_spans: 0,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn counts(&self) -> OpCounts {
        self.counts
    }

    pub fn peak_live_spans(&self) -> usize {
        self.peak_live_spans
    }

    /// Execute operations in order, stopping at the first violation.
    pub fn run<I>(&mut self, ops: I) -> Result<(), InvariantViolation>
    where
        I: IntoIterator<Item = Op>,
    {
        for op in ops {
            self.step(op)?;
        }
        Ok(())
    }

    pub fn step(&mut self, op: Op) -> Result<(), InvariantViolation> {
        self.counts.record(&op);
        match op {
            Op::Allocate {
                length,
                objects,
                align,
            } => self.allocate(length, objects, align),
            Op::Deallocate { selector } => self.deallocate(selector),
            Op::Release { pages } => {
                let released = {
                    let guard = pageheap_lock();
                    self.subject.release_at_least_n_pages(pages, &guard)
                };
                debug!(desired = %pages, released = %released, "release");
                Ok(())
            }
            Op::ReleaseBreaking { pages } => {
                let (free_bytes, released) = {
                    let guard = pageheap_lock();
                    let free_bytes = self.subject.stats(&guard).free_bytes;
                    let released = self
                        .subject
                        .release_at_least_n_pages_breaking_hugepages(pages, &guard);
                    (free_bytes, released)
                };
                debug!(desired = %pages, released = %released, free_bytes, "release_breaking");
                check_release_floor(pages, free_bytes, released)
            }
            Op::PrintPbtxt => {
                let mut out = Printer::new(&mut self.scratch);
                self.subject.print_in_pbtxt(&mut PbtxtRegion::top(&mut out));
                trace!(bytes = out.len(), truncated = out.truncated(), "print_pbtxt");
                Ok(())
            }
            Op::Print { everything } => {
                let mut out = Printer::new(&mut self.scratch);
                self.subject.print(&mut out, everything);
                trace!(
                    bytes = out.len(),
                    truncated = out.truncated(),
                    everything,
                    "print"
                );
                Ok(())
            }
            Op::CheckStats => {
                let stats = {
                    let guard = pageheap_lock();
                    self.subject.stats(&guard)
                };
                debug!(?stats, allocated = %self.ledger.allocated(), "check_stats");
                check_accounting(&stats, self.ledger.allocated())
            }
            Op::Reserved => Ok(()),
        }
    }

    fn allocate(
        &mut self,
        length: Length,
        objects: usize,
        align: Option<Length>,
    ) -> Result<(), InvariantViolation> {
        let span = match align {
            Some(align) => self.subject.new_aligned(length, align, objects),
            None => self.subject.new_span(length, objects),
        }
        .ok_or(InvariantViolation::NullSpan {
            requested: length,
            align,
        })?;
        if span.num_pages() < length {
            return Err(InvariantViolation::ShortSpan {
                requested: length,
                granted: span.num_pages(),
            });
        }
        self.ledger.record(span, objects);
        self.peak_live_spans = self.peak_live_spans.max(self.ledger.len());
        debug!(
            requested = %length,
            granted = %span.num_pages(),
            first_page = span.first_page(),
            objects,
            "allocate"
        );
        Ok(())
    }

    fn deallocate(&mut self, selector: u64) -> Result<(), InvariantViolation> {
        if self.ledger.is_empty() {
            return Ok(());
        }
        let index = (selector % self.ledger.len() as u64) as usize;
        let info = self.ledger.release_at(index)?;
        {
            let guard = pageheap_lock();
            self.subject
                .delete(info.span, info.objects_per_span, &guard);
        }
        debug!(index, pages = %info.span.num_pages(), "deallocate");
        Ok(())
    }

    /// Hand every outstanding span back to the subject under one lock hold.
    /// Returns how many spans were released.
    pub fn release_all(&mut self) -> Result<usize, InvariantViolation> {
        let guard = pageheap_lock();
        let mut released = 0;
        for info in self.ledger.drain() {
            let info = info?;
            self.subject
                .delete(info.span, info.objects_per_span, &guard);
            released += 1;
        }
        Ok(released)
    }
}
