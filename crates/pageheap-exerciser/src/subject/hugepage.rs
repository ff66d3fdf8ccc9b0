//! A hugepage-aware page heap.
//!
//! Pages are numbered from zero and the heap grows one 2 MiB hugepage at a
//! time. Spans are packed into existing hugepages when they fit; release
//! prefers whole empty hugepages and only breaks up partially used ones when
//! asked to.

use super::lifetime::{LifetimeStats, LifetimeTracker};
use super::options::{HugeRegionCountOption, LifetimeMode, LifetimeStrategy, SubjectConfig};
use super::printer::{PbtxtRegion, Printer};
use super::table::{pieces, HugePageTable, RegionKind, PAGES_PER_HUGE};
use super::{BackingStats, PageAllocator, Span};
use crate::sync::{pageheap_lock, PageHeapGuard};
use crate::util::{round_up_to, Length, HUGE_PAGE_SIZE, PAGE_SIZE};
use core::cell::UnsafeCell;
use core::fmt::Write;
use core::ptr;
use tracing::trace;

#[derive(Debug, Clone, Copy, Default)]
struct HeapCounters {
    spans_allocated: u64,
    spans_freed: u64,
    preserving_releases: u64,
    breaking_releases: u64,
    pages_released: u64,
    hugepages_broken: u64,
}

struct HeapState {
    table: HugePageTable,
    used_pages: usize,
    unbacked_pages: usize,
    lifetime: LifetimeTracker,
    counters: HeapCounters,
}

pub struct HugePageAwareAllocator {
    config: SubjectConfig,
    inner: UnsafeCell<HeapState>,
}

// All access to `inner` happens under the page heap lock.
unsafe impl Send for HugePageAwareAllocator {}
unsafe impl Sync for HugePageAwareAllocator {}

impl HugePageAwareAllocator {
    pub fn config(&self) -> &SubjectConfig {
        &self.config
    }

    /// Lifetime prediction tallies so far.
    pub fn lifetime_stats(&self) -> LifetimeStats {
        let guard = pageheap_lock();
        self.state(&guard).lifetime.stats()
    }

    /// Number of hugepages the heap has grown to.
    pub fn hugepages(&self) -> usize {
        let guard = pageheap_lock();
        self.state(&guard).table.len()
    }

    #[allow(clippy::mut_from_ref)]
    fn state(&self, _guard: &PageHeapGuard) -> &mut HeapState {
        // The guard proves the page heap lock is held, and no caller keeps
        // two of these borrows alive at once.
        unsafe { &mut *self.inner.get() }
    }

    fn allocate(&self, n: Length, align: usize, objects: usize) -> Option<Span> {
        let guard = pageheap_lock();
        let state = self.state(&guard);
        let now = state.lifetime.tick();
        let prediction = state.lifetime.predict(objects);
        let placement = prediction.placement;
        let len = n.raw_num();

        let first = match state.find_fit(len, align, placement, self.config.region_option) {
            Some(first) => first,
            None => state.grow_for(len, align, placement)?,
        };
        state.claim(first, len, placement);
        state.counters.spans_allocated += 1;
        trace!(first, len, align, objects, "span allocated");
        Some(Span::with_lifetime(first, n, now, prediction.short_lived))
    }
}

impl HeapState {
    fn find_fit(
        &self,
        len: usize,
        align: usize,
        kind: RegionKind,
        option: HugeRegionCountOption,
    ) -> Option<usize> {
        let mut best: Option<(usize, usize)> = None;
        for h in 0..self.table.len() {
            let hp = self.table.get(h);
            if !hp.accepts(kind) {
                continue;
            }
            let base = h * PAGES_PER_HUGE;
            let Some(offset) = hp.find_fit(base, len, align) else {
                continue;
            };
            match option {
                HugeRegionCountOption::AbandonedCount => return Some(base + offset),
                HugeRegionCountOption::Slack => {
                    let free = hp.free_pages();
                    if best.map_or(true, |(best_free, _)| free < best_free) {
                        best = Some((free, base + offset));
                    }
                }
            }
        }
        best.map(|(_, first)| first)
    }

    /// Grow the heap so that an aligned run of `len` pages exists at its end.
    fn grow_for(&mut self, len: usize, align: usize, kind: RegionKind) -> Option<usize> {
        let end = self.table.len() * PAGES_PER_HUGE;
        let first = round_up_to(end, align);
        let count = (first - end + len).div_ceil(PAGES_PER_HUGE);
        self.table.grow(count, kind)?;
        trace!(count, hugepages = self.table.len(), "heap grown");
        Some(first)
    }

    fn claim(&mut self, first: usize, len: usize, kind: RegionKind) {
        for piece in pieces(first, len) {
            let rebacked = self
                .table
                .get_mut(piece.hugepage)
                .claim(piece.offset, piece.count, kind);
            self.unbacked_pages -= rebacked;
        }
        self.used_pages += len;
    }

    fn unclaim(&mut self, first: usize, len: usize) {
        for piece in pieces(first, len) {
            self.table
                .get_mut(piece.hugepage)
                .unclaim(piece.offset, piece.count);
        }
        self.used_pages -= len;
    }

    fn free_backed_pages(&self) -> usize {
        self.table.len() * PAGES_PER_HUGE - self.used_pages - self.unbacked_pages
    }

    /// Unback empty hugepages until `n` pages are released.
    fn release_empty(&mut self, n: usize) -> usize {
        let mut released = 0;
        for h in 0..self.table.len() {
            if released >= n {
                break;
            }
            let hp = self.table.get_mut(h);
            if hp.is_empty() && hp.free_backed_pages() > 0 {
                released += hp.unback_free();
            }
        }
        self.unbacked_pages += released;
        released
    }

    /// Unback free pages of partially used hugepages until `n` pages are
    /// released.
    fn release_partial(&mut self, n: usize) -> usize {
        let mut released = 0;
        for h in 0..self.table.len() {
            if released >= n {
                break;
            }
            let hp = self.table.get_mut(h);
            if hp.is_empty() || hp.free_backed_pages() == 0 {
                continue;
            }
            let was_broken = hp.is_broken();
            released += hp.unback_free();
            if !was_broken && hp.is_broken() {
                self.counters.hugepages_broken += 1;
            }
        }
        self.unbacked_pages += released;
        released
    }

    fn stats(&self) -> BackingStats {
        BackingStats {
            system_bytes: (self.table.len() * HUGE_PAGE_SIZE) as u64,
            free_bytes: (self.free_backed_pages() * PAGE_SIZE) as u64,
            unmapped_bytes: (self.unbacked_pages * PAGE_SIZE) as u64,
        }
    }
}

impl PageAllocator for HugePageAwareAllocator {
    /// The metadata table is too large to build on the stack, so every field
    /// is written directly into the caller's storage and table entries are
    /// left uninitialized until the heap grows into them.
    unsafe fn construct_in_place(slot: *mut Self, config: &SubjectConfig) {
        ptr::addr_of_mut!((*slot).config).write(*config);
        let state = UnsafeCell::raw_get(ptr::addr_of_mut!((*slot).inner));
        HugePageTable::init_in_place(ptr::addr_of_mut!((*state).table));
        ptr::addr_of_mut!((*state).used_pages).write(0);
        ptr::addr_of_mut!((*state).unbacked_pages).write(0);
        ptr::addr_of_mut!((*state).lifetime).write(LifetimeTracker::new(config.lifetime));
        ptr::addr_of_mut!((*state).counters).write(HeapCounters::default());
    }

    fn new_span(&self, n: Length, objects_per_span: usize) -> Option<Span> {
        self.allocate(n, 1, objects_per_span)
    }

    fn new_aligned(&self, n: Length, align: Length, objects_per_span: usize) -> Option<Span> {
        self.allocate(n, align.raw_num().max(1), objects_per_span)
    }

    fn delete(&self, span: Span, objects_per_span: usize, guard: &PageHeapGuard) {
        let state = self.state(guard);
        state.lifetime.tick();
        state.unclaim(span.first_page(), span.num_pages().raw_num());
        state.lifetime.observe(
            objects_per_span,
            span.allocated_at(),
            span.predicted_short_lived(),
        );
        state.counters.spans_freed += 1;
        trace!(
            first = span.first_page(),
            len = span.num_pages().raw_num(),
            "span freed"
        );
    }

    fn release_at_least_n_pages(&self, n: Length, guard: &PageHeapGuard) -> Length {
        let state = self.state(guard);
        state.lifetime.tick();
        if n.is_zero() {
            return Length::ZERO;
        }
        let released = state.release_empty(n.raw_num());
        state.counters.preserving_releases += 1;
        state.counters.pages_released += released as u64;
        trace!(desired = n.raw_num(), released, "released empty hugepages");
        Length::new(released)
    }

    fn release_at_least_n_pages_breaking_hugepages(
        &self,
        n: Length,
        guard: &PageHeapGuard,
    ) -> Length {
        let state = self.state(guard);
        state.lifetime.tick();
        if n.is_zero() {
            return Length::ZERO;
        }
        let mut released = state.release_empty(n.raw_num());
        if released < n.raw_num() {
            released += state.release_partial(n.raw_num() - released);
        }
        state.counters.breaking_releases += 1;
        state.counters.pages_released += released as u64;
        trace!(desired = n.raw_num(), released, "released breaking hugepages");
        Length::new(released)
    }

    fn stats(&self, guard: &PageHeapGuard) -> BackingStats {
        self.state(guard).stats()
    }

    fn print_in_pbtxt(&self, region: &mut PbtxtRegion<'_, '_>) {
        let guard = pageheap_lock();
        let state = self.state(&guard);
        let stats = state.stats();

        region.print_raw("tag", self.config.tag.name());
        region.print_u64("system_bytes", stats.system_bytes);
        region.print_u64("free_bytes", stats.free_bytes);
        region.print_u64("unmapped_bytes", stats.unmapped_bytes);
        region.print_u64("used_pages", state.used_pages as u64);
        {
            let (mut full, mut partial, mut empty, mut broken, mut short_lived) = (0, 0, 0, 0, 0);
            for hp in state.table.iter() {
                match hp.used_pages() {
                    0 => empty += 1,
                    PAGES_PER_HUGE => full += 1,
                    _ => partial += 1,
                }
                if hp.is_broken() {
                    broken += 1;
                }
                if hp.kind() == RegionKind::ShortLived && !hp.is_empty() {
                    short_lived += 1;
                }
            }
            let mut filler = region.sub_region("filler");
            filler.print_i64("full_huge_pages", full);
            filler.print_i64("partial_huge_pages", partial);
            filler.print_i64("empty_huge_pages", empty);
            filler.print_i64("broken_huge_pages", broken);
            filler.print_i64("short_lived_huge_pages", short_lived);
        }
        {
            let c = state.counters;
            let mut counters = region.sub_region("counters");
            counters.print_u64("spans_allocated", c.spans_allocated);
            counters.print_u64("spans_freed", c.spans_freed);
            counters.print_u64("preserving_releases", c.preserving_releases);
            counters.print_u64("breaking_releases", c.breaking_releases);
            counters.print_u64("pages_released", c.pages_released);
            counters.print_u64("hugepages_broken", c.hugepages_broken);
        }
        {
            let lifetime = self.config.lifetime;
            let s = state.lifetime.stats();
            let mut region = region.sub_region("lifetime_prediction");
            region.print_raw("mode", mode_name(lifetime.mode));
            region.print_raw("strategy", strategy_name(lifetime.strategy));
            region.print_u64("threshold_ms", lifetime.threshold.as_millis() as u64);
            region.print_u64("predicted_short", s.predicted_short);
            region.print_u64("predicted_long", s.predicted_long);
            region.print_u64("correct", s.correct);
            region.print_u64("mispredicted", s.mispredicted);
        }
    }

    fn print(&self, out: &mut Printer<'_>, everything: bool) {
        let guard = pageheap_lock();
        let state = self.state(&guard);
        let stats = state.stats();
        let c = state.counters;
        let mib = |bytes: u64| bytes as f64 / (1024.0 * 1024.0);

        let _ = writeln!(out, "------------------------------------------------");
        let _ = writeln!(
            out,
            "HugePageAware [{}]: {} hugepages, region option {}",
            self.config.tag,
            state.table.len(),
            region_name(self.config.region_option),
        );
        let _ = writeln!(
            out,
            "  {:>10} bytes ({:>8.1} MiB) system",
            stats.system_bytes,
            mib(stats.system_bytes)
        );
        let _ = writeln!(
            out,
            "  {:>10} bytes ({:>8.1} MiB) free",
            stats.free_bytes,
            mib(stats.free_bytes)
        );
        let _ = writeln!(
            out,
            "  {:>10} bytes ({:>8.1} MiB) unmapped",
            stats.unmapped_bytes,
            mib(stats.unmapped_bytes)
        );
        let _ = writeln!(
            out,
            "  spans: {} allocated, {} freed; releases: {} preserving, {} breaking, {} pages, {} hugepages broken",
            c.spans_allocated,
            c.spans_freed,
            c.preserving_releases,
            c.breaking_releases,
            c.pages_released,
            c.hugepages_broken,
        );
        if self.config.lifetime.mode != LifetimeMode::Disabled {
            let s = state.lifetime.stats();
            let _ = writeln!(
                out,
                "  lifetime ({}, {}, {} ms): {} short, {} long, {} correct, {} mispredicted",
                mode_name(self.config.lifetime.mode),
                strategy_name(self.config.lifetime.strategy),
                self.config.lifetime.threshold.as_millis(),
                s.predicted_short,
                s.predicted_long,
                s.correct,
                s.mispredicted,
            );
        }
        if !everything {
            return;
        }
        for (h, hp) in state.table.iter().enumerate() {
            let _ = writeln!(
                out,
                "  hugepage {:>5}: {:>3} used {:>3} unbacked{}{}",
                h,
                hp.used_pages(),
                hp.unbacked_pages(),
                if hp.kind() == RegionKind::ShortLived {
                    " short-lived"
                } else {
                    ""
                },
                if hp.is_broken() { " broken" } else { "" },
            );
        }
    }
}

fn region_name(option: HugeRegionCountOption) -> &'static str {
    match option {
        HugeRegionCountOption::Slack => "SLACK",
        HugeRegionCountOption::AbandonedCount => "ABANDONED_COUNT",
    }
}

fn mode_name(mode: LifetimeMode) -> &'static str {
    match mode {
        LifetimeMode::Enabled => "ENABLED",
        LifetimeMode::Disabled => "DISABLED",
        LifetimeMode::Counterfactual => "COUNTERFACTUAL",
    }
}

fn strategy_name(strategy: LifetimeStrategy) -> &'static str {
    match strategy {
        LifetimeStrategy::AlwaysShortLivedRegions => "ALWAYS_SHORT_LIVED",
        LifetimeStrategy::PredictedLifetimeRegions => "PREDICTED_LIFETIME",
    }
}
