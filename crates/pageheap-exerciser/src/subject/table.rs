//! Per-hugepage metadata.
//!
//! Each hugepage tracks which of its pages are in use and which have been
//! returned to the OS, as one bit per page.

use crate::util::{round_up_to, PAGES_PER_HUGE_PAGE};
use core::mem::MaybeUninit;
use core::ptr;

pub const PAGES_PER_HUGE: usize = PAGES_PER_HUGE_PAGE.raw_num();
const WORDS: usize = PAGES_PER_HUGE / 64;

/// What a hugepage is currently dedicated to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Filler,
    ShortLived,
}

#[derive(Clone, Copy)]
#[repr(C)]
pub struct HugePageState {
    /// 1 = page is part of a live span.
    used: [u64; WORDS],
    /// 1 = page has been returned to the OS. Never set together with `used`.
    unbacked: [u64; WORDS],
    used_pages: u16,
    unbacked_pages: u16,
    kind: RegionKind,
    /// Free pages were released while the hugepage still held live spans.
    broken: bool,
}

#[inline]
fn test_bit(words: &[u64; WORDS], i: usize) -> bool {
    words[i / 64] & (1u64 << (i % 64)) != 0
}

#[inline]
fn set_bit(words: &mut [u64; WORDS], i: usize) {
    words[i / 64] |= 1u64 << (i % 64);
}

#[inline]
fn clear_bit(words: &mut [u64; WORDS], i: usize) {
    words[i / 64] &= !(1u64 << (i % 64));
}

impl HugePageState {
    /// Every page free and backed.
    pub const EMPTY: HugePageState = HugePageState {
        used: [0; WORDS],
        unbacked: [0; WORDS],
        used_pages: 0,
        unbacked_pages: 0,
        kind: RegionKind::Filler,
        broken: false,
    };

    #[inline]
    pub fn used_pages(&self) -> usize {
        self.used_pages as usize
    }

    #[inline]
    pub fn unbacked_pages(&self) -> usize {
        self.unbacked_pages as usize
    }

    #[inline]
    pub fn free_pages(&self) -> usize {
        PAGES_PER_HUGE - self.used_pages()
    }

    #[inline]
    pub fn free_backed_pages(&self) -> usize {
        PAGES_PER_HUGE - self.used_pages() - self.unbacked_pages()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.used_pages == 0
    }

    #[inline]
    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    #[inline]
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    #[inline]
    pub fn is_used(&self, page: usize) -> bool {
        test_bit(&self.used, page)
    }

    /// Whether a span of the given kind may be placed here.
    #[inline]
    pub fn accepts(&self, kind: RegionKind) -> bool {
        self.is_empty() || self.kind == kind
    }

    /// First offset at which `len` free pages start on a multiple of `align`,
    /// where `base` is the absolute page number of offset 0.
    pub fn find_fit(&self, base: usize, len: usize, align: usize) -> Option<usize> {
        if self.free_pages() < len {
            return None;
        }
        let mut run_start: Option<usize> = None;
        for i in 0..PAGES_PER_HUGE {
            if self.is_used(i) {
                run_start = None;
                continue;
            }
            let start = *run_start.get_or_insert(i);
            let candidate = round_up_to(base + start, align) - base;
            if candidate <= i && i + 1 - candidate >= len {
                return Some(candidate);
            }
        }
        None
    }

    /// Mark `[offset, offset + count)` used. Returns how many of those pages
    /// had to be backed again.
    pub fn claim(&mut self, offset: usize, count: usize, kind: RegionKind) -> usize {
        if self.is_empty() {
            self.kind = kind;
        }
        let mut rebacked = 0;
        for page in offset..offset + count {
            assert!(
                !self.is_used(page),
                "pageheap: page {page} of hugepage handed out twice"
            );
            set_bit(&mut self.used, page);
            if test_bit(&self.unbacked, page) {
                clear_bit(&mut self.unbacked, page);
                rebacked += 1;
            }
        }
        self.used_pages += count as u16;
        self.unbacked_pages -= rebacked as u16;
        rebacked
    }

    /// Mark `[offset, offset + count)` free again.
    pub fn unclaim(&mut self, offset: usize, count: usize) {
        for page in offset..offset + count {
            assert!(
                self.is_used(page),
                "pageheap: free of page {page} which is not allocated"
            );
            clear_bit(&mut self.used, page);
        }
        self.used_pages -= count as u16;
        if self.is_empty() {
            self.kind = RegionKind::Filler;
        }
    }

    /// Return every free, backed page to the OS. Returns the page count.
    pub fn unback_free(&mut self) -> usize {
        let mut released = 0;
        for w in 0..WORDS {
            let candidates = !self.used[w] & !self.unbacked[w];
            released += candidates.count_ones() as usize;
            self.unbacked[w] |= candidates;
        }
        self.unbacked_pages += released as u16;
        if released > 0 && !self.is_empty() {
            self.broken = true;
        }
        if self.unbacked_pages() == PAGES_PER_HUGE {
            self.broken = false;
        }
        released
    }
}

/// A contiguous piece of a span that lies within a single hugepage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Piece {
    pub hugepage: usize,
    pub offset: usize,
    pub count: usize,
}

/// Split the page range `[first, first + len)` at hugepage boundaries.
pub fn pieces(first: usize, len: usize) -> impl Iterator<Item = Piece> {
    let end = first + len;
    let mut page = first;
    core::iter::from_fn(move || {
        if page >= end {
            return None;
        }
        let hugepage = page / PAGES_PER_HUGE;
        let offset = page % PAGES_PER_HUGE;
        let count = (PAGES_PER_HUGE - offset).min(end - page);
        page += count;
        Some(Piece {
            hugepage,
            offset,
            count,
        })
    })
}

/// Metadata for every hugepage the heap has grown into.
///
/// Stored inline so the table lives and dies with the subject's raw storage.
/// Entries at or past `len` are uninitialized.
pub struct HugePageTable {
    len: usize,
    entries: [MaybeUninit<HugePageState>; HugePageTable::CAPACITY],
}

impl HugePageTable {
    /// Enough for the largest input the driver accepts, where every frame
    /// grows the heap by the maximum of two hugepages.
    pub const CAPACITY: usize = 1 << 15;

    /// Initialize an empty table without touching the entry storage.
    ///
    /// # Safety
    /// `slot` must be valid for writes and suitably aligned.
    pub unsafe fn init_in_place(slot: *mut HugePageTable) {
        ptr::addr_of_mut!((*slot).len).write(0);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append `count` fresh hugepages of the given kind. Returns the index of
    /// the first one, or `None` if the table is full.
    pub fn grow(&mut self, count: usize, kind: RegionKind) -> Option<usize> {
        if self.len + count > Self::CAPACITY {
            return None;
        }
        let first = self.len;
        for entry in &mut self.entries[first..first + count] {
            entry.write(HugePageState {
                kind,
                ..HugePageState::EMPTY
            });
        }
        self.len += count;
        Some(first)
    }

    #[inline]
    pub fn get(&self, hugepage: usize) -> &HugePageState {
        assert!(hugepage < self.len, "pageheap: hugepage {hugepage} out of range");
        unsafe { self.entries[hugepage].assume_init_ref() }
    }

    #[inline]
    pub fn get_mut(&mut self, hugepage: usize) -> &mut HugePageState {
        assert!(hugepage < self.len, "pageheap: hugepage {hugepage} out of range");
        unsafe { self.entries[hugepage].assume_init_mut() }
    }

    pub fn iter(&self) -> impl Iterator<Item = &HugePageState> + '_ {
        (0..self.len).map(move |h| self.get(h))
    }
}
