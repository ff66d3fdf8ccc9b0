use core::fmt;
use core::ops::{Add, AddAssign, Sub, SubAssign};

/// log2 of the subject's page size.
pub const PAGE_SHIFT: u32 = 13;

/// Subject page size (8 KiB).
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// log2 of the backing hugepage size.
pub const HUGE_PAGE_SHIFT: u32 = 21;

/// Backing hugepage size (2 MiB).
pub const HUGE_PAGE_SIZE: usize = 1 << HUGE_PAGE_SHIFT;

/// Number of subject pages that make up one hugepage.
pub const PAGES_PER_HUGE_PAGE: Length = Length(HUGE_PAGE_SIZE >> PAGE_SHIFT);

/// A count of subject pages.
///
/// All ledger and subject arithmetic is done in pages; bytes only appear at
/// the stats boundary via [`Length::in_bytes`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Length(usize);

impl Length {
    pub const ZERO: Length = Length(0);

    #[inline]
    pub const fn new(pages: usize) -> Self {
        Length(pages)
    }

    #[inline]
    pub const fn raw_num(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn in_bytes(self) -> u64 {
        (self.0 as u64) << PAGE_SHIFT
    }

    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn checked_sub(self, rhs: Length) -> Option<Length> {
        self.0.checked_sub(rhs.0).map(Length)
    }
}

impl Add for Length {
    type Output = Length;

    #[inline]
    fn add(self, rhs: Length) -> Length {
        Length(self.0 + rhs.0)
    }
}

impl AddAssign for Length {
    #[inline]
    fn add_assign(&mut self, rhs: Length) {
        self.0 += rhs.0;
    }
}

impl Sub for Length {
    type Output = Length;

    #[inline]
    fn sub(self, rhs: Length) -> Length {
        Length(self.0 - rhs.0)
    }
}

impl SubAssign for Length {
    #[inline]
    fn sub_assign(&mut self, rhs: Length) {
        self.0 -= rhs.0;
    }
}

impl fmt::Display for Length {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} pages", self.0)
    }
}

/// Round `value` up to the next multiple of `multiple`, which need not be a
/// power of two. `multiple` must be non-zero.
#[inline]
pub const fn round_up_to(value: usize, multiple: usize) -> usize {
    debug_assert!(multiple != 0);
    match value % multiple {
        0 => value,
        rem => value + (multiple - rem),
    }
}
