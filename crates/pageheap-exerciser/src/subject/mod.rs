//! The allocator under test.
//!
//! [`PageAllocator`] is the call contract the interpreter drives. The crate
//! ships [`HugePageAwareAllocator`] as the default subject; anything else
//! implementing the trait can be exercised through
//! [`crate::driver::run_with`].

pub mod hugepage;
pub mod lifetime;
pub mod options;
pub mod printer;
pub mod table;

pub use hugepage::HugePageAwareAllocator;
pub use options::{
    HugeRegionCountOption, LifetimeMode, LifetimePredictionOptions, LifetimeStrategy, MemoryTag,
    SubjectConfig,
};
pub use printer::{PbtxtRegion, Printer};

use crate::sync::PageHeapGuard;
use crate::util::Length;
use core::mem::{align_of, size_of};
use core::ops::{Deref, DerefMut};
use core::ptr::{self, NonNull};
use std::alloc::{handle_alloc_error, Layout};

/// A run of pages granted by the subject.
///
/// Handles are plain values; the subject owns the pages from `new_*` until
/// the handle is passed back to `delete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Span {
    first_page: usize,
    num_pages: Length,
    allocated_at: u64,
    predicted_short_lived: bool,
}

impl Span {
    pub const fn new(first_page: usize, num_pages: Length) -> Self {
        Span {
            first_page,
            num_pages,
            allocated_at: 0,
            predicted_short_lived: false,
        }
    }

    pub(crate) const fn with_lifetime(
        first_page: usize,
        num_pages: Length,
        allocated_at: u64,
        predicted_short_lived: bool,
    ) -> Self {
        Span {
            first_page,
            num_pages,
            allocated_at,
            predicted_short_lived,
        }
    }

    #[inline]
    pub fn first_page(&self) -> usize {
        self.first_page
    }

    #[inline]
    pub fn num_pages(&self) -> Length {
        self.num_pages
    }

    #[inline]
    pub fn allocated_at(&self) -> u64 {
        self.allocated_at
    }

    #[inline]
    pub fn predicted_short_lived(&self) -> bool {
        self.predicted_short_lived
    }
}

/// The subject's view of its own memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackingStats {
    /// Everything the subject has obtained from the system.
    pub system_bytes: u64,
    /// Backed memory not handed out to any span.
    pub free_bytes: u64,
    /// Memory returned to the system.
    pub unmapped_bytes: u64,
}

pub trait PageAllocator {
    /// Construct a subject into raw storage.
    ///
    /// # Safety
    /// `slot` must be valid for writes and suitably aligned. The storage is
    /// uninitialized; on return the value behind `slot` must be fully
    /// initialized.
    unsafe fn construct_in_place(slot: *mut Self, config: &SubjectConfig)
    where
        Self: Sized;

    /// Allocate a span of at least `n` pages. Takes the page heap lock.
    fn new_span(&self, n: Length, objects_per_span: usize) -> Option<Span>;

    /// Allocate a span of at least `n` pages whose first page number is a
    /// multiple of `align`. Takes the page heap lock.
    fn new_aligned(&self, n: Length, align: Length, objects_per_span: usize) -> Option<Span>;

    fn delete(&self, span: Span, objects_per_span: usize, guard: &PageHeapGuard);

    /// Return at least `n` pages to the system without breaking up any
    /// hugepage that still has live spans. Best effort.
    fn release_at_least_n_pages(&self, n: Length, guard: &PageHeapGuard) -> Length;

    /// Return at least `n` pages to the system, breaking up hugepages if
    /// needed. Must release at least `min(n, free pages)`.
    fn release_at_least_n_pages_breaking_hugepages(
        &self,
        n: Length,
        guard: &PageHeapGuard,
    ) -> Length;

    fn stats(&self, guard: &PageHeapGuard) -> BackingStats;

    /// Structured dump. Takes the page heap lock.
    fn print_in_pbtxt(&self, region: &mut PbtxtRegion<'_, '_>);

    /// Human-readable dump. Takes the page heap lock.
    fn print(&self, out: &mut Printer<'_>, everything: bool);
}

/// Construct a subject in its own raw storage block.
pub fn construct<A: PageAllocator>(config: &SubjectConfig) -> ArenaBox<A> {
    unsafe { ArenaBox::new_in_place(|slot| A::construct_in_place(slot, config)) }
}

/// Raw storage holding a value that must never be destructed.
///
/// The value is built in place in memory from the C allocator. Dropping the
/// box frees that memory without running the value's destructor; a subject
/// may hold state that cannot be unwound mid-process.
pub struct ArenaBox<T> {
    ptr: NonNull<T>,
}

impl<T> ArenaBox<T> {
    pub fn new(value: T) -> Self {
        unsafe { Self::new_in_place(|slot| slot.write(value)) }
    }

    /// Allocate uninitialized storage for a `T` and let `init` build the
    /// value there.
    ///
    /// # Safety
    /// `init` must fully initialize the value behind the pointer it is given.
    pub unsafe fn new_in_place<F>(init: F) -> Self
    where
        F: FnOnce(*mut T),
    {
        let align = align_of::<T>().max(size_of::<usize>());
        let size = size_of::<T>().max(1);
        let mut raw: *mut libc::c_void = ptr::null_mut();
        let rc = libc::posix_memalign(&mut raw, align, size);
        let Some(ptr) = NonNull::new(raw as *mut T).filter(|_| rc == 0) else {
            // align is a power of two, so the layout is always valid.
            handle_alloc_error(
                Layout::from_size_align(size, align).unwrap_or_else(|_| Layout::new::<T>()),
            );
        };
        init(ptr.as_ptr());
        ArenaBox { ptr }
    }

    pub fn as_ptr(&self) -> *const T {
        self.ptr.as_ptr()
    }
}

impl<T> Deref for ArenaBox<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> DerefMut for ArenaBox<T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { self.ptr.as_mut() }
    }
}

impl<T> Drop for ArenaBox<T> {
    fn drop(&mut self) {
        // Storage only; the value is deliberately not dropped.
        unsafe { libc::free(self.ptr.as_ptr() as *mut libc::c_void) };
    }
}
