use core::marker::PhantomData;
use core::sync::atomic::{AtomicI32, Ordering};

/// A simple mutex built on futex (Linux) or a spin fallback elsewhere.
///
/// The subject's metadata is only ever touched under this lock, so it has to
/// work before and after anything else in the process is set up.
pub struct RawMutex {
    /// 0 = unlocked, 1 = locked no waiters, 2 = locked with waiters
    state: AtomicI32,
}

unsafe impl Send for RawMutex {}
unsafe impl Sync for RawMutex {}

impl RawMutex {
    pub const fn new() -> Self {
        Self {
            state: AtomicI32::new(0),
        }
    }

    #[inline]
    pub fn lock(&self) {
        // Fast path: uncontended
        if self
            .state
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        self.lock_slow();
    }

    #[cold]
    fn lock_slow(&self) {
        loop {
            let old = self.state.swap(2, Ordering::Acquire);
            if old == 0 {
                return;
            }
            #[cfg(target_os = "linux")]
            unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    &self.state as *const AtomicI32,
                    libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                    2i32,
                    core::ptr::null::<libc::timespec>(),
                );
            }
            #[cfg(not(target_os = "linux"))]
            {
                core::hint::spin_loop();
            }
        }
    }

    #[inline]
    pub fn unlock(&self) {
        let old = self.state.fetch_sub(1, Ordering::Release);
        if old != 1 {
            // There were waiters
            self.state.store(0, Ordering::Release);
            self.wake_one();
        }
    }

    #[cold]
    fn wake_one(&self) {
        #[cfg(target_os = "linux")]
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                &self.state as *const AtomicI32,
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                1i32,
            );
        }
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != 0
    }
}

impl Default for RawMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide page heap lock.
///
/// Every subject instance shares it. Deallocation, both release paths and the
/// stats read must happen while it is held; allocation and the dump paths take
/// it internally.
static PAGEHEAP_LOCK: RawMutex = RawMutex::new();

/// Proof that the page heap lock is held by the current thread.
///
/// Subject methods that mutate shared state take `&PageHeapGuard` so the
/// exclusion scope is checked by the type system rather than by convention.
pub struct PageHeapGuard {
    // Unlocking must happen on the locking thread.
    _not_send: PhantomData<*const ()>,
}

/// Acquire the page heap lock for the lifetime of the returned guard.
#[inline]
pub fn pageheap_lock() -> PageHeapGuard {
    PAGEHEAP_LOCK.lock();
    PageHeapGuard {
        _not_send: PhantomData,
    }
}

impl Drop for PageHeapGuard {
    fn drop(&mut self) {
        PAGEHEAP_LOCK.unlock();
    }
}
