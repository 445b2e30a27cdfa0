use crate::{RawLock, RawUnlock};
use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, Ordering};

/// Test-and-test-and-set flag.
pub struct RawSpin {
    taken: AtomicBool,
}

impl Default for RawSpin {
    fn default() -> Self {
        Self::new()
    }
}

impl RawSpin {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            taken: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn acquire(&self) {
        while self.taken.swap(true, Ordering::Acquire) {
            // Wait on a plain load so the cache line stays shared.
            while self.taken.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
    }

    #[inline]
    pub fn try_acquire(&self) -> bool {
        !self.taken.swap(true, Ordering::Acquire)
    }

    #[inline]
    #[must_use]
    pub fn is_taken(&self) -> bool {
        self.taken.load(Ordering::Relaxed)
    }

    /// # Safety
    /// Must only be called by the current owner.
    #[inline]
    pub unsafe fn release(&self) {
        self.taken.store(false, Ordering::Release);
    }
}

impl RawLock for RawSpin {
    fn raw_lock(&self) {
        self.acquire();
    }

    fn raw_try_lock(&self) -> bool {
        self.try_acquire()
    }

    fn raw_is_locked(&self) -> bool {
        self.is_taken()
    }
}

impl RawUnlock for RawSpin {
    unsafe fn raw_unlock(&self) {
        unsafe { self.release() }
    }
}
