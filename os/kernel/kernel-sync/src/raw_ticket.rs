use crate::{RawLock, RawUnlock};
use core::hint::spin_loop;
use core::sync::atomic::{AtomicUsize, Ordering};

/// FIFO ticket lock: `next` hands out tickets, `serving` names the owner.
pub struct RawTicket {
    next: AtomicUsize,
    serving: AtomicUsize,
}

impl Default for RawTicket {
    fn default() -> Self {
        Self::new()
    }
}

impl RawTicket {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicUsize::new(0),
            serving: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn acquire(&self) {
        let ticket = self.next.fetch_add(1, Ordering::Relaxed);
        while self.serving.load(Ordering::Acquire) != ticket {
            spin_loop();
        }
    }

    #[inline]
    pub fn try_acquire(&self) -> bool {
        let serving = self.serving.load(Ordering::Relaxed);
        self.next
            .compare_exchange(
                serving,
                serving.wrapping_add(1),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Number of holders plus waiters.
    #[inline]
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.next
            .load(Ordering::Relaxed)
            .wrapping_sub(self.serving.load(Ordering::Relaxed))
    }

    /// # Safety
    /// Must only be called by the current owner.
    #[inline]
    pub unsafe fn release(&self) {
        let current = self.serving.load(Ordering::Relaxed);
        self.serving
            .store(current.wrapping_add(1), Ordering::Release);
    }
}

impl RawLock for RawTicket {
    fn raw_lock(&self) {
        self.acquire();
    }

    fn raw_try_lock(&self) -> bool {
        self.try_acquire()
    }

    fn raw_is_locked(&self) -> bool {
        self.queue_len() != 0
    }
}

impl RawUnlock for RawTicket {
    unsafe fn raw_unlock(&self) {
        unsafe { self.release() }
    }
}
