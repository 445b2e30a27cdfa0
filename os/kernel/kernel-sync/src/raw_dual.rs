use crate::{RawLock, RawSpin, RawTicket, RawUnlock};
use core::sync::atomic::{AtomicBool, Ordering};

/// A raw lock that is either a [`RawSpin`] or a [`RawTicket`], selected
/// at run time.
///
/// The mode may only change through [`set_sleepable`](Self::set_sleepable),
/// which holds both underlying locks while it flips the mode. A locker that
/// raced with a mode change notices the mismatch after acquiring and
/// retries in the new mode.
pub struct RawDual {
    sleepable: AtomicBool,
    held_sleepable: AtomicBool,
    spin: RawSpin,
    ticket: RawTicket,
}

impl Default for RawDual {
    fn default() -> Self {
        Self::new()
    }
}

impl RawDual {
    /// Starts out in spin mode.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            sleepable: AtomicBool::new(false),
            held_sleepable: AtomicBool::new(false),
            spin: RawSpin::new(),
            ticket: RawTicket::new(),
        }
    }

    #[must_use]
    pub fn is_sleepable(&self) -> bool {
        self.sleepable.load(Ordering::Acquire)
    }

    fn take(&self, sleepable: bool) {
        if sleepable {
            self.ticket.acquire();
        } else {
            self.spin.acquire();
        }
    }

    fn try_take(&self, sleepable: bool) -> bool {
        if sleepable {
            self.ticket.try_acquire()
        } else {
            self.spin.try_acquire()
        }
    }

    unsafe fn give(&self, sleepable: bool) {
        unsafe {
            if sleepable {
                self.ticket.release();
            } else {
                self.spin.release();
            }
        }
    }

    /// Switches between spin and ticket mode.
    pub fn set_sleepable(&self, sleepable: bool) {
        self.raw_lock();
        let current = self.held_sleepable.load(Ordering::Relaxed);
        if current != sleepable {
            self.take(sleepable);
            self.sleepable.store(sleepable, Ordering::Release);
            unsafe { self.give(sleepable) };
        }
        unsafe { self.give(current) };
    }
}

impl RawLock for RawDual {
    fn raw_lock(&self) {
        loop {
            let mode = self.is_sleepable();
            self.take(mode);
            if self.is_sleepable() == mode {
                self.held_sleepable.store(mode, Ordering::Relaxed);
                return;
            }
            unsafe { self.give(mode) };
        }
    }

    fn raw_try_lock(&self) -> bool {
        let mode = self.is_sleepable();
        if !self.try_take(mode) {
            return false;
        }
        if self.is_sleepable() != mode {
            unsafe { self.give(mode) };
            return false;
        }
        self.held_sleepable.store(mode, Ordering::Relaxed);
        true
    }

    fn raw_is_locked(&self) -> bool {
        self.spin.is_taken() || self.ticket.queue_len() != 0
    }
}

impl RawUnlock for RawDual {
    unsafe fn raw_unlock(&self) {
        let mode = self.held_sleepable.load(Ordering::Relaxed);
        unsafe { self.give(mode) }
    }
}
