//! # Locking primitives for translation-context bookkeeping
//!
//! Three lock families are provided:
//!
//! * [`SpinLock`] and [`SpinMutex`] never yield and may be taken from
//!   interrupt handlers when paired with an [`IrqGuard`]
//!   (see [`SpinLock::lock_irqsave`] and [`Mutex::lock_irq`]).
//! * [`SleepMutex`] is a FIFO ticket lock. It is the lock used for
//!   sections that conceptually may sleep (power sequencing, attach and
//!   detach, talking to a secure monitor); waiters are served in arrival
//!   order so a long attach cannot starve a detach.
//! * [`DualMutex`] switches between the two at run time, for data whose
//!   locking discipline depends on how it is configured.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod mutex;
mod raw_dual;
mod raw_spin;
mod raw_ticket;
mod spin_lock;

pub use irq::{IrqGuard, IrqMutexGuard};
pub use mutex::{Mutex, MutexGuard};
pub use raw_dual::RawDual;
pub use raw_spin::RawSpin;
pub use raw_ticket::RawTicket;
pub use spin_lock::{SpinLock, SpinLockGuard, SpinLockIrqGuard};

/// Test-and-set mutex. Short critical sections only.
pub type SpinMutex<T> = Mutex<T, RawSpin>;

/// Fair mutex for long-running or "sleepable" sections.
pub type SleepMutex<T> = Mutex<T, RawTicket>;

/// Mutex whose raw lock is a spin lock or a ticket lock, chosen at run time.
pub type DualMutex<T> = Mutex<T, RawDual>;

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawSpin::new(), value)
    }
}

impl<T> SleepMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawTicket::new(), value)
    }
}

impl<T> DualMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawDual::new(), value)
    }

    /// Switches the lock between spinning and queueing. Blocks until the
    /// current holder (if any) has released it.
    pub fn set_sleepable(&self, sleepable: bool) {
        self.raw().set_sleepable(sleepable);
    }

    #[must_use]
    pub fn is_sleepable(&self) -> bool {
        self.raw().is_sleepable()
    }
}

/// Acquisition half of a raw lock.
pub trait RawLock {
    fn raw_lock(&self);
    fn raw_try_lock(&self) -> bool;
    fn raw_is_locked(&self) -> bool;
}

/// Release half of a raw lock.
pub trait RawUnlock {
    /// # Safety
    /// The caller must currently own the lock.
    unsafe fn raw_unlock(&self);
}
