//! Local interrupt masking.
//!
//! On bare-metal builds (`target_os = "none"`) the guard really masks
//! interrupts: `cli`/`sti` with the `RFLAGS.IF` snapshot on `x86_64`,
//! `DAIF.I` on `aarch64`. Hosted builds (unit tests, tooling) have no
//! privileged interrupt state to touch and the guard only records that a
//! masked section was entered.

use crate::{Mutex, MutexGuard, RawLock, RawUnlock};
use core::ops::{Deref, DerefMut};

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
mod arch {
    /// `RFLAGS.IF`.
    const IF: u64 = 1 << 9;

    #[inline]
    pub fn save_and_disable() -> bool {
        let flags: u64;
        unsafe {
            core::arch::asm!("pushfq; pop {}", out(reg) flags, options(nostack, preserves_flags));
        }
        let enabled = flags & IF != 0;
        if enabled {
            unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
        }
        enabled
    }

    #[inline]
    pub fn restore(enabled: bool) {
        if enabled {
            unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
        }
    }
}

#[cfg(all(target_os = "none", target_arch = "aarch64"))]
mod arch {
    /// `DAIF.I`.
    const DAIF_I: u64 = 1 << 7;

    #[inline]
    pub fn save_and_disable() -> bool {
        let daif: u64;
        unsafe {
            core::arch::asm!("mrs {}, daif", out(reg) daif, options(nomem, nostack, preserves_flags));
            core::arch::asm!("msr daifset, #2", options(nomem, nostack, preserves_flags));
        }
        daif & DAIF_I == 0
    }

    #[inline]
    pub fn restore(enabled: bool) {
        if enabled {
            unsafe { core::arch::asm!("msr daifclr, #2", options(nomem, nostack, preserves_flags)) }
        }
    }
}

#[cfg(not(all(
    target_os = "none",
    any(target_arch = "x86_64", target_arch = "aarch64")
)))]
mod arch {
    #[inline]
    pub const fn save_and_disable() -> bool {
        false
    }

    #[inline]
    pub const fn restore(_enabled: bool) {}
}

/// RAII guard: masks local interrupts on creation, restores the previous
/// state on drop. Guards nest; only the outermost one re-enables.
pub struct IrqGuard {
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            were_enabled: arch::save_and_disable(),
        }
    }

    /// Whether interrupts were enabled when this guard was taken.
    #[inline]
    #[must_use]
    pub const fn were_enabled(&self) -> bool {
        self.were_enabled
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        arch::restore(self.were_enabled);
    }
}

/// A [`MutexGuard`] taken with interrupts masked.
pub struct IrqMutexGuard<'a, T, R: RawLock + RawUnlock> {
    guard: MutexGuard<'a, T, R>,
    _irq: IrqGuard,
}

impl<T, R: RawLock + RawUnlock> Mutex<T, R> {
    /// Masks interrupts, then locks. Unlock happens before the mask is
    /// restored.
    #[inline]
    pub fn lock_irq(&self) -> IrqMutexGuard<'_, T, R> {
        let irq = IrqGuard::new();
        let guard = self.lock();
        IrqMutexGuard { guard, _irq: irq }
    }
}

impl<T, R: RawLock + RawUnlock> Deref for IrqMutexGuard<'_, T, R> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T, R: RawLock + RawUnlock> DerefMut for IrqMutexGuard<'_, T, R> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
