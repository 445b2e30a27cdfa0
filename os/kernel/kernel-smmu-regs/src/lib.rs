//! # Typed SMMU registers
//!
//! The register file of an SMMUv1/v2 instance is split into 4 KiB or
//! 64 KiB pages (`pgshift` 12 or 16):
//!
//! ```text
//!  base + 0             GR0       global config, ID, SMR/S2CR tables
//!  base + 1 << pgshift  GR1       per-bank CBAR / CBA2R / CBFRSYNRA
//!  base + 2 << pgshift  IMPL_DEF0
//!  base + 6 << pgshift  IMPL_DEF1 micro-controller halt handshake
//!  base + size / 2      CB0, CB1, ... one page per context bank
//! ```
//!
//! Callers never deal in raw addresses. A register is named by a [`Reg`]
//! (address space + offset inside that space), values are the typed
//! `bitfield` structs in [`gr0`], [`gr1`], [`cb`] and [`impl_def`], and the
//! I/O itself goes through the [`SmmuMmio`] trait so that tests can swap in
//! a recording fake.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod cb;
pub mod gr0;
pub mod gr1;
pub mod impl_def;
mod mmio;

pub use mmio::{RegisterLayout, VolatileMmio};

/// One of the register address spaces of an SMMU instance.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Space {
    Gr0,
    Gr1,
    ImplDef0,
    ImplDef1,
    ContextBank(u8),
}

/// A register location: address space plus byte offset inside it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Reg {
    pub space: Space,
    pub offset: u32,
}

impl Reg {
    #[must_use]
    pub const fn new(space: Space, offset: u32) -> Self {
        Self { space, offset }
    }

    /// The register `bytes` further into the same space.
    #[must_use]
    pub const fn plus(self, bytes: u32) -> Self {
        Self {
            space: self.space,
            offset: self.offset + bytes,
        }
    }
}

/// Raw register I/O.
///
/// Implementations perform relaxed (unordered) accesses; ordering against
/// later accesses is requested explicitly with [`barrier`](Self::barrier).
pub trait SmmuMmio: Send + Sync {
    fn read32(&self, reg: Reg) -> u32;
    fn write32(&self, reg: Reg, value: u32);

    /// 64-bit read as two 32-bit halves, low word first.
    fn read64(&self, reg: Reg) -> u64 {
        let lo = u64::from(self.read32(reg));
        let hi = u64::from(self.read32(reg.plus(4)));
        hi << 32 | lo
    }

    /// 64-bit write as two 32-bit halves, low word first.
    #[allow(clippy::cast_possible_truncation)]
    fn write64(&self, reg: Reg, value: u64) {
        self.write32(reg, value as u32);
        self.write32(reg.plus(4), (value >> 32) as u32);
    }

    /// Write barrier: all earlier writes are visible to the device before
    /// any later one.
    fn barrier(&self) {
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }
}

/// A typed 32-bit register value.
pub trait Register32: Copy {
    fn from_raw(raw: u32) -> Self;
    fn into_raw(self) -> u32;
}

/// A typed 64-bit register value.
pub trait Register64: Copy {
    fn from_raw(raw: u64) -> Self;
    fn into_raw(self) -> u64;
}

macro_rules! register32 {
    ($($ty:ty),+ $(,)?) => {
        $(impl $crate::Register32 for $ty {
            #[inline]
            fn from_raw(raw: u32) -> Self {
                Self::from_bits(raw)
            }

            #[inline]
            fn into_raw(self) -> u32 {
                self.into_bits()
            }
        })+
    };
}
pub(crate) use register32;

/// Typed accessors on top of [`SmmuMmio`].
pub trait LoadStore: SmmuMmio {
    #[inline]
    fn load<R: Register32>(&self, reg: Reg) -> R {
        R::from_raw(self.read32(reg))
    }

    #[inline]
    fn store<R: Register32>(&self, reg: Reg, value: R) {
        self.write32(reg, value.into_raw());
    }

    #[inline]
    fn load64<R: Register64>(&self, reg: Reg) -> R {
        R::from_raw(self.read64(reg))
    }

    /// Read-modify-write.
    #[inline]
    fn modify<R: Register32>(&self, reg: Reg, f: impl FnOnce(R) -> R) -> R {
        let value = f(self.load(reg));
        self.store(reg, value);
        value
    }
}

impl<T: SmmuMmio + ?Sized> LoadStore for T {}
