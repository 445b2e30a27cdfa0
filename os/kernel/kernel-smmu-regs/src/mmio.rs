use crate::{Reg, SmmuMmio, Space};
use core::ptr::NonNull;

/// Where each register space sits inside the mapped SMMU window.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RegisterLayout {
    /// log2 of the register page size (12 or 16, see `ID1.PAGESIZE`).
    pub pgshift: u32,
    /// Total size of the mapped register window in bytes.
    pub size: usize,
}

impl RegisterLayout {
    #[must_use]
    pub const fn new(pgshift: u32, size: usize) -> Self {
        Self { pgshift, size }
    }

    /// Byte offset of `reg` from the start of the window.
    #[must_use]
    pub const fn byte_offset(&self, reg: Reg) -> usize {
        let page = 1usize << self.pgshift;
        let base = match reg.space {
            Space::Gr0 => 0,
            Space::Gr1 => page,
            Space::ImplDef0 => 2 * page,
            Space::ImplDef1 => 6 * page,
            Space::ContextBank(n) => (self.size >> 1) + n as usize * page,
        };
        base + reg.offset as usize
    }
}

/// Volatile accesses into a mapped register window.
pub struct VolatileMmio {
    base: NonNull<u8>,
    layout: RegisterLayout,
}

// Safety: device registers; every access is a single volatile load/store.
unsafe impl Send for VolatileMmio {}
unsafe impl Sync for VolatileMmio {}

impl VolatileMmio {
    /// # Safety
    /// `base` must map `layout.size` bytes of SMMU registers as device
    /// memory for the lifetime of the returned value.
    #[must_use]
    pub const unsafe fn new(base: NonNull<u8>, layout: RegisterLayout) -> Self {
        Self { base, layout }
    }

    #[must_use]
    pub const fn layout(&self) -> RegisterLayout {
        self.layout
    }

    fn ptr(&self, reg: Reg) -> *mut u32 {
        let offset = self.layout.byte_offset(reg);
        debug_assert!(offset + 4 <= self.layout.size);
        unsafe { self.base.as_ptr().add(offset).cast::<u32>() }
    }
}

impl SmmuMmio for VolatileMmio {
    fn read32(&self, reg: Reg) -> u32 {
        unsafe { self.ptr(reg).read_volatile() }
    }

    fn write32(&self, reg: Reg, value: u32) {
        unsafe { self.ptr(reg).write_volatile(value) }
    }
}
