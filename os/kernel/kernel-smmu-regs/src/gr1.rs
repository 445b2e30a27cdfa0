//! Global register space 1: per-context-bank attribute registers.

use crate::{Reg, Space};
use bitfield_struct::bitfield;

pub const CBAR_BASE: u32 = 0x0;
pub const CBFRSYNRA_BASE: u32 = 0x400;
pub const CBA2R_BASE: u32 = 0x800;

#[must_use]
pub const fn cbar(n: u8) -> Reg {
    Reg::new(Space::Gr1, CBAR_BASE + 4 * n as u32)
}

#[must_use]
pub const fn cbfrsynra(n: u8) -> Reg {
    Reg::new(Space::Gr1, CBFRSYNRA_BASE + 4 * n as u32)
}

#[must_use]
pub const fn cba2r(n: u8) -> Reg {
    Reg::new(Space::Gr1, CBA2R_BASE + 4 * n as u32)
}

/// `CBAR.TYPE`: which stages the bank translates.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum CbarType {
    S2Trans = 0,
    S1TransS2Bypass = 1,
    S1TransS2Fault = 2,
    S1TransS2Trans = 3,
}

impl CbarType {
    #[must_use]
    pub const fn into_bits(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn from_bits(value: u8) -> Self {
        match value & 0b11 {
            0 => Self::S2Trans,
            1 => Self::S1TransS2Bypass,
            2 => Self::S1TransS2Fault,
            _ => Self::S1TransS2Trans,
        }
    }

    /// Whether the bank runs a stage-1 (ASID-tagged) table.
    #[must_use]
    pub const fn is_stage1(self) -> bool {
        !matches!(self, Self::S2Trans)
    }
}

/// `CBAR(n)`: context bank attributes.
#[bitfield(u32, order = Lsb)]
#[derive(Eq, PartialEq)]
pub struct Cbar {
    /// Bits 0–7 — VMID.
    #[bits(8)]
    pub vmid: u8,
    /// Bits 8–9 — BPSHCFG: bypass shareability (stage-1 banks).
    #[bits(2)]
    pub bpshcfg: u8,
    #[bits(2)]
    __: u8,
    /// Bits 12–15 — MEMATTR: bypass memory attributes (stage-1 banks).
    #[bits(4)]
    pub memattr: u8,
    /// Bits 16–17 — TYPE.
    #[bits(2)]
    pub kind: CbarType,
    #[bits(6)]
    __: u8,
    /// Bits 24–31 — IRPTNDX: context interrupt index (SMMUv1 only).
    #[bits(8)]
    pub irptndx: u8,
}

impl Cbar {
    /// BPSHCFG: non-shareable.
    pub const BPSHCFG_NSH: u8 = 3;
    /// MEMATTR: outer and inner write-back.
    pub const MEMATTR_WB: u8 = 0xf;
}

/// `CBA2R(n)`: extended attributes. Must be written before `CBAR(n)`.
#[bitfield(u32, order = Lsb)]
#[derive(Eq, PartialEq)]
pub struct Cba2r {
    /// Bit 0 — VA64: AArch64 translation regime.
    pub rw64: bool,
    #[bits(31)]
    __: u32,
}

/// `CBFRSYNRA(n)`: stream ID of the last context fault on bank `n`.
#[bitfield(u32, order = Lsb)]
#[derive(Eq, PartialEq)]
pub struct Cbfrsynra {
    #[bits(16)]
    pub sid: u16,
    #[bits(16)]
    __: u16,
}

crate::register32!(Cbar, Cba2r, Cbfrsynra);
