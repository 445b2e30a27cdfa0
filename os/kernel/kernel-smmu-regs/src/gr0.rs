//! Global register space 0: configuration, identification, global fault
//! status, TLB maintenance and the stream-matching tables.

use crate::{Reg, Space};
use bitfield_struct::bitfield;

pub const SCR0: u32 = 0x0;
pub const ID0: u32 = 0x20;
pub const ID1: u32 = 0x24;
pub const ID2: u32 = 0x28;
pub const SGFSR: u32 = 0x48;
pub const SGFSYNR0: u32 = 0x50;
pub const SGFSYNR1: u32 = 0x54;
pub const SGFSYNR2: u32 = 0x58;
pub const TLBIVMID: u32 = 0x64;
pub const TLBIALLNSNH: u32 = 0x68;
pub const TLBIALLH: u32 = 0x6c;
pub const STLBGSYNC: u32 = 0x70;
pub const STLBGSTATUS: u32 = 0x74;
pub const SMR_BASE: u32 = 0x800;
pub const S2CR_BASE: u32 = 0xc00;

#[must_use]
pub const fn reg(offset: u32) -> Reg {
    Reg::new(Space::Gr0, offset)
}

/// Stream match register `n`.
#[must_use]
pub const fn smr(n: u8) -> Reg {
    reg(SMR_BASE + 4 * n as u32)
}

/// Stream-to-context register `n`.
#[must_use]
pub const fn s2cr(n: u8) -> Reg {
    reg(S2CR_BASE + 4 * n as u32)
}

/// `sCR0`: global (non-secure) configuration.
#[bitfield(u32, order = Lsb)]
#[derive(Eq, PartialEq)]
pub struct Scr0 {
    /// Bit 0 — CLIENTPD: client port disable; all transactions bypass.
    pub clientpd: bool,
    /// Bit 1 — GFRE: global fault report enable.
    pub gfre: bool,
    /// Bit 2 — GFIE: global fault interrupt enable.
    pub gfie: bool,
    #[bits(1)]
    __: u8,
    /// Bit 4 — GCFGFRE: global configuration fault report enable.
    pub gcfgfre: bool,
    /// Bit 5 — GCFGFIE: global configuration fault interrupt enable.
    pub gcfgfie: bool,
    #[bits(4)]
    __: u8,
    /// Bit 10 — USFCFG: unidentified stream faults instead of bypassing.
    pub usfcfg: bool,
    /// Bit 11 — VMIDPNE: VMID private namespace enable.
    pub vmidpne: bool,
    /// Bit 12 — PTM: private TLB maintenance.
    pub ptm: bool,
    /// Bit 13 — FB: force broadcast of TLB maintenance.
    pub fb: bool,
    /// Bits 14–15 — BSU: barrier shareability upgrade.
    #[bits(2)]
    pub bsu: u8,
    #[bits(16)]
    __: u16,
}

/// `ID0`: translation and stream-matching capabilities.
#[bitfield(u32, order = Lsb)]
#[derive(Eq, PartialEq)]
pub struct Id0 {
    /// Bits 0–7 — NUMSMRG: number of stream match register groups.
    #[bits(8)]
    pub numsmrg: u8,
    #[bits(1)]
    __: u8,
    /// Bits 9–12 — NUMSIDB: stream ID width.
    #[bits(4)]
    pub numsidb: u8,
    #[bits(1)]
    __: u8,
    /// Bit 14 — CTTW: coherent translation table walk.
    pub cttw: bool,
    #[bits(1)]
    __: u8,
    /// Bits 16–23 — NUMIRPT: number of context interrupts (v1).
    #[bits(8)]
    pub numirpt: u8,
    #[bits(2)]
    __: u8,
    /// Bit 26 — ATOSNS: address translation operations *not* supported.
    pub atosns: bool,
    /// Bit 27 — SMS: stream match support.
    pub sms: bool,
    /// Bit 28 — NTS: nested translation.
    pub nts: bool,
    /// Bit 29 — S2TS: stage-2 translation.
    pub s2ts: bool,
    /// Bit 30 — S1TS: stage-1 translation.
    pub s1ts: bool,
    #[bits(1)]
    __: u8,
}

/// `ID1`: register-file geometry and context bank counts.
#[bitfield(u32, order = Lsb)]
#[derive(Eq, PartialEq)]
pub struct Id1 {
    /// Bits 0–7 — NUMCB.
    #[bits(8)]
    pub numcb: u8,
    #[bits(8)]
    __: u8,
    /// Bits 16–23 — NUMS2CB: banks that only support stage-2.
    #[bits(8)]
    pub nums2cb: u8,
    #[bits(4)]
    __: u8,
    /// Bits 28–30 — NUMPAGENDXB.
    #[bits(3)]
    pub numpagendxb: u8,
    /// Bit 31 — PAGESIZE: 64 KiB register pages when set.
    pub pagesize: bool,
}

impl Id1 {
    /// log2 of the register page size.
    #[must_use]
    pub const fn pgshift(self) -> u32 {
        if self.pagesize() { 16 } else { 12 }
    }
}

/// `ID2`: address sizes and translation granules.
#[bitfield(u32, order = Lsb)]
#[derive(Eq, PartialEq)]
pub struct Id2 {
    /// Bits 0–3 — IAS: intermediate physical address size.
    #[bits(4)]
    pub ias: u8,
    /// Bits 4–7 — OAS: output address size.
    #[bits(4)]
    pub oas: u8,
    /// Bits 8–11 — UBS: upstream bus size.
    #[bits(4)]
    pub ubs: u8,
    /// Bit 12 — 4 KiB granule supported.
    pub ptfs_4k: bool,
    /// Bit 13 — 16 KiB granule supported.
    pub ptfs_16k: bool,
    /// Bit 14 — 64 KiB granule supported.
    pub ptfs_64k: bool,
    #[bits(17)]
    __: u32,
}

/// Decodes an IAS/OAS/UBS field into an address width in bits.
#[must_use]
pub const fn size_to_bits(size: u8) -> u32 {
    match size {
        0 => 32,
        1 => 36,
        2 => 40,
        3 => 42,
        4 => 44,
        _ => 48,
    }
}

/// `sGFSR`: global fault status. Write-one-to-clear.
#[bitfield(u32, order = Lsb)]
#[derive(Eq, PartialEq)]
pub struct Gfsr {
    /// Bit 0 — ICF: invalid context fault.
    pub icf: bool,
    /// Bit 1 — USF: unidentified stream fault.
    pub usf: bool,
    /// Bit 2 — SMCF: stream match conflict fault.
    pub smcf: bool,
    /// Bit 3 — UCBF: unimplemented context bank fault.
    pub ucbf: bool,
    /// Bit 4 — UCIF: unimplemented context interrupt fault.
    pub ucif: bool,
    /// Bit 5 — CAF: configuration access fault.
    pub caf: bool,
    /// Bit 6 — EF: external fault.
    pub ef: bool,
    /// Bit 7 — PF: permission fault.
    pub pf: bool,
    #[bits(23)]
    __: u32,
    /// Bit 31 — MULTI: more than one fault was recorded.
    pub multi: bool,
}

/// `SMR(n)`: exact or masked stream ID match.
#[bitfield(u32, order = Lsb)]
#[derive(Eq, PartialEq)]
pub struct Smr {
    /// Bits 0–14 — ID.
    #[bits(15)]
    pub id: u16,
    #[bits(1)]
    __: u8,
    /// Bits 16–30 — MASK: ID bits to ignore.
    #[bits(15)]
    pub mask: u16,
    /// Bit 31 — VALID.
    pub valid: bool,
}

impl Smr {
    /// Largest stream ID representable in the ID field.
    pub const ID_MAX: u16 = 0x7fff;

    /// An exact-match entry for `id`.
    #[must_use]
    pub const fn exact(id: u16) -> Self {
        Self::new().with_id(id).with_valid(true)
    }
}

/// `S2CR.TYPE`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum S2crType {
    Translate = 0,
    Bypass = 1,
    Fault = 2,
    Reserved = 3,
}

impl S2crType {
    #[must_use]
    pub const fn into_bits(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn from_bits(value: u8) -> Self {
        match value & 0b11 {
            0 => Self::Translate,
            1 => Self::Bypass,
            2 => Self::Fault,
            _ => Self::Reserved,
        }
    }
}

/// `S2CR(n)`: what happens to a transaction matched by `SMR(n)`.
#[bitfield(u32, order = Lsb)]
#[derive(Eq, PartialEq)]
pub struct S2cr {
    /// Bits 0–7 — CBNDX: target context bank for `Translate`.
    #[bits(8)]
    pub cbndx: u8,
    #[bits(8)]
    __: u8,
    /// Bits 16–17 — TYPE.
    #[bits(2)]
    pub kind: S2crType,
    #[bits(14)]
    __: u16,
}

impl S2cr {
    #[must_use]
    pub const fn translate(cbndx: u8) -> Self {
        Self::new().with_kind(S2crType::Translate).with_cbndx(cbndx)
    }

    #[must_use]
    pub const fn bypass() -> Self {
        Self::new().with_kind(S2crType::Bypass)
    }
}

/// `sTLBGSTATUS` and the per-bank `TLBSTATUS` share this layout.
#[bitfield(u32, order = Lsb)]
#[derive(Eq, PartialEq)]
pub struct TlbSyncStatus {
    /// Bit 0 — SACTIVE: a sync is still in progress.
    pub active: bool,
    #[bits(31)]
    __: u32,
}

crate::register32!(Scr0, Id0, Id1, Id2, Gfsr, Smr, S2cr, TlbSyncStatus);
