//! Context bank register space.

use crate::{Reg, Register64, Space};
use bitfield_struct::bitfield;

pub const SCTLR: u32 = 0x0;
pub const ACTLR: u32 = 0x4;
pub const RESUME: u32 = 0x8;
pub const TTBCR2: u32 = 0x10;
pub const TTBR0: u32 = 0x20;
pub const TTBR1: u32 = 0x28;
pub const TTBCR: u32 = 0x30;
pub const CONTEXTIDR: u32 = 0x34;
pub const MAIR0: u32 = 0x38;
pub const MAIR1: u32 = 0x3c;
pub const PAR: u32 = 0x50;
pub const FSR: u32 = 0x58;
pub const FSRRESTORE: u32 = 0x5c;
pub const FAR: u32 = 0x60;
pub const FSYNR0: u32 = 0x68;
pub const TLBIVA: u32 = 0x600;
pub const TLBIASID: u32 = 0x610;
pub const TLBIALL: u32 = 0x618;
pub const TLBIVAL: u32 = 0x620;
pub const TLBIIPAS2: u32 = 0x630;
pub const TLBIIPAS2L: u32 = 0x638;
pub const TLBSYNC: u32 = 0x7f0;
pub const TLBSTATUS: u32 = 0x7f4;
pub const ATS1PR: u32 = 0x800;
pub const ATSR: u32 = 0x8f0;

/// ASID position in `TTBRn` and in stage-1 TLBI-by-VA operands.
pub const TTBR_ASID_SHIFT: u32 = 48;

/// `RESUME` value: retry the stalled transaction.
pub const RESUME_RETRY: u32 = 0;
/// `RESUME` value: abort the stalled transaction.
pub const RESUME_TERMINATE: u32 = 1;

/// Qualcomm `ACTLR`: inner, outer and non-shareable hints.
pub const ACTLR_QCOM_SHAREABILITY: u32 = (1 << 28) | (1 << 29) | (1 << 30);

#[must_use]
pub const fn reg(cbndx: u8, offset: u32) -> Reg {
    Reg::new(Space::ContextBank(cbndx), offset)
}

#[must_use]
pub const fn sctlr(cbndx: u8) -> Reg {
    reg(cbndx, SCTLR)
}

#[must_use]
pub const fn fsr(cbndx: u8) -> Reg {
    reg(cbndx, FSR)
}

/// `SCTLR`: context bank system control.
#[bitfield(u32, order = Lsb)]
#[derive(Eq, PartialEq)]
pub struct Sctlr {
    /// Bit 0 — M: translation enable.
    pub m: bool,
    /// Bit 1 — TRE: TEX remap enable.
    pub tre: bool,
    /// Bit 2 — AFE: access flag enable.
    pub afe: bool,
    #[bits(1)]
    __: u8,
    /// Bit 4 — E: big-endian translation tables.
    pub e: bool,
    /// Bit 5 — CFRE: context fault report enable.
    pub cfre: bool,
    /// Bit 6 — CFIE: context fault interrupt enable.
    pub cfie: bool,
    /// Bit 7 — CFCFG: stall (rather than terminate) on context fault.
    pub cfcfg: bool,
    /// Bit 8 — HUPCF: hit under previous context fault.
    pub hupcf: bool,
    #[bits(3)]
    __: u8,
    /// Bit 12 — ASIDPNE: ASID private namespace enable.
    pub asidpne: bool,
    #[bits(19)]
    __: u32,
}

/// `FSR`: context fault status. Write-one-to-clear.
#[bitfield(u32, order = Lsb)]
#[derive(Eq, PartialEq)]
pub struct Fsr {
    #[bits(1)]
    __: u8,
    /// Bit 1 — TF: translation fault.
    pub tf: bool,
    /// Bit 2 — AFF: access flag fault.
    pub aff: bool,
    /// Bit 3 — PF: permission fault.
    pub pf: bool,
    /// Bit 4 — EF: external fault.
    pub ef: bool,
    /// Bit 5 — TLBMCF: TLB match conflict.
    pub tlbmcf: bool,
    /// Bit 6 — TLBLKF: TLB lock fault.
    pub tlblkf: bool,
    /// Bit 7 — ASF: address size fault.
    pub asf: bool,
    /// Bit 8 — UUT: unsupported upstream transaction.
    pub uut: bool,
    #[bits(21)]
    __: u32,
    /// Bit 30 — SS: the faulting transaction is stalled.
    pub ss: bool,
    /// Bit 31 — MULTI.
    pub multi: bool,
}

impl Fsr {
    /// Every fault-reporting bit; writing this clears the register.
    pub const FAULT_MASK: u32 = 0xc000_01fe;

    #[must_use]
    pub const fn all_faults() -> Self {
        Self::from_bits(Self::FAULT_MASK)
    }

    #[must_use]
    pub const fn has_fault(self) -> bool {
        self.into_bits() & Self::FAULT_MASK != 0
    }

    /// Names of the bits set, for fault reports.
    pub fn set_bit_names(self) -> impl Iterator<Item = &'static str> {
        const NAMES: [(u32, &str); 10] = [
            (1 << 1, "TF"),
            (1 << 2, "AFF"),
            (1 << 3, "PF"),
            (1 << 4, "EF"),
            (1 << 5, "TLBMCF"),
            (1 << 6, "TLBLKF"),
            (1 << 7, "ASF"),
            (1 << 8, "UUT"),
            (1 << 30, "SS"),
            (1 << 31, "MULTI"),
        ];
        let bits = self.into_bits();
        NAMES
            .into_iter()
            .filter(move |(mask, _)| bits & mask != 0)
            .map(|(_, name)| name)
    }
}

/// `FSYNR0`: syndrome of the recorded context fault.
#[bitfield(u32, order = Lsb)]
#[derive(Eq, PartialEq)]
pub struct Fsynr0 {
    /// Bits 0–1 — PLVL: table level of the fault.
    #[bits(2)]
    pub plvl: u8,
    #[bits(2)]
    __: u8,
    /// Bit 4 — WNR: write, not read.
    pub wnr: bool,
    /// Bit 5 — PNU: privileged, not unprivileged.
    pub pnu: bool,
    /// Bit 6 — IND: instruction, not data.
    pub ind: bool,
    /// Bit 7 — NSSTATE.
    pub nsstate: bool,
    /// Bit 8 — NSATTR.
    pub nsattr: bool,
    /// Bit 9 — ATOF: fault caused by an ATOS operation.
    pub atof: bool,
    /// Bit 10 — PTWF: fault during the table walk.
    pub ptwf: bool,
    /// Bit 11 — AFR: asynchronous fault.
    pub afr: bool,
    #[bits(20)]
    __: u32,
}

/// `PAR`: result of the last `ATS1PR`.
#[bitfield(u64, order = Lsb)]
#[derive(Eq, PartialEq)]
pub struct Par {
    /// Bit 0 — F: the translation faulted; the rest holds a syndrome.
    pub f: bool,
    #[bits(11)]
    __: u16,
    /// Bits 12–47 — PA\[47:12\].
    #[bits(36)]
    pub pa: u64,
    #[bits(16)]
    __: u16,
}

impl Par {
    /// Output address for `iova`, or `None` when the walk faulted.
    #[must_use]
    pub const fn translate(self, iova: u64) -> Option<u64> {
        if self.f() {
            None
        } else {
            Some(self.pa() << 12 | (iova & 0xfff))
        }
    }
}

impl Register64 for Par {
    fn from_raw(raw: u64) -> Self {
        Self::from_bits(raw)
    }

    fn into_raw(self) -> u64 {
        self.into_bits()
    }
}

/// `ATSR`: address translation status.
#[bitfield(u32, order = Lsb)]
#[derive(Eq, PartialEq)]
pub struct Atsr {
    /// Bit 0 — ACTIVE: a translation operation is in flight.
    pub active: bool,
    #[bits(31)]
    __: u32,
}

crate::register32!(Sctlr, Fsr, Fsynr0, Atsr);
