//! Platform configuration and probed hardware capabilities.

use crate::SmmuError;
use crate::secure::AssignFailurePolicy;
use alloc::vec::Vec;
use bitflags::bitflags;
use kernel_smmu_regs::gr0::{self, Id0, Id1, Id2, Smr, size_to_bits};
use kernel_smmu_regs::{LoadStore, SmmuMmio};
use log::{debug, error, info};

/// Largest number of stream IDs a single device may carry.
pub const MAX_MASTER_STREAMIDS: usize = 45;

/// Largest ASID handed out to dynamic domains.
pub const MAX_ASID: u16 = 0xff;

/// Capacity of the context bank and SMR bitmaps.
pub const MAX_INDICES: u8 = 128;

bitflags! {
    /// Controller quirks and behaviours selected by the platform.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct SmmuOptions: u32 {
        /// Invalidate the whole context after every `map`.
        const INVALIDATE_ON_MAP     = 1 << 0;
        /// Halt and invalidate before an ATOS query.
        const HALT_AND_TLB_ON_ATOS  = 1 << 1;
        /// Register contents survive power collapse; no extra regulator vote.
        const REGISTER_SAVE         = 1 << 2;
        /// Leave SMR, S2CR and context bank state from the boot loader alone.
        const SKIP_INIT             = 1 << 3;
        /// Sync the context TLB before resuming a stalled transaction.
        const ERRATA_CTX_FAULT_HANG = 1 << 4;
        /// Address-size faults are fatal.
        const FATAL_ASF             = 1 << 5;
        /// Skip the SMR mask width self-test at probe.
        const NO_SMR_CHECK          = 1 << 6;
        /// Dynamic domains may share a context bank.
        const DYNAMIC               = 1 << 7;
        /// Secure domains use the context bank pre-programmed by firmware.
        const STATIC_CB             = 1 << 8;
    }
}

bitflags! {
    /// Capabilities decoded from the ID registers.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct SmmuFeatures: u32 {
        const COHERENT_WALK = 1 << 0;
        const STREAM_MATCH  = 1 << 1;
        const TRANS_S1      = 1 << 2;
        const TRANS_S2      = 1 << 3;
        const TRANS_NESTED  = 1 << 4;
        const TRANS_OPS     = 1 << 5;
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum SmmuVersion {
    V1,
    #[default]
    V2,
}

/// Implementation flavour; selects implementation-defined register values.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum SmmuModel {
    #[default]
    Generic,
    QcomV2,
}

/// Restricts the translation stages advertised by the hardware.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ForcedStage {
    Stage1,
    Stage2,
}

/// An implementation-defined GR0 register written on power-up.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ImplDefRegister {
    pub offset: u32,
    pub value: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmmuConfig {
    pub version: SmmuVersion,
    pub model: SmmuModel,
    pub options: SmmuOptions,
    pub force_stage: Option<ForcedStage>,
    /// Delay before the regulator is switched off after the last vote.
    pub regulator_defer_ms: u32,
    pub assign_failure_policy: AssignFailurePolicy,
    pub impl_def_attach_registers: Vec<ImplDefRegister>,
    /// The page-table walker is cache coherent.
    pub dma_coherent: bool,
    /// Number of context interrupt lines; `0` means one per context bank.
    pub num_context_irqs: u8,
}

impl Default for SmmuConfig {
    fn default() -> Self {
        Self {
            version: SmmuVersion::V2,
            model: SmmuModel::Generic,
            options: SmmuOptions::empty(),
            force_stage: None,
            regulator_defer_ms: 0,
            assign_failure_policy: AssignFailurePolicy::default(),
            impl_def_attach_registers: Vec::new(),
            dma_coherent: false,
            num_context_irqs: 0,
        }
    }
}

/// What the controller can do, as read from `ID0`..`ID2`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SmmuHwInfo {
    pub version: SmmuVersion,
    pub features: SmmuFeatures,
    pub num_mapping_groups: u8,
    pub num_context_banks: u8,
    pub num_s2_context_banks: u8,
    pub pgshift: u32,
    pub va_size: u32,
    pub ipa_size: u32,
    pub pa_size: u32,
    pub ubs: u8,
    pub pgsize_bitmap: u64,
}

const SZ_4K: u64 = 1 << 12;
const SZ_16K: u64 = 1 << 14;
const SZ_64K: u64 = 1 << 16;
const SZ_2M: u64 = 1 << 21;
const SZ_32M: u64 = 1 << 25;
const SZ_512M: u64 = 1 << 29;
const SZ_1G: u64 = 1 << 30;

impl SmmuHwInfo {
    /// Decodes the ID registers. Must run with the clocks on.
    ///
    /// With stream matching, SMR 0 is used for a mask-width self test
    /// unless [`SmmuOptions::NO_SMR_CHECK`] is set. Its previous contents
    /// are written back afterwards.
    pub fn probe_id_registers(mmio: &dyn SmmuMmio, config: &SmmuConfig) -> Result<Self, SmmuError> {
        let mut id0: Id0 = mmio.load(gr0::reg(gr0::ID0));
        match config.force_stage {
            Some(ForcedStage::Stage1) => id0 = id0.with_s2ts(false).with_nts(false),
            Some(ForcedStage::Stage2) => id0 = id0.with_s1ts(false).with_nts(false),
            None => {}
        }

        let mut features = SmmuFeatures::empty();
        features.set(SmmuFeatures::TRANS_S1, id0.s1ts());
        features.set(SmmuFeatures::TRANS_S2, id0.s2ts());
        features.set(SmmuFeatures::TRANS_NESTED, id0.nts());
        if !features.intersects(SmmuFeatures::TRANS_S1 | SmmuFeatures::TRANS_S2) {
            error!("no translation support (id0={:#x})", id0.into_bits());
            return Err(SmmuError::NoDevice);
        }
        if id0.s1ts() && (config.version == SmmuVersion::V1 || !id0.atosns()) {
            features |= SmmuFeatures::TRANS_OPS;
        }
        if config.dma_coherent {
            features |= SmmuFeatures::COHERENT_WALK;
        }
        if config.dma_coherent != id0.cttw() {
            debug!("ID0.CTTW overridden by platform coherency");
        }

        let num_mapping_groups = if id0.sms() {
            features |= SmmuFeatures::STREAM_MATCH;
            let groups = id0.numsmrg();
            if groups == 0 {
                error!("stream-matching supported, but no SMRs present");
                return Err(SmmuError::NoDevice);
            }
            if !config.options.contains(SmmuOptions::NO_SMR_CHECK) {
                // SMR 0 may hold a firmware mapping that is yet to be recorded.
                let saved: Smr = mmio.load(gr0::smr(0));
                let probe = Smr::new().with_id(Smr::ID_MAX).with_mask(Smr::ID_MAX);
                mmio.store(gr0::smr(0), probe);
                let back: Smr = mmio.load(gr0::smr(0));
                mmio.store(gr0::smr(0), saved);
                if back.mask() & back.id() != back.id() {
                    error!(
                        "SMR mask bits ({:#x}) insufficient for ID field ({:#x})",
                        back.mask(),
                        back.id()
                    );
                    return Err(SmmuError::NoDevice);
                }
            }
            groups.min(MAX_INDICES)
        } else {
            id0.numsidb()
        };

        let id1: Id1 = mmio.load(gr0::reg(gr0::ID1));
        let num_context_banks = id1.numcb().min(MAX_INDICES);
        let num_s2_context_banks = id1.nums2cb();
        if num_s2_context_banks > num_context_banks {
            error!("impossible number of S2 context banks");
            return Err(SmmuError::NoDevice);
        }

        let id2: Id2 = mmio.load(gr0::reg(gr0::ID2));
        let ipa_size = size_to_bits(id2.ias());
        let pa_size = size_to_bits(id2.oas());
        let (va_size, ubs, pgsize_bitmap) = match config.version {
            SmmuVersion::V1 => (ipa_size, 0, SZ_4K | SZ_2M | SZ_1G),
            SmmuVersion::V2 => {
                let mut sizes = 0;
                if id2.ptfs_4k() {
                    sizes |= SZ_4K | SZ_2M | SZ_1G;
                }
                if id2.ptfs_16k() {
                    sizes |= SZ_16K | SZ_32M;
                }
                if id2.ptfs_64k() {
                    sizes |= SZ_64K | SZ_512M;
                }
                (size_to_bits(id2.ubs()).min(39), id2.ubs(), sizes)
            }
        };

        let info = Self {
            version: config.version,
            features,
            num_mapping_groups,
            num_context_banks,
            num_s2_context_banks,
            pgshift: id1.pgshift(),
            va_size,
            ipa_size,
            pa_size,
            ubs,
            pgsize_bitmap,
        };
        info!(
            "SMMU{:?}: {} context banks ({} stage-2 only), {} mapping groups, features {:?}",
            info.version, num_context_banks, num_s2_context_banks, num_mapping_groups, features
        );
        Ok(info)
    }

    #[must_use]
    pub const fn has(&self, feature: SmmuFeatures) -> bool {
        self.features.contains(feature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::RefCell;
    use kernel_smmu_regs::Reg;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct Regs(RefCell<BTreeMap<Reg, u32>>);

    unsafe impl Sync for Regs {}

    impl SmmuMmio for Regs {
        fn read32(&self, reg: Reg) -> u32 {
            self.0.borrow().get(&reg).copied().unwrap_or(0)
        }

        fn write32(&self, reg: Reg, value: u32) {
            self.0.borrow_mut().insert(reg, value);
        }
    }

    fn regs(id0: Id0, id1: Id1, id2: Id2) -> Regs {
        let r = Regs::default();
        r.store(gr0::reg(gr0::ID0), id0);
        r.store(gr0::reg(gr0::ID1), id1);
        r.store(gr0::reg(gr0::ID2), id2);
        r
    }

    fn full_id0() -> Id0 {
        Id0::new()
            .with_s1ts(true)
            .with_s2ts(true)
            .with_nts(true)
            .with_sms(true)
            .with_numsmrg(16)
    }

    #[test]
    fn decodes_a_v2_controller() {
        let r = regs(
            full_id0(),
            Id1::new().with_numcb(8).with_nums2cb(2),
            Id2::new().with_ias(2).with_oas(1).with_ubs(5).with_ptfs_4k(true),
        );
        let hw = SmmuHwInfo::probe_id_registers(&r, &SmmuConfig::default()).unwrap();
        assert!(hw.has(SmmuFeatures::TRANS_S1 | SmmuFeatures::TRANS_S2 | SmmuFeatures::TRANS_NESTED));
        assert!(hw.has(SmmuFeatures::STREAM_MATCH | SmmuFeatures::TRANS_OPS));
        assert!(!hw.has(SmmuFeatures::COHERENT_WALK));
        assert_eq!(hw.num_mapping_groups, 16);
        assert_eq!((hw.num_context_banks, hw.num_s2_context_banks), (8, 2));
        assert_eq!((hw.ipa_size, hw.pa_size, hw.va_size), (40, 36, 39));
        assert_eq!(hw.pgsize_bitmap, SZ_4K | SZ_2M | SZ_1G);
        assert_eq!(hw.pgshift, 12);
    }

    #[test]
    fn forced_stage_masks_capabilities() {
        let r = regs(full_id0(), Id1::new().with_numcb(4), Id2::new());
        let config = SmmuConfig {
            force_stage: Some(ForcedStage::Stage2),
            ..SmmuConfig::default()
        };
        let hw = SmmuHwInfo::probe_id_registers(&r, &config).unwrap();
        assert!(hw.has(SmmuFeatures::TRANS_S2));
        assert!(!hw.has(SmmuFeatures::TRANS_S1));
        assert!(!hw.has(SmmuFeatures::TRANS_NESTED));
        assert!(!hw.has(SmmuFeatures::TRANS_OPS));
    }

    #[test]
    fn rejects_impossible_configurations() {
        let cfg = SmmuConfig::default();
        let no_stage = regs(Id0::new().with_sms(true).with_numsmrg(4), Id1::new(), Id2::new());
        assert_eq!(SmmuHwInfo::probe_id_registers(&no_stage, &cfg), Err(SmmuError::NoDevice));

        let no_smrs = regs(full_id0().with_numsmrg(0), Id1::new().with_numcb(4), Id2::new());
        assert_eq!(SmmuHwInfo::probe_id_registers(&no_smrs, &cfg), Err(SmmuError::NoDevice));

        let too_many_s2 = regs(full_id0(), Id1::new().with_numcb(2).with_nums2cb(3), Id2::new());
        assert_eq!(SmmuHwInfo::probe_id_registers(&too_many_s2, &cfg), Err(SmmuError::NoDevice));
    }

    #[test]
    fn v1_uses_ipa_size_for_va() {
        let r = regs(full_id0(), Id1::new().with_numcb(4), Id2::new().with_ias(1));
        let config = SmmuConfig {
            version: SmmuVersion::V1,
            dma_coherent: true,
            ..SmmuConfig::default()
        };
        let hw = SmmuHwInfo::probe_id_registers(&r, &config).unwrap();
        assert_eq!(hw.va_size, 36);
        assert_eq!(hw.ubs, 0);
        assert!(hw.has(SmmuFeatures::COHERENT_WALK));
    }
}
