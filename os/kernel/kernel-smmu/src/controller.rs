//! One SMMU instance: probed capabilities, index pools, power, registered
//! devices and the controller-wide register sequences.

use crate::config::{MAX_ASID, SmmuConfig, SmmuFeatures, SmmuHwInfo, SmmuModel, SmmuOptions, SmmuVersion};
use crate::domain::TranslationDomain;
use crate::fault::IrqReturn;
use crate::pgtable::{PageTableCodec, TableRegisters};
use crate::power::{PowerGate, PowerResources};
use crate::resources::{AsidPool, ResourceAllocator};
use crate::stream::{MasterCfg, StreamRouter};
use crate::time::{
    ATOS_POLL_STEP_US, ATOS_TIMEOUT_US, Clocksource, HALT_TIMEOUT_US, TLB_SYNC_TIMEOUT_US,
    poll_timeout,
};
use crate::{DeviceId, DomainId, Handshake, SmmuError, SmmuId};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU8, Ordering};
use kernel_smmu_regs::cb::{self, Atsr, Par, Sctlr};
use kernel_smmu_regs::gr0::{self, Gfsr, S2cr, Scr0, Smr, TlbSyncStatus};
use kernel_smmu_regs::gr1::{self, Cba2r, Cbar, CbarType};
use kernel_smmu_regs::impl_def::{MICRO_MMU_CTRL, MicroMmuCtrl};
use kernel_smmu_regs::{LoadStore, SmmuMmio};
use kernel_sync::{MutexGuard, RawTicket, SleepMutex, SpinLock};
use log::{debug, error, info};

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[error("context interrupt {index} could not be requested")]
pub struct IrqError {
    pub index: u8,
}

/// Context interrupt lines of the controller.
pub trait IrqLines: Send + Sync {
    fn request_context(&self, index: u8) -> Result<(), IrqError>;
    fn free_context(&self, index: u8);
}

/// Everything the platform hands to [`SmmuDevice::probe`].
pub struct SmmuPlatform {
    pub mmio: Box<dyn SmmuMmio>,
    pub clock: Arc<dyn Clocksource>,
    pub power: PowerResources,
    pub irqs: Arc<dyn IrqLines>,
    pub codec: Arc<dyn PageTableCodec>,
}

/// Controller-wide attach bookkeeping, guarded by the attach lock.
pub(crate) struct AttachState {
    pub(crate) count: u32,
    pub(crate) attached: BTreeMap<DeviceId, DomainId>,
    pub(crate) asids: AsidPool,
}

/// Address space identifiers of a bound context.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TlbTarget {
    pub cbndx: u8,
    pub asid: u8,
    pub vmid: u8,
    pub stage1: bool,
}

/// Register values for one context bank.
#[derive(Debug, Copy, Clone)]
pub(crate) struct ContextBankSetup {
    pub(crate) target: TlbTarget,
    pub(crate) cbar: CbarType,
    pub(crate) irptndx: u8,
    pub(crate) regs: TableRegisters,
    pub(crate) procid: Option<u32>,
    pub(crate) s1_bypass: bool,
    pub(crate) stall_disable: bool,
}

type IrqConsumers = BTreeMap<u8, Vec<(DomainId, Weak<TranslationDomain>)>>;

pub struct SmmuDevice {
    id: SmmuId,
    mmio: Box<dyn SmmuMmio>,
    clock: Arc<dyn Clocksource>,
    irqs: Arc<dyn IrqLines>,
    codec: Arc<dyn PageTableCodec>,
    config: SmmuConfig,
    hw: SmmuHwInfo,
    resources: ResourceAllocator,
    power: PowerGate,
    masters: SpinLock<BTreeMap<DeviceId, Arc<SpinLock<MasterCfg>>>>,
    attach: SleepMutex<AttachState>,
    atos_lock: SpinLock<()>,
    next_irptndx: AtomicU8,
    context_irqs: SpinLock<IrqConsumers>,
}

impl SmmuDevice {
    /// Powers the controller, decodes its ID registers and records the
    /// stream mappings firmware left behind.
    pub fn probe(id: SmmuId, platform: SmmuPlatform, config: SmmuConfig) -> Result<Arc<Self>, SmmuError> {
        let power = PowerGate::new(
            platform.power.clone(),
            Arc::clone(&platform.clock),
            config.regulator_defer_ms,
        );
        let hw = {
            let _vote = power.enable()?;
            SmmuHwInfo::probe_id_registers(&*platform.mmio, &config)?
        };
        Self::assemble(id, platform, power, config, hw)
    }

    /// Like [`probe`](Self::probe), with capabilities supplied by the caller.
    pub fn with_hw_info(
        id: SmmuId,
        platform: SmmuPlatform,
        config: SmmuConfig,
        hw: SmmuHwInfo,
    ) -> Result<Arc<Self>, SmmuError> {
        let power = PowerGate::new(
            platform.power.clone(),
            Arc::clone(&platform.clock),
            config.regulator_defer_ms,
        );
        Self::assemble(id, platform, power, config, hw)
    }

    fn assemble(
        id: SmmuId,
        platform: SmmuPlatform,
        power: PowerGate,
        config: SmmuConfig,
        hw: SmmuHwInfo,
    ) -> Result<Arc<Self>, SmmuError> {
        let first_dynamic_asid = u16::from(hw.num_context_banks) + 2;
        let smmu = Arc::new(Self {
            id,
            mmio: platform.mmio,
            clock: platform.clock,
            irqs: platform.irqs,
            codec: platform.codec,
            config,
            hw,
            resources: ResourceAllocator::new(),
            power,
            masters: SpinLock::new(BTreeMap::new()),
            attach: SleepMutex::new(AttachState {
                count: 0,
                attached: BTreeMap::new(),
                asids: AsidPool::new(first_dynamic_asid, MAX_ASID),
            }),
            atos_lock: SpinLock::new(()),
            next_irptndx: AtomicU8::new(0),
            context_irqs: SpinLock::new(BTreeMap::new()),
        });
        if smmu.hw.has(SmmuFeatures::STREAM_MATCH) {
            let _vote = smmu.power.enable()?;
            smmu.resources.discover(
                &*smmu.mmio,
                smmu.hw.num_mapping_groups,
                smmu.hw.num_context_banks,
            );
        }
        info!("SMMU {:?} ready", smmu.id);
        Ok(smmu)
    }

    #[must_use]
    pub const fn id(&self) -> SmmuId {
        self.id
    }

    #[must_use]
    pub const fn hw(&self) -> &SmmuHwInfo {
        &self.hw
    }

    #[must_use]
    pub const fn config(&self) -> &SmmuConfig {
        &self.config
    }

    #[must_use]
    pub const fn options(&self) -> SmmuOptions {
        self.config.options
    }

    #[must_use]
    pub const fn power(&self) -> &PowerGate {
        &self.power
    }

    #[must_use]
    pub const fn resources(&self) -> &ResourceAllocator {
        &self.resources
    }

    #[must_use]
    pub fn mmio(&self) -> &dyn SmmuMmio {
        &*self.mmio
    }

    pub(crate) fn codec(&self) -> &dyn PageTableCodec {
        &*self.codec
    }

    pub(crate) fn attach_state(&self) -> MutexGuard<'_, AttachState, RawTicket> {
        self.attach.lock()
    }

    /// Number of devices attached through this controller.
    #[must_use]
    pub fn attach_count(&self) -> u32 {
        self.attach.lock().count
    }

    /// Dynamic ASIDs currently handed out.
    #[must_use]
    pub fn dynamic_asids_in_use(&self) -> usize {
        self.attach.lock().asids.in_use()
    }

    pub(crate) fn streams(&self) -> StreamRouter<'_> {
        StreamRouter {
            mmio: &*self.mmio,
            resources: &self.resources,
            stream_match: self.hw.has(SmmuFeatures::STREAM_MATCH),
            num_mapping_groups: self.hw.num_mapping_groups,
        }
    }

    /// Registers a device and its stream IDs.
    pub fn add_device(&self, device: DeviceId, stream_ids: &[u16]) -> Result<(), SmmuError> {
        let cfg = MasterCfg::new(stream_ids)?;
        let mut masters = self.masters.lock();
        if masters.contains_key(&device) {
            return Err(SmmuError::Busy);
        }
        masters.insert(device, Arc::new(SpinLock::new(cfg)));
        Ok(())
    }

    /// Registers `device` as a member of the hardware group of `sibling`;
    /// both share one stream configuration.
    pub fn add_device_to_group(&self, device: DeviceId, sibling: DeviceId) -> Result<(), SmmuError> {
        let mut masters = self.masters.lock();
        if masters.contains_key(&device) {
            return Err(SmmuError::Busy);
        }
        let shared = masters.get(&sibling).cloned().ok_or(SmmuError::NoDevice)?;
        masters.insert(device, shared);
        Ok(())
    }

    pub fn remove_device(&self, device: DeviceId) -> Result<(), SmmuError> {
        let attach = self.attach.lock();
        if attach.attached.contains_key(&device) {
            return Err(SmmuError::Busy);
        }
        self.masters
            .lock()
            .remove(&device)
            .map(|_| ())
            .ok_or(SmmuError::NoDevice)
    }

    #[must_use]
    pub fn has_device(&self, device: DeviceId) -> bool {
        self.masters.lock().contains_key(&device)
    }

    pub(crate) fn master(&self, device: DeviceId) -> Option<Arc<SpinLock<MasterCfg>>> {
        self.masters.lock().get(&device).cloned()
    }

    /// Reverse lookup used in fault reports.
    #[must_use]
    pub fn find_master_by_sid(&self, sid: u16) -> Option<DeviceId> {
        self.masters
            .lock()
            .iter()
            .find(|(_, m)| m.lock().stream_ids().contains(&sid))
            .map(|(&device, _)| device)
    }

    /// Returns the controller to a known state: faults cleared, all streams
    /// bypassing, all context banks off, TLBs invalidated.
    pub(crate) fn device_reset(&self) {
        let mmio = &*self.mmio;
        let gfsr: Gfsr = mmio.load(gr0::reg(gr0::SGFSR));
        mmio.store(gr0::reg(gr0::SGFSR), gfsr);

        if !self.options().contains(SmmuOptions::SKIP_INIT) {
            for idx in 0..self.hw.num_mapping_groups {
                mmio.store(gr0::smr(idx), Smr::new());
                mmio.store(gr0::s2cr(idx), S2cr::bypass());
            }
            for cbndx in 0..self.hw.num_context_banks {
                mmio.store(cb::sctlr(cbndx), Sctlr::new());
                mmio.write32(cb::fsr(cbndx), cb::Fsr::FAULT_MASK);
            }
        }

        mmio.write32(gr0::reg(gr0::TLBIALLH), 0);
        mmio.write32(gr0::reg(gr0::TLBIALLNSNH), 0);

        let scr0 = mmio
            .load::<Scr0>(gr0::reg(gr0::SCR0))
            .with_gfre(true)
            .with_gfie(true)
            .with_gcfgfre(true)
            .with_gcfgfie(true)
            .with_vmidpne(true)
            .with_ptm(true)
            .with_clientpd(false)
            .with_usfcfg(true)
            .with_fb(false)
            .with_bsu(0);

        let _ = self.tlb_sync_global();
        mmio.store(gr0::reg(gr0::SCR0), scr0);
    }

    /// Writes the implementation-defined attach registers with the
    /// micro-controller halted.
    pub(crate) fn impl_def_programming(&self) {
        if self.config.impl_def_attach_registers.is_empty() {
            return;
        }
        let _ = self.halt();
        for r in &self.config.impl_def_attach_registers {
            self.mmio.write32(gr0::reg(r.offset), r.value);
        }
        self.resume();
    }

    /// Blocks client transactions after the last detach.
    pub(crate) fn power_off(&self) {
        match self.power.enable() {
            Ok(_vote) => self.mmio.store(gr0::reg(gr0::SCR0), Scr0::new().with_clientpd(true)),
            Err(e) => error!("powering off SMMU {:?}: {e}", self.id),
        }
        if !self.options().contains(SmmuOptions::REGISTER_SAVE)
            && let Err(e) = self.power.release_blocking()
        {
            error!("dropping controller power vote: {e}");
        }
    }

    pub fn tlb_sync_global(&self) -> Result<(), SmmuError> {
        self.mmio.write32(gr0::reg(gr0::STLBGSYNC), 0);
        let done = poll_timeout(&*self.clock, 1, TLB_SYNC_TIMEOUT_US, || {
            !self.mmio.load::<TlbSyncStatus>(gr0::reg(gr0::STLBGSTATUS)).active()
        });
        if done {
            Ok(())
        } else {
            error!("TLB sync timed out -- SMMU may be deadlocked");
            Err(SmmuError::Timeout(Handshake::GlobalTlbSync))
        }
    }

    pub fn tlb_sync_context(&self, cbndx: u8) -> Result<(), SmmuError> {
        self.mmio.write32(cb::reg(cbndx, cb::TLBSYNC), 0);
        let done = poll_timeout(&*self.clock, 1, TLB_SYNC_TIMEOUT_US, || {
            !self.mmio.load::<TlbSyncStatus>(cb::reg(cbndx, cb::TLBSTATUS)).active()
        });
        if done {
            Ok(())
        } else {
            error!("TLBSYNC on context bank {cbndx} timed out -- SMMU may be deadlocked");
            Err(SmmuError::Timeout(Handshake::ContextTlbSync))
        }
    }

    /// Invalidates every TLB entry of a context and waits for completion.
    pub fn tlb_inv_context(&self, t: &TlbTarget) {
        if t.stage1 {
            self.mmio.write32(cb::reg(t.cbndx, cb::TLBIASID), u32::from(t.asid));
            let _ = self.tlb_sync_context(t.cbndx);
        } else {
            self.mmio.write32(gr0::reg(gr0::TLBIVMID), u32::from(t.vmid));
            let _ = self.tlb_sync_global();
        }
    }

    /// Queues invalidation of one granule at `iova`; completion needs a sync.
    #[allow(clippy::cast_possible_truncation)]
    pub fn tlb_inv_range(&self, t: &TlbTarget, iova: u64, leaf: bool) {
        if t.stage1 {
            let off = if leaf { cb::TLBIVAL } else { cb::TLBIVA };
            let reg = cb::reg(t.cbndx, off);
            match self.hw.version {
                SmmuVersion::V1 => self.mmio.write32(reg, (iova & !0xfff) as u32 | u32::from(t.asid)),
                SmmuVersion::V2 => self
                    .mmio
                    .write64(reg, iova >> 12 | u64::from(t.asid) << cb::TTBR_ASID_SHIFT),
            }
        } else if self.hw.version == SmmuVersion::V2 {
            let off = if leaf { cb::TLBIIPAS2L } else { cb::TLBIIPAS2 };
            self.mmio.write64(cb::reg(t.cbndx, off), iova >> 12);
        } else {
            self.mmio.write32(gr0::reg(gr0::TLBIVMID), u32::from(t.vmid));
        }
    }

    pub fn halt_nowait(&self) {
        self.mmio
            .modify(MICRO_MMU_CTRL, |c: MicroMmuCtrl| c.with_local_halt_req(true));
    }

    pub fn wait_for_halt(&self) -> Result<(), SmmuError> {
        let idle = poll_timeout(&*self.clock, 0, HALT_TIMEOUT_US, || {
            self.mmio.load::<MicroMmuCtrl>(MICRO_MMU_CTRL).idle()
        });
        if idle {
            Ok(())
        } else {
            error!("couldn't halt SMMU {:?}", self.id);
            Err(SmmuError::Timeout(Handshake::Halt))
        }
    }

    pub fn halt(&self) -> Result<(), SmmuError> {
        self.halt_nowait();
        self.wait_for_halt()
    }

    pub fn resume(&self) {
        self.mmio
            .modify(MICRO_MMU_CTRL, |c: MicroMmuCtrl| c.with_local_halt_req(false));
    }

    /// Hardware translation of `iova` in context bank `cbndx`.
    ///
    /// `Ok(None)` when the walk faulted.
    #[allow(clippy::cast_possible_truncation)]
    pub fn atos(&self, cbndx: u8, iova: u64, halt: bool) -> Result<Option<u64>, SmmuError> {
        let _vote = self.power.enable()?;
        let _serial = self.atos_lock.lock_irqsave();
        if halt {
            self.halt()?;
        }

        let va = iova & !0xfff;
        let ats1pr = cb::reg(cbndx, cb::ATS1PR);
        match self.hw.version {
            SmmuVersion::V1 => self.mmio.write32(ats1pr, va as u32),
            SmmuVersion::V2 => self.mmio.write64(ats1pr, va),
        }
        let done = poll_timeout(&*self.clock, ATOS_POLL_STEP_US, ATOS_TIMEOUT_US, || {
            !self.mmio.load::<Atsr>(cb::reg(cbndx, cb::ATSR)).active()
        });
        if !done {
            if halt {
                self.resume();
            }
            error!("iova to phys timed out on context bank {cbndx}");
            return Err(SmmuError::Timeout(Handshake::Atos));
        }

        let par: Par = self.mmio.load64(cb::reg(cbndx, cb::PAR));
        if halt {
            self.resume();
        }
        if par.f() {
            error!("translation fault on ATOS, PAR {:#x}", par.into_bits());
        }
        Ok(par.translate(iova))
    }

    /// Writes a context bank from scratch. CBA2R precedes CBAR.
    ///
    /// Tables owned by the secure world leave the translation registers
    /// to it.
    pub(crate) fn program_context_bank(&self, s: &ContextBankSetup) {
        let mmio = &*self.mmio;
        let t = s.target;
        let stage1 = s.cbar.is_stage1();

        if self.hw.version == SmmuVersion::V2 {
            mmio.store(gr1::cba2r(t.cbndx), Cba2r::new().with_rw64(true));
        }

        let mut cbar = Cbar::new().with_kind(s.cbar).with_vmid(t.vmid);
        if self.hw.version == SmmuVersion::V1 {
            cbar = cbar.with_irptndx(s.irptndx);
        }
        if stage1 {
            cbar = cbar
                .with_bpshcfg(Cbar::BPSHCFG_NSH)
                .with_memattr(Cbar::MEMATTR_WB);
        }
        mmio.store(gr1::cbar(t.cbndx), cbar);

        let cbr = |off| cb::reg(t.cbndx, off);
        match s.regs {
            TableRegisters::Stage1 { ttbr, tcr, mair } => {
                let asid = u64::from(t.asid) << cb::TTBR_ASID_SHIFT;
                mmio.write64(cbr(cb::TTBR0), ttbr[0] | asid);
                mmio.write64(cbr(cb::TTBR1), ttbr[1] | asid);
                #[allow(clippy::cast_possible_truncation)]
                mmio.write32(cbr(cb::TTBCR), tcr as u32);
                if self.hw.version == SmmuVersion::V2 {
                    #[allow(clippy::cast_possible_truncation)]
                    mmio.write32(cbr(cb::TTBCR2), (tcr >> 32) as u32);
                }
                mmio.write32(cbr(cb::MAIR0), mair[0]);
                mmio.write32(cbr(cb::MAIR1), mair[1]);
            }
            TableRegisters::Stage2 { vttbr, vtcr } => {
                mmio.write64(cbr(cb::TTBR0), vttbr);
                mmio.write32(cbr(cb::TTBCR), vtcr);
            }
            TableRegisters::Secure => {}
        }

        if stage1 && let Some(procid) = s.procid {
            mmio.write32(cbr(cb::CONTEXTIDR), procid);
        }

        if self.config.model == SmmuModel::QcomV2 {
            mmio.write32(cbr(cb::ACTLR), cb::ACTLR_QCOM_SHAREABILITY);
        }

        let mut sctlr = Sctlr::new()
            .with_cfcfg(true)
            .with_cfie(true)
            .with_cfre(true)
            .with_afe(true)
            .with_tre(true)
            .with_e(cfg!(target_endian = "big"));
        if s.stall_disable {
            sctlr = sctlr.with_cfcfg(false).with_hupcf(true);
        }
        if !(s.s1_bypass && stage1) {
            sctlr = sctlr.with_m(true);
        }
        if stage1 {
            sctlr = sctlr.with_asidpne(true);
        }
        mmio.store(cb::sctlr(t.cbndx), sctlr);
        debug!("context bank {} programmed: {:?}, vmid {}, asid {}", t.cbndx, s.cbar, t.vmid, t.asid);
    }

    /// Interrupt index for a new context: the bank itself on v2, round
    /// robin over the context lines on v1.
    pub(crate) fn context_irq_index(&self, cbndx: u8) -> u8 {
        match self.hw.version {
            SmmuVersion::V2 => cbndx,
            SmmuVersion::V1 => {
                let lines = match self.config.num_context_irqs {
                    0 => self.hw.num_context_banks.max(1),
                    n => n,
                };
                let idx = self.next_irptndx.fetch_add(1, Ordering::Relaxed);
                idx % lines
            }
        }
    }

    pub(crate) fn request_context_irq(
        &self,
        index: u8,
        domain: DomainId,
        consumer: Weak<TranslationDomain>,
    ) -> Result<(), IrqError> {
        let mut irqs = self.context_irqs.lock();
        let consumers = irqs.entry(index).or_default();
        if consumers.is_empty() {
            self.irqs.request_context(index)?;
        }
        consumers.push((domain, consumer));
        Ok(())
    }

    pub(crate) fn free_context_irq(&self, index: u8, domain: DomainId) {
        let mut irqs = self.context_irqs.lock();
        if let Some(consumers) = irqs.get_mut(&index) {
            consumers.retain(|(id, _)| *id != domain);
            if consumers.is_empty() {
                irqs.remove(&index);
                self.irqs.free_context(index);
            }
        }
    }

    /// Entry point for a context interrupt line.
    pub fn dispatch_context_irq(&self, index: u8) -> Result<IrqReturn, SmmuError> {
        let domains: Vec<Arc<TranslationDomain>> = self
            .context_irqs
            .lock()
            .get(&index)
            .map(|c| c.iter().filter_map(|(_, d)| d.upgrade()).collect())
            .unwrap_or_default();

        let mut ret = IrqReturn::None;
        for domain in domains {
            if domain.handle_context_fault()? == IrqReturn::Handled {
                ret = IrqReturn::Handled;
            }
        }
        Ok(ret)
    }

    /// Entry point for the global fault line.
    pub fn handle_global_fault(&self) -> Result<IrqReturn, SmmuError> {
        let _vote = self.power.enable()?;
        let mmio = &*self.mmio;
        let gfsr: Gfsr = mmio.load(gr0::reg(gr0::SGFSR));
        if gfsr.into_bits() == 0 {
            return Ok(IrqReturn::None);
        }
        let syn0 = mmio.read32(gr0::reg(gr0::SGFSYNR0));
        let syn1 = mmio.read32(gr0::reg(gr0::SGFSYNR1));
        let syn2 = mmio.read32(gr0::reg(gr0::SGFSYNR2));
        error!("unexpected global fault, this could be serious");
        error!(
            "GFSR {:#010x}, GFSYNR0 {syn0:#010x}, GFSYNR1 {syn1:#010x}, GFSYNR2 {syn2:#010x}",
            gfsr.into_bits()
        );
        mmio.store(gr0::reg(gr0::SGFSR), gfsr);
        Ok(IrqReturn::Handled)
    }
}
