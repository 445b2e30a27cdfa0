//! Translation domains.
//!
//! A domain is one isolated address space. It is unbound until its first
//! device attaches; at that point it takes a context bank, derives its
//! ASID and VMID from the bank index, has the codec build its tables and
//! programs the bank. The last detach tears all of that down again.
//!
//! Lock order: domain init lock, controller attach lock, secure tracker,
//! page-table lock, live context.

use crate::attr::DomainAttrs;
use crate::config::{SmmuFeatures, SmmuOptions};
use crate::controller::{AttachState, ContextBankSetup, SmmuDevice, TlbTarget};
use crate::fault::FaultClient;
use crate::pgtable::{
    PageBlock, PageTableConfig, PageTableEnv, PageTableError, PageTableFormat, PageTableOps,
    PageTableQuirks, Prot, Segment, TableRegisters,
};
use crate::secure::{AssignFailurePolicy, OwnershipTransfer, PageSource, SecureOwnershipTracker};
use crate::{DeviceId, DomainId, SmmuError};
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_smmu_regs::cb::{self, Sctlr};
use kernel_smmu_regs::gr1::CbarType;
use kernel_smmu_regs::LoadStore;
use kernel_sync::{DualMutex, SleepMutex, SpinLock};
use log::{debug, error, info, warn};

/// Registers reachable through [`TranslationDomain::reg_read`].
const CB_REG_WINDOW: u32 = 0x1000;

/// Translation stage of a domain.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Stage {
    #[default]
    S1,
    S2,
    Nested,
}

/// The stage a domain actually gets on a controller with `features`.
///
/// Hardware without stage 1 forces stage 2 and vice versa; with both the
/// request stands.
#[must_use]
pub fn resolve_stage(requested: Stage, features: SmmuFeatures) -> Stage {
    let mut stage = requested;
    if !features.contains(SmmuFeatures::TRANS_S1) {
        stage = Stage::S2;
    }
    if !features.contains(SmmuFeatures::TRANS_S2) {
        stage = Stage::S1;
    }
    stage
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum DomainState {
    #[default]
    Unbound,
    Binding,
    Bound,
    Unbinding,
}

/// Memory and secure-world services a domain's tables go through.
#[derive(Clone)]
pub struct DomainServices {
    pub pages: Arc<dyn PageSource>,
    pub ownership: Arc<dyn OwnershipTransfer>,
}

/// What TLB maintenance needs while the context bank is live.
#[derive(Clone)]
pub(crate) struct LiveContext {
    pub(crate) smmu: Arc<SmmuDevice>,
    pub(crate) target: TlbTarget,
}

#[derive(Default)]
pub(crate) struct DomainInner {
    pub(crate) state: DomainState,
    pub(crate) requested: Stage,
    pub(crate) stage: Option<Stage>,
    pub(crate) smmu: Option<Arc<SmmuDevice>>,
    pub(crate) cbndx: Option<u8>,
    pub(crate) irptndx: Option<u8>,
    pub(crate) asid: Option<u8>,
    pub(crate) vmid: Option<u8>,
    pub(crate) attrs: DomainAttrs,
    /// Attached devices and whether each holds an atomic-domain regulator vote.
    pub(crate) devices: Vec<(DeviceId, bool)>,
    pub(crate) regs: Option<TableRegisters>,
}

impl DomainInner {
    fn clear_binding(&mut self) {
        self.stage = None;
        self.smmu = None;
        self.cbndx = None;
        self.irptndx = None;
        self.asid = None;
        self.vmid = None;
        self.regs = None;
    }
}

/// Steps of a partially completed attach, undone in reverse on failure.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Undo {
    /// The controller attach count was raised.
    AttachCount,
    /// An atomic domain took an extra regulator vote.
    AtomicVote,
    /// The context bank was set up for this domain.
    DomainContext,
}

pub struct TranslationDomain {
    id: DomainId,
    pub(crate) inner: SleepMutex<DomainInner>,
    pub(crate) secure: SleepMutex<SecureOwnershipTracker>,
    /// Sleeping while the secure world owns the tables.
    pgtbl: DualMutex<Option<Box<dyn PageTableOps>>>,
    live: SpinLock<Option<LiveContext>>,
    pub(crate) atomic: AtomicBool,
    pub(crate) has_secure_vmid: AtomicBool,
    slave_side: AtomicBool,
    pub(crate) fault_client: SpinLock<Option<Arc<dyn FaultClient>>>,
    services: DomainServices,
}

impl TranslationDomain {
    #[must_use]
    pub fn new(
        id: DomainId,
        stage: Stage,
        services: DomainServices,
        policy: AssignFailurePolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            inner: SleepMutex::new(DomainInner {
                requested: stage,
                ..DomainInner::default()
            }),
            secure: SleepMutex::new(SecureOwnershipTracker::new(policy)),
            pgtbl: DualMutex::new(None),
            live: SpinLock::new(None),
            atomic: AtomicBool::new(false),
            has_secure_vmid: AtomicBool::new(false),
            slave_side: AtomicBool::new(false),
            fault_client: SpinLock::new(None),
            services,
        })
    }

    #[must_use]
    pub const fn id(&self) -> DomainId {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> DomainState {
        self.inner.lock().state
    }

    /// Stage the domain is bound with, if bound.
    #[must_use]
    pub fn stage(&self) -> Option<Stage> {
        self.inner.lock().stage
    }

    #[must_use]
    pub fn context_bank(&self) -> Option<u8> {
        self.inner.lock().cbndx
    }

    #[must_use]
    pub fn asid(&self) -> Option<u8> {
        self.inner.lock().asid
    }

    #[must_use]
    pub fn vmid(&self) -> Option<u8> {
        self.inner.lock().vmid
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.inner.lock().smmu.is_some()
    }

    /// Pages of the secure tracker, for inspection.
    pub fn with_secure_tracker<R>(&self, f: impl FnOnce(&SecureOwnershipTracker) -> R) -> R {
        f(&self.secure.lock())
    }

    pub fn set_fault_client(&self, client: Option<Arc<dyn FaultClient>>) {
        *self.fault_client.lock() = client;
    }

    /// Tables are handed between the normal and the secure world.
    fn is_master_side_secure(&self) -> bool {
        self.has_secure_vmid.load(Ordering::Acquire) && !self.slave_side.load(Ordering::Acquire)
    }

    /// Tables are owned by the secure world altogether.
    fn is_slave_side_secure(&self) -> bool {
        self.has_secure_vmid.load(Ordering::Acquire) && self.slave_side.load(Ordering::Acquire)
    }

    pub(crate) fn tlb_target(&self) -> Option<TlbTarget> {
        self.live.lock().as_ref().map(|l| l.target)
    }

    /// Attaches `device` of `smmu`, binding the domain on first use.
    pub fn attach(self: &Arc<Self>, smmu: &Arc<SmmuDevice>, device: DeviceId) -> Result<(), SmmuError> {
        let mut inner = self.inner.lock();
        if inner.attrs.dynamic {
            return self.attach_dynamic(&mut inner, smmu);
        }
        if let Some(bound) = &inner.smmu
            && !Arc::ptr_eq(bound, smmu)
        {
            error!("domain {:?} is bound to SMMU {:?}, not {:?}", self.id, bound.id(), smmu.id());
            return Err(SmmuError::InvalidArgument("domain is bound to another SMMU"));
        }
        let master = smmu.master(device).ok_or(SmmuError::NoDevice)?;

        let mut attach = smmu.attach_state();
        if attach.attached.contains_key(&device) {
            error!("device {device:?} is already attached");
            return Err(SmmuError::AlreadyAttached);
        }

        let previous = inner.state;
        inner.state = DomainState::Binding;
        let mut undo = Vec::new();
        let atomic_vote = inner.attrs.atomic;
        let stream_ids = master.lock().stream_ids().to_vec();

        let result = self
            .attach_steps(&mut inner, smmu, &mut attach, &stream_ids, &mut undo)
            .and_then(|cbndx| {
                let _vote = smmu.power().enable()?;
                smmu.streams().bind(&mut master.lock(), cbndx)
            });

        match result {
            Ok(outcome) => {
                debug!("device {device:?} attached to domain {:?}: {outcome:?}", self.id);
                attach.attached.insert(device, self.id);
                inner.devices.push((device, atomic_vote));
                inner.state = DomainState::Bound;
                Ok(())
            }
            Err(e) => {
                error!("attaching device {device:?} to domain {:?} failed: {e}", self.id);
                self.unwind(&mut inner, smmu, &mut attach, undo);
                if inner.smmu.is_some() {
                    inner.state = previous;
                } else {
                    inner.state = DomainState::Unbound;
                    self.slave_side.store(false, Ordering::Release);
                    self.pgtbl.set_sleepable(false);
                }
                Err(e)
            }
        }
    }

    /// Everything up to the stream binding. Returns the bound context bank.
    fn attach_steps(
        self: &Arc<Self>,
        inner: &mut DomainInner,
        smmu: &Arc<SmmuDevice>,
        attach: &mut AttachState,
        stream_ids: &[u16],
        undo: &mut Vec<Undo>,
    ) -> Result<u8, SmmuError> {
        let power = smmu.power();
        if attach.count == 0 {
            // Without register retention the regulator must stay up while
            // anything is attached.
            if !smmu.options().contains(SmmuOptions::REGISTER_SAVE) {
                power.acquire_blocking()?;
            }
            let vote = match power.enable() {
                Ok(v) => v,
                Err(e) => {
                    if !smmu.options().contains(SmmuOptions::REGISTER_SAVE) {
                        let _ = power.release_blocking();
                    }
                    return Err(e.into());
                }
            };
            smmu.device_reset();
            smmu.impl_def_programming();
            drop(vote);
        }
        attach.count += 1;
        undo.push(Undo::AttachCount);

        if inner.attrs.atomic {
            power.acquire_blocking()?;
            undo.push(Undo::AtomicVote);
        }

        if smmu.options().contains(SmmuOptions::STATIC_CB) {
            let first = stream_ids.first().copied().unwrap_or_default();
            if smmu.resources().static_translate_for(first).is_none() {
                error!("no firmware context bank for stream {first:#x}");
                return Err(SmmuError::InvalidArgument("no static context bank for device"));
            }
            self.slave_side.store(true, Ordering::Release);
            self.pgtbl.set_sleepable(self.is_slave_side_secure());
        }

        if inner.smmu.is_none() {
            let _vote = power.enable()?;
            self.init_context(inner, smmu, stream_ids)?;
            undo.push(Undo::DomainContext);
        }
        inner.cbndx.ok_or(SmmuError::NotAttached)
    }

    fn unwind(
        &self,
        inner: &mut DomainInner,
        smmu: &Arc<SmmuDevice>,
        attach: &mut AttachState,
        undo: Vec<Undo>,
    ) {
        for step in undo.into_iter().rev() {
            match step {
                Undo::DomainContext => self.destroy_context(inner, smmu),
                Undo::AtomicVote => {
                    if let Err(e) = smmu.power().release_blocking() {
                        warn!("releasing atomic-domain vote: {e}");
                    }
                }
                Undo::AttachCount => {
                    attach.count -= 1;
                    if attach.count == 0 {
                        smmu.power_off();
                    }
                }
            }
        }
    }

    /// Takes a context bank and builds the tables. On error nothing stays
    /// allocated.
    fn init_context(
        self: &Arc<Self>,
        inner: &mut DomainInner,
        smmu: &Arc<SmmuDevice>,
        stream_ids: &[u16],
    ) -> Result<(), SmmuError> {
        let hw = *smmu.hw();
        let attrs = inner.attrs;
        let stage = resolve_stage(inner.requested, hw.features);
        debug!("domain {:?}: requested {:?}, bound as {stage:?}", self.id, inner.requested);

        let (cbar, start, mut ias, oas, mut format) = match stage {
            Stage::S1 => (
                CbarType::S1TransS2Bypass,
                hw.num_s2_context_banks,
                hw.va_size,
                hw.ipa_size,
                PageTableFormat::Arm64LpaeS1,
            ),
            Stage::S2 | Stage::Nested => (
                CbarType::S2Trans,
                0,
                hw.ipa_size,
                hw.pa_size,
                PageTableFormat::Arm64LpaeS2,
            ),
        };

        let mut quirks = PageTableQuirks::empty();
        let mut sep = 0;
        if stage == Stage::S1 && attrs.ttbr1 {
            quirks |= PageTableQuirks::TTBR1;
            if hw.ubs == 5 {
                sep = 48;
            } else {
                sep = ias - 1;
                ias -= 1;
            }
        }
        if attrs.force_coherent || hw.has(SmmuFeatures::COHERENT_WALK) {
            quirks |= PageTableQuirks::COHERENT_WALK;
        }

        let cbndx = smmu
            .resources()
            .alloc_context(start, hw.num_context_banks, stream_ids)?;
        let asid = cbndx + 1;
        let vmid = cbndx + 2;

        let (iova_base, iova_end) = attrs
            .geometry
            .unwrap_or((0, (1u64 << ias.min(63)) - 1));
        let mut cfg = PageTableConfig {
            quirks,
            pgsize_bitmap: hw.pgsize_bitmap,
            ias,
            oas,
            sep,
            iova_base,
            iova_end,
            secure_cbndx: None,
        };
        if self.is_slave_side_secure() {
            format = PageTableFormat::MsmSecure;
            cfg = PageTableConfig {
                ias: 0,
                oas: 0,
                sep: 0,
                iova_base: 0,
                iova_end: 0,
                secure_cbndx: Some(cbndx),
                ..cfg
            };
        }

        inner.smmu = Some(Arc::clone(smmu));
        inner.stage = Some(stage);
        inner.cbndx = Some(cbndx);
        inner.asid = Some(asid);
        inner.vmid = Some(vmid);

        let regs = match self.alloc_tables(smmu, format, &cfg) {
            Ok(regs) => regs,
            Err(e) => {
                self.destroy_context(inner, smmu);
                return Err(e);
            }
        };
        inner.regs = Some(regs);

        let irptndx = smmu.context_irq_index(cbndx);
        let target = TlbTarget {
            cbndx,
            asid,
            vmid,
            stage1: cbar.is_stage1(),
        };
        smmu.program_context_bank(&ContextBankSetup {
            target,
            cbar,
            irptndx,
            regs,
            procid: attrs.procid,
            s1_bypass: attrs.s1_bypass,
            stall_disable: attrs.stall_disable,
        });

        // Last, so the handler never sees a half-built domain.
        match smmu.request_context_irq(irptndx, self.id, Arc::downgrade(self)) {
            Ok(()) => inner.irptndx = Some(irptndx),
            Err(e) => error!("{e}; context bank {cbndx} runs without fault reporting"),
        }

        *self.live.lock() = Some(LiveContext {
            smmu: Arc::clone(smmu),
            target,
        });
        Ok(())
    }

    /// Has the codec build tables and hands any table memory to the secure
    /// VMID. The tables are published on success.
    fn alloc_tables(
        &self,
        smmu: &SmmuDevice,
        format: PageTableFormat,
        cfg: &PageTableConfig,
    ) -> Result<TableRegisters, SmmuError> {
        let mut secure = self.is_master_side_secure().then(|| self.secure.lock());
        let ops = {
            let env = DomainEnv::new(&self.services, secure.as_deref_mut(), None);
            smmu.codec().alloc(format, cfg, &env)
        }?;
        let regs = ops.registers();
        *self.pgtbl.lock() = Some(ops);

        if let Some(tracker) = secure.as_deref_mut() {
            tracker.assign(&*self.services.ownership)?;
        }
        Ok(regs)
    }

    /// Frees the tables; secure pages go back to the normal world first.
    fn release_tables(&self) {
        let ops = self.pgtbl.lock().take();
        let mut secure = self.is_master_side_secure().then(|| self.secure.lock());
        if let Some(ops) = ops {
            let env = DomainEnv::new(&self.services, secure.as_deref_mut(), None);
            ops.free(&env);
        }
        if let Some(tracker) = secure.as_deref_mut() {
            tracker.drain_pool();
            if let Err(e) = tracker.unassign(&*self.services.ownership, &*self.services.pages) {
                error!("domain {:?}: {e}; page withheld from the allocator", self.id);
            }
        }
    }

    /// Disables the context bank and returns everything it held.
    fn destroy_context(&self, inner: &mut DomainInner, smmu: &SmmuDevice) {
        let Some(cbndx) = inner.cbndx else {
            return;
        };
        *self.live.lock() = None;
        match smmu.power().enable() {
            Ok(_vote) => smmu.mmio().store(cb::sctlr(cbndx), Sctlr::new()),
            Err(e) => error!("disabling context bank {cbndx}: {e}"),
        }
        self.release_tables();
        if let Some(irptndx) = inner.irptndx.take() {
            smmu.free_context_irq(irptndx, self.id);
        }
        smmu.resources().free_context(cbndx);
        inner.clear_binding();
        self.slave_side.store(false, Ordering::Release);
        self.pgtbl.set_sleepable(false);
    }

    /// Detaches `device`; the last detach unbinds the domain.
    pub fn detach(&self, device: DeviceId) -> Result<(), SmmuError> {
        let mut inner = self.inner.lock();
        let smmu = inner.smmu.clone().ok_or(SmmuError::NotAttached)?;
        if inner.attrs.dynamic {
            self.detach_dynamic(&mut inner, &smmu);
            return Ok(());
        }

        let mut attach = smmu.attach_state();
        if attach.attached.get(&device) != Some(&self.id) {
            return Err(SmmuError::NotAttached);
        }
        let pos = inner
            .devices
            .iter()
            .position(|&(d, _)| d == device)
            .ok_or(SmmuError::NotAttached)?;
        let (_, atomic_vote) = inner.devices.remove(pos);
        attach.attached.remove(&device);
        inner.state = DomainState::Unbinding;

        if let Some(master) = smmu.master(device) {
            match smmu.power().enable() {
                Ok(_vote) => {
                    if let Err(e) = smmu.streams().unbind(&mut master.lock()) {
                        error!("unbinding streams of {device:?}: {e}");
                    }
                }
                Err(e) => error!("unbinding streams of {device:?}: {e}"),
            }
        }

        if inner.devices.is_empty() {
            self.destroy_context(&mut inner, &smmu);
            inner.state = DomainState::Unbound;
        } else {
            inner.state = DomainState::Bound;
        }

        if atomic_vote && let Err(e) = smmu.power().release_blocking() {
            warn!("releasing atomic-domain vote: {e}");
        }
        attach.count -= 1;
        if attach.count == 0 {
            smmu.power_off();
        }
        Ok(())
    }

    /// Shares a context bank programmed by someone else, with a private
    /// ASID from the controller's dynamic pool.
    fn attach_dynamic(&self, inner: &mut DomainInner, smmu: &Arc<SmmuDevice>) -> Result<(), SmmuError> {
        if !smmu.options().contains(SmmuOptions::DYNAMIC) {
            error!("SMMU {:?} does not support dynamic domains", smmu.id());
            return Err(SmmuError::Unsupported("dynamic domains"));
        }
        if inner.smmu.is_some() {
            return Err(SmmuError::Busy);
        }
        let hw = *smmu.hw();
        let cbndx = inner
            .attrs
            .context_bank
            .filter(|&c| c < hw.num_context_banks)
            .ok_or(SmmuError::NoDevice)?;
        if !hw.has(SmmuFeatures::TRANS_S1) {
            return Err(SmmuError::InvalidArgument("dynamic domains need stage 1"));
        }

        let mut quirks = PageTableQuirks::empty();
        if inner.attrs.force_coherent || hw.has(SmmuFeatures::COHERENT_WALK) {
            quirks |= PageTableQuirks::COHERENT_WALK;
        }
        let (iova_base, iova_end) = inner
            .attrs
            .geometry
            .unwrap_or((0, (1u64 << hw.va_size.min(63)) - 1));
        let cfg = PageTableConfig {
            quirks,
            pgsize_bitmap: hw.pgsize_bitmap,
            ias: hw.va_size,
            oas: hw.ipa_size,
            sep: 0,
            iova_base,
            iova_end,
            secure_cbndx: None,
        };

        let mut attach = smmu.attach_state();
        let regs = self.alloc_tables(smmu, PageTableFormat::Arm64LpaeS1, &cfg).inspect_err(|_| {
            self.release_tables();
        })?;
        let Some(asid) = attach.asids.alloc().and_then(|a| u8::try_from(a).ok()) else {
            info!("dynamic ASIDs exhausted on SMMU {:?}", smmu.id());
            self.release_tables();
            return Err(SmmuError::OutOfSpace);
        };
        drop(attach);

        let vmid = cbndx + 2;
        inner.smmu = Some(Arc::clone(smmu));
        inner.stage = Some(Stage::S1);
        inner.cbndx = Some(cbndx);
        inner.asid = Some(asid);
        inner.vmid = Some(vmid);
        inner.regs = Some(regs);
        inner.state = DomainState::Bound;
        *self.live.lock() = Some(LiveContext {
            smmu: Arc::clone(smmu),
            target: TlbTarget {
                cbndx,
                asid,
                vmid,
                stage1: true,
            },
        });
        debug!("dynamic domain {:?} on context bank {cbndx} with ASID {asid}", self.id);
        Ok(())
    }

    fn detach_dynamic(&self, inner: &mut DomainInner, smmu: &SmmuDevice) {
        let mut attach = smmu.attach_state();
        let live = self.live.lock().take();
        if attach.count > 0
            && let Some(live) = &live
        {
            match smmu.power().enable() {
                Ok(_vote) => smmu.tlb_inv_context(&live.target),
                Err(e) => error!("invalidating dynamic domain {:?}: {e}", self.id),
            }
        }
        if let Some(asid) = inner.asid {
            attach.asids.free(u16::from(asid));
        }
        drop(attach);
        self.release_tables();
        inner.clear_binding();
        inner.state = DomainState::Unbound;
    }

    /// Final teardown. Every device must be detached.
    pub fn free(&self) -> Result<(), SmmuError> {
        let mut inner = self.inner.lock();
        if !inner.devices.is_empty() {
            return Err(SmmuError::Busy);
        }
        if let Some(smmu) = inner.smmu.clone() {
            if inner.attrs.dynamic {
                self.detach_dynamic(&mut inner, &smmu);
            } else {
                self.destroy_context(&mut inner, &smmu);
            }
        }
        inner.state = DomainState::Unbound;
        Ok(())
    }

    pub fn map(&self, iova: u64, paddr: u64, size: usize, prot: Prot) -> Result<(), SmmuError> {
        self.with_tables_for_map(|ops, env| ops.map(env, iova, paddr, size, prot))?;
        self.invalidate_after_map()
    }

    /// Maps `segments` back to back from `iova`. A partial mapping is
    /// unmapped again before the error is returned.
    pub fn map_batch(&self, iova: u64, segments: &[Segment], prot: Prot) -> Result<usize, SmmuError> {
        let total: usize = segments.iter().map(|s| s.len).sum();
        match self.with_tables_for_map(|ops, env| ops.map_batch(env, iova, segments, prot)) {
            Ok(mapped) => {
                self.invalidate_after_map()?;
                Ok(mapped)
            }
            Err(e) => {
                if let Err(undo) = self.unmap(iova, total) {
                    error!("unmapping partial batch at {iova:#x}: {undo}");
                }
                Err(e)
            }
        }
    }

    fn with_tables_for_map<R>(
        &self,
        f: impl FnOnce(&mut Box<dyn PageTableOps>, &dyn PageTableEnv) -> Result<R, PageTableError>,
    ) -> Result<R, SmmuError> {
        let mut secure = self.is_master_side_secure().then(|| self.secure.lock());
        let result = {
            let env = DomainEnv::new(&self.services, secure.as_deref_mut(), None);
            let mut pgtbl = self.pgtbl.lock();
            let ops = pgtbl.as_mut().ok_or(SmmuError::NotAttached)?;
            f(ops, &env)
        };
        let assigned = match secure.as_deref_mut() {
            Some(tracker) => tracker.assign(&*self.services.ownership).map(|_| ()),
            None => Ok(()),
        };
        let value = result?;
        assigned?;
        Ok(value)
    }

    fn invalidate_after_map(&self) -> Result<(), SmmuError> {
        let Some(live) = self.live.lock().clone() else {
            return Ok(());
        };
        if live.smmu.options().contains(SmmuOptions::INVALIDATE_ON_MAP) {
            let _vote = live.smmu.power().enable()?;
            live.smmu.tlb_inv_context(&live.target);
        }
        Ok(())
    }

    /// Returns the number of bytes unmapped.
    ///
    /// Atomic domains stay on the non-sleeping clock path.
    pub fn unmap(&self, iova: u64, size: usize) -> Result<usize, SmmuError> {
        if self.atomic.load(Ordering::Acquire) {
            if self.is_slave_side_secure() {
                return Err(SmmuError::Unsupported("atomic unmap with secure-world tables"));
            }
            let live = self.live.lock().clone().ok_or(SmmuError::NotAttached)?;
            let _vote = live.smmu.power().enable_atomic()?;
            return self.unmap_tables(iova, size, Some(&live));
        }

        let _init = self.inner.lock();
        let live = self.live.lock().clone();
        let _vote = live.as_ref().map(|l| l.smmu.power().enable()).transpose()?;
        self.unmap_tables(iova, size, live.as_ref())
    }

    fn unmap_tables(&self, iova: u64, size: usize, live: Option<&LiveContext>) -> Result<usize, SmmuError> {
        let mut secure = self.is_master_side_secure().then(|| self.secure.lock());
        let unmapped = {
            let env = DomainEnv::new(&self.services, secure.as_deref_mut(), live);
            let mut pgtbl = self.pgtbl.lock();
            let ops = pgtbl.as_mut().ok_or(SmmuError::NotAttached)?;
            ops.unmap(&env, iova, size)
        };
        if let Some(tracker) = secure.as_deref_mut() {
            let svc = &*self.services.ownership;
            let pages = &*self.services.pages;
            if let Err(e) = tracker.assign(svc) {
                if let Err(stuck) = tracker.unassign(svc, pages) {
                    error!("domain {:?}: {stuck}; page withheld from the allocator", self.id);
                }
                return Err(e.into());
            }
            tracker.unassign(svc, pages)?;
        }
        Ok(unmapped)
    }

    /// Software walk.
    #[must_use]
    pub fn iova_to_phys(&self, iova: u64) -> Option<u64> {
        self.pgtbl.lock().as_ref().and_then(|ops| ops.iova_to_phys(iova))
    }

    #[must_use]
    pub fn iova_to_pte(&self, iova: u64) -> u64 {
        self.pgtbl.lock().as_ref().map_or(0, |ops| ops.iova_to_pte(iova))
    }

    #[must_use]
    pub fn is_iova_coherent(&self, iova: u64) -> bool {
        self.pgtbl.lock().as_ref().is_some_and(|ops| ops.is_iova_coherent(iova))
    }

    /// Hardware walk through ATOS. Controllers without translation
    /// operations, and stage-2 domains, answer with the software walk.
    pub fn iova_to_phys_hard(&self, iova: u64) -> Option<u64> {
        let inner = self.inner.lock();
        let (smmu, cbndx) = (inner.smmu.clone()?, inner.cbndx?);
        if !smmu.hw().has(SmmuFeatures::TRANS_OPS) || inner.stage != Some(Stage::S1) {
            drop(inner);
            return self.iova_to_phys(iova);
        }

        let halt = smmu.options().contains(SmmuOptions::HALT_AND_TLB_ON_ATOS);
        if halt && let Some(target) = self.tlb_target() {
            match smmu.power().enable() {
                Ok(_vote) => smmu.tlb_inv_context(&target),
                Err(e) => error!("invalidating before ATOS: {e}"),
            }
        }
        match smmu.atos(cbndx, iova, halt) {
            Ok(phys) => phys,
            Err(e) => {
                error!("ATOS of {iova:#x} failed ({e}); software walk gives {:#x?}", self.iova_to_phys(iova));
                None
            }
        }
    }

    pub fn tlb_invalidate_all(&self) -> Result<(), SmmuError> {
        let live = self.live.lock().clone().ok_or(SmmuError::NotAttached)?;
        let _vote = live.smmu.power().enable()?;
        live.smmu.tlb_inv_context(&live.target);
        Ok(())
    }

    /// Raises a context fault with the given FSR bits, for testing clients.
    pub fn trigger_fault(&self, fsr: u32) -> Result<(), SmmuError> {
        let (smmu, cbndx) = self.bound()?;
        let _vote = smmu.power().enable()?;
        smmu.mmio().write32(cb::reg(cbndx, cb::FSRRESTORE), fsr);
        Ok(())
    }

    /// Reads a register of this domain's context bank.
    pub fn reg_read(&self, offset: u32) -> Result<u32, SmmuError> {
        check_cb_offset(offset)?;
        let (smmu, cbndx) = self.bound()?;
        let _vote = smmu.power().enable()?;
        Ok(smmu.mmio().read32(cb::reg(cbndx, offset)))
    }

    pub fn reg_write(&self, offset: u32, value: u32) -> Result<(), SmmuError> {
        check_cb_offset(offset)?;
        let (smmu, cbndx) = self.bound()?;
        let _vote = smmu.power().enable()?;
        smmu.mmio().write32(cb::reg(cbndx, offset), value);
        Ok(())
    }

    fn bound(&self) -> Result<(Arc<SmmuDevice>, u8), SmmuError> {
        let inner = self.inner.lock();
        match (&inner.smmu, inner.cbndx) {
            (Some(smmu), Some(cbndx)) => Ok((Arc::clone(smmu), cbndx)),
            _ => Err(SmmuError::NotAttached),
        }
    }
}

fn check_cb_offset(offset: u32) -> Result<(), SmmuError> {
    if offset >= CB_REG_WINDOW || offset % 4 != 0 {
        return Err(SmmuError::InvalidArgument("offset outside the context bank"));
    }
    Ok(())
}

/// Codec callbacks of one domain.
struct DomainEnv<'a> {
    pages: &'a dyn PageSource,
    secure: Option<RefCell<&'a mut SecureOwnershipTracker>>,
    live: Option<&'a LiveContext>,
}

impl<'a> DomainEnv<'a> {
    fn new(
        services: &'a DomainServices,
        secure: Option<&'a mut SecureOwnershipTracker>,
        live: Option<&'a LiveContext>,
    ) -> Self {
        Self {
            pages: &*services.pages,
            secure: secure.map(RefCell::new),
            live,
        }
    }
}

impl PageTableEnv for DomainEnv<'_> {
    fn alloc_pages(&self, size: usize) -> Option<PageBlock> {
        match &self.secure {
            Some(tracker) => tracker.borrow_mut().alloc_page(size, self.pages),
            None => self.pages.alloc(size),
        }
    }

    fn free_pages(&self, block: PageBlock) {
        match &self.secure {
            Some(tracker) => tracker.borrow_mut().free_page(block, self.pages),
            None => self.pages.free(block),
        }
    }

    fn tlb_flush_all(&self) {
        if let Some(live) = self.live {
            live.smmu.tlb_inv_context(&live.target);
        }
    }

    fn tlb_add_flush(&self, iova: u64, size: usize, granule: usize, leaf: bool) {
        let Some(live) = self.live else {
            return;
        };
        let step = granule.max(1) as u64;
        let end = iova.saturating_add(size as u64);
        let mut addr = iova;
        while addr < end {
            live.smmu.tlb_inv_range(&live.target, addr, leaf);
            addr += step;
        }
    }

    fn tlb_sync(&self) {
        if let Some(live) = self.live {
            let _ = if live.target.stage1 {
                live.smmu.tlb_sync_context(live.target.cbndx)
            } else {
                live.smmu.tlb_sync_global()
            };
        }
    }
}
