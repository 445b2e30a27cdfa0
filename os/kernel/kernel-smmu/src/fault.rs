//! Context and global fault handling.
//!
//! A context fault is first offered to the domain's [`FaultClient`]. If the
//! client cannot resolve it, the stalled transaction is terminated and the
//! faulting address is re-translated by the hardware (ATOS) so the report
//! can tell a stale TLB from a genuinely unmapped access.

use crate::config::SmmuOptions;
use crate::controller::SmmuDevice;
use crate::domain::TranslationDomain;
use crate::error::{FatalFault, FatalReason};
use crate::{DeviceId, DomainId, SmmuError};
use bitflags::bitflags;
use kernel_smmu_regs::LoadStore;
use kernel_smmu_regs::cb::{self, Fsr, Fsynr0, Sctlr};
use kernel_smmu_regs::gr1::{self, Cbfrsynra};
use log::{debug, error};

/// What a client made of a fault.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FaultResponse {
    /// Resolved; clear the status and let the transaction go.
    Handled,
    /// Still working on it; the transaction stays stalled and the status
    /// stays set.
    Deferred,
    Unhandled,
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct FaultFlags: u32 {
        const READ        = 1 << 0;
        const WRITE       = 1 << 1;
        const TRANSLATION = 1 << 2;
        const PERMISSION  = 1 << 3;
        const EXTERNAL    = 1 << 4;
        const STALLED     = 1 << 5;
    }
}

impl FaultFlags {
    fn decode(fsr: Fsr, fsynr0: Fsynr0) -> Self {
        let mut flags = if fsynr0.wnr() { Self::WRITE } else { Self::READ };
        flags.set(Self::TRANSLATION, fsr.tf());
        flags.set(Self::PERMISSION, fsr.pf());
        flags.set(Self::EXTERNAL, fsr.ef());
        flags.set(Self::STALLED, fsr.ss());
        flags
    }
}

/// Snapshot of one context fault, valid for the duration of the handler.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FaultRecord {
    pub domain: DomainId,
    pub cbndx: u8,
    pub iova: u64,
    pub fsr: u32,
    pub fsynr0: u32,
    pub flags: FaultFlags,
    pub stream_id: u16,
    pub master: Option<DeviceId>,
    /// Software table walk of `iova`.
    pub soft_phys: Option<u64>,
}

/// Receives context faults of a domain.
pub trait FaultClient: Send + Sync {
    fn on_fault(&self, fault: &FaultRecord) -> FaultResponse;
}

/// Interrupt handler result.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IrqReturn {
    /// Not ours, or nothing to do.
    None,
    Handled,
}

impl TranslationDomain {
    /// Services the context interrupt of this domain's bank.
    ///
    /// # Errors
    /// [`SmmuError::Fatal`] when the fault must bring the system down. No
    /// register is written after the error is produced.
    pub fn handle_context_fault(&self) -> Result<IrqReturn, SmmuError> {
        let inner = self.inner.lock();
        let (Some(smmu), Some(cbndx)) = (inner.smmu.clone(), inner.cbndx) else {
            error!("context fault on detached domain {:?}", self.id());
            return Ok(IrqReturn::Handled);
        };
        let non_fatal = inner.attrs.non_fatal_faults;

        let _vote = match smmu.power().enable() {
            Ok(v) => v,
            Err(e) => {
                error!("context fault on bank {cbndx} with power unavailable: {e}");
                return Ok(IrqReturn::None);
            }
        };
        let mmio = smmu.mmio();
        let fsr: Fsr = mmio.load(cb::fsr(cbndx));
        if !fsr.has_fault() {
            return Ok(IrqReturn::None);
        }

        let iova = mmio.read64(cb::reg(cbndx, cb::FAR));
        if smmu.options().contains(SmmuOptions::FATAL_ASF) && fsr.asf() {
            error!("address size fault on bank {cbndx} at {iova:#x}, FSR {:#010x}", fsr.into_bits());
            return Err(SmmuError::Fatal(FatalFault {
                cbndx,
                iova,
                fsr: fsr.into_bits(),
                reason: FatalReason::AddressSize,
            }));
        }

        let fsynr0: Fsynr0 = mmio.load(cb::reg(cbndx, cb::FSYNR0));
        let stream_id = mmio.load::<Cbfrsynra>(gr1::cbfrsynra(cbndx)).sid();
        let record = FaultRecord {
            domain: self.id(),
            cbndx,
            iova,
            fsr: fsr.into_bits(),
            fsynr0: fsynr0.into_bits(),
            flags: FaultFlags::decode(fsr, fsynr0),
            stream_id,
            master: smmu.find_master_by_sid(stream_id),
            soft_phys: self.iova_to_phys(iova),
        };

        let client = self.fault_client.lock().clone();
        let response = client.map_or(FaultResponse::Unhandled, |c| c.on_fault(&record));

        match response {
            FaultResponse::Deferred => {
                debug!("context fault at {iova:#x} deferred by client");
                return Ok(IrqReturn::Handled);
            }
            FaultResponse::Handled => {
                debug!("context fault at {iova:#x} handled by client");
            }
            FaultResponse::Unhandled => {
                let phys_hard = self.verify_fault(&smmu, cbndx, iova, fsr);
                report_unhandled(&record, fsr, phys_hard);
                if !non_fatal {
                    error!("unhandled context fault on bank {cbndx}");
                    return Err(SmmuError::Fatal(FatalFault {
                        cbndx,
                        iova,
                        fsr: fsr.into_bits(),
                        reason: FatalReason::Unhandled,
                    }));
                }
                // Status was cleared and the transaction terminated while
                // verifying.
                return Ok(IrqReturn::None);
            }
        }

        mmio.store(cb::fsr(cbndx), fsr);
        mmio.barrier();
        if fsr.ss() {
            if smmu.options().contains(SmmuOptions::ERRATA_CTX_FAULT_HANG) {
                let _ = smmu.tlb_sync_context(cbndx);
            }
            mmio.write32(cb::reg(cbndx, cb::RESUME), cb::RESUME_TERMINATE);
        }
        Ok(IrqReturn::Handled)
    }

    /// Terminates the stalled transaction, then asks the hardware to
    /// translate `iova` with stalling off. Retries once after a full TLB
    /// invalidation.
    fn verify_fault(&self, smmu: &SmmuDevice, cbndx: u8, iova: u64, fsr: Fsr) -> Option<u64> {
        let mmio = smmu.mmio();
        smmu.halt_nowait();
        mmio.write32(cb::reg(cbndx, cb::RESUME), cb::RESUME_TERMINATE);
        // Logged by the controller; verification continues regardless.
        let _ = smmu.wait_for_halt();

        // ATOS reports into FSR as well.
        mmio.store(cb::fsr(cbndx), fsr);

        let sctlr: Sctlr = mmio.load(cb::sctlr(cbndx));
        mmio.store(cb::sctlr(cbndx), sctlr.with_cfcfg(false));

        let mut phys = smmu.atos(cbndx, iova, false).ok().flatten();
        if phys.is_none() {
            error!("ATOS failed, invalidating the context TLB and trying again");
            if let Some(target) = self.tlb_target() {
                smmu.tlb_inv_context(&target);
            }
            phys = smmu.atos(cbndx, iova, false).ok().flatten();
            if phys.is_some() {
                error!("ATOS succeeded on retry, a TLB invalidation was probably missed");
            } else {
                error!("ATOS failed again; if the software walk looks right the hardware is misbehaving");
            }
        }

        mmio.store(cb::sctlr(cbndx), sctlr);
        smmu.resume();
        phys
    }
}

fn report_unhandled(record: &FaultRecord, fsr: Fsr, phys_hard: Option<u64>) {
    error!(
        "unhandled context fault: iova={:#018x}, fsr={:#x}, fsynr0={:#x}, cb={}",
        record.iova, record.fsr, record.fsynr0, record.cbndx
    );
    for name in fsr.set_bit_names() {
        error!("FSR.{name} set");
    }
    error!("soft iova-to-phys={:#x?}", record.soft_phys);
    error!("ATOS iova-to-phys={:#x?}", phys_hard);
    error!("SID={:#x} master={:?} flags={:?}", record.stream_id, record.master, record.flags);
}
