//! Per-domain configuration attributes.

use crate::config::SmmuFeatures;
use crate::domain::{Stage, TranslationDomain};
use crate::pgtable::TableRegisters;
use crate::SmmuError;
use core::sync::atomic::Ordering;
use kernel_smmu_regs::cb;
use log::warn;

/// Highest IOVA an explicit aperture may reach.
const GEOMETRY_LIMIT: u64 = 1 << 32;

/// An attribute together with the value to set.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DomainAttribute {
    Nesting(bool),
    SecureVmid(u32),
    Dynamic(bool),
    ContextBankIndex(u8),
    NonFatalFaults(bool),
    S1Bypass(bool),
    EnableTtbr1(bool),
    PageTableForceCoherent(bool),
    Geometry { start: u64, end: u64 },
    Atomic(bool),
    CbStallDisable(bool),
    ProcId(u32),
}

/// Selects an attribute for [`TranslationDomain::get_attribute`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AttributeKind {
    Nesting,
    SecureVmid,
    Dynamic,
    ContextBankIndex,
    NonFatalFaults,
    S1Bypass,
    EnableTtbr1,
    PageTableForceCoherent,
    Geometry,
    Atomic,
    CbStallDisable,
    ProcId,
    PageTableIsCoherent,
    Ttbr0,
    PtBaseAddr,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    Bool(bool),
    U32(u32),
    U64(u64),
    Range { start: u64, end: u64 },
}

/// Attribute state kept under the domain's init lock.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub(crate) struct DomainAttrs {
    pub(crate) secure_vmid: Option<u32>,
    pub(crate) dynamic: bool,
    /// Context bank a dynamic domain shares.
    pub(crate) context_bank: Option<u8>,
    pub(crate) non_fatal_faults: bool,
    pub(crate) s1_bypass: bool,
    pub(crate) ttbr1: bool,
    pub(crate) force_coherent: bool,
    pub(crate) geometry: Option<(u64, u64)>,
    pub(crate) atomic: bool,
    pub(crate) stall_disable: bool,
    pub(crate) procid: Option<u32>,
}

impl TranslationDomain {
    /// Changes one attribute.
    ///
    /// Attributes that shape the context bank are only accepted while the
    /// domain is detached; the others take effect on the next fault, unmap
    /// or attach.
    pub fn set_attribute(&self, attr: DomainAttribute) -> Result<(), SmmuError> {
        let mut inner = self.inner.lock();
        let attached = inner.smmu.is_some();
        let refuse_attached = |what: &str| {
            if attached {
                warn!("cannot change {what} of domain {:?} while attached", self.id());
                Err(SmmuError::Busy)
            } else {
                Ok(())
            }
        };

        match attr {
            DomainAttribute::Nesting(nested) => {
                refuse_attached("nesting")?;
                inner.requested = if nested { Stage::Nested } else { Stage::S1 };
            }
            DomainAttribute::SecureVmid(vmid) => {
                if inner.attrs.secure_vmid.is_some() {
                    return Err(SmmuError::Busy);
                }
                inner.attrs.secure_vmid = Some(vmid);
                self.secure.lock().set_secure_vmid(vmid);
                self.has_secure_vmid.store(true, Ordering::Release);
            }
            DomainAttribute::Dynamic(dynamic) => {
                refuse_attached("the dynamic flag")?;
                inner.attrs.dynamic = dynamic;
            }
            DomainAttribute::ContextBankIndex(cbndx) => {
                refuse_attached("the context bank")?;
                if !inner.attrs.dynamic {
                    return Err(SmmuError::InvalidArgument("context bank index on a non-dynamic domain"));
                }
                inner.attrs.context_bank = Some(cbndx);
            }
            DomainAttribute::NonFatalFaults(on) => inner.attrs.non_fatal_faults = on,
            DomainAttribute::S1Bypass(on) => inner.attrs.s1_bypass = on,
            DomainAttribute::EnableTtbr1(on) => inner.attrs.ttbr1 = on,
            DomainAttribute::PageTableForceCoherent(on) => {
                refuse_attached("page-table coherency")?;
                inner.attrs.force_coherent = on;
            }
            DomainAttribute::Geometry { start, end } => {
                refuse_attached("the geometry")?;
                if start >= GEOMETRY_LIMIT || end >= GEOMETRY_LIMIT || start > end {
                    return Err(SmmuError::InvalidArgument("aperture must lie below 4 GiB"));
                }
                inner.attrs.geometry = Some(match inner.attrs.geometry {
                    Some((s, e)) => (s.min(start), e.max(end)),
                    None => (start, end),
                });
            }
            DomainAttribute::Atomic(on) => {
                inner.attrs.atomic = on;
                self.atomic.store(on, Ordering::Release);
            }
            DomainAttribute::CbStallDisable(on) => inner.attrs.stall_disable = on,
            DomainAttribute::ProcId(procid) => {
                refuse_attached("the process ID")?;
                inner.attrs.procid = Some(procid);
            }
        }
        Ok(())
    }

    pub fn get_attribute(&self, kind: AttributeKind) -> Result<AttributeValue, SmmuError> {
        let inner = self.inner.lock();
        let a = &inner.attrs;
        let value = match kind {
            AttributeKind::Nesting => AttributeValue::Bool(inner.requested == Stage::Nested),
            AttributeKind::SecureVmid => AttributeValue::U32(
                a.secure_vmid
                    .ok_or(SmmuError::InvalidArgument("no secure VMID set"))?,
            ),
            AttributeKind::Dynamic => AttributeValue::Bool(a.dynamic),
            AttributeKind::ContextBankIndex => {
                let cbndx = inner.cbndx.filter(|_| inner.smmu.is_some()).ok_or(SmmuError::NoDevice)?;
                AttributeValue::U32(u32::from(cbndx))
            }
            AttributeKind::NonFatalFaults => AttributeValue::Bool(a.non_fatal_faults),
            AttributeKind::S1Bypass => AttributeValue::Bool(a.s1_bypass),
            AttributeKind::EnableTtbr1 => AttributeValue::Bool(a.ttbr1),
            AttributeKind::PageTableForceCoherent => AttributeValue::Bool(a.force_coherent),
            AttributeKind::Geometry => {
                let (start, end) = a.geometry.unwrap_or((0, 0));
                AttributeValue::Range { start, end }
            }
            AttributeKind::Atomic => AttributeValue::Bool(a.atomic),
            AttributeKind::CbStallDisable => AttributeValue::Bool(a.stall_disable),
            AttributeKind::ProcId => AttributeValue::U32(a.procid.unwrap_or(0)),
            AttributeKind::PageTableIsCoherent => {
                let smmu = inner.smmu.as_ref().ok_or(SmmuError::NoDevice)?;
                AttributeValue::Bool(a.force_coherent || smmu.hw().has(SmmuFeatures::COHERENT_WALK))
            }
            AttributeKind::Ttbr0 => {
                if inner.smmu.is_none() {
                    return Err(SmmuError::NoDevice);
                }
                let ttbr0 = match inner.regs {
                    Some(TableRegisters::Stage1 { ttbr, .. }) => {
                        ttbr[0] | u64::from(inner.asid.unwrap_or(0)) << cb::TTBR_ASID_SHIFT
                    }
                    Some(TableRegisters::Stage2 { vttbr, .. }) => vttbr,
                    Some(TableRegisters::Secure) | None => 0,
                };
                AttributeValue::U64(ttbr0)
            }
            AttributeKind::PtBaseAddr => {
                AttributeValue::U64(inner.regs.and_then(|r| r.table_base()).unwrap_or(0))
            }
        };
        Ok(value)
    }
}

