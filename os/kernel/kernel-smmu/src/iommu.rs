//! The interface the bus layer programs against.

use crate::attr::{AttributeKind, AttributeValue, DomainAttribute};
use crate::domain::{DomainServices, Stage, TranslationDomain};
use crate::pgtable::{Prot, Segment};
use crate::registry::SmmuRegistry;
use crate::secure::AssignFailurePolicy;
use crate::{DeviceId, DomainId, SmmuError, SmmuId};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};
use log::error;

/// A domain as handed out to callers.
pub type DomainHandle = Arc<TranslationDomain>;

/// IOMMU operations offered to the bus layer.
pub trait IommuOps {
    fn domain_alloc(&self, stage: Stage) -> DomainHandle;
    fn domain_free(&self, domain: &DomainHandle) -> Result<(), SmmuError>;
    fn add_device(&self, smmu: SmmuId, device: DeviceId, stream_ids: &[u16]) -> Result<(), SmmuError>;
    fn remove_device(&self, device: DeviceId) -> Result<(), SmmuError>;
    fn attach(&self, domain: &DomainHandle, device: DeviceId) -> Result<(), SmmuError>;
    fn detach(&self, domain: &DomainHandle, device: DeviceId) -> Result<(), SmmuError>;
    fn map(
        &self,
        domain: &DomainHandle,
        iova: u64,
        paddr: u64,
        size: usize,
        prot: Prot,
    ) -> Result<(), SmmuError>;
    fn map_batch(&self, domain: &DomainHandle, iova: u64, segments: &[Segment], prot: Prot)
    -> Result<usize, SmmuError>;
    fn unmap(&self, domain: &DomainHandle, iova: u64, size: usize) -> Result<usize, SmmuError>;
    fn iova_to_phys(&self, domain: &DomainHandle, iova: u64) -> Option<u64>;
    fn iova_to_phys_hard(&self, domain: &DomainHandle, iova: u64) -> Option<u64>;
    fn set_attribute(&self, domain: &DomainHandle, attr: DomainAttribute) -> Result<(), SmmuError>;
    fn get_attribute(&self, domain: &DomainHandle, kind: AttributeKind) -> Result<AttributeValue, SmmuError>;
    fn tlb_invalidate_all(&self, domain: &DomainHandle) -> Result<(), SmmuError>;
}

/// [`IommuOps`] over every controller in a registry.
pub struct SmmuIommu {
    registry: SmmuRegistry,
    services: DomainServices,
    policy: AssignFailurePolicy,
    next_domain: AtomicU32,
}

impl SmmuIommu {
    #[must_use]
    pub const fn new(registry: SmmuRegistry, services: DomainServices, policy: AssignFailurePolicy) -> Self {
        Self {
            registry,
            services,
            policy,
            next_domain: AtomicU32::new(1),
        }
    }

    #[must_use]
    pub const fn registry(&self) -> &SmmuRegistry {
        &self.registry
    }
}

impl IommuOps for SmmuIommu {
    fn domain_alloc(&self, stage: Stage) -> DomainHandle {
        let id = DomainId(self.next_domain.fetch_add(1, Ordering::Relaxed));
        TranslationDomain::new(id, stage, self.services.clone(), self.policy)
    }

    fn domain_free(&self, domain: &DomainHandle) -> Result<(), SmmuError> {
        domain.free()
    }

    fn add_device(&self, smmu: SmmuId, device: DeviceId, stream_ids: &[u16]) -> Result<(), SmmuError> {
        if self.registry.find_for_device(device).is_some() {
            return Err(SmmuError::Busy);
        }
        self.registry
            .find(smmu)
            .ok_or(SmmuError::NoDevice)?
            .add_device(device, stream_ids)
    }

    fn remove_device(&self, device: DeviceId) -> Result<(), SmmuError> {
        self.registry
            .find_for_device(device)
            .ok_or(SmmuError::NoDevice)?
            .remove_device(device)
    }

    fn attach(&self, domain: &DomainHandle, device: DeviceId) -> Result<(), SmmuError> {
        let Some(smmu) = self.registry.find_for_device(device) else {
            error!("cannot attach {device:?}: not behind any registered SMMU");
            return Err(SmmuError::NoDevice);
        };
        domain.attach(&smmu, device)
    }

    fn detach(&self, domain: &DomainHandle, device: DeviceId) -> Result<(), SmmuError> {
        domain.detach(device)
    }

    fn map(
        &self,
        domain: &DomainHandle,
        iova: u64,
        paddr: u64,
        size: usize,
        prot: Prot,
    ) -> Result<(), SmmuError> {
        domain.map(iova, paddr, size, prot)
    }

    fn map_batch(
        &self,
        domain: &DomainHandle,
        iova: u64,
        segments: &[Segment],
        prot: Prot,
    ) -> Result<usize, SmmuError> {
        domain.map_batch(iova, segments, prot)
    }

    fn unmap(&self, domain: &DomainHandle, iova: u64, size: usize) -> Result<usize, SmmuError> {
        domain.unmap(iova, size)
    }

    fn iova_to_phys(&self, domain: &DomainHandle, iova: u64) -> Option<u64> {
        domain.iova_to_phys(iova)
    }

    fn iova_to_phys_hard(&self, domain: &DomainHandle, iova: u64) -> Option<u64> {
        domain.iova_to_phys_hard(iova)
    }

    fn set_attribute(&self, domain: &DomainHandle, attr: DomainAttribute) -> Result<(), SmmuError> {
        domain.set_attribute(attr)
    }

    fn get_attribute(&self, domain: &DomainHandle, kind: AttributeKind) -> Result<AttributeValue, SmmuError> {
        domain.get_attribute(kind)
    }

    fn tlb_invalidate_all(&self, domain: &DomainHandle) -> Result<(), SmmuError> {
        domain.tlb_invalidate_all()
    }
}
