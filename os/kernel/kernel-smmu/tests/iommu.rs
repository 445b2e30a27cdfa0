mod common;

use common::{PAGE, Rig};
use kernel_smmu::config::{ForcedStage, SmmuFeatures};
use kernel_smmu::pgtable::Prot;
use kernel_smmu::secure::AssignFailurePolicy;
use kernel_smmu::{
    AttributeKind, AttributeValue, DeviceId, DomainState, IommuOps, SmmuConfig, SmmuError, SmmuId, SmmuIommu,
    SmmuRegistry, Stage,
};
use kernel_smmu_regs::gr0::{self, Id0, Id1, Id2, S2cr, S2crType, Smr};
use std::sync::Arc;

fn facade(rigs: &[&Rig]) -> SmmuIommu {
    let registry = SmmuRegistry::new();
    for rig in rigs {
        registry.register(Arc::clone(&rig.smmu)).unwrap();
    }
    SmmuIommu::new(registry, rigs[0].services(), AssignFailurePolicy::Retain)
}

#[test]
fn registry_tracks_controllers_and_their_devices() {
    let a = Rig::numbered(0);
    let b = Rig::numbered(1);
    let registry = SmmuRegistry::new();
    assert!(registry.is_empty());
    registry.register(Arc::clone(&a.smmu)).unwrap();
    registry.register(Arc::clone(&b.smmu)).unwrap();
    assert_eq!(registry.register(Arc::clone(&a.smmu)), Err(SmmuError::Busy));
    assert_eq!(registry.len(), 2);

    let dev = b.device(7, 0x70);
    let found = registry.find_for_device(dev).unwrap();
    assert_eq!(found.id(), SmmuId(1));
    assert!(registry.find_for_device(DeviceId(8)).is_none());
    assert_eq!(registry.find(SmmuId(0)).map(|s| s.id()), Some(SmmuId(0)));

    let domain = b.domain(1);
    domain.attach(&b.smmu, dev).unwrap();
    assert!(matches!(registry.unregister(SmmuId(1)), Err(SmmuError::Busy)));
    domain.detach(dev).unwrap();
    assert_eq!(registry.unregister(SmmuId(1)).map(|s| s.id()), Ok(SmmuId(1)));
    assert!(matches!(registry.unregister(SmmuId(1)), Err(SmmuError::NoDevice)));
    assert_eq!(registry.len(), 1);
}

#[test]
fn devices_belong_to_one_controller() {
    let a = Rig::numbered(0);
    let b = Rig::numbered(1);
    let iommu = facade(&[&a, &b]);

    iommu.add_device(SmmuId(0), DeviceId(1), &[0x10]).unwrap();
    assert_eq!(iommu.add_device(SmmuId(1), DeviceId(1), &[0x20]), Err(SmmuError::Busy));
    assert_eq!(iommu.add_device(SmmuId(5), DeviceId(2), &[0x20]), Err(SmmuError::NoDevice));
    assert!(a.smmu.has_device(DeviceId(1)));
    assert!(!b.smmu.has_device(DeviceId(1)));

    iommu.remove_device(DeviceId(1)).unwrap();
    assert_eq!(iommu.remove_device(DeviceId(1)), Err(SmmuError::NoDevice));
}

#[test]
fn facade_drives_a_domain_end_to_end() {
    let rig = Rig::numbered(0);
    let iommu = facade(&[&rig]);
    iommu.add_device(SmmuId(0), DeviceId(1), &[0x10]).unwrap();

    let domain = iommu.domain_alloc(Stage::S1);
    let other = iommu.domain_alloc(Stage::S1);
    assert_ne!(domain.id(), other.id());
    assert_eq!(iommu.attach(&domain, DeviceId(9)), Err(SmmuError::NoDevice));

    iommu.attach(&domain, DeviceId(1)).unwrap();
    assert_eq!(
        iommu.get_attribute(&domain, AttributeKind::ContextBankIndex),
        Ok(AttributeValue::U32(0))
    );
    iommu.map(&domain, 0x1000, 0x9000_0000, PAGE, Prot::READ).unwrap();
    assert_eq!(iommu.iova_to_phys(&domain, 0x1000), Some(0x9000_0000));
    iommu.tlb_invalidate_all(&domain).unwrap();
    assert_eq!(iommu.unmap(&domain, 0x1000, PAGE), Ok(PAGE));

    assert_eq!(iommu.remove_device(DeviceId(1)), Err(SmmuError::Busy));
    assert_eq!(iommu.domain_free(&domain), Err(SmmuError::Busy));
    iommu.detach(&domain, DeviceId(1)).unwrap();
    iommu.domain_free(&domain).unwrap();
    assert_eq!(domain.state(), DomainState::Unbound);
    iommu.remove_device(DeviceId(1)).unwrap();
    assert_eq!(rig.pages.outstanding(), 0);
}

fn seed_ids(id0: Id0, id1: Id1) -> impl FnOnce(&common::FakeMmio) {
    move |mmio| {
        mmio.poke(gr0::reg(gr0::ID0), id0.into_bits());
        mmio.poke(gr0::reg(gr0::ID1), id1.into_bits());
        mmio.poke(
            gr0::reg(gr0::ID2),
            Id2::new().with_ias(2).with_oas(2).with_ubs(2).with_ptfs_4k(true).into_bits(),
        );
    }
}

fn full_id0() -> Id0 {
    Id0::new()
        .with_s1ts(true)
        .with_s2ts(true)
        .with_nts(true)
        .with_sms(true)
        .with_numsmrg(8)
}

#[test]
fn probed_controller_keeps_stage1_off_the_stage2_banks() {
    let rig = Rig::probe(
        SmmuConfig::default(),
        seed_ids(full_id0(), Id1::new().with_numcb(8).with_nums2cb(2)),
    )
    .unwrap();
    let hw = rig.smmu.hw();
    assert_eq!(hw.num_context_banks, 8);
    assert_eq!(hw.num_s2_context_banks, 2);
    assert_eq!(hw.num_mapping_groups, 8);
    assert_eq!((hw.ipa_size, hw.pa_size, hw.va_size), (40, 40, 39));
    assert!(hw.has(SmmuFeatures::TRANS_NESTED | SmmuFeatures::STREAM_MATCH | SmmuFeatures::TRANS_OPS));

    let domain = rig.domain(1);
    domain.attach(&rig.smmu, rig.device(1, 0x10)).unwrap();
    assert_eq!(domain.context_bank(), Some(2));
    assert_eq!(domain.asid(), Some(3));
}

#[test]
fn probe_rejects_impossible_id_registers() {
    let no_translation = Id0::new().with_sms(true).with_numsmrg(8);
    assert!(matches!(
        Rig::probe(SmmuConfig::default(), seed_ids(no_translation, Id1::new().with_numcb(8))),
        Err(SmmuError::NoDevice)
    ));
    assert!(matches!(
        Rig::probe(
            SmmuConfig::default(),
            seed_ids(full_id0(), Id1::new().with_numcb(2).with_nums2cb(4))
        ),
        Err(SmmuError::NoDevice)
    ));
}

#[test]
fn forced_stage_masks_the_other_stage() {
    let rig = Rig::probe(
        SmmuConfig {
            force_stage: Some(ForcedStage::Stage2),
            ..SmmuConfig::default()
        },
        seed_ids(full_id0(), Id1::new().with_numcb(4)),
    )
    .unwrap();
    assert!(!rig.smmu.hw().has(SmmuFeatures::TRANS_S1));

    let domain = rig.domain(1);
    domain.attach(&rig.smmu, rig.device(1, 0x10)).unwrap();
    assert_eq!(domain.stage(), Some(Stage::S2));
}

#[test]
fn smr_self_test_keeps_the_firmware_mapping_in_smr0() {
    let rig = Rig::probe(SmmuConfig::default(), |mmio| {
        seed_ids(full_id0(), Id1::new().with_numcb(8))(mmio);
        mmio.poke(gr0::smr(0), Smr::exact(0x41).into_bits());
        mmio.poke(gr0::s2cr(0), S2cr::translate(2).into_bits());
    })
    .unwrap();
    assert_eq!(rig.mmio.peek(gr0::smr(0)), Smr::exact(0x41).into_bits());
    assert!(rig.smmu.resources().smr_in_use(0));
    assert!(rig.smmu.resources().context_in_use(2));

    let domain = rig.domain(1);
    domain.attach(&rig.smmu, rig.device(1, 0x41)).unwrap();
    assert_eq!(domain.context_bank(), Some(2));
}

#[test]
fn firmware_mapping_to_a_missing_bank_is_kept_as_bypass() {
    let rig = Rig::build(SmmuConfig::default(), common::hw_info(4), |mmio| {
        mmio.poke(gr0::smr(1), Smr::exact(0x41).into_bits());
        mmio.poke(gr0::s2cr(1), S2cr::translate(200).into_bits());
    });
    let resources = rig.smmu.resources();
    assert!(resources.smr_in_use(1));
    assert!(!resources.context_in_use(200));
    assert_eq!(resources.static_for_sid(0x41).map(|b| b.kind), Some(S2crType::Bypass));

    let domain = rig.domain(1);
    domain.attach(&rig.smmu, rig.device(1, 0x41)).unwrap();
    assert!(domain.context_bank().is_some_and(|cb| cb < 4));
    assert_eq!(resources.contexts_in_use(), 1);
}
