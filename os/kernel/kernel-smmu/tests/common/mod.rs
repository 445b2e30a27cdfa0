//! In-memory SMMU and platform collaborators for the scenario tests.

#![allow(dead_code, clippy::must_use_candidate)]

use kernel_smmu::config::{SmmuConfig, SmmuFeatures, SmmuHwInfo, SmmuVersion};
use kernel_smmu::controller::{IrqError, IrqLines, SmmuPlatform};
use kernel_smmu::pgtable::{
    PageBlock, PageTableCodec, PageTableConfig, PageTableEnv, PageTableError, PageTableFormat, PageTableOps,
    PageTableQuirks, Prot, TableRegisters,
};
use kernel_smmu::power::{BusBandwidth, Clock, PowerError, PowerResources, Regulator};
use kernel_smmu::secure::{
    AssignFailurePolicy, OwnershipError, OwnershipTransfer, PageSource, VMID_HLOS, VmidPerm,
};
use kernel_smmu::time::Clocksource;
use kernel_smmu::{
    DeviceId, DomainId, DomainServices, SmmuDevice, SmmuError, SmmuId, Stage, TranslationDomain,
};
use kernel_smmu_regs::cb;
use kernel_smmu_regs::gr0;
use kernel_smmu_regs::impl_def::{MICRO_MMU_CTRL, MicroMmuCtrl};
use kernel_smmu_regs::{Reg, SmmuMmio, Space};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub const PAGE: usize = 0x1000;

#[derive(Default)]
struct MmioState {
    regs: BTreeMap<Reg, u32>,
    writes: Vec<(Reg, u32)>,
}

/// Register file with a write log.
///
/// FSR and sGFSR are write-one-to-clear, FSRRESTORE loads FSR, and the
/// micro-controller acknowledges a halt request at once. Everything else
/// reads back what was last written (or zero), so sync and ATOS status
/// registers always report completion.
#[derive(Clone, Default)]
pub struct FakeMmio(Arc<Mutex<MmioState>>);

impl FakeMmio {
    /// Sets a register without logging a write.
    pub fn poke(&self, reg: Reg, value: u32) {
        self.0.lock().unwrap().regs.insert(reg, value);
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn poke64(&self, reg: Reg, value: u64) {
        self.poke(reg, value as u32);
        self.poke(reg.plus(4), (value >> 32) as u32);
    }

    pub fn peek(&self, reg: Reg) -> u32 {
        self.read32(reg)
    }

    pub fn writes(&self) -> Vec<(Reg, u32)> {
        self.0.lock().unwrap().writes.clone()
    }

    pub fn writes_to(&self, reg: Reg) -> Vec<u32> {
        self.0
            .lock()
            .unwrap()
            .writes
            .iter()
            .filter(|(r, _)| *r == reg)
            .map(|&(_, v)| v)
            .collect()
    }

    pub fn clear_log(&self) {
        self.0.lock().unwrap().writes.clear();
    }
}

impl SmmuMmio for FakeMmio {
    fn read32(&self, reg: Reg) -> u32 {
        self.0.lock().unwrap().regs.get(&reg).copied().unwrap_or(0)
    }

    fn write32(&self, reg: Reg, value: u32) {
        let mut st = self.0.lock().unwrap();
        st.writes.push((reg, value));
        match (reg.space, reg.offset) {
            (Space::ContextBank(_), cb::FSR) | (Space::Gr0, gr0::SGFSR) => {
                *st.regs.entry(reg).or_default() &= !value;
            }
            (Space::ContextBank(n), cb::FSRRESTORE) => {
                st.regs.insert(cb::fsr(n), value);
                st.regs.insert(reg, value);
            }
            _ if reg == MICRO_MMU_CTRL => {
                let ctrl = MicroMmuCtrl::from_bits(value);
                st.regs.insert(reg, ctrl.with_idle(ctrl.local_halt_req()).into_bits());
            }
            _ => {
                st.regs.insert(reg, value);
            }
        }
    }
}

/// Manual time: only advances when the engine waits.
#[derive(Default)]
pub struct Ticks(AtomicU64);

impl Clocksource for Ticks {
    fn now_us(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn delay_us(&self, us: u64) {
        self.0.fetch_add(us, Ordering::Relaxed);
    }
}

#[derive(Default)]
pub struct FakeRegulator {
    pub on: AtomicBool,
    pub enables: AtomicU32,
}

impl Regulator for FakeRegulator {
    fn enable(&self) -> Result<(), PowerError> {
        self.on.store(true, Ordering::Relaxed);
        self.enables.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn disable(&self) {
        self.on.store(false, Ordering::Relaxed);
    }
}

#[derive(Default)]
pub struct FakeClock {
    pub prepared: AtomicU32,
    pub enabled: AtomicU32,
}

impl Clock for FakeClock {
    fn prepare(&self) -> Result<(), PowerError> {
        self.prepared.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn unprepare(&self) {
        self.prepared.fetch_sub(1, Ordering::Relaxed);
    }

    fn enable(&self) -> Result<(), PowerError> {
        self.enabled.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn disable(&self) {
        self.enabled.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Default)]
pub struct FakeBus(pub AtomicU32);

impl BusBandwidth for FakeBus {
    fn vote(&self) -> Result<(), PowerError> {
        self.0.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn unvote(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Default)]
pub struct FakeIrqs {
    pub requested: Mutex<BTreeSet<u8>>,
    pub refuse: AtomicBool,
}

impl IrqLines for FakeIrqs {
    fn request_context(&self, index: u8) -> Result<(), IrqError> {
        if self.refuse.load(Ordering::Relaxed) {
            return Err(IrqError { index });
        }
        self.requested.lock().unwrap().insert(index);
        Ok(())
    }

    fn free_context(&self, index: u8) {
        self.requested.lock().unwrap().remove(&index);
    }
}

/// The secure monitor: remembers who owns each page.
#[derive(Default)]
pub struct FakeMonitor {
    owners: Mutex<BTreeMap<u64, Vec<u32>>>,
    pub refuse: Mutex<BTreeSet<u64>>,
    pub calls: AtomicU32,
}

impl FakeMonitor {
    /// Owners of `phys`; pages never transferred belong to the normal world.
    pub fn owners(&self, phys: u64) -> Vec<u32> {
        self.owners
            .lock()
            .unwrap()
            .get(&phys)
            .cloned()
            .unwrap_or_else(|| vec![VMID_HLOS])
    }

    pub fn is_secure(&self, phys: u64) -> bool {
        self.owners(phys).iter().any(|&v| v != VMID_HLOS)
    }
}

impl OwnershipTransfer for FakeMonitor {
    fn transfer(&self, block: PageBlock, _from: &[u32], to: &[VmidPerm]) -> Result<(), OwnershipError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if self.refuse.lock().unwrap().contains(&block.phys) {
            return Err(OwnershipError { phys: block.phys });
        }
        self.owners
            .lock()
            .unwrap()
            .insert(block.phys, to.iter().map(|p| p.vmid).collect());
        Ok(())
    }
}

/// Page allocator that flags any secure-owned page it gets back.
pub struct FakePages {
    monitor: Arc<FakeMonitor>,
    next: AtomicU64,
    pub live: Mutex<BTreeSet<u64>>,
    pub freed_while_secure: Mutex<Vec<u64>>,
}

impl FakePages {
    pub fn new(monitor: Arc<FakeMonitor>) -> Self {
        Self {
            monitor,
            next: AtomicU64::new(0x8000_0000),
            live: Mutex::new(BTreeSet::new()),
            freed_while_secure: Mutex::new(Vec::new()),
        }
    }

    pub fn outstanding(&self) -> usize {
        self.live.lock().unwrap().len()
    }
}

impl PageSource for FakePages {
    fn alloc(&self, size: usize) -> Option<PageBlock> {
        let phys = self.next.fetch_add(size as u64, Ordering::Relaxed);
        self.live.lock().unwrap().insert(phys);
        Some(PageBlock { phys, size })
    }

    fn free(&self, block: PageBlock) {
        if self.monitor.is_secure(block.phys) {
            self.freed_while_secure.lock().unwrap().push(block.phys);
        }
        self.live.lock().unwrap().remove(&block.phys);
    }

    fn zero(&self, _block: PageBlock) {}
}

/// Flat page table: one root page plus one page per mapping.
pub struct FakeCodec {
    pub allocs: Mutex<Vec<(PageTableFormat, PageTableConfig)>>,
    pub fail: AtomicBool,
}

impl Default for FakeCodec {
    fn default() -> Self {
        Self {
            allocs: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        }
    }
}

impl FakeCodec {
    pub fn last_alloc(&self) -> Option<(PageTableFormat, PageTableConfig)> {
        self.allocs.lock().unwrap().last().copied()
    }
}

impl PageTableCodec for FakeCodec {
    fn alloc(
        &self,
        format: PageTableFormat,
        config: &PageTableConfig,
        env: &dyn PageTableEnv,
    ) -> Result<Box<dyn PageTableOps>, PageTableError> {
        self.allocs.lock().unwrap().push((format, *config));
        if self.fail.load(Ordering::Relaxed) {
            return Err(PageTableError::NoMemory);
        }
        let root = env.alloc_pages(PAGE).ok_or(PageTableError::NoMemory)?;
        Ok(Box::new(FakeTables {
            format,
            root,
            coherent: config.quirks.contains(PageTableQuirks::COHERENT_WALK),
            leaves: BTreeMap::new(),
        }))
    }
}

struct FakeTables {
    format: PageTableFormat,
    root: PageBlock,
    coherent: bool,
    /// iova -> (phys, len, table page)
    leaves: BTreeMap<u64, (u64, usize, PageBlock)>,
}

impl PageTableOps for FakeTables {
    fn registers(&self) -> TableRegisters {
        match self.format {
            PageTableFormat::Arm64LpaeS1 => TableRegisters::Stage1 {
                ttbr: [self.root.phys, 0],
                tcr: 0x0000_0001_0000_3520,
                mair: [0x0004_04ff, 0],
            },
            PageTableFormat::Arm64LpaeS2 => TableRegisters::Stage2 {
                vttbr: self.root.phys,
                vtcr: 0x8002_3560,
            },
            PageTableFormat::MsmSecure => TableRegisters::Secure,
        }
    }

    fn map(
        &mut self,
        env: &dyn PageTableEnv,
        iova: u64,
        paddr: u64,
        size: usize,
        _prot: Prot,
    ) -> Result<(), PageTableError> {
        if size == 0 || iova % PAGE as u64 != 0 {
            return Err(PageTableError::Invalid { iova });
        }
        if self.iova_to_phys(iova).is_some() {
            return Err(PageTableError::Exists { iova });
        }
        let page = env.alloc_pages(PAGE).ok_or(PageTableError::NoMemory)?;
        self.leaves.insert(iova, (paddr, size, page));
        Ok(())
    }

    fn unmap(&mut self, env: &dyn PageTableEnv, iova: u64, size: usize) -> usize {
        let end = iova + size as u64;
        let hit: Vec<u64> = self.leaves.range(iova..end).map(|(&k, _)| k).collect();
        let mut unmapped = 0;
        for key in hit {
            if let Some((_, len, page)) = self.leaves.remove(&key) {
                env.free_pages(page);
                env.tlb_add_flush(key, len, PAGE, true);
                unmapped += len;
            }
        }
        if unmapped > 0 {
            env.tlb_sync();
        }
        unmapped
    }

    fn iova_to_phys(&self, iova: u64) -> Option<u64> {
        let (&base, &(phys, len, _)) = self.leaves.range(..=iova).next_back()?;
        (iova < base + len as u64).then(|| phys + (iova - base))
    }

    fn iova_to_pte(&self, iova: u64) -> u64 {
        self.iova_to_phys(iova).map_or(0, |phys| phys & !0xfff | 0x3)
    }

    fn is_iova_coherent(&self, iova: u64) -> bool {
        self.coherent && self.iova_to_phys(iova).is_some()
    }

    fn free(self: Box<Self>, env: &dyn PageTableEnv) {
        for (_, _, page) in self.leaves.into_values() {
            env.free_pages(page);
        }
        env.free_pages(self.root);
    }
}

/// A v2 controller with `banks` context banks, all stages and 16 SMRs.
pub fn hw_info(banks: u8) -> SmmuHwInfo {
    SmmuHwInfo {
        version: SmmuVersion::V2,
        features: SmmuFeatures::TRANS_S1
            | SmmuFeatures::TRANS_S2
            | SmmuFeatures::TRANS_NESTED
            | SmmuFeatures::STREAM_MATCH
            | SmmuFeatures::TRANS_OPS,
        num_mapping_groups: 16,
        num_context_banks: banks,
        num_s2_context_banks: 0,
        pgshift: 12,
        va_size: 39,
        ipa_size: 40,
        pa_size: 40,
        ubs: 5,
        pgsize_bitmap: 0x4020_1000,
    }
}

/// One controller and every fake behind it.
pub struct Rig {
    pub mmio: FakeMmio,
    pub clock: Arc<Ticks>,
    pub regulator: Arc<FakeRegulator>,
    pub core_clock: Arc<FakeClock>,
    pub bus: Arc<FakeBus>,
    pub irqs: Arc<FakeIrqs>,
    pub codec: Arc<FakeCodec>,
    pub monitor: Arc<FakeMonitor>,
    pub pages: Arc<FakePages>,
    pub smmu: Arc<SmmuDevice>,
}

impl Rig {
    pub fn new(config: SmmuConfig) -> Self {
        Self::build(config, hw_info(4), |_| {})
    }

    /// `seed` runs on the register file before the controller looks at it.
    pub fn build(config: SmmuConfig, hw: SmmuHwInfo, seed: impl FnOnce(&FakeMmio)) -> Self {
        Self::assemble(seed, |platform| SmmuDevice::with_hw_info(SmmuId(0), platform, config, hw)).unwrap()
    }

    /// A default controller registered as `SmmuId(id)`.
    pub fn numbered(id: u32) -> Self {
        Self::assemble(
            |_| {},
            |platform| SmmuDevice::with_hw_info(SmmuId(id), platform, SmmuConfig::default(), hw_info(4)),
        )
        .unwrap()
    }

    /// Decodes the capabilities from the ID registers `seed` writes.
    pub fn probe(config: SmmuConfig, seed: impl FnOnce(&FakeMmio)) -> Result<Self, SmmuError> {
        Self::assemble(seed, |platform| SmmuDevice::probe(SmmuId(0), platform, config))
    }

    fn assemble(
        seed: impl FnOnce(&FakeMmio),
        make: impl FnOnce(SmmuPlatform) -> Result<Arc<SmmuDevice>, SmmuError>,
    ) -> Result<Self, SmmuError> {
        let mmio = FakeMmio::default();
        seed(&mmio);
        let clock = Arc::new(Ticks::default());
        let regulator = Arc::new(FakeRegulator::default());
        let core_clock = Arc::new(FakeClock::default());
        let bus = Arc::new(FakeBus::default());
        let irqs = Arc::new(FakeIrqs::default());
        let codec = Arc::new(FakeCodec::default());
        let monitor = Arc::new(FakeMonitor::default());
        let pages = Arc::new(FakePages::new(Arc::clone(&monitor)));

        let platform = SmmuPlatform {
            mmio: Box::new(mmio.clone()),
            clock: Arc::clone(&clock) as Arc<dyn Clocksource>,
            power: PowerResources {
                regulator: Some(Arc::clone(&regulator) as Arc<dyn Regulator>),
                bus: Some(Arc::clone(&bus) as Arc<dyn BusBandwidth>),
                clocks: vec![Arc::clone(&core_clock) as Arc<dyn Clock>],
            },
            irqs: Arc::clone(&irqs) as Arc<dyn IrqLines>,
            codec: Arc::clone(&codec) as Arc<dyn PageTableCodec>,
        };
        let smmu = make(platform)?;
        mmio.clear_log();

        Ok(Self {
            mmio,
            clock,
            regulator,
            core_clock,
            bus,
            irqs,
            codec,
            monitor,
            pages,
            smmu,
        })
    }

    pub fn services(&self) -> DomainServices {
        DomainServices {
            pages: Arc::clone(&self.pages) as Arc<dyn PageSource>,
            ownership: Arc::clone(&self.monitor) as Arc<dyn OwnershipTransfer>,
        }
    }

    pub fn domain(&self, id: u32) -> Arc<TranslationDomain> {
        self.domain_with(id, Stage::S1, AssignFailurePolicy::Retain)
    }

    pub fn domain_with(&self, id: u32, stage: Stage, policy: AssignFailurePolicy) -> Arc<TranslationDomain> {
        TranslationDomain::new(DomainId(id), stage, self.services(), policy)
    }

    /// Registers `device` with a single stream ID.
    pub fn device(&self, device: u32, sid: u16) -> DeviceId {
        let id = DeviceId(device);
        self.smmu.add_device(id, &[sid]).unwrap();
        id
    }
}
