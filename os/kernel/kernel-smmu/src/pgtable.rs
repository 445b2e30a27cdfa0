//! Contract with the page-table codec.
//!
//! The codec owns the descriptor format. It allocates and frees table
//! memory and requests TLB maintenance only through [`PageTableEnv`], which
//! the domain implements so it can route table pages through the secure
//! ownership tracker and invalidations to the bound context bank.

use alloc::boxed::Box;
use bitflags::bitflags;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PageTableFormat {
    /// AArch64 long descriptors, stage-1 (VA to IPA).
    Arm64LpaeS1,
    /// AArch64 long descriptors, stage-2 (IPA to PA).
    Arm64LpaeS2,
    /// Tables owned by the secure world; the codec forwards requests there.
    MsmSecure,
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct Prot: u32 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        const CACHE   = 1 << 2;
        const NOEXEC  = 1 << 3;
        const MMIO    = 1 << 4;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct PageTableQuirks: u32 {
        /// Upper half of the input range is translated through TTBR1.
        const TTBR1          = 1 << 0;
        /// The walker snoops CPU caches; no cache maintenance on table updates.
        const COHERENT_WALK  = 1 << 1;
    }
}

/// Input to [`PageTableCodec::alloc`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PageTableConfig {
    pub quirks: PageTableQuirks,
    pub pgsize_bitmap: u64,
    /// Input address size in bits.
    pub ias: u32,
    /// Output address size in bits.
    pub oas: u32,
    /// Sign-extension bit when [`PageTableQuirks::TTBR1`] is set.
    pub sep: u32,
    pub iova_base: u64,
    pub iova_end: u64,
    /// Context bank the secure world should program, for [`PageTableFormat::MsmSecure`].
    pub secure_cbndx: Option<u8>,
}

/// Translation registers produced by the codec.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TableRegisters {
    Stage1 { ttbr: [u64; 2], tcr: u64, mair: [u32; 2] },
    Stage2 { vttbr: u64, vtcr: u32 },
    /// Programmed by the secure world.
    Secure,
}

impl TableRegisters {
    /// Base address of the first-level table, if visible.
    #[must_use]
    pub const fn table_base(&self) -> Option<u64> {
        match self {
            Self::Stage1 { ttbr, .. } => Some(ttbr[0]),
            Self::Stage2 { vttbr, .. } => Some(*vttbr),
            Self::Secure => None,
        }
    }
}

/// Physically contiguous memory handed to or from the codec.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageBlock {
    pub phys: u64,
    pub size: usize,
}

/// One entry of a scatter list for [`PageTableOps::map_batch`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Segment {
    pub phys: u64,
    pub len: usize,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PageTableError {
    #[error("out of page-table memory")]
    NoMemory,
    #[error("page-table format not supported")]
    UnsupportedFormat,
    #[error("{iova:#x} is already mapped")]
    Exists { iova: u64 },
    #[error("misaligned or out-of-range request at {iova:#x}")]
    Invalid { iova: u64 },
}

/// Services the codec calls back into.
pub trait PageTableEnv {
    fn alloc_pages(&self, size: usize) -> Option<PageBlock>;
    fn free_pages(&self, block: PageBlock);
    fn tlb_flush_all(&self);
    fn tlb_add_flush(&self, iova: u64, size: usize, granule: usize, leaf: bool);
    fn tlb_sync(&self);
}

/// A live set of translation tables.
pub trait PageTableOps: Send {
    fn registers(&self) -> TableRegisters;

    fn map(&mut self, env: &dyn PageTableEnv, iova: u64, paddr: u64, size: usize, prot: Prot)
    -> Result<(), PageTableError>;

    /// Returns the number of bytes unmapped.
    fn unmap(&mut self, env: &dyn PageTableEnv, iova: u64, size: usize) -> usize;

    /// Maps `segments` back to back from `iova`. On error a prefix may be
    /// left mapped.
    fn map_batch(
        &mut self,
        env: &dyn PageTableEnv,
        iova: u64,
        segments: &[Segment],
        prot: Prot,
    ) -> Result<usize, PageTableError> {
        let mut mapped = 0;
        for seg in segments {
            self.map(env, iova + mapped as u64, seg.phys, seg.len, prot)?;
            mapped += seg.len;
        }
        Ok(mapped)
    }

    fn iova_to_phys(&self, iova: u64) -> Option<u64>;

    /// Raw descriptor for `iova`, `0` when unmapped.
    fn iova_to_pte(&self, iova: u64) -> u64;

    fn is_iova_coherent(&self, iova: u64) -> bool;

    /// Releases every table page through `env`.
    fn free(self: Box<Self>, env: &dyn PageTableEnv);
}

pub trait PageTableCodec: Send + Sync {
    fn alloc(
        &self,
        format: PageTableFormat,
        config: &PageTableConfig,
        env: &dyn PageTableEnv,
    ) -> Result<Box<dyn PageTableOps>, PageTableError>;
}
