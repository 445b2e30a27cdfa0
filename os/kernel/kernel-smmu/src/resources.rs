//! Context bank and SMR index allocation.
//!
//! Both pools are fixed 128-bit bitmaps. Firmware may have pre-programmed
//! some stream mappings before the kernel ran; those are recorded as
//! [`StaticBinding`]s, reserved in the bitmaps and handed out by stream ID
//! instead of by first-fit search. Their indices are never freed.

use crate::SmmuError;
use crate::config::MAX_INDICES;
use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_smmu_regs::gr0::{self, S2cr, S2crType, Smr};
use kernel_smmu_regs::{LoadStore, SmmuMmio};
use kernel_sync::SpinLock;
use log::{debug, warn};

/// Lock-free 128-entry bitmap.
#[derive(Debug, Default)]
pub struct IndexBitmap {
    words: [AtomicU64; 2],
}

impl IndexBitmap {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            words: [AtomicU64::new(0), AtomicU64::new(0)],
        }
    }

    fn locate(&self, idx: u8) -> Option<(&AtomicU64, u64)> {
        let word = self.words.get(usize::from(idx / 64))?;
        Some((word, 1 << (idx % 64)))
    }

    /// Sets bit `idx`, returning whether it was already set. Indices past
    /// the end count as taken.
    pub fn test_and_set(&self, idx: u8) -> bool {
        self.locate(idx)
            .is_none_or(|(word, bit)| word.fetch_or(bit, Ordering::AcqRel) & bit != 0)
    }

    pub fn clear(&self, idx: u8) {
        if let Some((word, bit)) = self.locate(idx) {
            word.fetch_and(!bit, Ordering::AcqRel);
        }
    }

    #[must_use]
    pub fn is_set(&self, idx: u8) -> bool {
        self.locate(idx)
            .is_some_and(|(word, bit)| word.load(Ordering::Acquire) & bit != 0)
    }

    /// First-fit allocation in `[start, end)`.
    ///
    /// A racing allocator may take the bit between the search and the
    /// set; the search then restarts.
    pub fn alloc_in(&self, start: u8, end: u8) -> Option<u8> {
        let end = end.min(MAX_INDICES);
        loop {
            let idx = (start..end).find(|&i| !self.is_set(i))?;
            if !self.test_and_set(idx) {
                return Some(idx);
            }
        }
    }

    #[must_use]
    pub fn count(&self) -> u32 {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Acquire).count_ones())
            .sum()
    }
}

/// A stream mapping programmed by firmware before the kernel ran.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StaticBinding {
    pub stream_id: u16,
    pub smr_index: u8,
    /// Only meaningful for [`S2crType::Translate`].
    pub cbndx: u8,
    pub kind: S2crType,
}

/// Per-controller index pools.
#[derive(Default)]
pub struct ResourceAllocator {
    context_map: IndexBitmap,
    smr_map: IndexBitmap,
    statics: SpinLock<Vec<StaticBinding>>,
}

impl ResourceAllocator {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            context_map: IndexBitmap::new(),
            smr_map: IndexBitmap::new(),
            statics: SpinLock::new(Vec::new()),
        }
    }

    /// Records a static binding and reserves its indices.
    pub fn add_static(&self, binding: StaticBinding) {
        if binding.kind == S2crType::Translate {
            self.context_map.test_and_set(binding.cbndx);
            debug!(
                "static context bank: smr {}, sid {:#x}, cbndx {}",
                binding.smr_index, binding.stream_id, binding.cbndx
            );
        }
        self.smr_map.test_and_set(binding.smr_index);
        self.statics.lock().push(binding);
    }

    /// Scans the SMRs left valid by firmware and records them as static
    /// bindings. Must run with the clocks on, before any reset.
    ///
    /// A translating entry naming a context bank the controller does not
    /// have is recorded as bypass: its SMR stays reserved, no bank is.
    pub fn discover(&self, mmio: &dyn SmmuMmio, num_mapping_groups: u8, num_context_banks: u8) {
        for idx in 0..num_mapping_groups {
            let smr: Smr = mmio.load(gr0::smr(idx));
            if !smr.valid() {
                continue;
            }
            if smr.mask() != 0 {
                warn!("static SMR {idx} has mask {:#x}; only exact matches are supported", smr.mask());
            }
            let s2cr: S2cr = mmio.load(gr0::s2cr(idx));
            let mut kind = s2cr.kind();
            if kind == S2crType::Translate && s2cr.cbndx() >= num_context_banks {
                warn!(
                    "static SMR {idx} routes to missing context bank {}; treating as bypass",
                    s2cr.cbndx()
                );
                kind = S2crType::Bypass;
            }
            self.add_static(StaticBinding {
                stream_id: smr.id(),
                smr_index: idx,
                cbndx: s2cr.cbndx(),
                kind,
            });
        }
    }

    #[must_use]
    pub fn static_for_sid(&self, sid: u16) -> Option<StaticBinding> {
        self.statics.lock().iter().find(|b| b.stream_id == sid).copied()
    }

    /// The static translating context bank of `sid`, if any.
    #[must_use]
    pub fn static_translate_for(&self, sid: u16) -> Option<u8> {
        self.static_for_sid(sid)
            .filter(|b| b.kind == S2crType::Translate)
            .map(|b| b.cbndx)
    }

    fn is_static_context(&self, cbndx: u8) -> bool {
        self.statics
            .lock()
            .iter()
            .any(|b| b.kind == S2crType::Translate && b.cbndx == cbndx)
    }

    fn is_static_smr(&self, idx: u8) -> bool {
        self.statics.lock().iter().any(|b| b.smr_index == idx)
    }

    /// Context bank for a device with `stream_ids`: the first static
    /// translating binding among them, else first fit in `[start, end)`.
    pub fn alloc_context(&self, start: u8, end: u8, stream_ids: &[u16]) -> Result<u8, SmmuError> {
        if let Some(cbndx) = stream_ids.iter().find_map(|&sid| self.static_translate_for(sid)) {
            return Ok(cbndx);
        }
        self.context_map
            .alloc_in(start, end)
            .ok_or(SmmuError::OutOfSpace)
    }

    pub fn free_context(&self, cbndx: u8) {
        if !self.is_static_context(cbndx) {
            self.context_map.clear(cbndx);
        }
    }

    /// SMR for `sid`: its static slot, else first fit in `[0, end)`.
    pub fn alloc_smr(&self, sid: u16, end: u8) -> Result<u8, SmmuError> {
        if let Some(b) = self.static_for_sid(sid) {
            return Ok(b.smr_index);
        }
        self.smr_map.alloc_in(0, end).ok_or(SmmuError::OutOfSpace)
    }

    pub fn free_smr(&self, idx: u8) {
        if !self.is_static_smr(idx) {
            self.smr_map.clear(idx);
        }
    }

    #[must_use]
    pub fn context_in_use(&self, cbndx: u8) -> bool {
        self.context_map.is_set(cbndx)
    }

    #[must_use]
    pub fn smr_in_use(&self, idx: u8) -> bool {
        self.smr_map.is_set(idx)
    }

    #[must_use]
    pub fn contexts_in_use(&self) -> u32 {
        self.context_map.count()
    }
}

/// Cyclic ID allocator over `[start, end]` that resumes searching after
/// the most recently allocated ID, so a just-released ID is the last
/// candidate to be handed out again.
#[derive(Debug)]
pub struct AsidPool {
    start: u16,
    end: u16,
    next: u16,
    used: BTreeSet<u16>,
}

impl AsidPool {
    /// Empty when `start > end`.
    #[must_use]
    pub const fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            next: start,
            used: BTreeSet::new(),
        }
    }

    pub fn alloc(&mut self) -> Option<u16> {
        if self.start > self.end {
            return None;
        }
        let found = (self.next..=self.end)
            .chain(self.start..self.next)
            .find(|id| !self.used.contains(id))?;
        self.used.insert(found);
        self.next = if found == self.end { self.start } else { found + 1 };
        Some(found)
    }

    pub fn free(&mut self, id: u16) {
        self.used.remove(&id);
    }

    #[must_use]
    pub fn in_use(&self) -> usize {
        self.used.len()
    }
}
