//! Ownership hand-off of page-table memory to a secure VMID.
//!
//! A master-side secure domain keeps its translation tables in memory
//! that the secure world may read but the normal world may no longer
//! write directly. Fresh table pages are queued in `pending_assign` and
//! transferred in bulk after each page-table update; pages the codec
//! releases are zeroed and parked in a per-domain pool so they can be
//! reused without a round trip. On teardown the pool is drained into
//! `pending_unassign` and every page is handed back before it is freed.

use crate::pgtable::PageBlock;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use bitflags::bitflags;
use log::{error, warn};

/// The default (normal world) owner.
pub const VMID_HLOS: u32 = 3;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct Perm: u32 {
        const EXEC  = 1 << 0;
        const WRITE = 1 << 1;
        const READ  = 1 << 2;
    }
}

/// An owner and what it may do with the page.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VmidPerm {
    pub vmid: u32,
    pub perm: Perm,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[error("ownership transfer of page {phys:#x} failed")]
pub struct OwnershipError {
    pub phys: u64,
}

/// The secure monitor call that re-tags a page.
pub trait OwnershipTransfer: Send + Sync {
    fn transfer(&self, block: PageBlock, from: &[u32], to: &[VmidPerm]) -> Result<(), OwnershipError>;
}

/// The normal-world page allocator backing page tables.
pub trait PageSource: Send + Sync {
    fn alloc(&self, size: usize) -> Option<PageBlock>;
    fn free(&self, block: PageBlock);
    fn zero(&self, block: PageBlock);
}

/// What [`SecureOwnershipTracker::assign`] does after a failed transfer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum AssignFailurePolicy {
    /// Keep the failed page and everything behind it queued for the next
    /// attempt.
    #[default]
    Retain,
    /// Stop at the failure and forget the rest of the queue.
    Drain,
}

#[derive(Debug, Default)]
pub struct SecureOwnershipTracker {
    secure_vmid: Option<u32>,
    policy: AssignFailurePolicy,
    pending_assign: VecDeque<PageBlock>,
    pending_unassign: VecDeque<PageBlock>,
    pool: Vec<PageBlock>,
    stranded: Vec<PageBlock>,
}

impl SecureOwnershipTracker {
    #[must_use]
    pub fn new(policy: AssignFailurePolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn secure_vmid(&self) -> Option<u32> {
        self.secure_vmid
    }

    pub const fn set_secure_vmid(&mut self, vmid: u32) {
        self.secure_vmid = Some(vmid);
    }

    /// A table page for the codec: a pooled secure page of the same size,
    /// or a fresh one queued for assignment.
    pub fn alloc_page(&mut self, size: usize, pages: &dyn PageSource) -> Option<PageBlock> {
        if let Some(pos) = self.pool.iter().position(|b| b.size == size) {
            return Some(self.pool.swap_remove(pos));
        }
        let block = pages.alloc(size)?;
        self.pending_assign.push_back(block);
        Some(block)
    }

    /// A table page the codec no longer needs.
    pub fn free_page(&mut self, block: PageBlock, pages: &dyn PageSource) {
        // Never handed over; still ours to free.
        if let Some(pos) = self.pending_assign.iter().position(|b| *b == block) {
            self.pending_assign.remove(pos);
            pages.free(block);
            return;
        }
        pages.zero(block);
        self.pool.push(block);
    }

    /// Hands every queued page to the secure VMID (read) while keeping the
    /// normal world as a read/write co-owner. Returns the number of pages
    /// transferred.
    pub fn assign(&mut self, svc: &dyn OwnershipTransfer) -> Result<usize, OwnershipError> {
        let Some(vmid) = self.secure_vmid else {
            return Ok(0);
        };
        let to = [
            VmidPerm {
                vmid: VMID_HLOS,
                perm: Perm::READ | Perm::WRITE,
            },
            VmidPerm {
                vmid,
                perm: Perm::READ,
            },
        ];
        let mut done = 0;
        while let Some(&block) = self.pending_assign.front() {
            if let Err(e) = svc.transfer(block, &[VMID_HLOS], &to) {
                error!("assigning page-table page {:#x} to vmid {vmid}: {e}", block.phys);
                if self.policy == AssignFailurePolicy::Drain {
                    warn!("dropping {} unassigned page-table pages", self.pending_assign.len());
                    self.pending_assign.clear();
                }
                return Err(e);
            }
            self.pending_assign.pop_front();
            done += 1;
        }
        Ok(done)
    }

    /// Hands every page in `pending_unassign` back to the normal world and
    /// frees it. A page whose hand-back fails is stranded, never freed.
    /// Returns the number of pages freed.
    pub fn unassign(
        &mut self,
        svc: &dyn OwnershipTransfer,
        pages: &dyn PageSource,
    ) -> Result<usize, OwnershipError> {
        let Some(vmid) = self.secure_vmid else {
            return Ok(0);
        };
        let to = [VmidPerm {
            vmid: VMID_HLOS,
            perm: Perm::READ | Perm::WRITE | Perm::EXEC,
        }];
        let mut freed = 0;
        let mut first_err = None;
        while let Some(block) = self.pending_unassign.pop_front() {
            match svc.transfer(block, &[vmid, VMID_HLOS], &to) {
                Ok(()) => {
                    pages.free(block);
                    freed += 1;
                }
                Err(e) => {
                    error!("returning page-table page {:#x} from vmid {vmid}: {e}", block.phys);
                    self.stranded.push(block);
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(freed), Err)
    }

    /// Moves every pooled page to `pending_unassign`.
    pub fn drain_pool(&mut self) {
        self.pending_unassign.extend(self.pool.drain(..));
    }

    #[must_use]
    pub fn pending_assign(&self) -> usize {
        self.pending_assign.len()
    }

    #[must_use]
    pub fn pending_unassign(&self) -> usize {
        self.pending_unassign.len()
    }

    #[must_use]
    pub fn pooled(&self) -> usize {
        self.pool.len()
    }

    /// Pages that could not be handed back and are withheld from the
    /// allocator for good.
    #[must_use]
    pub fn stranded(&self) -> &[PageBlock] {
        &self.stranded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Pages {
        next: Mutex<u64>,
        freed: Mutex<Vec<u64>>,
        zeroed: Mutex<Vec<u64>>,
    }

    impl PageSource for Pages {
        fn alloc(&self, size: usize) -> Option<PageBlock> {
            let mut next = self.next.lock().unwrap();
            *next += 0x1000;
            Some(PageBlock { phys: *next, size })
        }

        fn free(&self, block: PageBlock) {
            self.freed.lock().unwrap().push(block.phys);
        }

        fn zero(&self, block: PageBlock) {
            self.zeroed.lock().unwrap().push(block.phys);
        }
    }

    #[derive(Default)]
    struct Monitor {
        refuse: Mutex<BTreeSet<u64>>,
        calls: Mutex<Vec<(u64, Vec<u32>)>>,
    }

    impl OwnershipTransfer for Monitor {
        fn transfer(&self, block: PageBlock, from: &[u32], _to: &[VmidPerm]) -> Result<(), OwnershipError> {
            self.calls.lock().unwrap().push((block.phys, from.to_vec()));
            if self.refuse.lock().unwrap().contains(&block.phys) {
                return Err(OwnershipError { phys: block.phys });
            }
            Ok(())
        }
    }

    fn tracker(policy: AssignFailurePolicy) -> SecureOwnershipTracker {
        let mut t = SecureOwnershipTracker::new(policy);
        t.set_secure_vmid(10);
        t
    }

    #[test]
    fn retain_keeps_failed_page_and_its_successors() {
        let pages = Pages::default();
        let mon = Monitor::default();
        let mut t = tracker(AssignFailurePolicy::Retain);
        for _ in 0..3 {
            t.alloc_page(0x1000, &pages).unwrap();
        }
        mon.refuse.lock().unwrap().insert(0x2000);

        assert_eq!(t.assign(&mon), Err(OwnershipError { phys: 0x2000 }));
        assert_eq!(t.pending_assign(), 2);

        mon.refuse.lock().unwrap().clear();
        assert_eq!(t.assign(&mon), Ok(2));
        assert_eq!(t.pending_assign(), 0);
    }

    #[test]
    fn drain_forgets_the_queue_on_failure() {
        let pages = Pages::default();
        let mon = Monitor::default();
        let mut t = tracker(AssignFailurePolicy::Drain);
        for _ in 0..3 {
            t.alloc_page(0x1000, &pages).unwrap();
        }
        mon.refuse.lock().unwrap().insert(0x1000);
        assert!(t.assign(&mon).is_err());
        assert_eq!(t.pending_assign(), 0);
        assert_eq!(mon.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn freed_pages_are_pooled_and_reused() {
        let pages = Pages::default();
        let mon = Monitor::default();
        let mut t = tracker(AssignFailurePolicy::Retain);
        let a = t.alloc_page(0x1000, &pages).unwrap();
        t.assign(&mon).unwrap();

        t.free_page(a, &pages);
        assert_eq!(t.pooled(), 1);
        assert_eq!(*pages.zeroed.lock().unwrap(), [a.phys]);
        assert_eq!(t.alloc_page(0x1000, &pages), Some(a));
        assert_eq!(t.pending_assign(), 0);
    }

    #[test]
    fn never_assigned_page_is_freed_directly() {
        let pages = Pages::default();
        let mut t = tracker(AssignFailurePolicy::Retain);
        let a = t.alloc_page(0x1000, &pages).unwrap();
        t.free_page(a, &pages);
        assert_eq!(t.pooled(), 0);
        assert_eq!(*pages.freed.lock().unwrap(), [a.phys]);
    }

    #[test]
    fn failed_hand_back_strands_the_page() {
        let pages = Pages::default();
        let mon = Monitor::default();
        let mut t = tracker(AssignFailurePolicy::Retain);
        let a = t.alloc_page(0x1000, &pages).unwrap();
        let b = t.alloc_page(0x1000, &pages).unwrap();
        t.assign(&mon).unwrap();
        t.free_page(a, &pages);
        t.free_page(b, &pages);
        t.drain_pool();

        mon.refuse.lock().unwrap().insert(a.phys);
        assert_eq!(t.unassign(&mon, &pages), Err(OwnershipError { phys: a.phys }));
        assert_eq!(*pages.freed.lock().unwrap(), [b.phys]);
        assert_eq!(t.stranded(), [a]);
        assert_eq!(mon.calls.lock().unwrap().last().unwrap().1, [10, VMID_HLOS]);
    }

    #[test]
    fn without_secure_vmid_nothing_is_transferred() {
        let mon = Monitor::default();
        let mut t = SecureOwnershipTracker::new(AssignFailurePolicy::Retain);
        assert_eq!(t.assign(&mon), Ok(0));
        assert_eq!(t.unassign(&mon, &Pages::default()), Ok(0));
        assert!(mon.calls.lock().unwrap().is_empty());
    }
}
