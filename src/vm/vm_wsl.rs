//! Working-set list
//!
//! Bounds the number of hardware-valid mappings an address space holds.
//! Entries are kept in insertion order for FIFO eviction and in an
//! address-ordered set for membership tests. Eviction demotes the mapping
//! to a transition PTE: the frame stays resident on the modified or
//! standby queue and a later fault reinstalls it without zero-filling.
//!
//! The list belongs to an address space and is only touched under its
//! mutex, with the frame database lock held whenever eviction may run.

use alloc::collections::{BTreeSet, VecDeque};

use crate::types::VAddr;
use crate::vm::pmap::{fetch_pte, read_pte, write_pte, Pmap};
use crate::vm::pte::Pte;
use crate::vm::vm_page::{Account, PageFrameDb, PageUse};

/// Working set of one address space
#[derive(Debug)]
pub struct WorkingSetList {
    /// Oldest entry at the front
    queue: VecDeque<VAddr>,
    index: BTreeSet<VAddr>,
    capacity: usize,
}

impl WorkingSetList {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "working set capacity must be non-zero");
        Self {
            queue: VecDeque::with_capacity(capacity),
            index: BTreeSet::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn contains(&self, vaddr: VAddr) -> bool {
        self.index.contains(&vaddr)
    }

    /// Entries from oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = VAddr> + '_ {
        self.queue.iter().copied()
    }

    /// Track a newly installed mapping, evicting the oldest if full
    ///
    /// Returns the evicted address, whose translation must be invalidated.
    pub fn insert(
        &mut self,
        db: &mut PageFrameDb,
        pmap: &Pmap,
        account: &mut Account,
        vaddr: VAddr,
    ) -> Option<VAddr> {
        assert!(
            !self.contains(vaddr),
            "{:#x} is already in the working set",
            vaddr
        );

        let evicted = if self.queue.len() >= self.capacity {
            self.evict_oldest(db, pmap, account)
        } else {
            None
        };

        self.queue.push_back(vaddr);
        self.index.insert(vaddr);
        evicted
    }

    /// Demote the oldest mapping to a transition entry
    pub fn evict_oldest(
        &mut self,
        db: &mut PageFrameDb,
        pmap: &Pmap,
        account: &mut Account,
    ) -> Option<VAddr> {
        let vaddr = self.queue.pop_front()?;
        self.index.remove(&vaddr);
        log::trace!("wsl: evicting {:#x}", vaddr);

        let Some(slot) = fetch_pte(db, pmap, vaddr) else {
            panic!("working set entry {:#x} has no page table", vaddr);
        };
        let Pte::Hardware { pfn, writeable } = read_pte(db, slot) else {
            panic!("working set entry {:#x} is not mapped", vaddr);
        };

        if writeable {
            db.set_dirty(pfn);
        }
        let usage = db.page(pfn).usage();
        assert!(
            usage == PageUse::AnonPrivate,
            "cannot evict {:#x}: frame {} is {:?}",
            vaddr,
            pfn,
            usage
        );

        // the entry stays counted in its leaf table
        db.set_referent(pfn, Some(slot));
        write_pte(db, slot, Pte::Transition { pfn });
        db.release(pfn, account);
        Some(vaddr)
    }

    /// Forget `vaddr` without touching its mapping
    pub fn remove(&mut self, vaddr: VAddr) -> bool {
        if !self.index.remove(&vaddr) {
            return false;
        }
        self.queue.retain(|&v| v != vaddr);
        true
    }

    /// Forget every entry in `[start, end)`; returns how many
    pub fn remove_range(&mut self, start: VAddr, end: VAddr) -> usize {
        if start >= end {
            return 0;
        }
        let before = self.index.len();
        self.index.retain(|v| !(start..end).contains(v));
        let removed = before - self.index.len();
        if removed > 0 {
            self.queue.retain(|v| !(start..end).contains(v));
        }
        removed
    }
}
