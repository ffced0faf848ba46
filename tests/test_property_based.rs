//! Property-based tests for vmm_core
//!
//! These tests drive the frame database, the VAD tree and the working
//! set with generated operation sequences and check their invariants
//! after every step.

mod proptest_strategies;

use std::sync::Arc;

use proptest::prelude::*;
use proptest_strategies::*;
use vmm_core::vm::pmap::{fetch_pte, read_pte};
use vmm_core::vm::vm_map::{Vad, VadTree};
use vmm_core::vm::vm_page::region_reserved_pages;
use vmm_core::vm::{
    Account, FaultAccess, PageFrameDb, PageUse, Pte, QueueKind, SoftPhysMemory, VmConfig,
    VmInherit, VmProt,
};
use vmm_core::{PAddr, Pfn, Vmm, PAGE_SIZE};

const BASE: PAddr = 0x800_0000;

fn pfndb(npages: usize) -> PageFrameDb {
    let mem = Arc::new(SoftPhysMemory::new(BASE, npages).expect("backing memory"));
    let mut db = PageFrameDb::new(mem);
    db.register_region(BASE, npages * PAGE_SIZE)
        .expect("register region");
    db
}

fn expected_queue(refcnt: u16, dirty: bool) -> Option<QueueKind> {
    match (refcnt, dirty) {
        (0, true) => Some(QueueKind::Modified),
        (0, false) => Some(QueueKind::Standby),
        _ => None,
    }
}

// ════════════════════════════════════════════════════════════
// Frame Database Property Tests
// ════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Queue membership tracks refcnt and dirty through any op sequence
    #[test]
    fn frame_transitions_follow_the_table(ops in frame_ops()) {
        let mut db = pfndb(32);
        let mut acct = Account::new();
        let pfn = db.alloc(&mut acct, PageUse::AnonPrivate).unwrap();
        let mut refs: u16 = 1;
        let mut dirty = false;

        for op in ops {
            match op {
                FrameOp::Retain => {
                    db.retain(pfn, &mut acct);
                    refs += 1;
                }
                FrameOp::Release if refs > 0 => {
                    db.release(pfn, &mut acct);
                    refs -= 1;
                }
                FrameOp::Dirty if refs > 0 => {
                    db.set_dirty(pfn);
                    dirty = true;
                }
                _ => {}
            }

            let page = db.page(pfn);
            prop_assert!(db.frame_state_consistent(pfn));
            prop_assert_eq!(page.usage(), PageUse::AnonPrivate);
            prop_assert_eq!(page.refcnt(), refs);
            prop_assert_eq!(page.is_dirty(), dirty);
            prop_assert_eq!(page.queue(), expected_queue(refs, dirty));
            prop_assert_eq!(acct.nwires, refs as u64);
            prop_assert!(db.stats().is_balanced());
        }

        db.delete(pfn, &mut acct, refs > 0);
        for _ in 1..refs {
            prop_assert_eq!(db.page(pfn).usage(), PageUse::Deleted);
            db.release(pfn, &mut acct);
        }
        prop_assert_eq!(db.page(pfn).usage(), PageUse::Free);
        prop_assert_eq!(db.page(pfn).queue(), Some(QueueKind::Free));
        prop_assert!(acct.is_zero());
        prop_assert!(db.deleted_account().is_zero());
        prop_assert_eq!(db.stats().ndeleted, 0);
    }

    /// Equal numbers of retains and releases leave a frame unchanged
    #[test]
    fn retain_release_is_symmetric(
        n in 1usize..20,
        idle in any::<bool>(),
        dirty in any::<bool>()
    ) {
        let mut db = pfndb(32);
        let mut acct = Account::new();
        let pfn = db.alloc(&mut acct, PageUse::AnonPrivate).unwrap();
        if dirty {
            db.set_dirty(pfn);
        }
        if idle {
            db.release(pfn, &mut acct);
        }

        let before = *db.page(pfn);
        let stats = db.stats();
        for _ in 0..n {
            db.retain(pfn, &mut acct);
        }
        for _ in 0..n {
            db.release(pfn, &mut acct);
        }

        let after = db.page(pfn);
        prop_assert_eq!(after.refcnt(), before.refcnt());
        prop_assert_eq!(after.usage(), before.usage());
        prop_assert_eq!(after.queue(), before.queue());
        prop_assert_eq!(after.is_dirty(), before.is_dirty());
        prop_assert_eq!(db.stats(), stats);
    }

    /// A region of N frames frees all but its header frames, and every
    /// frame is found again from any address inside it
    #[test]
    fn region_registration_counts_and_lookup(
        npages in region_frames(),
        offset in page_offset()
    ) {
        let db = pfndb(npages);
        let reserved = region_reserved_pages(npages);
        let stats = db.stats();
        prop_assert_eq!(stats.ntotal, npages as u64);
        prop_assert_eq!(stats.nfree, (npages - reserved) as u64);
        prop_assert_eq!(db.queue_len(QueueKind::Free), npages - reserved);

        let first = Pfn::from_paddr(BASE);
        for i in 0..npages as u64 {
            let pfn = Pfn(first.0 + i);
            prop_assert_eq!(db.paddr_to_frame(pfn.paddr() + offset).pfn(), pfn);
            let usage = db.page(pfn).usage();
            if (i as usize) < reserved {
                prop_assert_eq!(usage, PageUse::Reserved);
            } else {
                prop_assert_eq!(usage, PageUse::Free);
            }
        }
        prop_assert!(db.try_paddr_to_frame(BASE + (npages * PAGE_SIZE) as u64).is_none());
    }
}

// ════════════════════════════════════════════════════════════
// VAD Tree Property Tests
// ════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Lookups return the VAD containing the address, or nothing
    #[test]
    fn vad_lookup_is_containment(
        ranges in disjoint_ranges(),
        probes in probe_addresses()
    ) {
        let mut tree = VadTree::new();
        for &(start, end) in &ranges {
            prop_assert!(tree.insert(Vad::anonymous(start, end)).is_ok());
        }
        prop_assert_eq!(tree.len(), ranges.len());

        for &(start, end) in &ranges {
            prop_assert_eq!(tree.find(start).map(|v| v.start), Some(start));
            prop_assert_eq!(tree.find(end - 1).map(|v| v.start), Some(start));
        }
        for addr in probes {
            let owner = ranges.iter().find(|&&(s, e)| s <= addr && addr < e);
            prop_assert_eq!(tree.find(addr).map(|v| (v.start, v.end)), owner.copied());
        }
    }

    /// Whatever is inserted, the tree never holds overlapping VADs
    #[test]
    fn vads_never_overlap(ranges in any_ranges()) {
        let mut tree = VadTree::new();
        let mut accepted = Vec::new();
        for (start, end) in ranges {
            let clash = accepted.iter().any(|&(s, e)| start < e && s < end);
            let result = tree.insert(Vad::anonymous(start, end));
            prop_assert_eq!(result.is_err(), clash);
            if !clash {
                accepted.push((start, end));
            }
        }

        let vads: Vec<_> = tree.iter().map(|v| (v.start, v.end)).collect();
        prop_assert_eq!(vads.len(), accepted.len());
        for pair in vads.windows(2) {
            prop_assert!(pair[0].1 <= pair[1].0);
        }
    }
}

// ════════════════════════════════════════════════════════════
// Working Set Property Tests
// ════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    /// The working set keeps the newest entries and demotes the oldest,
    /// marking a demoted frame dirty iff its mapping was writeable
    #[test]
    fn working_set_is_fifo(capacity in ws_capacity(), touches in touch_pattern()) {
        const VA: u64 = 0x20_0000;
        let npages = 64;
        let mem = Arc::new(SoftPhysMemory::new(BASE, npages).unwrap());
        let vmm = Vmm::new(VmConfig::default().with_ws_capacity(capacity), mem).unwrap();
        vmm.register_physical_region(BASE, npages * PAGE_SIZE).unwrap();
        let space = vmm.init_address_space().unwrap();

        // one page per region, writeable or read-only
        let addr = |i: usize| VA + (i * PAGE_SIZE) as u64;
        for (i, &write) in touches.iter().enumerate() {
            let protection = if write { VmProt::DEFAULT } else { VmProt::READ };
            vmm.map_region(
                &space,
                addr(i),
                PAGE_SIZE as u64,
                protection,
                VmProt::ALL,
                false,
                VmInherit::Copy,
                None,
            )
            .unwrap();
            vmm.handle_fault(&space, addr(i), FaultAccess::Read, None).unwrap();
        }

        let keep = touches.len().saturating_sub(capacity);
        let state = space.lock("proptest");
        let resident: Vec<_> = state.working_set().iter().collect();
        let newest: Vec<_> = (keep..touches.len()).map(addr).collect();
        prop_assert_eq!(resident, newest);

        vmm.with_pfndb(|db| {
            for (i, &write) in touches.iter().enumerate() {
                let slot = fetch_pte(db, state.pmap(), addr(i)).unwrap();
                match read_pte(db, slot) {
                    Pte::Transition { pfn } => {
                        assert!(i < keep, "resident page {} demoted", i);
                        assert_eq!(db.page(pfn).is_dirty(), write);
                        assert_eq!(db.page(pfn).refcnt(), 0);
                    }
                    Pte::Hardware { writeable, .. } => {
                        assert!(i >= keep, "evicted page {} still valid", i);
                        assert_eq!(writeable, write);
                    }
                    other => panic!("page {} has entry {:?}", i, other),
                }
            }
        });
    }
}
