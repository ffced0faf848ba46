//! Page Fault Handler
//!
//! Resolves one faulting address of an address space into a valid
//! mapping. Each pass runs under the address-space mutex and, inside it,
//! the frame database lock:
//!
//! 1. find the covering VAD and check its protection
//! 2. wire the table chain down to the leaf entry
//! 3. dispatch on the leaf entry: already valid, valid read-only hit by a
//!    write, transition, or empty
//! 4. release the table references taken in step 2
//!
//! A write fault whose pass ended with a read-only mapping runs again;
//! this happens after a transition page is reinstalled read-only.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Unsupported, VmError};
use crate::types::{trunc_page, Pfn, VAddr, PAGE_SIZE};
use crate::vm::pmap::{fault_state_release, read_pte, wire_pte, write_pte, FaultState};
use crate::vm::pte::Pte;
use crate::vm::vm_map::{AddressSpace, ProcState, Vad, VmProt};
use crate::vm::vm_page::{Account, FrameHandle, PageFrameDb, PageUse, PteSlot};
use crate::vm::Vmm;

// ============================================================================
// Fault Types
// ============================================================================

/// Kind of access that faulted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAccess {
    Read,
    Write,
    Execute,
}

impl FaultAccess {
    /// Convert to required protection
    pub fn to_protection(self) -> VmProt {
        match self {
            FaultAccess::Read => VmProt::READ,
            FaultAccess::Write => VmProt::WRITE,
            FaultAccess::Execute => VmProt::EXECUTE,
        }
    }

    pub fn is_write(self) -> bool {
        self == FaultAccess::Write
    }
}

// ============================================================================
// Fault Statistics
// ============================================================================

/// Fault statistics counters
#[derive(Debug, Default)]
pub struct FaultStats {
    /// Total faults
    pub total: AtomicU64,
    /// Demand-zero pages installed
    pub zero_fill: AtomicU64,
    /// Transition pages put back in the working set
    pub reactivated: AtomicU64,
    /// Read-only mappings made writeable
    pub write_upgrades: AtomicU64,
    /// Passes that found the mapping already in place
    pub already_resolved: AtomicU64,
    /// Passes repeated because a write produced a read-only mapping
    pub retries: AtomicU64,
    /// Faults that returned an error
    pub failures: AtomicU64,
}

/// Plain copy of [`FaultStats`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FaultCounts {
    pub total: u64,
    pub zero_fill: u64,
    pub reactivated: u64,
    pub write_upgrades: u64,
    pub already_resolved: u64,
    pub retries: u64,
    pub failures: u64,
}

impl FaultStats {
    pub const fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            zero_fill: AtomicU64::new(0),
            reactivated: AtomicU64::new(0),
            write_upgrades: AtomicU64::new(0),
            already_resolved: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FaultCounts {
        FaultCounts {
            total: self.total.load(Ordering::Relaxed),
            zero_fill: self.zero_fill.load(Ordering::Relaxed),
            reactivated: self.reactivated.load(Ordering::Relaxed),
            write_upgrades: self.write_upgrades.load(Ordering::Relaxed),
            already_resolved: self.already_resolved.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Page Fault Handling
// ============================================================================

/// Outcome of one pass
struct Pass {
    frame: Option<FrameHandle>,
    writeable: bool,
    evicted: Option<VAddr>,
}

/// Handle a page fault
///
/// On success the page at `vaddr` is mapped with at least the rights
/// `access` needs. If `out` is given, the backing frame is also retained
/// on its behalf and returned; the caller drops it with
/// [`Vmm::release_frame`].
pub fn vm_fault(
    vmm: &Vmm,
    space: &AddressSpace,
    vaddr: VAddr,
    access: FaultAccess,
    mut out: Option<&mut Account>,
) -> Result<Option<FrameHandle>, VmError> {
    let stats = vmm.fault_stats();
    FaultStats::incr(&stats.total);

    // Round address to page boundary
    let vaddr = trunc_page(vaddr);
    log::debug!("vm_fault({:#x}, {:?})", vaddr, access);

    loop {
        let pass = match fault_pass(vmm, space, vaddr, access, out.as_deref_mut()) {
            Ok(pass) => pass,
            Err(err) => {
                FaultStats::incr(&stats.failures);
                log::warn!("vm_fault({:#x}, {:?}): {}", vaddr, access, err);
                return Err(err);
            }
        };

        if access.is_write() && !pass.writeable {
            if let (Some(frame), Some(account)) = (pass.frame, out.as_deref_mut()) {
                vmm.release_frame(frame, account);
            }
            FaultStats::incr(&stats.retries);
            continue;
        }
        return Ok(pass.frame);
    }
}

fn fault_pass(
    vmm: &Vmm,
    space: &AddressSpace,
    vaddr: VAddr,
    access: FaultAccess,
    out: Option<&mut Account>,
) -> Result<Pass, VmError> {
    let mut guard = space.lock("vm_fault");
    let ps = &mut *guard;

    let vad = *ps.vads.find(vaddr).ok_or(VmError::NoRegion(vaddr))?;
    if !vad.protection.contains(access.to_protection()) {
        return Err(VmError::ProtectionViolation { vaddr, access });
    }

    let mut db = vmm.pfndb().acquire();
    let mut state = FaultState::new();
    let owner = space.id().0;
    let result = resolve(
        vmm, &mut db, ps, owner, &vad, vaddr, access, out, &mut state,
    );
    fault_state_release(&mut db, &mut ps.account, &mut state);
    drop(db);

    if let Some(evicted) = result.as_ref().ok().and_then(|pass| pass.evicted) {
        vmm.tlb().invalidate_range(
            ps.pmap.root_paddr(),
            evicted,
            evicted + PAGE_SIZE as VAddr,
        );
    }
    result
}

fn retain_for(
    db: &mut PageFrameDb,
    pfn: Pfn,
    out: Option<&mut Account>,
) -> Option<FrameHandle> {
    out.map(|account| {
        db.retain(pfn, account);
        db.handle(pfn)
    })
}

#[allow(clippy::too_many_arguments)]
fn resolve(
    vmm: &Vmm,
    db: &mut PageFrameDb,
    ps: &mut ProcState,
    owner: u64,
    vad: &Vad,
    vaddr: VAddr,
    access: FaultAccess,
    out: Option<&mut Account>,
    state: &mut FaultState,
) -> Result<Pass, VmError> {
    let stats = vmm.fault_stats();
    let slot = wire_pte(db, &ps.pmap, &mut ps.account, owner, vaddr, state)?;

    match read_pte(db, slot) {
        Pte::Hardware { pfn, writeable } if writeable || !access.is_write() => {
            // another thread of this space got here first
            FaultStats::incr(&stats.already_resolved);
            Ok(Pass {
                frame: retain_for(db, pfn, out),
                writeable,
                evicted: None,
            })
        }
        Pte::Hardware { pfn, .. } => {
            if vad.cow {
                return Err(VmError::NotSupported(Unsupported::CopyOnWrite));
            }
            write_pte(
                db,
                slot,
                Pte::Hardware {
                    pfn,
                    writeable: true,
                },
            );
            db.set_dirty(pfn);
            FaultStats::incr(&stats.write_upgrades);
            Ok(Pass {
                frame: retain_for(db, pfn, out),
                writeable: true,
                evicted: None,
            })
        }
        Pte::Transition { pfn } => {
            db.retain(pfn, &mut ps.account);
            install(db, slot, pfn, false);
            let frame = retain_for(db, pfn, out);
            let evicted = ps.wsl.insert(db, &ps.pmap, &mut ps.account, vaddr);
            FaultStats::incr(&stats.reactivated);
            Ok(Pass {
                frame,
                writeable: false,
                evicted,
            })
        }
        Pte::Empty => {
            if !vad.is_anonymous() {
                return Err(VmError::NotSupported(Unsupported::SectionBacked));
            }
            let pfn = db.alloc(&mut ps.account, PageUse::AnonPrivate)?;
            db.set_owner(pfn, owner);
            let frame = retain_for(db, pfn, out);
            let writeable = vad.protection.can_write();
            install(db, slot, pfn, writeable);

            // count the entry before the insert, which may evict from this table
            db.table_used_inc(slot.table);
            db.retain(slot.table, &mut ps.account);
            let evicted = ps.wsl.insert(db, &ps.pmap, &mut ps.account, vaddr);
            FaultStats::incr(&stats.zero_fill);
            Ok(Pass {
                frame,
                writeable,
                evicted,
            })
        }
        Pte::Outpaged { .. } => Err(VmError::NotSupported(Unsupported::Outpaged)),
        Pte::Fork { .. } => Err(VmError::NotSupported(Unsupported::ForkPte)),
    }
}

fn install(db: &mut PageFrameDb, slot: PteSlot, pfn: Pfn, writeable: bool) {
    write_pte(db, slot, Pte::Hardware { pfn, writeable });
    db.set_referent(pfn, Some(slot));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PAddr;
    use crate::vm::phys::SoftPhysMemory;
    use crate::vm::pmap::fetch_pte;
    use crate::vm::vm_map::{SectionId, VmInherit};
    use crate::vm::VmConfig;
    use alloc::sync::Arc;

    const BASE: PAddr = 0x200_0000;
    const VA: VAddr = 0x10_0000;

    fn setup(npages: usize) -> (Vmm, AddressSpace) {
        let mem = Arc::new(SoftPhysMemory::new(BASE, npages).unwrap());
        let vmm = Vmm::new(VmConfig::default(), mem).unwrap();
        vmm.register_physical_region(BASE, npages * PAGE_SIZE).unwrap();
        let space = vmm.init_address_space().unwrap();
        vmm.allocate(&space, VA, 4 * PAGE_SIZE as u64).unwrap();
        (vmm, space)
    }

    fn leaf(vmm: &Vmm, space: &AddressSpace, vaddr: VAddr) -> Pte {
        let ps = space.lock("test");
        vmm.with_pfndb(|db| {
            fetch_pte(db, ps.pmap(), vaddr)
                .map(|slot| read_pte(db, slot))
                .unwrap_or(Pte::Empty)
        })
    }

    #[test]
    fn test_zero_fill_follows_region_protection() {
        let (vmm, space) = setup(64);
        vm_fault(&vmm, &space, VA + 0x10, FaultAccess::Read, None).unwrap();
        let Pte::Hardware { pfn, writeable } = leaf(&vmm, &space, VA) else {
            panic!("not mapped");
        };
        assert!(writeable);

        // a later write needs no second fault pass
        vm_fault(&vmm, &space, VA, FaultAccess::Write, None).unwrap();
        assert_eq!(leaf(&vmm, &space, VA), Pte::Hardware { pfn, writeable: true });

        let ro = 0x40_0000;
        space
            .map_region(
                ro,
                0x1000,
                VmProt::READ,
                VmProt::ALL,
                false,
                VmInherit::Copy,
                None,
            )
            .unwrap();
        vm_fault(&vmm, &space, ro, FaultAccess::Read, None).unwrap();
        assert!(!leaf(&vmm, &space, ro).is_writeable());

        let counts = vmm.fault_stats().snapshot();
        assert_eq!(
            (counts.total, counts.zero_fill, counts.write_upgrades),
            (3, 2, 0)
        );
        assert_eq!(counts.already_resolved, 1);
    }

    #[test]
    fn test_already_resolved_succeeds() {
        let (vmm, space) = setup(64);
        vm_fault(&vmm, &space, VA, FaultAccess::Write, None).unwrap();
        vm_fault(&vmm, &space, VA, FaultAccess::Write, None).unwrap();
        vm_fault(&vmm, &space, VA, FaultAccess::Read, None).unwrap();
        assert_eq!(vmm.fault_stats().snapshot().already_resolved, 2);
        assert_eq!(space.lock("test").working_set().len(), 1);
    }

    #[test]
    fn test_out_frame_is_retained() {
        let (vmm, space) = setup(64);
        let mut mine = Account::new();
        let handle = vm_fault(&vmm, &space, VA, FaultAccess::Write, Some(&mut mine))
            .unwrap()
            .unwrap();
        assert_eq!(mine.nwires, 1);
        assert_eq!(vmm.with_pfndb(|db| db.page(handle.pfn()).refcnt()), 2);
        vmm.release_frame(handle, &mut mine);
        assert!(mine.is_zero());
    }

    #[test]
    fn test_transition_write_retries() {
        let (vmm, space) = setup(64);
        vm_fault(&vmm, &space, VA, FaultAccess::Write, None).unwrap();
        vm_fault(&vmm, &space, VA + 0x1000, FaultAccess::Write, None).unwrap();
        vm_fault(&vmm, &space, VA + 0x2000, FaultAccess::Write, None).unwrap();
        assert!(matches!(leaf(&vmm, &space, VA), Pte::Transition { .. }));

        let mut mine = Account::new();
        let handle = vm_fault(&vmm, &space, VA, FaultAccess::Write, Some(&mut mine))
            .unwrap()
            .unwrap();
        assert_eq!(
            leaf(&vmm, &space, VA),
            Pte::Hardware {
                pfn: handle.pfn(),
                writeable: true
            }
        );
        assert_eq!(mine.nwires, 1);
        let counts = vmm.fault_stats().snapshot();
        assert_eq!(
            (counts.reactivated, counts.retries, counts.write_upgrades),
            (1, 1, 1)
        );
        vmm.release_frame(handle, &mut mine);
    }

    #[test]
    fn test_policy_violations_are_errors() {
        let (vmm, space) = setup(64);
        assert_eq!(
            vm_fault(&vmm, &space, 0x1000, FaultAccess::Read, None),
            Err(VmError::NoRegion(0x1000))
        );

        let ro = 0x40_0000;
        space
            .map_region(
                ro,
                0x1000,
                VmProt::READ,
                VmProt::ALL,
                false,
                VmInherit::Copy,
                None,
            )
            .unwrap();
        assert_eq!(
            vm_fault(&vmm, &space, ro, FaultAccess::Write, None),
            Err(VmError::ProtectionViolation {
                vaddr: ro,
                access: FaultAccess::Write
            })
        );
        assert_eq!(vmm.fault_stats().snapshot().failures, 2);
    }

    #[test]
    fn test_unsupported_backings() {
        let (vmm, space) = setup(64);
        let sec = 0x50_0000;
        space
            .map_region(
                sec,
                0x1000,
                VmProt::ALL,
                VmProt::ALL,
                false,
                VmInherit::Share,
                Some(SectionId(1)),
            )
            .unwrap();
        assert_eq!(
            vm_fault(&vmm, &space, sec, FaultAccess::Read, None),
            Err(VmError::NotSupported(Unsupported::SectionBacked))
        );

        let cow = 0x60_0000;
        space
            .map_region(
                cow,
                0x1000,
                VmProt::ALL,
                VmProt::ALL,
                true,
                VmInherit::Copy,
                None,
            )
            .unwrap();
        // a fresh zero page is private, whatever the access order
        vm_fault(&vmm, &space, cow, FaultAccess::Read, None).unwrap();
        assert!(leaf(&vmm, &space, cow).is_writeable());
        vm_fault(&vmm, &space, cow, FaultAccess::Write, None).unwrap();

        // a reactivated page comes back read-only and needs promotion
        vm_fault(&vmm, &space, VA, FaultAccess::Write, None).unwrap();
        vm_fault(&vmm, &space, VA + 0x1000, FaultAccess::Write, None).unwrap();
        assert!(matches!(leaf(&vmm, &space, cow), Pte::Transition { .. }));
        assert_eq!(
            vm_fault(&vmm, &space, cow, FaultAccess::Write, None),
            Err(VmError::NotSupported(Unsupported::CopyOnWrite))
        );
    }

    #[test]
    fn test_shortage_is_reported() {
        let (vmm, space) = setup(64);
        vm_fault(&vmm, &space, VA, FaultAccess::Write, None).unwrap();
        let mut hog = Account::new();
        vmm.with_pfndb(|db| {
            while db.alloc(&mut hog, PageUse::AnonPrivate).is_ok() {}
        });

        assert_eq!(
            vm_fault(&vmm, &space, VA + 0x1000, FaultAccess::Write, None),
            Err(VmError::PageShortage)
        );
        // the failed pass left the existing tables and mapping intact
        assert!(leaf(&vmm, &space, VA).is_writeable());
        assert!(leaf(&vmm, &space, VA + 0x1000).is_empty());
        assert!(vmm.page_stats().is_balanced());
    }
}
