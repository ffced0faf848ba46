//! Software MMU
//!
//! Translates addresses the way the hardware walker would, looking only at
//! the valid and writeable bits of each level. A miss or a write to a
//! read-only page enters [`vm_fault`] and the walk is retried, so callers
//! can drive the VM core with plain loads and stores.

use crate::error::VmError;
use crate::types::{page_offset, PAddr, Pfn, VAddr, PT_LEVELS};
use crate::vm::pmap::{read_raw, slot_for};
use crate::vm::pte::{raw_hw_pfn, raw_is_valid, raw_is_writeable};
use crate::vm::vm_fault::{vm_fault, FaultAccess};
use crate::vm::vm_map::AddressSpace;
use crate::vm::vm_page::PageFrameDb;
use crate::vm::Vmm;

/// Why a walk stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Miss {
    Invalid { level: usize },
    WriteProtected,
}

fn walk(
    db: &PageFrameDb,
    root: Pfn,
    vaddr: VAddr,
    access: FaultAccess,
) -> Result<PAddr, Miss> {
    let mut table = root;
    for level in (1..=PT_LEVELS).rev() {
        let raw = read_raw(db, slot_for(table, vaddr, level));
        if !raw_is_valid(raw) {
            return Err(Miss::Invalid { level });
        }
        if level == 1 && access.is_write() && !raw_is_writeable(raw) {
            return Err(Miss::WriteProtected);
        }
        table = raw_hw_pfn(raw);
    }
    Ok(table.paddr() + page_offset(vaddr))
}

/// Translate `vaddr`, faulting as needed, and run `f` on the physical
/// address with the frame database lock still held
fn with_access<R>(
    vmm: &Vmm,
    space: &AddressSpace,
    vaddr: VAddr,
    access: FaultAccess,
    f: impl FnOnce(&PageFrameDb, PAddr) -> R,
) -> Result<R, VmError> {
    let root = Pfn::from_paddr(space.root_paddr());
    loop {
        let db = vmm.pfndb().acquire();
        match walk(&*db, root, vaddr, access) {
            Ok(paddr) => {
                log::trace!(
                    "mmu: {} {:#x} => {:#x}",
                    if access.is_write() { "write" } else { "read " },
                    vaddr,
                    paddr
                );
                return Ok(f(&*db, paddr));
            }
            Err(miss) => {
                drop(db);
                log::trace!("mmu: {:#x}: {:?}", vaddr, miss);
                vm_fault(vmm, space, vaddr, access, None)?;
            }
        }
    }
}

/// Physical address `vaddr` translates to for `access`
pub fn translate(
    vmm: &Vmm,
    space: &AddressSpace,
    vaddr: VAddr,
    access: FaultAccess,
) -> Result<PAddr, VmError> {
    with_access(vmm, space, vaddr, access, |_, paddr| paddr)
}

pub fn read_byte(vmm: &Vmm, space: &AddressSpace, vaddr: VAddr) -> Result<u8, VmError> {
    with_access(vmm, space, vaddr, FaultAccess::Read, |db, paddr| {
        // SAFETY: the page is mapped and cannot be freed while the lock is held.
        unsafe { db.direct_map().phys_to_virt(paddr).read_volatile() }
    })
}

pub fn write_byte(
    vmm: &Vmm,
    space: &AddressSpace,
    vaddr: VAddr,
    value: u8,
) -> Result<(), VmError> {
    with_access(vmm, space, vaddr, FaultAccess::Write, |db, paddr| {
        // SAFETY: as in read_byte, and the mapping is writeable.
        unsafe { db.direct_map().phys_to_virt(paddr).write_volatile(value) }
    })
}
