//! Physical memory access through a direct map
//!
//! The VM core never dereferences physical addresses itself. Frame
//! contents, page tables and the frame database headers are all reached
//! through a [`DirectMap`], which translates between physical addresses
//! and addresses the kernel can load from and store to.

use alloc::alloc::{alloc_zeroed, dealloc};
use core::alloc::Layout;
use core::ptr::NonNull;

use crate::error::VmError;
use crate::types::{PAddr, PAGE_SIZE};

/// Physical to kernel-accessible address translation
///
/// Both directions must be total over every registered physical region.
pub trait DirectMap: Send + Sync {
    /// Accessible address of physical byte `paddr`
    fn phys_to_virt(&self, paddr: PAddr) -> *mut u8;

    /// Physical address of an accessible pointer produced by `phys_to_virt`
    fn virt_to_phys(&self, ptr: *const u8) -> PAddr;
}

/// Heap-backed stand-in for a machine's physical memory
///
/// Covers `[base, base + npages * PAGE_SIZE)`, page aligned and zeroed.
pub struct SoftPhysMemory {
    base: PAddr,
    len: usize,
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the backing allocation is owned exclusively by this value and all
// access to its contents is serialized by the frame database lock.
unsafe impl Send for SoftPhysMemory {}
unsafe impl Sync for SoftPhysMemory {}

impl SoftPhysMemory {
    /// Allocate `npages` zeroed frames starting at physical address `base`
    pub fn new(base: PAddr, npages: usize) -> Result<Self, VmError> {
        if npages == 0 || base as usize % PAGE_SIZE != 0 {
            return Err(VmError::InvalidArgument(
                "physical memory must be page aligned and non-empty",
            ));
        }
        let len = npages
            .checked_mul(PAGE_SIZE)
            .ok_or(VmError::InvalidArgument("physical memory size overflows"))?;
        let layout = Layout::from_size_align(len, PAGE_SIZE)
            .map_err(|_| VmError::InvalidArgument("physical memory size overflows"))?;

        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(VmError::PageShortage)?;

        Ok(Self {
            base,
            len,
            ptr,
            layout,
        })
    }

    pub fn base(&self) -> PAddr {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, paddr: PAddr) -> bool {
        paddr >= self.base && paddr - self.base < self.len as u64
    }
}

impl DirectMap for SoftPhysMemory {
    fn phys_to_virt(&self, paddr: PAddr) -> *mut u8 {
        assert!(
            self.contains(paddr),
            "physical address {:#x} outside {:#x}+{:#x}",
            paddr,
            self.base,
            self.len
        );
        let offset = (paddr - self.base) as usize;
        // SAFETY: offset is within the allocation, checked above.
        unsafe { self.ptr.as_ptr().add(offset) }
    }

    fn virt_to_phys(&self, ptr: *const u8) -> PAddr {
        let start = self.ptr.as_ptr() as usize;
        let addr = ptr as usize;
        assert!(
            addr >= start && addr - start < self.len,
            "pointer {:p} is not in the direct map",
            ptr
        );
        self.base + (addr - start) as u64
    }
}

impl Drop for SoftPhysMemory {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl core::fmt::Debug for SoftPhysMemory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SoftPhysMemory")
            .field("base", &format_args!("{:#x}", self.base))
            .field("len", &format_args!("{:#x}", self.len))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translation_round_trip() {
        let mem = SoftPhysMemory::new(0x10_0000, 4).unwrap();
        assert_eq!(mem.len(), 4 * PAGE_SIZE);
        let p = mem.phys_to_virt(0x10_2010);
        assert_eq!(mem.virt_to_phys(p), 0x10_2010);
        assert_eq!(p as usize % 16, 0x10 % 16);
        // SAFETY: p is inside the allocation.
        unsafe {
            assert_eq!(*p, 0);
            *p = 0xAB;
            assert_eq!(*mem.phys_to_virt(0x10_2010), 0xAB);
        }
    }

    #[test]
    fn test_rejects_bad_geometry() {
        assert!(SoftPhysMemory::new(0x1001, 1).is_err());
        assert!(SoftPhysMemory::new(0, 0).is_err());
    }

    #[test]
    #[should_panic(expected = "outside")]
    fn test_out_of_range_panics() {
        let mem = SoftPhysMemory::new(0, 1).unwrap();
        mem.phys_to_virt(PAGE_SIZE as u64);
    }
}
