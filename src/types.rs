//! Common types and machine geometry used across the VM subsystem
//!
//! The reference configuration is a three-level table hierarchy with
//! 4 KiB pages and 512 eight-byte entries per table, covering a 39-bit
//! virtual address space. Higher address bits are ignored by the walker.

use core::fmt;

/// Virtual address
pub type VAddr = u64;

/// Physical address
pub type PAddr = u64;

/// Page shift (log2 of PAGE_SIZE)
pub const PAGE_SHIFT: u32 = 12;

/// Page size
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Number of page-table levels. The root is level `PT_LEVELS`, the
/// leaf table (whose entries map data pages) is level 1.
pub const PT_LEVELS: usize = 3;

/// Width of one table index field
pub const PT_INDEX_BITS: u32 = 9;

/// Entries per page table
pub const PT_ENTRIES: usize = 1 << PT_INDEX_BITS;

/// Size of one page-table entry in bytes
pub const PTE_SIZE: usize = core::mem::size_of::<u64>();

/// First virtual address the walker cannot translate
pub const VM_MAX_ADDRESS: VAddr = 1 << (PAGE_SHIFT + PT_LEVELS as u32 * PT_INDEX_BITS);

/// Bytes of virtual address space mapped by one leaf table
pub const LEAF_TABLE_SPAN: VAddr = (PAGE_SIZE * PT_ENTRIES) as VAddr;

// A page table occupies exactly one frame.
const _: () = assert!(PT_ENTRIES * PTE_SIZE == PAGE_SIZE);

/// Page frame number: a physical address shifted down by `PAGE_SHIFT`
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Pfn(pub u64);

impl Pfn {
    /// Frame containing a physical address
    pub const fn from_paddr(paddr: PAddr) -> Self {
        Self(paddr >> PAGE_SHIFT)
    }

    /// Physical address of the first byte of the frame
    pub const fn paddr(self) -> PAddr {
        self.0 << PAGE_SHIFT
    }

    /// Raw frame number
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pfn({:#x})", self.0)
    }
}

impl fmt::Display for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Round address down to page boundary
pub const fn trunc_page(addr: u64) -> u64 {
    addr & !(PAGE_SIZE as u64 - 1)
}

/// Round address up to page boundary
pub const fn round_page(addr: u64) -> u64 {
    (addr + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

/// Check page alignment
pub const fn is_page_aligned(addr: u64) -> bool {
    addr & (PAGE_SIZE as u64 - 1) == 0
}

/// Number of whole pages needed to hold `bytes`
pub const fn pages_for(bytes: usize) -> usize {
    (bytes + PAGE_SIZE - 1) / PAGE_SIZE
}

/// Index into the table at `level` (1 = leaf table) for `vaddr`
pub const fn pt_index(vaddr: VAddr, level: usize) -> usize {
    let shift = PAGE_SHIFT + (level as u32 - 1) * PT_INDEX_BITS;
    ((vaddr >> shift) & (PT_ENTRIES as u64 - 1)) as usize
}

/// Byte offset of `vaddr` within its page
pub const fn page_offset(vaddr: VAddr) -> u64 {
    vaddr & (PAGE_SIZE as u64 - 1)
}
