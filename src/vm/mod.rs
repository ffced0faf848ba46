//! Virtual memory subsystem
//!
//! - `phys`: direct map from physical addresses to accessible memory
//! - `pte`: page-table entry encoding
//! - `vm_page`: page-frame database and residency queues
//! - `pmap`: page-table walker and table reclamation
//! - `vm_map`: address spaces and their VAD trees
//! - `vm_wsl`: working-set list and eviction
//! - `vm_fault`: demand-paging fault handler
//! - `soft_mmu`: software address translation driving the fault handler
//!
//! [`Vmm`] ties them together. It owns the single page-frame database
//! lock and is passed to every operation, so independent instances can
//! coexist (one per test, for example).

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::VmError;
use crate::kern::lock::SpinLock;
use crate::types::{PAddr, VAddr};

pub mod phys;
pub mod pmap;
pub mod pte;
pub mod soft_mmu;
pub mod vm_fault;
pub mod vm_map;
pub mod vm_page;
pub mod vm_wsl;

pub use phys::{DirectMap, SoftPhysMemory};
pub use pmap::{NoTlb, TlbInvalidate};
pub use pte::Pte;
pub use vm_fault::{FaultAccess, FaultCounts, FaultStats};
pub use vm_map::{AddressSpace, SectionId, SpaceId, Vad, VmInherit, VmProt};
pub use vm_page::{Account, FrameHandle, PageFrameDb, PageUse, QueueKind, RegionInfo, VmStat};

// ============================================================================
// Configuration
// ============================================================================

/// Working-set capacity of the reference configuration
pub const DEFAULT_WS_CAPACITY: usize = 2;

/// Tunables of a [`Vmm`] instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Maximum resident mappings per address space
    pub ws_capacity: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            ws_capacity: DEFAULT_WS_CAPACITY,
        }
    }
}

impl VmConfig {
    pub fn with_ws_capacity(mut self, capacity: usize) -> Self {
        self.ws_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<(), VmError> {
        if self.ws_capacity == 0 {
            return Err(VmError::InvalidArgument(
                "working set capacity must be non-zero",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// VM context
// ============================================================================

/// Virtual memory manager instance
pub struct Vmm {
    pfndb: SpinLock<PageFrameDb>,
    config: VmConfig,
    tlb: Arc<dyn TlbInvalidate>,
    fault_stats: FaultStats,
    next_space_id: AtomicU64,
}

impl Vmm {
    /// Create a VM with no physical memory yet
    pub fn new(config: VmConfig, dmap: Arc<dyn DirectMap>) -> Result<Self, VmError> {
        config.validate()?;
        Ok(Self {
            pfndb: SpinLock::new(PageFrameDb::new(dmap)),
            config,
            tlb: Arc::new(NoTlb),
            fault_stats: FaultStats::new(),
            next_space_id: AtomicU64::new(1),
        })
    }

    /// Use `tlb` for translation cache invalidation
    pub fn with_tlb(mut self, tlb: Arc<dyn TlbInvalidate>) -> Self {
        self.tlb = tlb;
        self
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub(crate) fn pfndb(&self) -> &SpinLock<PageFrameDb> {
        &self.pfndb
    }

    pub(crate) fn tlb(&self) -> &dyn TlbInvalidate {
        &*self.tlb
    }

    /// Hand `[base, base + len)` of physical memory to the VM
    pub fn register_physical_region(&self, base: PAddr, len: usize) -> Result<RegionInfo, VmError> {
        self.pfndb.acquire().register_region(base, len)
    }

    /// Create an empty address space with its root table
    pub fn init_address_space(&self) -> Result<AddressSpace, VmError> {
        let id = SpaceId(self.next_space_id.fetch_add(1, Ordering::Relaxed));
        let space = AddressSpace::new(id, &mut self.pfndb.acquire(), self.config.ws_capacity)?;
        log::info!(
            "vm: address space {} created, root {:#x}",
            id.0,
            space.root_paddr()
        );
        Ok(space)
    }

    /// Reserve `[address, address + size)` in `space`
    #[allow(clippy::too_many_arguments)]
    pub fn map_region(
        &self,
        space: &AddressSpace,
        address: VAddr,
        size: u64,
        protection: VmProt,
        max_protection: VmProt,
        cow: bool,
        inheritance: VmInherit,
        section: Option<SectionId>,
    ) -> Result<(), VmError> {
        space.map_region(
            address,
            size,
            protection,
            max_protection,
            cow,
            inheritance,
            section,
        )
    }

    /// Reserve anonymous demand-zero memory with every right
    pub fn allocate(&self, space: &AddressSpace, address: VAddr, size: u64) -> Result<(), VmError> {
        space.map_region(
            address,
            size,
            VmProt::ALL,
            VmProt::ALL,
            false,
            VmInherit::Copy,
            None,
        )
    }

    /// Remove the regions inside `[start, start + size)`, returning how many
    pub fn unmap_region(&self, space: &AddressSpace, start: VAddr, size: u64) -> Result<usize, VmError> {
        space.unmap_region(self, start, size)
    }

    /// Resolve a fault at `vaddr`
    ///
    /// With `out` the backing frame is retained for that account and
    /// returned.
    pub fn handle_fault(
        &self,
        space: &AddressSpace,
        vaddr: VAddr,
        access: FaultAccess,
        out: Option<&mut Account>,
    ) -> Result<Option<FrameHandle>, VmError> {
        vm_fault::vm_fault(self, space, vaddr, access, out)
    }

    /// Drop a frame reference obtained from [`Vmm::handle_fault`]
    pub fn release_frame(&self, frame: FrameHandle, account: &mut Account) {
        let mut db = self.pfndb.acquire();
        let pfn = db.resolve(frame);
        db.release(pfn, account);
    }

    /// Unmap everything in `space` and free its root table
    ///
    /// Returns the space's final account, which is zero unless frames it
    /// allocated are still referenced elsewhere.
    pub fn destroy_address_space(&self, space: AddressSpace) -> Account {
        let id = space.id();
        let account = space.destroy(self);
        log::info!("vm: address space {} destroyed", id.0);
        account
    }

    pub fn page_stats(&self) -> VmStat {
        self.pfndb.acquire().stats()
    }

    pub fn fault_stats(&self) -> &FaultStats {
        &self.fault_stats
    }

    /// Run `f` with the frame database locked
    pub fn with_pfndb<R>(&self, f: impl FnOnce(&mut PageFrameDb) -> R) -> R {
        f(&mut self.pfndb.acquire())
    }
}

impl core::fmt::Debug for Vmm {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Vmm")
            .field("config", &self.config)
            .field("pfndb", &self.pfndb)
            .finish()
    }
}
