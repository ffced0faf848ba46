//! VM Map - address space region tracking
//!
//! Each address space records the virtual ranges reserved in it as
//! virtual address descriptors (VADs): half-open ranges with a protection,
//! a maximum protection, fork inheritance and backing policy. VADs never
//! overlap, and new ones are placed at exactly the address asked for.
//!
//! The VAD tree, the working set and the pmap of a space are guarded
//! together by the space's [`KMutex`], which is always taken before the
//! frame database lock.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::error::VmError;
use crate::kern::lock::{KMutex, KMutexGuard};
use crate::kern::timer::Timeout;
use crate::types::{is_page_aligned, PAddr, Pfn, VAddr, VM_MAX_ADDRESS};
use crate::vm::pmap::{unmap_range_and_invoke, Pmap};
use crate::vm::pte::Pte;
use crate::vm::vm_page::{Account, PageFrameDb, PageUse};
use crate::vm::vm_wsl::WorkingSetList;
use crate::vm::Vmm;

// ============================================================================
// VM Map Types
// ============================================================================

/// Address space identifier, also the owner tag of the frames it allocates
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpaceId(pub u64);

/// Memory protection flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmProt(u32);

impl VmProt {
    /// No access
    pub const NONE: Self = Self(0);
    pub const READ: Self = Self(1);
    pub const WRITE: Self = Self(2);
    pub const EXECUTE: Self = Self(4);
    /// Read and write
    pub const DEFAULT: Self = Self(3);
    /// All permissions
    pub const ALL: Self = Self(7);

    pub fn new(bits: u32) -> Self {
        Self(bits & 0x7)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn can_read(&self) -> bool {
        self.contains(Self::READ)
    }

    pub fn can_write(&self) -> bool {
        self.contains(Self::WRITE)
    }

    pub fn can_execute(&self) -> bool {
        self.contains(Self::EXECUTE)
    }
}

impl core::ops::BitOr for VmProt {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl Default for VmProt {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Inheritance on fork
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum VmInherit {
    /// Child shares the parent's pages
    Share = 1,
    /// Child gets a private copy
    #[default]
    Copy = 2,
}

/// Opaque reference to a shared or file-backed section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectionId(pub u64);

// ============================================================================
// Virtual Address Descriptors
// ============================================================================

/// One reserved virtual range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vad {
    pub start: VAddr,
    pub end: VAddr,
    pub protection: VmProt,
    pub max_protection: VmProt,
    pub inheritance: VmInherit,
    pub cow: bool,
    /// `None` for anonymous memory
    pub section: Option<SectionId>,
}

impl Vad {
    /// Anonymous, private region with every right
    pub fn anonymous(start: VAddr, end: VAddr) -> Self {
        Self {
            start,
            end,
            protection: VmProt::ALL,
            max_protection: VmProt::ALL,
            inheritance: VmInherit::Copy,
            cow: false,
            section: None,
        }
    }

    pub fn contains(&self, vaddr: VAddr) -> bool {
        vaddr >= self.start && vaddr < self.end
    }

    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_anonymous(&self) -> bool {
        self.section.is_none()
    }
}

/// Address-ordered set of non-overlapping VADs
#[derive(Debug, Default)]
pub struct VadTree {
    entries: BTreeMap<VAddr, Vad>,
}

impl VadTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// VAD containing `vaddr`
    pub fn find(&self, vaddr: VAddr) -> Option<&Vad> {
        self.entries
            .range(..=vaddr)
            .next_back()
            .map(|(_, vad)| vad)
            .filter(|vad| vad.contains(vaddr))
    }

    /// First VAD intersecting `[start, end)`
    pub fn first_overlap(&self, start: VAddr, end: VAddr) -> Option<&Vad> {
        if let Some(vad) = self.find(start) {
            return Some(vad);
        }
        self.entries.range(start..end).next().map(|(_, vad)| vad)
    }

    pub fn insert(&mut self, vad: Vad) -> Result<(), VmError> {
        assert!(vad.start < vad.end, "empty VAD {:#x}", vad.start);
        if self.first_overlap(vad.start, vad.end).is_some() {
            return Err(VmError::RegionOverlap {
                start: vad.start,
                end: vad.end,
            });
        }
        self.entries.insert(vad.start, vad);
        Ok(())
    }

    /// Remove the VAD starting at `start`
    pub fn remove(&mut self, start: VAddr) -> Option<Vad> {
        self.entries.remove(&start)
    }

    /// VADs intersecting `[start, end)` in address order
    pub fn overlapping(
        &self,
        start: VAddr,
        end: VAddr,
    ) -> impl Iterator<Item = &Vad> + '_ {
        let first = self.find(start).map(|vad| vad.start).unwrap_or(start);
        self.entries.range(first..end).map(|(_, vad)| vad)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vad> + '_ {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Log every range
    pub fn dump(&self) {
        for vad in self.iter() {
            log::debug!(
                "  {:#x}-{:#x} {:?}/{:?}",
                vad.start,
                vad.end,
                vad.protection,
                vad.max_protection
            );
        }
    }
}

// ============================================================================
// Address spaces
// ============================================================================

/// State guarded by the address-space mutex
#[derive(Debug)]
pub struct ProcState {
    pub(crate) vads: VadTree,
    pub(crate) wsl: WorkingSetList,
    pub(crate) pmap: Pmap,
    pub(crate) account: Account,
}

impl ProcState {
    pub fn vads(&self) -> &VadTree {
        &self.vads
    }

    pub fn working_set(&self) -> &WorkingSetList {
        &self.wsl
    }

    pub fn pmap(&self) -> &Pmap {
        &self.pmap
    }

    /// Pages charged to and wired by this space
    pub fn account(&self) -> Account {
        self.account
    }
}

/// One virtual address space
#[derive(Debug)]
pub struct AddressSpace {
    id: SpaceId,
    /// Root table, fixed for the life of the space
    root: Pfn,
    state: KMutex<ProcState>,
}

impl AddressSpace {
    pub(crate) fn new(
        id: SpaceId,
        db: &mut PageFrameDb,
        ws_capacity: usize,
    ) -> Result<Self, VmError> {
        let mut account = Account::new();
        let pmap = Pmap::create(db, &mut account, id.0)?;
        Ok(Self {
            id,
            root: pmap.root(),
            state: KMutex::new(ProcState {
                vads: VadTree::new(),
                wsl: WorkingSetList::new(ws_capacity),
                pmap,
                account,
            }),
        })
    }

    pub fn id(&self) -> SpaceId {
        self.id
    }

    /// Physical address of the root table
    pub fn root_paddr(&self) -> PAddr {
        self.root.paddr()
    }

    /// Wait for the address-space mutex
    pub fn lock(&self, reason: &'static str) -> KMutexGuard<'_, ProcState> {
        self.state.lock(reason)
    }

    /// Wait for the address-space mutex with a timeout
    pub fn try_lock_for(
        &self,
        reason: &'static str,
        timeout: Timeout,
    ) -> Result<KMutexGuard<'_, ProcState>, VmError> {
        Ok(self.state.wait(reason, timeout)?)
    }

    pub fn find_vad(&self, vaddr: VAddr) -> Option<Vad> {
        self.lock("find_vad").vads.find(vaddr).copied()
    }

    /// Reserve exactly `[address, address + size)`
    #[allow(clippy::too_many_arguments)]
    pub fn map_region(
        &self,
        address: VAddr,
        size: u64,
        protection: VmProt,
        max_protection: VmProt,
        cow: bool,
        inheritance: VmInherit,
        section: Option<SectionId>,
    ) -> Result<(), VmError> {
        let end = check_range(address, size)?;
        if !max_protection.contains(protection) {
            return Err(VmError::InvalidArgument(
                "protection exceeds maximum protection",
            ));
        }

        let vad = Vad {
            start: address,
            end,
            protection,
            max_protection,
            inheritance,
            cow,
            section,
        };
        self.lock("map_region").vads.insert(vad)?;
        log::debug!(
            "vm: space {} mapped {:#x}-{:#x} {:?}",
            self.id.0,
            address,
            end,
            protection
        );
        Ok(())
    }

    /// Release every VAD inside `[start, start + size)`
    ///
    /// A VAD that only partly overlaps the range is refused before anything
    /// is changed. Resident frames of removed VADs are deleted; frames still
    /// referenced elsewhere are freed when the last reference goes.
    pub fn unmap_region(&self, vmm: &Vmm, start: VAddr, size: u64) -> Result<usize, VmError> {
        let end = check_range(start, size)?;
        let mut guard = self.lock("unmap_region");
        let state = &mut *guard;

        if let Some(vad) = state
            .vads
            .overlapping(start, end)
            .find(|vad| vad.start < start || vad.end > end)
        {
            log::warn!(
                "vm: unmap {:#x}-{:#x} splits region {:#x}-{:#x}",
                start,
                end,
                vad.start,
                vad.end
            );
            return Err(VmError::PartialUnmap {
                start,
                end,
                vad_start: vad.start,
                vad_end: vad.end,
            });
        }

        let doomed: Vec<Vad> = state.vads.overlapping(start, end).copied().collect();
        for vad in &doomed {
            state.vads.remove(vad.start);
            state.wsl.remove_range(vad.start, vad.end);
            unmap_pages(vmm, &state.pmap, &mut state.account, vad.start, vad.end);
            log::debug!(
                "vm: space {} unmapped {:#x}-{:#x}",
                self.id.0,
                vad.start,
                vad.end
            );
        }
        Ok(doomed.len())
    }

    /// Tear the space down, returning the final account
    pub(crate) fn destroy(self, vmm: &Vmm) -> Account {
        let mut state = self.state.into_inner();
        log::debug!("vm: tearing down space {}", self.id.0);
        state.vads.dump();
        let vads: Vec<Vad> = state.vads.iter().copied().collect();
        for vad in vads {
            state.vads.remove(vad.start);
            state.wsl.remove_range(vad.start, vad.end);
            unmap_pages(vmm, &state.pmap, &mut state.account, vad.start, vad.end);
        }
        state
            .pmap
            .destroy(&mut vmm.pfndb().acquire(), &mut state.account);
        state.account
    }
}

fn check_range(address: VAddr, size: u64) -> Result<VAddr, VmError> {
    if size == 0 || !is_page_aligned(address) || !is_page_aligned(size) {
        return Err(VmError::InvalidArgument(
            "range must be non-empty and page aligned",
        ));
    }
    match address.checked_add(size) {
        Some(end) if end <= VM_MAX_ADDRESS => Ok(end),
        _ => Err(VmError::InvalidArgument("range exceeds the address space")),
    }
}

/// Clear `[start, end)` and delete every frame it maps
fn unmap_pages(vmm: &Vmm, pmap: &Pmap, account: &mut Account, start: VAddr, end: VAddr) {
    unmap_range_and_invoke(
        vmm.pfndb(),
        vmm.tlb(),
        pmap,
        account,
        start,
        end,
        |db, account, pte| {
            let (pfn, resident_wired) = match pte {
                Pte::Hardware { pfn, .. } => (pfn, true),
                Pte::Transition { pfn } => (pfn, false),
                other => panic!("cannot unmap {:?}", other),
            };
            let usage = db.page(pfn).usage();
            assert!(
                usage == PageUse::AnonPrivate,
                "cannot unmap frame {} in use {:?}",
                pfn,
                usage
            );
            db.delete(pfn, account, resident_wired);
        },
    );
}
