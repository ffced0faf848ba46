//! Page-frame database
//!
//! One [`VmPage`] per physical frame, stored in place at the start of the
//! physical region it describes. Frames with no references sit on one of
//! three residency queues:
//!
//! - free: available to [`PageFrameDb::alloc`]
//! - modified: resident, unreferenced and dirty
//! - standby: resident, unreferenced and clean
//!
//! A frame with `refcnt > 0` is never on a queue. Every operation takes
//! `&mut self`; the database lives in the `Vmm`'s spin lock, so holding
//! that lock is a precondition enforced by the borrow checker.

use alloc::sync::Arc;
use core::mem::{align_of, size_of};
use core::ptr::{self, NonNull};

use crate::error::VmError;
use crate::types::{pages_for, round_page, trunc_page, PAddr, Pfn, PAGE_SIZE};
use crate::vm::phys::DirectMap;

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of physical regions that can be registered
pub const MAX_PHYS_REGIONS: usize = 16;

// ============================================================================
// Frame metadata
// ============================================================================

/// What a frame is currently used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageUse {
    /// Holds frame database headers; never freed
    Reserved,
    Free,
    /// Deleted from its owner; freed once the last reference goes
    Deleted,
    /// Demand-zero anonymous memory
    AnonPrivate,
    /// Leaf page table
    PageTable1,
    PageTable2,
    /// Root page table
    PageTable3,
}

impl PageUse {
    /// Use category of a page table at `level` (1 = leaf)
    pub fn page_table(level: usize) -> Self {
        match level {
            1 => PageUse::PageTable1,
            2 => PageUse::PageTable2,
            3 => PageUse::PageTable3,
            _ => panic!("no page table level {}", level),
        }
    }

    pub fn is_page_table(self) -> bool {
        matches!(
            self,
            PageUse::PageTable1 | PageUse::PageTable2 | PageUse::PageTable3
        )
    }
}

/// Residency queues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Free = 0,
    Modified = 1,
    Standby = 2,
}

/// Location of one page-table entry: the table frame and the slot index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PteSlot {
    pub table: Pfn,
    pub index: u16,
}

/// Use-dependent frame data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageData {
    Plain,
    /// Page table: number of non-empty entries
    Table { used_ptes: u16 },
    /// Section-backed page: byte offset into the section
    Backed { offset: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageLink {
    Unlinked,
    Queued {
        queue: QueueKind,
        prev: Option<Pfn>,
        next: Option<Pfn>,
    },
    /// Busy with an outstanding pager request
    PagerRequest(u32),
}

/// Page-frame entry
#[derive(Debug, Clone, Copy)]
pub struct VmPage {
    pfn: Pfn,
    usage: PageUse,
    dirty: bool,
    busy: bool,
    refcnt: u16,
    generation: u32,
    data: PageData,
    referent: Option<PteSlot>,
    link: PageLink,
    owner: u64,
}

impl VmPage {
    const fn new(pfn: Pfn) -> Self {
        Self {
            pfn,
            usage: PageUse::Free,
            dirty: false,
            busy: false,
            refcnt: 0,
            generation: 0,
            data: PageData::Plain,
            referent: None,
            link: PageLink::Unlinked,
            owner: 0,
        }
    }

    pub fn pfn(&self) -> Pfn {
        self.pfn
    }

    pub fn usage(&self) -> PageUse {
        self.usage
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn refcnt(&self) -> u16 {
        self.refcnt
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn data(&self) -> PageData {
        self.data
    }

    /// Non-empty entries if this frame is a page table, else zero
    pub fn used_ptes(&self) -> u16 {
        match self.data {
            PageData::Table { used_ptes } => used_ptes,
            _ => 0,
        }
    }

    /// The PTE that maps (or last mapped) this frame
    pub fn referent(&self) -> Option<PteSlot> {
        self.referent
    }

    /// Residency queue the frame is on, if any
    pub fn queue(&self) -> Option<QueueKind> {
        match self.link {
            PageLink::Queued { queue, .. } => Some(queue),
            _ => None,
        }
    }

    pub fn owner(&self) -> u64 {
        self.owner
    }
}

/// Charge/credit counters for page allocation and wiring
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Account {
    /// Pages allocated and not yet deleted
    pub nalloced: u64,
    /// References currently held
    pub nwires: u64,
}

impl Account {
    pub const fn new() -> Self {
        Self {
            nalloced: 0,
            nwires: 0,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.nalloced == 0 && self.nwires == 0
    }

    fn wire(&mut self) {
        self.nwires += 1;
    }

    fn unwire(&mut self) {
        assert!(self.nwires > 0, "account wire count underflow");
        self.nwires -= 1;
    }

    fn uncharge(&mut self) {
        assert!(self.nalloced > 0, "account allocation count underflow");
        self.nalloced -= 1;
    }
}

/// Reference to a frame handed out of the core
///
/// The generation is bumped every time the frame is freed, so a handle
/// outliving its frame is detected instead of aliasing the next user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHandle {
    pfn: Pfn,
    generation: u32,
}

impl FrameHandle {
    pub fn pfn(&self) -> Pfn {
        self.pfn
    }

    pub fn paddr(&self) -> PAddr {
        self.pfn.paddr()
    }
}

/// Global page statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VmStat {
    pub ntotal: u64,
    pub nreserved: u64,
    pub nfree: u64,
    pub nactive: u64,
    pub nmodified: u64,
    pub nstandby: u64,
    pub ndeleted: u64,
    pub nanonprivate: u64,
    pub npagetable: u64,
}

impl VmStat {
    /// Every frame is in exactly one residency state
    pub fn is_balanced(&self) -> bool {
        self.nreserved + self.nfree + self.nactive + self.nmodified + self.nstandby
            == self.ntotal
    }

    fn count_use(&mut self, usage: PageUse, delta: i64) {
        let counter = match usage {
            PageUse::Deleted => &mut self.ndeleted,
            PageUse::AnonPrivate => &mut self.nanonprivate,
            u if u.is_page_table() => &mut self.npagetable,
            u => panic!("no use statistics for {:?}", u),
        };
        *counter = counter
            .checked_add_signed(delta)
            .unwrap_or_else(|| panic!("{:?} page count underflow", usage));
    }
}

// ============================================================================
// Physical regions
// ============================================================================

/// Header written at the start of each registered region
#[repr(C)]
struct RegionHeader {
    base: PAddr,
    npages: u64,
}

#[derive(Debug, Clone, Copy)]
struct PhysRegion {
    base: Pfn,
    npages: usize,
    pages: NonNull<VmPage>,
}

impl PhysRegion {
    fn contains(&self, pfn: Pfn) -> bool {
        pfn >= self.base && pfn.0 - self.base.0 < self.npages as u64
    }
}

/// Summary of a registered region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionInfo {
    pub base: PAddr,
    pub npages: usize,
    pub reserved: usize,
}

/// Offset of the frame array within a region header area
const fn pages_offset() -> usize {
    let align = align_of::<VmPage>();
    (size_of::<RegionHeader>() + align - 1) / align * align
}

/// Bytes needed to describe a region of `npages` frames
pub const fn region_header_bytes(npages: usize) -> usize {
    pages_offset() + npages * size_of::<VmPage>()
}

/// Frames consumed by the header of a region of `npages` frames
pub const fn region_reserved_pages(npages: usize) -> usize {
    pages_for(region_header_bytes(npages))
}

#[derive(Debug, Default, Clone, Copy)]
struct PageQueue {
    head: Option<Pfn>,
    tail: Option<Pfn>,
    count: usize,
}

// ============================================================================
// Page-frame database
// ============================================================================

/// The page-frame database
pub struct PageFrameDb {
    dmap: Arc<dyn DirectMap>,
    regions: heapless::Vec<PhysRegion, MAX_PHYS_REGIONS>,
    queues: [PageQueue; 3],
    stats: VmStat,
    deleted_account: Account,
}

// SAFETY: region pointers refer to memory reachable through the direct map,
// which is Send + Sync; the database itself is only touched under its lock.
unsafe impl Send for PageFrameDb {}

impl PageFrameDb {
    pub fn new(dmap: Arc<dyn DirectMap>) -> Self {
        Self {
            dmap,
            regions: heapless::Vec::new(),
            queues: [PageQueue::default(); 3],
            stats: VmStat::default(),
            deleted_account: Account::new(),
        }
    }

    pub fn direct_map(&self) -> &Arc<dyn DirectMap> {
        &self.dmap
    }

    /// Bring `[base, base + len)` under management
    ///
    /// The range is shrunk to whole pages. Its first frames hold the
    /// region header and frame array and are permanently reserved; the
    /// rest go on the free queue.
    pub fn register_region(
        &mut self,
        base: PAddr,
        len: usize,
    ) -> Result<RegionInfo, VmError> {
        let start = round_page(base);
        let end = trunc_page(base.saturating_add(len as u64));
        if end <= start {
            return Err(VmError::RegionTooSmall { base, len });
        }
        let npages = ((end - start) / PAGE_SIZE as u64) as usize;
        let reserved = region_reserved_pages(npages);
        if reserved >= npages {
            return Err(VmError::RegionTooSmall { base, len });
        }

        let first = Pfn::from_paddr(start);
        let last = Pfn(first.0 + npages as u64 - 1);
        let overlaps = |r: &PhysRegion| {
            r.contains(first) || r.contains(last) || (first < r.base && last >= r.base)
        };
        if self.regions.iter().any(overlaps) {
            return Err(VmError::RegionConflict { base, len });
        }
        if self.regions.is_full() {
            return Err(VmError::TooManyRegions);
        }

        let header = self.dmap.phys_to_virt(start);
        assert!(
            header as usize % align_of::<VmPage>() == 0,
            "direct map of {:#x} is misaligned",
            start
        );
        // SAFETY: the direct map covers the whole region contiguously and the
        // header frames are reserved below, so nothing else aliases them.
        let pages = unsafe {
            ptr::write(
                header as *mut RegionHeader,
                RegionHeader {
                    base: start,
                    npages: npages as u64,
                },
            );
            let pages = header.add(pages_offset()) as *mut VmPage;
            for i in 0..npages {
                ptr::write(pages.add(i), VmPage::new(Pfn(first.0 + i as u64)));
            }
            NonNull::new_unchecked(pages)
        };

        let region = PhysRegion {
            base: first,
            npages,
            pages,
        };
        if self.regions.push(region).is_err() {
            return Err(VmError::TooManyRegions);
        }

        for i in 0..npages {
            let pfn = Pfn(first.0 + i as u64);
            if i < reserved {
                let page = self.page_mut(pfn);
                page.usage = PageUse::Reserved;
                page.refcnt = 1;
            } else {
                self.enqueue(QueueKind::Free, pfn);
            }
        }

        self.stats.ntotal += npages as u64;
        self.stats.nreserved += reserved as u64;
        self.stats.nfree += (npages - reserved) as u64;

        log::info!(
            "vm: region {:#x}-{:#x}: {} frames, {} reserved for frame database",
            start,
            end,
            npages,
            reserved
        );

        Ok(RegionInfo {
            base: start,
            npages,
            reserved,
        })
    }

    // ------------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------------

    fn locate(&self, pfn: Pfn) -> Option<NonNull<VmPage>> {
        self.regions.iter().find(|r| r.contains(pfn)).map(|r| {
            // SAFETY: the index is within the region's frame array.
            let index = (pfn.0 - r.base.0) as usize;
            unsafe { NonNull::new_unchecked(r.pages.as_ptr().add(index)) }
        })
    }

    /// Entry for a physical address, if any region covers it
    pub fn try_paddr_to_frame(&self, paddr: PAddr) -> Option<&VmPage> {
        // SAFETY: entries live as long as the region, which is never removed.
        self.locate(Pfn::from_paddr(paddr))
            .map(|p| unsafe { &*p.as_ptr() })
    }

    /// Entry for a physical address
    ///
    /// Panics if no registered region covers it.
    pub fn paddr_to_frame(&self, paddr: PAddr) -> &VmPage {
        match self.try_paddr_to_frame(paddr) {
            Some(page) => page,
            None => panic!("no frame for physical address {:#x}", paddr),
        }
    }

    pub fn page(&self, pfn: Pfn) -> &VmPage {
        self.paddr_to_frame(pfn.paddr())
    }

    fn page_mut(&mut self, pfn: Pfn) -> &mut VmPage {
        match self.locate(pfn) {
            // SAFETY: unique access through &mut self.
            Some(p) => unsafe { &mut *p.as_ptr() },
            None => panic!("no frame {}", pfn),
        }
    }

    /// Kernel-accessible address of a frame's contents
    pub fn frame_ptr(&self, pfn: Pfn) -> *mut u8 {
        self.dmap.phys_to_virt(pfn.paddr())
    }

    pub fn stats(&self) -> VmStat {
        self.stats
    }

    /// Account holding the charge of deleted frames not yet freed
    pub fn deleted_account(&self) -> Account {
        self.deleted_account
    }

    /// Number of frames on a residency queue
    pub fn queue_len(&self, kind: QueueKind) -> usize {
        self.queues[kind as usize].count
    }

    // ------------------------------------------------------------------------
    // Residency queues
    // ------------------------------------------------------------------------

    fn enqueue(&mut self, kind: QueueKind, pfn: Pfn) {
        let tail = self.queues[kind as usize].tail;
        {
            let page = self.page_mut(pfn);
            assert!(
                page.link == PageLink::Unlinked,
                "frame {} enqueued twice",
                pfn
            );
            page.link = PageLink::Queued {
                queue: kind,
                prev: tail,
                next: None,
            };
        }
        match tail {
            Some(t) => self.set_next(t, Some(pfn)),
            None => self.queues[kind as usize].head = Some(pfn),
        }
        let q = &mut self.queues[kind as usize];
        q.tail = Some(pfn);
        q.count += 1;
    }

    fn unlink(&mut self, pfn: Pfn) -> QueueKind {
        let (kind, prev, next) = match self.page(pfn).link {
            PageLink::Queued { queue, prev, next } => (queue, prev, next),
            link => panic!("frame {} is not queued ({:?})", pfn, link),
        };
        match prev {
            Some(p) => self.set_next(p, next),
            None => self.queues[kind as usize].head = next,
        }
        match next {
            Some(n) => self.set_prev(n, prev),
            None => self.queues[kind as usize].tail = prev,
        }
        self.queues[kind as usize].count -= 1;
        self.page_mut(pfn).link = PageLink::Unlinked;
        kind
    }

    fn dequeue_head(&mut self, kind: QueueKind) -> Option<Pfn> {
        let head = self.queues[kind as usize].head?;
        self.unlink(head);
        Some(head)
    }

    fn set_next(&mut self, pfn: Pfn, to: Option<Pfn>) {
        if let PageLink::Queued { next, .. } = &mut self.page_mut(pfn).link {
            *next = to;
        }
    }

    fn set_prev(&mut self, pfn: Pfn, to: Option<Pfn>) {
        if let PageLink::Queued { prev, .. } = &mut self.page_mut(pfn).link {
            *prev = to;
        }
    }

    fn passive_queue(page: &VmPage) -> QueueKind {
        if page.dirty {
            QueueKind::Modified
        } else {
            QueueKind::Standby
        }
    }

    // ------------------------------------------------------------------------
    // Frame lifecycle
    // ------------------------------------------------------------------------

    /// Allocate a zeroed frame for `usage`, charged to `account`
    pub fn alloc(&mut self, account: &mut Account, usage: PageUse) -> Result<Pfn, VmError> {
        assert!(
            !matches!(usage, PageUse::Free | PageUse::Deleted | PageUse::Reserved),
            "cannot allocate a frame as {:?}",
            usage
        );
        let Some(pfn) = self.dequeue_head(QueueKind::Free) else {
            log::warn!("vm: page shortage allocating {:?}", usage);
            return Err(VmError::PageShortage);
        };

        {
            let page = self.page_mut(pfn);
            assert!(
                page.refcnt == 0 && page.used_ptes() == 0 && page.referent.is_none(),
                "free frame {} has stale state",
                pfn
            );
            page.refcnt = 1;
            page.usage = usage;
            page.busy = false;
            page.dirty = false;
            page.referent = None;
            page.owner = 0;
            page.data = if usage.is_page_table() {
                PageData::Table { used_ptes: 0 }
            } else {
                PageData::Plain
            };
        }

        self.stats.nfree -= 1;
        self.stats.nactive += 1;
        account.nalloced += 1;
        account.wire();
        self.stats.count_use(usage, 1);

        // SAFETY: the frame is ours and the direct map covers it.
        unsafe { ptr::write_bytes(self.frame_ptr(pfn), 0, PAGE_SIZE) };

        debug_assert!(self.frame_state_consistent(pfn));
        Ok(pfn)
    }

    /// Take a reference to `pfn` on behalf of `account`
    pub fn retain(&mut self, pfn: Pfn, account: &mut Account) -> Pfn {
        account.wire();
        let page = self.page_mut(pfn);
        assert!(page.refcnt < u16::MAX, "frame {} refcnt overflow", pfn);
        page.refcnt += 1;

        if page.refcnt == 1 {
            assert!(
                page.usage != PageUse::Deleted && page.usage != PageUse::Free,
                "retaining unowned frame {} ({:?})",
                pfn,
                page.usage
            );
            let expected = Self::passive_queue(page);
            let from = self.unlink(pfn);
            assert_eq!(from, expected, "frame {} on the wrong queue", pfn);
            match from {
                QueueKind::Modified => self.stats.nmodified -= 1,
                QueueKind::Standby => self.stats.nstandby -= 1,
                QueueKind::Free => unreachable!(),
            }
            self.stats.nactive += 1;
        }

        debug_assert!(self.frame_state_consistent(pfn));
        pfn
    }

    /// Drop a reference held by `account`
    pub fn release(&mut self, pfn: Pfn, account: &mut Account) {
        let page = self.page_mut(pfn);
        assert!(page.refcnt > 0, "releasing frame {} with no references", pfn);
        page.refcnt -= 1;
        let now_idle = page.refcnt == 0;
        let usage = page.usage;
        let queue = Self::passive_queue(page);
        account.unwire();

        if now_idle {
            self.stats.nactive -= 1;
            if usage == PageUse::Deleted {
                self.free(pfn);
            } else {
                self.enqueue(queue, pfn);
                match queue {
                    QueueKind::Modified => self.stats.nmodified += 1,
                    _ => self.stats.nstandby += 1,
                }
            }
        }

        debug_assert!(self.frame_state_consistent(pfn));
    }

    /// Remove `pfn` from its owner, moving its charge to the deleted account
    ///
    /// With `also_release` one reference held by `account` is dropped as
    /// well. Otherwise an unreferenced frame is freed straight off its
    /// passive queue.
    pub fn delete(&mut self, pfn: Pfn, account: &mut Account, also_release: bool) {
        let page = self.page_mut(pfn);
        assert!(
            !matches!(page.usage, PageUse::Deleted | PageUse::Free | PageUse::Reserved),
            "deleting frame {} in use {:?}",
            pfn,
            page.usage
        );
        assert!(!page.busy, "deleting busy frame {}", pfn);
        let prior = page.usage;
        page.usage = PageUse::Deleted;
        let refcnt = page.refcnt;

        self.stats.count_use(prior, -1);
        self.stats.count_use(PageUse::Deleted, 1);
        account.uncharge();
        self.deleted_account.nalloced += 1;

        if also_release {
            assert!(refcnt > 0, "delete-and-release of unreferenced frame {}", pfn);
            self.release(pfn, account);
        } else if refcnt == 0 {
            match self.unlink(pfn) {
                QueueKind::Modified => self.stats.nmodified -= 1,
                QueueKind::Standby => self.stats.nstandby -= 1,
                QueueKind::Free => panic!("deleted frame {} was on the free queue", pfn),
            }
            self.free(pfn);
        }

        debug_assert!(self.frame_state_consistent(pfn));
    }

    /// Return a deleted, unreferenced frame to the free queue
    fn free(&mut self, pfn: Pfn) {
        let page = self.page_mut(pfn);
        assert!(
            page.usage == PageUse::Deleted && page.refcnt == 0,
            "freeing frame {} in use {:?} with {} references",
            pfn,
            page.usage,
            page.refcnt
        );
        page.usage = PageUse::Free;
        page.dirty = false;
        page.referent = None;
        page.data = PageData::Plain;
        page.owner = 0;
        page.generation = page.generation.wrapping_add(1);

        self.enqueue(QueueKind::Free, pfn);
        self.deleted_account.uncharge();
        self.stats.count_use(PageUse::Deleted, -1);
        self.stats.nfree += 1;
    }

    // ------------------------------------------------------------------------
    // Field updates
    // ------------------------------------------------------------------------

    /// Mark a referenced frame modified
    ///
    /// An idle frame's queue is chosen by its dirty flag, so only frames
    /// that are off the passive queues may change it.
    pub fn set_dirty(&mut self, pfn: Pfn) {
        let page = self.page_mut(pfn);
        assert!(page.refcnt > 0, "dirtying idle frame {}", pfn);
        page.dirty = true;
    }

    pub fn set_referent(&mut self, pfn: Pfn, slot: Option<PteSlot>) {
        self.page_mut(pfn).referent = slot;
    }

    pub fn set_owner(&mut self, pfn: Pfn, owner: u64) {
        self.page_mut(pfn).owner = owner;
    }

    /// Count one more non-empty entry in table `pfn`
    pub fn table_used_inc(&mut self, pfn: Pfn) -> u16 {
        match &mut self.page_mut(pfn).data {
            PageData::Table { used_ptes } => {
                assert!((*used_ptes as usize) < crate::types::PT_ENTRIES);
                *used_ptes += 1;
                *used_ptes
            }
            data => panic!("frame {} is not a page table ({:?})", pfn, data),
        }
    }

    /// Count one less non-empty entry in table `pfn`
    pub fn table_used_dec(&mut self, pfn: Pfn) -> u16 {
        match &mut self.page_mut(pfn).data {
            PageData::Table { used_ptes } => {
                assert!(*used_ptes > 0, "table {} entry count underflow", pfn);
                *used_ptes -= 1;
                *used_ptes
            }
            data => panic!("frame {} is not a page table ({:?})", pfn, data),
        }
    }

    /// Mark a referenced frame busy with a pager request
    pub fn begin_pagein(&mut self, pfn: Pfn, request: u32) {
        let page = self.page_mut(pfn);
        assert!(
            page.refcnt > 0 && !page.busy && page.link == PageLink::Unlinked,
            "frame {} cannot start paging",
            pfn
        );
        page.busy = true;
        page.link = PageLink::PagerRequest(request);
        debug_assert!(self.frame_state_consistent(pfn));
    }

    /// Complete the pager request on `pfn`, returning its id
    pub fn end_pagein(&mut self, pfn: Pfn) -> u32 {
        let page = self.page_mut(pfn);
        let PageLink::PagerRequest(request) = page.link else {
            panic!("frame {} has no pager request", pfn);
        };
        page.busy = false;
        page.link = PageLink::Unlinked;
        request
    }

    // ------------------------------------------------------------------------
    // Handles
    // ------------------------------------------------------------------------

    pub fn handle(&self, pfn: Pfn) -> FrameHandle {
        FrameHandle {
            pfn,
            generation: self.page(pfn).generation,
        }
    }

    /// Frame behind a handle; panics if the frame was freed since
    pub fn resolve(&self, handle: FrameHandle) -> Pfn {
        let page = self.page(handle.pfn);
        assert!(
            page.generation == handle.generation,
            "stale handle for frame {} (generation {} now {})",
            handle.pfn,
            handle.generation,
            page.generation
        );
        handle.pfn
    }

    // ------------------------------------------------------------------------
    // Consistency
    // ------------------------------------------------------------------------

    /// Queue membership agrees with use, dirty and refcnt
    pub fn frame_state_consistent(&self, pfn: Pfn) -> bool {
        let page = self.page(pfn);
        match (page.usage, page.link) {
            (PageUse::Free, PageLink::Queued { queue, .. }) => {
                queue == QueueKind::Free && page.refcnt == 0 && !page.dirty && !page.busy
            }
            (PageUse::Free, _) => false,
            (PageUse::Reserved, link) => link == PageLink::Unlinked && page.refcnt >= 1,
            (_, PageLink::Queued { queue, .. }) => {
                page.refcnt == 0
                    && page.usage != PageUse::Deleted
                    && queue == Self::passive_queue(page)
            }
            (_, PageLink::Unlinked) => page.refcnt > 0 && !page.busy,
            (_, PageLink::PagerRequest(_)) => page.refcnt > 0 && page.busy,
        }
    }
}

impl core::fmt::Debug for PageFrameDb {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageFrameDb")
            .field("regions", &self.regions.len())
            .field("stats", &self.stats)
            .finish()
    }
}
