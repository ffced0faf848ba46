//! Physical Map (pmap) - three-level page-table walker
//!
//! Page tables are ordinary frames from the page-frame database. Their
//! reference counts track the references held on them:
//!
//! - every non-empty entry of a table holds one reference on that table
//! - the root holds one more for the address space itself
//! - a fault in progress holds one transient reference per table below the
//!   root, kept in its [`FaultState`]
//!
//! A table below the root whose entry count drops to zero is unlinked
//! from its parent and freed, which may empty the parent in turn.
//!
//! All functions here run with the page-frame database lock held; the
//! `&mut PageFrameDb` argument is the proof.

use core::ptr;

use crate::error::VmError;
use crate::kern::lock::SpinLock;
use crate::types::{pt_index, PAddr, Pfn, VAddr, LEAF_TABLE_SPAN, PAGE_SIZE, PT_LEVELS};
use crate::vm::pte::Pte;
use crate::vm::vm_page::{Account, PageFrameDb, PageUse, PteSlot};

/// Number of tables a walk can hold below the root
pub const PT_INTERMEDIATE: usize = PT_LEVELS - 1;

// ============================================================================
// TLB
// ============================================================================

/// Translation cache invalidation
///
/// Called once per unmapped range, after the frame database lock has been
/// released, so frames freed by the unmap cannot be handed out again while
/// another processor may still translate through a stale entry.
pub trait TlbInvalidate: Send + Sync {
    fn invalidate_range(&self, root: PAddr, start: VAddr, end: VAddr);
}

/// Invalidation for a machine with no translation caches
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTlb;

impl TlbInvalidate for NoTlb {
    fn invalidate_range(&self, _root: PAddr, _start: VAddr, _end: VAddr) {}
}

// ============================================================================
// Pmap
// ============================================================================

/// Root of one address space's table hierarchy
#[derive(Debug)]
pub struct Pmap {
    root: Pfn,
}

impl Pmap {
    /// Allocate an empty root table charged to `account`
    pub fn create(
        db: &mut PageFrameDb,
        account: &mut Account,
        owner: u64,
    ) -> Result<Self, VmError> {
        let root = db.alloc(account, PageUse::page_table(PT_LEVELS))?;
        db.set_owner(root, owner);
        log::trace!("pmap: root table {} for space {}", root, owner);
        Ok(Self { root })
    }

    pub fn root(&self) -> Pfn {
        self.root
    }

    /// Physical address loaded into the MMU's table base register
    pub fn root_paddr(&self) -> PAddr {
        self.root.paddr()
    }

    /// Free the root table; every mapping must already be gone
    pub fn destroy(self, db: &mut PageFrameDb, account: &mut Account) {
        let root = db.page(self.root);
        assert!(
            root.used_ptes() == 0 && root.refcnt() == 1,
            "destroying pmap {} with {} live entries",
            self.root,
            root.used_ptes()
        );
        db.delete(self.root, account, true);
    }
}

/// Table references held by one fault pass
#[derive(Debug, Default)]
pub struct FaultState {
    /// Tables below the root, top-down
    tables: heapless::Vec<Pfn, PT_INTERMEDIATE>,
    /// The wired leaf entry
    pte: Option<PteSlot>,
}

impl FaultState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pte(&self) -> Option<PteSlot> {
        self.pte
    }

    /// The leaf table holding the wired entry
    pub fn leaf_table(&self) -> Option<Pfn> {
        self.pte.map(|slot| slot.table)
    }
}

// ============================================================================
// Entry access
// ============================================================================

fn slot_ptr(db: &PageFrameDb, slot: PteSlot) -> *mut u64 {
    debug_assert!(db.page(slot.table).usage().is_page_table());
    // SAFETY: a table frame holds PT_ENTRIES words and the index is in range.
    unsafe { (db.frame_ptr(slot.table) as *mut u64).add(slot.index as usize) }
}

/// Raw entry word, as the MMU would load it
pub(crate) fn read_raw(db: &PageFrameDb, slot: PteSlot) -> u64 {
    // SAFETY: slot_ptr points at a live, aligned table entry.
    unsafe { ptr::read_volatile(slot_ptr(db, slot)) }
}

pub fn read_pte(db: &PageFrameDb, slot: PteSlot) -> Pte {
    Pte::from_bits(read_raw(db, slot))
}

pub fn write_pte(db: &mut PageFrameDb, slot: PteSlot, pte: Pte) {
    // SAFETY: as in read_pte; &mut PageFrameDb serializes writers.
    unsafe { ptr::write_volatile(slot_ptr(db, slot), pte.bits()) }
}

pub(crate) fn slot_for(table: Pfn, vaddr: VAddr, level: usize) -> PteSlot {
    PteSlot {
        table,
        index: pt_index(vaddr, level) as u16,
    }
}

fn is_root(db: &PageFrameDb, table: Pfn) -> bool {
    db.page(table).usage() == PageUse::page_table(PT_LEVELS)
}

// ============================================================================
// Walks
// ============================================================================

/// Wire the chain of tables down to the leaf entry for `vaddr`
///
/// Missing tables are allocated and charged to `account`. Each table below
/// the root gains a transient reference recorded in `state`, and the leaf
/// table counts the entry as used until [`fault_state_release`].
pub fn wire_pte(
    db: &mut PageFrameDb,
    pmap: &Pmap,
    account: &mut Account,
    owner: u64,
    vaddr: VAddr,
    state: &mut FaultState,
) -> Result<PteSlot, VmError> {
    if let Some(slot) = state.pte {
        return Ok(slot);
    }

    let mut table = pmap.root;
    for (depth, level) in (1..PT_LEVELS).rev().enumerate() {
        if let Some(&cached) = state.tables.get(depth) {
            table = cached;
            continue;
        }

        let slot = slot_for(table, vaddr, level + 1);
        let child = match read_pte(db, slot) {
            Pte::Empty => link_table(db, account, owner, slot, level)?,
            Pte::Hardware { pfn, .. } => db.retain(pfn, account),
            other => panic!("{:?} in level {} table {}", other, level + 1, table),
        };
        if state.tables.push(child).is_err() {
            unreachable!("fault state holds one table per level");
        }
        table = child;
    }

    let slot = slot_for(table, vaddr, 1);
    db.table_used_inc(table);
    state.pte = Some(slot);
    Ok(slot)
}

/// Allocate a table for `level` and link it into `parent`
fn link_table(
    db: &mut PageFrameDb,
    account: &mut Account,
    owner: u64,
    parent: PteSlot,
    level: usize,
) -> Result<Pfn, VmError> {
    let child = db.alloc(account, PageUse::page_table(level))?;
    db.set_owner(child, owner);
    db.set_referent(child, Some(parent));
    write_pte(
        db,
        parent,
        Pte::Hardware {
            pfn: child,
            writeable: true,
        },
    );
    db.table_used_inc(parent.table);
    db.retain(parent.table, account);
    log::trace!(
        "pmap: level {} table {} linked at {}[{}]",
        level,
        child,
        parent.table,
        parent.index
    );
    Ok(child)
}

/// Drop the references taken by [`wire_pte`]
pub fn fault_state_release(
    db: &mut PageFrameDb,
    account: &mut Account,
    state: &mut FaultState,
) {
    let leaf = state.pte.take().map(|slot| slot.table);
    let wired = state.tables.len();

    for (i, &table) in state.tables.iter().enumerate() {
        if leaf.is_some() && i + 1 == wired {
            break;
        }
        if db.page(table).used_ptes() == 0 {
            // linked by this pass, but the walk below it failed
            free_table(db, account, table);
        } else {
            db.release(table, account);
        }
    }
    if let Some(leaf) = leaf {
        pte_became_zero(db, account, leaf);
    }
    state.tables.clear();
}

/// One entry of `table` became empty, or a transient reference on it ends
pub fn pte_became_zero(db: &mut PageFrameDb, account: &mut Account, table: Pfn) {
    let used = db.table_used_dec(table);
    if used == 0 && !is_root(db, table) {
        free_table(db, account, table);
    } else {
        db.release(table, account);
    }
}

/// Unlink and free an empty table, then any ancestors it leaves empty
///
/// The child is fully torn down before its parent's count is touched.
fn free_table(db: &mut PageFrameDb, account: &mut Account, table: Pfn) {
    let mut table = table;
    loop {
        let page = db.page(table);
        assert!(
            page.usage().is_page_table() && page.used_ptes() == 0,
            "freeing non-empty table {}",
            table
        );
        let Some(slot) = page.referent() else {
            panic!("table {} has no parent entry", table);
        };

        write_pte(db, slot, Pte::Empty);
        db.delete(table, account, true);
        log::trace!(
            "pmap: table {} freed from {}[{}]",
            table,
            slot.table,
            slot.index
        );

        let parent = slot.table;
        if db.table_used_dec(parent) == 0 && !is_root(db, parent) {
            table = parent;
        } else {
            db.release(parent, account);
            break;
        }
    }
}

/// Locate the leaf entry for `vaddr` without allocating or counting
pub fn fetch_pte(db: &PageFrameDb, pmap: &Pmap, vaddr: VAddr) -> Option<PteSlot> {
    let mut table = pmap.root;
    for level in (2..=PT_LEVELS).rev() {
        match read_pte(db, slot_for(table, vaddr, level)) {
            Pte::Empty => return None,
            Pte::Hardware { pfn, .. } => table = pfn,
            other => panic!("{:?} in level {} table {}", other, level, table),
        }
    }
    Some(slot_for(table, vaddr, 1))
}

/// Clear every entry in `[start, end)` and hand each non-empty one to
/// `callback`
///
/// The database lock is held for the whole range; the TLB is invalidated
/// once after it is dropped. Returns the number of entries cleared.
pub fn unmap_range_and_invoke<F>(
    pfndb: &SpinLock<PageFrameDb>,
    tlb: &dyn TlbInvalidate,
    pmap: &Pmap,
    account: &mut Account,
    start: VAddr,
    end: VAddr,
    mut callback: F,
) -> usize
where
    F: FnMut(&mut PageFrameDb, &mut Account, Pte),
{
    let mut cleared = 0;
    let mut db = pfndb.acquire();
    let mut vaddr = start;

    while vaddr < end {
        let Some(slot) = fetch_pte(&db, pmap, vaddr) else {
            vaddr = (vaddr & !(LEAF_TABLE_SPAN - 1)) + LEAF_TABLE_SPAN;
            continue;
        };

        let pte = read_pte(&db, slot);
        if !pte.is_empty() {
            write_pte(&mut db, slot, Pte::Empty);
            callback(&mut db, account, pte);
            pte_became_zero(&mut db, account, slot.table);
            cleared += 1;
        }
        vaddr += PAGE_SIZE as VAddr;
    }
    drop(db);

    if start < end {
        tlb.invalidate_range(pmap.root_paddr(), start, end);
    }
    cleared
}
