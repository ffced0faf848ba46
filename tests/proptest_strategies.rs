//! Proptest strategies for the VM property tests

#![allow(dead_code)]

use proptest::prelude::*;
use vmm_core::PAGE_SIZE;

// ════════════════════════════════════════════════════════════
// Frame database
// ════════════════════════════════════════════════════════════

/// One step applied to an allocated frame
#[derive(Debug, Clone, Copy)]
pub enum FrameOp {
    Retain,
    Release,
    Dirty,
}

pub fn frame_op() -> impl Strategy<Value = FrameOp> {
    prop_oneof![
        3 => Just(FrameOp::Retain),
        3 => Just(FrameOp::Release),
        1 => Just(FrameOp::Dirty),
    ]
}

pub fn frame_ops() -> impl Strategy<Value = Vec<FrameOp>> {
    prop::collection::vec(frame_op(), 0..40)
}

/// Sizes of physical regions, in frames
pub fn region_frames() -> impl Strategy<Value = usize> {
    16usize..512
}

/// A byte offset within a page
pub fn page_offset() -> impl Strategy<Value = u64> {
    0u64..PAGE_SIZE as u64
}

// ════════════════════════════════════════════════════════════
// Regions
// ════════════════════════════════════════════════════════════

/// Pages per slot in `disjoint_ranges`
pub const SLOT_PAGES: u64 = 8;

/// Page-aligned ranges that never overlap: at most one per slot of
/// `SLOT_PAGES` pages, each starting somewhere inside its slot
pub fn disjoint_ranges() -> impl Strategy<Value = Vec<(u64, u64)>> {
    prop::collection::btree_map(0u64..64, (0u64..4, 1u64..=4), 1..16).prop_map(|slots| {
        slots
            .into_iter()
            .map(|(slot, (skip, len))| {
                let start = (slot * SLOT_PAGES + skip) * PAGE_SIZE as u64;
                (start, start + len * PAGE_SIZE as u64)
            })
            .collect()
    })
}

/// Arbitrary, possibly overlapping page-aligned ranges
pub fn any_ranges() -> impl Strategy<Value = Vec<(u64, u64)>> {
    prop::collection::vec((0u64..256, 1u64..16), 1..32).prop_map(|ranges| {
        ranges
            .into_iter()
            .map(|(page, len)| {
                let start = page * PAGE_SIZE as u64;
                (start, start + len * PAGE_SIZE as u64)
            })
            .collect()
    })
}

/// Probe addresses over the space covered by the range strategies
pub fn probe_addresses() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(0u64..(SLOT_PAGES * 64 * PAGE_SIZE as u64), 1..64)
}

// ════════════════════════════════════════════════════════════
// Working sets
// ════════════════════════════════════════════════════════════

pub fn ws_capacity() -> impl Strategy<Value = usize> {
    1usize..=4
}

/// Per-page region writeability; `true` allows writes
pub fn touch_pattern() -> impl Strategy<Value = Vec<bool>> {
    prop::collection::vec(any::<bool>(), 1..12)
}
