//! Unified error types for the VM subsystem using thiserror
//!
//! Only recoverable conditions are represented here. Corruption of the
//! frame database or page tables is not an error but a panic: it cannot
//! be contained to the caller that noticed it.

use thiserror::Error;

use crate::types::{PAddr, VAddr};
use crate::vm::vm_fault::FaultAccess;

/// Top-level error type for VM operations
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    #[error("no free page frames")]
    PageShortage,

    #[error("no region covers address {0:#x}")]
    NoRegion(VAddr),

    #[error("{access:?} access to {vaddr:#x} not permitted by its region")]
    ProtectionViolation { vaddr: VAddr, access: FaultAccess },

    #[error("{0} is not supported")]
    NotSupported(Unsupported),

    #[error("range {start:#x}-{end:#x} partially covers region {vad_start:#x}-{vad_end:#x}")]
    PartialUnmap {
        start: VAddr,
        end: VAddr,
        vad_start: VAddr,
        vad_end: VAddr,
    },

    #[error("range {start:#x}-{end:#x} overlaps an existing region")]
    RegionOverlap { start: VAddr, end: VAddr },

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("too many physical regions")]
    TooManyRegions,

    #[error("physical region {base:#x}+{len:#x} cannot hold its own frame database")]
    RegionTooSmall { base: PAddr, len: usize },

    #[error("physical region {base:#x}+{len:#x} overlaps a registered region")]
    RegionConflict { base: PAddr, len: usize },

    #[error("wait timed out")]
    TimedOut,
}

/// Features deliberately outside the current scope of the core
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unsupported {
    #[error("copy-on-write")]
    CopyOnWrite,

    #[error("section-backed fault")]
    SectionBacked,

    #[error("paging in an outpaged page")]
    Outpaged,

    #[error("fork page-table entry")]
    ForkPte,
}
