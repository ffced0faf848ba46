//! vmm_core - demand-paged virtual memory manager core
//!
//! This crate implements the machine-independent heart of a kernel's
//! virtual memory manager:
//!
//! - a page-frame database with reference-counted residency and
//!   free/modified/standby queues ([`vm::vm_page`])
//! - a three-level page-table walker with cascading table reclamation
//!   ([`vm::pmap`])
//! - per-address-space region tracking ([`vm::vm_map`])
//! - a bounded FIFO working set ([`vm::vm_wsl`])
//! - the demand-paging fault handler ([`vm::vm_fault`])
//! - a software MMU that drives it with plain loads and stores
//!   ([`vm::soft_mmu`])
//!
//! Everything hangs off a [`vm::Vmm`] context object which owns the global
//! page-frame database lock. Address spaces are serialized by their own
//! blocking mutex, which always nests outside the database lock.

#![no_std]
// Kernel-appropriate clippy configuration
// Many kernel types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]
// Manual ceiling division is clearer in memory allocation contexts
#![allow(clippy::manual_div_ceil)]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod error;
pub mod kern;
pub mod types;
pub mod vm;

pub use error::{Unsupported, VmError};
pub use types::{PAddr, Pfn, VAddr, PAGE_SHIFT, PAGE_SIZE};
pub use vm::{AddressSpace, FaultAccess, FrameHandle, VmConfig, Vmm};

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Crate name
pub const NAME: &str = "vmm_core";
