//! Page-table entry encoding
//!
//! A PTE is one 64-bit word with two layouts selected by bit 63:
//!
//! ```text
//! hardware (valid = 1):  | 63 valid | 62 writeable | 61..0 pfn        |
//! software (valid = 0):  | 63 0     | 62 0         | 61..2 pfn | 1..0 kind |
//! ```
//!
//! The all-zero word is the empty entry. Software kinds are
//! 1 = transition, 2 = transition after fork, 3 = outpaged; kind 0 with
//! any other bit set does not occur.

use crate::types::Pfn;

const VALID: u64 = 1 << 63;
const WRITEABLE: u64 = 1 << 62;
const HW_PFN_MASK: u64 = (1 << 62) - 1;
const SW_KIND_MASK: u64 = 0b11;
const SW_PFN_SHIFT: u32 = 2;
const SW_PFN_MASK: u64 = (1 << 60) - 1;

const KIND_TRANSITION: u64 = 1;
const KIND_FORK: u64 = 2;
const KIND_OUTPAGED: u64 = 3;

/// Decoded page-table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pte {
    /// Nothing mapped, nothing resident
    Empty,
    /// Valid translation the MMU will use
    Hardware { pfn: Pfn, writeable: bool },
    /// Page is resident but was evicted from the working set
    Transition { pfn: Pfn },
    /// Reserved for fork sharing
    Fork { slot: u64 },
    /// Reserved for pages written to backing store
    Outpaged { slot: u64 },
}

impl Pte {
    /// Decode a raw entry
    ///
    /// Panics on a software entry of kind zero that is not the empty word.
    pub fn from_bits(raw: u64) -> Self {
        if raw & VALID != 0 {
            return Pte::Hardware {
                pfn: Pfn(raw & HW_PFN_MASK),
                writeable: raw & WRITEABLE != 0,
            };
        }
        if raw == 0 {
            return Pte::Empty;
        }
        assert!(raw & WRITEABLE == 0, "malformed software PTE {:#x}", raw);

        let payload = (raw >> SW_PFN_SHIFT) & SW_PFN_MASK;
        match raw & SW_KIND_MASK {
            KIND_TRANSITION => Pte::Transition { pfn: Pfn(payload) },
            KIND_FORK => Pte::Fork { slot: payload },
            KIND_OUTPAGED => Pte::Outpaged { slot: payload },
            _ => panic!("malformed software PTE {:#x}", raw),
        }
    }

    /// Encode to the raw word
    pub fn bits(self) -> u64 {
        match self {
            Pte::Empty => 0,
            Pte::Hardware { pfn, writeable } => {
                assert!(pfn.0 <= HW_PFN_MASK, "pfn {} too wide for a PTE", pfn);
                let w = if writeable { WRITEABLE } else { 0 };
                VALID | w | pfn.0
            }
            Pte::Transition { pfn } => software(KIND_TRANSITION, pfn.0),
            Pte::Fork { slot } => software(KIND_FORK, slot),
            Pte::Outpaged { slot } => software(KIND_OUTPAGED, slot),
        }
    }

    pub fn is_empty(self) -> bool {
        self == Pte::Empty
    }

    /// Whether the MMU may use this entry
    pub fn is_valid(self) -> bool {
        matches!(self, Pte::Hardware { .. })
    }

    pub fn is_writeable(self) -> bool {
        matches!(self, Pte::Hardware { writeable: true, .. })
    }

    /// Resident frame behind a hardware or transition entry
    pub fn pfn(self) -> Option<Pfn> {
        match self {
            Pte::Hardware { pfn, .. } | Pte::Transition { pfn } => Some(pfn),
            _ => None,
        }
    }
}

fn software(kind: u64, payload: u64) -> u64 {
    assert!(
        payload <= SW_PFN_MASK,
        "software PTE payload {:#x} too wide",
        payload
    );
    (payload << SW_PFN_SHIFT) | kind
}

/// Raw-word tests used on the hot walk without a full decode
pub(crate) fn raw_is_valid(raw: u64) -> bool {
    raw & VALID != 0
}

pub(crate) fn raw_is_writeable(raw: u64) -> bool {
    raw & WRITEABLE != 0
}

pub(crate) fn raw_hw_pfn(raw: u64) -> Pfn {
    Pfn(raw & HW_PFN_MASK)
}
