//! Interrupt Priority Level tracking
//!
//! Spin locks raise the IPL to `Dispatch` while held so the holder cannot
//! be preempted into code that would block. The prior level travels with
//! the lock guard and is restored on release, so acquire/release pairs
//! must nest.
//!
//! With `std` (and in unit tests) every host thread is treated as its own
//! processor and nesting is checked. Without it there is a single boot
//! processor whose level is shared by every context, so nesting cannot be
//! verified and only the save/restore protocol is kept.
//!
//! That shared cell is not SMP-safe. When several processors take spin
//! locks at once their raise/lower pairs interleave, and the level left
//! behind may be any of the saved values (typically `Dispatch`). Nothing
//! here reads the level back in that mode, so locking stays correct, but a
//! multiprocessor port must supply a per-processor cell.

/// Interrupt priority level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Ipl {
    /// Normal thread execution, blocking allowed
    Passive = 0,
    /// Asynchronous procedure calls masked
    Apc = 1,
    /// Dispatcher masked; blocking is illegal
    Dispatch = 2,
    /// All interrupts masked
    High = 15,
}

impl Ipl {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Ipl::Passive,
            1 => Ipl::Apc,
            2 => Ipl::Dispatch,
            _ => Ipl::High,
        }
    }
}

#[cfg(any(test, feature = "std"))]
mod cpu {
    use core::cell::Cell;

    pub const CHECKED: bool = true;

    std::thread_local! {
        static CURRENT: Cell<u8> = const { Cell::new(0) };
    }

    pub fn load() -> u8 {
        CURRENT.with(|c| c.get())
    }

    pub fn store(raw: u8) {
        CURRENT.with(|c| c.set(raw));
    }
}

#[cfg(not(any(test, feature = "std")))]
mod cpu {
    use core::sync::atomic::{AtomicU8, Ordering};

    pub const CHECKED: bool = false;

    static CURRENT: AtomicU8 = AtomicU8::new(0);

    pub fn load() -> u8 {
        CURRENT.load(Ordering::Relaxed)
    }

    pub fn store(raw: u8) {
        CURRENT.store(raw, Ordering::Relaxed);
    }
}

/// Current IPL of this processor
pub fn current() -> Ipl {
    Ipl::from_u8(cpu::load())
}

/// Raise the IPL, returning the prior level
///
/// Raising to a level below the current one is a nesting violation.
pub fn raise(level: Ipl) -> Ipl {
    let prior = current();
    assert!(
        !cpu::CHECKED || level >= prior,
        "raise to {:?} while at higher level {:?}",
        level,
        prior
    );
    cpu::store(level as u8);
    prior
}

/// Restore a level previously returned by [`raise`]
pub fn lower(prior: Ipl) {
    let now = current();
    assert!(
        !cpu::CHECKED || prior <= now,
        "lower to {:?} while at lower level {:?}",
        prior,
        now
    );
    cpu::store(prior as u8);
}

/// Whether the current context may block
///
/// Always true where nesting is not tracked.
pub fn blocking_allowed() -> bool {
    !cpu::CHECKED || current() < Ipl::Dispatch
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raise_lower_nesting() {
        assert_eq!(current(), Ipl::Passive);
        let outer = raise(Ipl::Dispatch);
        assert_eq!(outer, Ipl::Passive);
        let inner = raise(Ipl::High);
        assert_eq!(inner, Ipl::Dispatch);
        assert_eq!(current(), Ipl::High);
        lower(inner);
        assert_eq!(current(), Ipl::Dispatch);
        lower(outer);
        assert_eq!(current(), Ipl::Passive);
    }

    #[test]
    fn test_levels_are_per_thread() {
        let prior = raise(Ipl::Dispatch);
        let other = std::thread::spawn(current).join().unwrap_or(Ipl::High);
        assert_eq!(other, Ipl::Passive);
        lower(prior);
    }
}
