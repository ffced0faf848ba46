//! Locking primitives
//!
//! Provides:
//! - [`SpinLock`] for the short, non-blocking critical sections of the
//!   page-frame database; holding it raises the IPL to `Dispatch`
//! - [`KMutex`] for address-space state, which may be held across long
//!   operations and is waited on with a timeout
//! - [`KEvent`], a manually reset notification
//!
//! All three are built on `spin` so they work without an operating system
//! underneath.

use core::fmt;
use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use super::ipl::{self, Ipl};
use super::timer::{relax, Deadline, Timeout};
use crate::error::VmError;

/// A bounded wait expired before the resource became available
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedOut;

impl From<TimedOut> for VmError {
    fn from(_: TimedOut) -> Self {
        VmError::TimedOut
    }
}

// ============================================================================
// Spin Lock
// ============================================================================

/// Non-reentrant spin lock that raises the IPL while held
pub struct SpinLock<T> {
    inner: spin::Mutex<T>,
}

/// Guard for a held [`SpinLock`]
///
/// Dropping it unlocks first and restores the saved IPL second.
pub struct SpinLockGuard<'a, T> {
    guard: ManuallyDrop<spin::MutexGuard<'a, T>>,
    prior: Ipl,
}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
        }
    }

    /// Raise to `Dispatch` and spin until the lock is ours
    pub fn acquire(&self) -> SpinLockGuard<'_, T> {
        let prior = ipl::raise(Ipl::Dispatch);
        SpinLockGuard {
            guard: ManuallyDrop::new(self.inner.lock()),
            prior,
        }
    }

    /// Take the lock only if it is free right now
    pub fn try_acquire(&self) -> Option<SpinLockGuard<'_, T>> {
        let prior = ipl::raise(Ipl::Dispatch);
        match self.inner.try_lock() {
            Some(guard) => Some(SpinLockGuard {
                guard: ManuallyDrop::new(guard),
                prior,
            }),
            None => {
                ipl::lower(prior);
                None
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T> fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinLock")
            .field("locked", &self.is_locked())
            .finish()
    }
}

impl<'a, T> SpinLockGuard<'a, T> {
    /// IPL that will be restored on release
    pub fn prior_ipl(&self) -> Ipl {
        self.prior
    }

    /// Explicit release, returning the IPL now in effect
    pub fn unlock(self) -> Ipl {
        let prior = self.prior;
        drop(self);
        prior
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: the inner guard is dropped exactly once, here.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        ipl::lower(self.prior);
    }
}

// ============================================================================
// Blocking Mutex
// ============================================================================

/// Mutex for state that is held across long operations
///
/// Waiting is only legal below `Dispatch`.
pub struct KMutex<T> {
    inner: spin::Mutex<T>,
}

pub type KMutexGuard<'a, T> = spin::MutexGuard<'a, T>;

impl<T> KMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
        }
    }

    /// Wait for the mutex
    ///
    /// `reason` names the waiter in trace output.
    pub fn wait(
        &self,
        reason: &'static str,
        timeout: Timeout,
    ) -> Result<KMutexGuard<'_, T>, TimedOut> {
        assert!(
            ipl::blocking_allowed(),
            "{}: blocking wait at {:?}",
            reason,
            ipl::current()
        );

        if let Some(guard) = self.inner.try_lock() {
            return Ok(guard);
        }

        log::trace!("{}: mutex contended", reason);
        let mut deadline = Deadline::new(timeout);
        loop {
            if deadline.expired() {
                return Err(TimedOut);
            }
            relax();
            if let Some(guard) = self.inner.try_lock() {
                return Ok(guard);
            }
        }
    }

    /// Wait without a deadline
    pub fn lock(&self, reason: &'static str) -> KMutexGuard<'_, T> {
        loop {
            if let Ok(guard) = self.wait(reason, Timeout::Infinite) {
                return guard;
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T> fmt::Debug for KMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KMutex")
            .field("locked", &self.is_locked())
            .finish()
    }
}

// ============================================================================
// Event
// ============================================================================

/// Notification event; stays signalled until cleared
#[derive(Debug)]
pub struct KEvent {
    signalled: AtomicBool,
}

impl KEvent {
    pub const fn new(signalled: bool) -> Self {
        Self {
            signalled: AtomicBool::new(signalled),
        }
    }

    pub fn signal(&self) {
        self.signalled.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.signalled.store(false, Ordering::Release);
    }

    pub fn is_signalled(&self) -> bool {
        self.signalled.load(Ordering::Acquire)
    }

    pub fn wait(&self, timeout: Timeout) -> Result<(), TimedOut> {
        let mut deadline = Deadline::new(timeout);
        while !self.is_signalled() {
            if deadline.expired() {
                return Err(TimedOut);
            }
            relax();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;

    #[test]
    fn test_spinlock_raises_and_restores_ipl() {
        let lock = SpinLock::new(5u32);
        assert_eq!(ipl::current(), Ipl::Passive);
        {
            let mut guard = lock.acquire();
            assert_eq!(ipl::current(), Ipl::Dispatch);
            assert_eq!(guard.prior_ipl(), Ipl::Passive);
            *guard += 1;
            assert!(lock.try_acquire().is_none());
            assert_eq!(ipl::current(), Ipl::Dispatch);
        }
        assert_eq!(ipl::current(), Ipl::Passive);
        assert!(!lock.is_locked());

        let guard = lock.acquire();
        assert_eq!(*guard, 6);
        assert_eq!(guard.unlock(), Ipl::Passive);
        assert_eq!(ipl::current(), Ipl::Passive);
    }

    #[test]
    fn test_guard_reaches_inner_release() {
        struct Pool {
            held: u32,
        }
        impl Pool {
            fn release(&mut self, n: u32) -> u32 {
                self.held -= n;
                self.held
            }
        }

        let lock = SpinLock::new(Pool { held: 5 });
        let mut guard = lock.acquire();
        assert_eq!(guard.release(2), 3);
        drop(guard);
        assert_eq!(ipl::current(), Ipl::Passive);
        assert_eq!(lock.into_inner().held, 3);
    }

    #[test]
    fn test_spinlocks_nest() {
        let a = SpinLock::new(());
        let b = SpinLock::new(());
        let ga = a.acquire();
        let gb = b.acquire();
        assert_eq!(gb.prior_ipl(), Ipl::Dispatch);
        drop(gb);
        assert_eq!(ipl::current(), Ipl::Dispatch);
        drop(ga);
        assert_eq!(ipl::current(), Ipl::Passive);
    }

    #[test]
    fn test_kmutex_timeouts() {
        let m = KMutex::new(0u32);
        let held = m.wait("test", Timeout::Infinite).unwrap();
        assert_eq!(m.wait("test", Timeout::POLL).err(), Some(TimedOut));
        assert_eq!(m.wait("test", Timeout::from_nanos(1_000)).err(), Some(TimedOut));
        drop(held);
        assert!(m.wait("test", Timeout::POLL).is_ok());
    }

    #[test]
    #[should_panic(expected = "blocking wait")]
    fn test_kmutex_refuses_dispatch_level() {
        let spin = SpinLock::new(());
        let m = KMutex::new(());
        let _g = spin.acquire();
        let _ = m.wait("test", Timeout::POLL);
    }

    #[test]
    fn test_kmutex_serializes_threads() {
        let m = Arc::new(KMutex::new(0u64));
        let handles: alloc::vec::Vec<_> = (0..4)
            .map(|_| {
                let m = m.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        *m.lock("counter") += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*m.lock("counter"), 4000);
    }

    #[test]
    fn test_event() {
        let ev = KEvent::new(false);
        assert_eq!(ev.wait(Timeout::POLL), Err(TimedOut));
        ev.signal();
        assert!(ev.wait(Timeout::Infinite).is_ok());
        assert!(ev.is_signalled());
        ev.clear();
        assert!(!ev.is_signalled());
    }
}
