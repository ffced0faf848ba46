//! Kernel time source for bounded waits
//!
//! With `std` the host monotonic clock is used. Otherwise time is a
//! nanosecond counter advanced by the platform clock interrupt through
//! [`advance`].

use core::sync::atomic::{AtomicU64, Ordering};

/// Rough cost of one relax iteration while spinning on a lock, used when
/// the clock does not move during a wait
pub const SPIN_ESTIMATE_NS: u64 = 100;

static TICKS_NS: AtomicU64 = AtomicU64::new(0);

/// Advance the tick counter by `ns` nanoseconds
pub fn advance(ns: u64) {
    TICKS_NS.fetch_add(ns, Ordering::Relaxed);
}

#[cfg(any(test, feature = "std"))]
fn host_ns() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;

    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as u64
}

#[cfg(not(any(test, feature = "std")))]
fn host_ns() -> u64 {
    0
}

/// Monotonic nanoseconds since an arbitrary epoch
pub fn now_ns() -> u64 {
    host_ns() + TICKS_NS.load(Ordering::Relaxed)
}

/// Relative timeout for kernel waits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Wait until the condition is met
    Infinite,
    /// Give up after this many nanoseconds; zero polls once
    Nanos(u64),
}

impl Timeout {
    /// Poll without waiting
    pub const POLL: Self = Self::Nanos(0);

    /// Convert the kernel's signed convention: `-1` waits forever
    pub const fn from_nanos(nanos: i64) -> Self {
        if nanos < 0 {
            Self::Infinite
        } else {
            Self::Nanos(nanos as u64)
        }
    }
}

/// Deadline tracker for a single wait
#[derive(Debug)]
pub(crate) struct Deadline {
    start: u64,
    limit: Option<u64>,
    spins: u64,
}

impl Deadline {
    pub(crate) fn new(timeout: Timeout) -> Self {
        Self {
            start: now_ns(),
            limit: match timeout {
                Timeout::Infinite => None,
                Timeout::Nanos(ns) => Some(ns),
            },
            spins: 0,
        }
    }

    /// Account one relax iteration and report whether time is up
    pub(crate) fn expired(&mut self) -> bool {
        let Some(limit) = self.limit else {
            return false;
        };
        self.spins += 1;
        let elapsed = now_ns()
            .saturating_sub(self.start)
            .max(self.spins.saturating_mul(SPIN_ESTIMATE_NS));
        elapsed >= limit
    }
}

/// Back off while waiting for another holder
pub(crate) fn relax() {
    #[cfg(any(test, feature = "std"))]
    std::thread::yield_now();
    #[cfg(not(any(test, feature = "std")))]
    core::hint::spin_loop();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_conversion() {
        assert_eq!(Timeout::from_nanos(-1), Timeout::Infinite);
        assert_eq!(Timeout::from_nanos(0), Timeout::POLL);
        assert_eq!(Timeout::from_nanos(500), Timeout::Nanos(500));
    }

    #[test]
    fn test_deadline_expires() {
        let mut poll = Deadline::new(Timeout::POLL);
        assert!(poll.expired());

        let mut forever = Deadline::new(Timeout::Infinite);
        for _ in 0..1000 {
            assert!(!forever.expired());
        }

        let mut bounded = Deadline::new(Timeout::Nanos(10 * SPIN_ESTIMATE_NS));
        let mut spins = 0;
        while !bounded.expired() {
            spins += 1;
        }
        assert!(spins < 10);
    }

    #[test]
    fn test_clock_is_monotonic() {
        let a = now_ns();
        advance(1_000);
        let b = now_ns();
        assert!(b >= a + 1_000);
    }
}
