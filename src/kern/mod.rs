//! Kernel primitives the VM core relies on
//!
//! - `ipl`: interrupt priority level tracking
//! - `lock`: spin lock, blocking mutex and event
//! - `timer`: time source and timeouts for bounded waits

pub mod ipl;
pub mod lock;
pub mod timer;

pub use ipl::Ipl;
pub use lock::{KEvent, KMutex, KMutexGuard, SpinLock, SpinLockGuard, TimedOut};
pub use timer::Timeout;
