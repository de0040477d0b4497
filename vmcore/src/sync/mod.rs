//! Interrupt-aware spinlock.

mod spin_lock;

pub use spin_lock::{SpinLock, SpinLockGuard};
