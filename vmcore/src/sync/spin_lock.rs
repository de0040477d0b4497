//! An interrupt-aware spinlock.
//!
//! Grounded on the teacher's `kernel::sync::spin_lock`, but simplified: the
//! teacher tracks a per-CPU interrupt-disable nesting counter so that
//! holding several locks on one hart only re-enables interrupts once the
//! outermost guard drops. This core's contract is per-critical-section
//! rather than per-hart-nesting, so the sampled interrupt-enable flag
//! lives in the guard itself: `lock()` samples, disables, and acquires;
//! `unlock()` releases and restores exactly what it sampled. Nesting two
//! of these locks on one hart works (the inner lock samples "disabled" and
//! restores "disabled"), it just doesn't share the teacher's single
//! counter.

use core::{
    cell::UnsafeCell,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

use mutex_api::Mutex;

use crate::hal::Hal;

/// A mutual-exclusion lock that disables interrupts on this hart for the
/// duration of the critical section, restoring whatever the interrupt
/// state was when the lock was acquired.
pub struct SpinLock<T, H> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
    _hal: PhantomData<H>,
}

unsafe impl<T: Send, H> Sync for SpinLock<T, H> {}

impl<T, H: Hal> SpinLock<T, H> {
    /// Creates a new unlocked spinlock protecting `value`.
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
            _hal: PhantomData,
        }
    }

    /// Acquires the lock, spinning until it is available.
    pub fn lock(&self) -> SpinLockGuard<'_, T, H> {
        let interrupts_were_enabled = H::is_interrupt_enabled();
        H::disable_interrupt();
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        SpinLockGuard {
            lock: self,
            interrupts_were_enabled,
        }
    }

    /// Attempts to acquire the lock without spinning.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T, H>> {
        let interrupts_were_enabled = H::is_interrupt_enabled();
        H::disable_interrupt();
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinLockGuard {
                lock: self,
                interrupts_were_enabled,
            })
        } else {
            if interrupts_were_enabled {
                H::enable_interrupt();
            }
            None
        }
    }
}

impl<T, H: Hal> Mutex for SpinLock<T, H> {
    type Data = T;
    type Guard<'a>
        = SpinLockGuard<'a, T, H>
    where
        Self: 'a;

    fn new(data: Self::Data) -> Self {
        Self::new(data)
    }

    fn lock(&self) -> Self::Guard<'_> {
        self.lock()
    }
}

/// RAII guard returned by [`SpinLock::lock`].
pub struct SpinLockGuard<'a, T, H: Hal> {
    lock: &'a SpinLock<T, H>,
    interrupts_were_enabled: bool,
}

unsafe impl<T: Send, H: Hal> Send for SpinLockGuard<'_, T, H> {}
unsafe impl<T: Sync, H: Hal> Sync for SpinLockGuard<'_, T, H> {}

impl<T, H: Hal> Deref for SpinLockGuard<'_, T, H> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T, H: Hal> DerefMut for SpinLockGuard<'_, T, H> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T, H: Hal> Drop for SpinLockGuard<'_, T, H> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        if self.interrupts_were_enabled {
            H::enable_interrupt();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{hal::Hal, mock_hal::MockHal};

    #[test]
    fn mutual_exclusion_and_restore() {
        MockHal::reset();
        let lock = SpinLock::<u32, MockHal>::new(0);
        MockHal::enable_interrupt();

        {
            let mut guard = lock.lock();
            assert!(!MockHal::is_interrupt_enabled());
            *guard += 1;
        }
        assert!(MockHal::is_interrupt_enabled());
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn try_lock_fails_while_held() {
        MockHal::reset();
        let lock = SpinLock::<u32, MockHal>::new(0);
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }
}
