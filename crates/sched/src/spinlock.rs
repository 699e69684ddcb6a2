//! Test-and-set spinlock with a tri-state non-blocking acquire, used by the
//! timer tick handler to avoid blocking inside an interrupt context.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// Result of [`Spinlock::test_and_acq`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestAcqResult {
    /// The lock was free and is now held by the caller.
    Acquired,
    /// The lock was already held by someone else.
    AlreadyHeld,
}

/// A spin-based lock using test-and-set with a `pause` hint on contention.
pub struct Spinlock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: exclusive access is enforced by the atomic flag.
unsafe impl<T: Send> Send for Spinlock<T> {}
unsafe impl<T: Send> Sync for Spinlock<T> {}

impl<T> Spinlock<T> {
    /// Creates a new unlocked spinlock.
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    /// Spins (hinting `pause` to the CPU on each failed attempt) until the
    /// lock is acquired.
    pub fn acquire(&self) -> SpinlockGuard<'_, T> {
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return SpinlockGuard { lock: self };
            }
            core::hint::spin_loop();
        }
    }

    /// Attempts to acquire without blocking, reporting whether the lock was
    /// already held. Used by code that must not block (the timer tick
    /// handler) rather than treating contention as an error.
    pub fn test_and_acq(&self) -> Result<SpinlockGuard<'_, T>, TestAcqResult> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Ok(SpinlockGuard { lock: self })
        } else {
            Err(TestAcqResult::AlreadyHeld)
        }
    }
}

/// RAII guard releasing the [`Spinlock`] on drop.
pub struct SpinlockGuard<'a, T> {
    lock: &'a Spinlock<T>,
}

impl<T> Deref for SpinlockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the guard guarantees exclusive access while it exists.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard guarantees exclusive access while it exists.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinlockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_and_acq_reports_acquired_when_free() {
        let lock = Spinlock::new(0);
        assert!(lock.test_and_acq().is_ok());
    }

    #[test]
    fn test_and_acq_reports_already_held() {
        let lock = Spinlock::new(0);
        let _guard = lock.acquire();
        assert_eq!(lock.test_and_acq().unwrap_err(), TestAcqResult::AlreadyHeld);
    }

    #[test]
    fn guard_releases_on_drop() {
        let lock = Spinlock::new(5);
        {
            let _guard = lock.acquire();
        }
        assert!(lock.test_and_acq().is_ok());
    }
}
