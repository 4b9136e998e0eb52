//! IPL-raising spinlock.
//!
//! Raises the IPL to HIGH before acquiring and restores the previous level
//! when the guard drops, so interrupt context can never observe the protected
//! data mid-update. On a single cooperative CPU sustained contention is
//! impossible — a lock held across a suspension point is forbidden — so a
//! spin that exceeds the timeout is reported as a deadlock (almost always a
//! recursive acquire) instead of hanging silently.

use crate::arch::intr;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// A lock protecting data of type `T` against interrupt context.
///
/// Holders must not reach a suspension point (sleep, mutex acquire, switch)
/// while the guard is live.
pub struct Spinlock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for Spinlock<T> {}
unsafe impl<T: Send> Send for Spinlock<T> {}

/// RAII guard for a held [`Spinlock`]. Releases the lock and restores the
/// saved IPL on drop.
pub struct SpinlockGuard<'a, T> {
    lock: &'a Spinlock<T>,
    saved_ipl: u8,
}

impl<T> Spinlock<T> {
    pub const fn new(data: T) -> Self {
        Spinlock {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock.
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        // Long enough that transient contention never trips it, short enough
        // to fire before the system looks frozen.
        const SPIN_TIMEOUT: u64 = 500_000_000;

        let saved_ipl = intr::raise_ipl(intr::IPL_HIGH);
        let mut spins: u64 = 0;
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
            spins += 1;
            if spins >= SPIN_TIMEOUT {
                panic!("spinlock: spin timeout (recursive acquire or suspension while held)");
            }
        }
        SpinlockGuard { lock: self, saved_ipl }
    }

    /// Consume the lock and return the protected value.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T> Deref for SpinlockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinlockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        intr::set_ipl(self.saved_ipl);
    }
}
