use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::trap::irq::{disable_local, DisabledLocalIrqGuard};

/// A spin lock.
///
/// This is the foundation every other lock is built on: it is the only
/// primitive that is safe to take from interrupt context, and the blocking
/// primitives use it to guard their own waiter queues.
pub struct SpinLock<T: ?Sized> {
    lock: AtomicBool,
    val: UnsafeCell<T>,
}

impl<T> SpinLock<T> {
    pub const fn new(val: T) -> Self {
        Self {
            lock: AtomicBool::new(false),
            val: UnsafeCell::new(val),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquires the lock with local IRQs disabled, restoring the previous
    /// interrupt state when the guard drops. Use this whenever the lock is
    /// also taken from an interrupt handler.
    pub fn lock_irq_disabled(&self) -> SpinLockIrqDisabledGuard<'_, T> {
        let irq_guard = disable_local();
        self.acquire_lock();
        SpinLockIrqDisabledGuard {
            lock: self,
            _irq_guard: irq_guard,
        }
    }

    /// Acquires the lock without touching the interrupt flag. Only valid
    /// for locks never taken from interrupt context.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.acquire_lock();
        SpinLockGuard { lock: self }
    }

    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self.try_acquire_lock() {
            return Some(SpinLockGuard { lock: self });
        }
        None
    }

    fn acquire_lock(&self) {
        while !self.try_acquire_lock() {
            core::hint::spin_loop();
        }
    }

    fn try_acquire_lock(&self) -> bool {
        self.lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn release_lock(&self) {
        self.lock.store(false, Ordering::Release);
    }
}

impl<T: fmt::Debug> fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&self.val, f)
    }
}

// Safety: only one lock holder may access the inner data at a time.
unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

pub struct SpinLockIrqDisabledGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    _irq_guard: DisabledLocalIrqGuard,
}

impl<'a, T: ?Sized> Deref for SpinLockIrqDisabledGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: guarded by the held lock.
        unsafe { &*self.lock.val.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for SpinLockIrqDisabledGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: guarded by the held lock.
        unsafe { &mut *self.lock.val.get() }
    }
}

impl<'a, T: ?Sized> Drop for SpinLockIrqDisabledGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.release_lock();
        // The IRQ guard drops afterwards, restoring the interrupt state
        // only once the lock is free.
    }
}

impl<'a, T: ?Sized> !Send for SpinLockIrqDisabledGuard<'a, T> {}

pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
}

impl<'a, T: ?Sized> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: guarded by the held lock.
        unsafe { &*self.lock.val.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: guarded by the held lock.
        unsafe { &mut *self.lock.val.get() }
    }
}

impl<'a, T: ?Sized> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.release_lock();
    }
}

impl<'a, T: ?Sized> !Send for SpinLockGuard<'a, T> {}
