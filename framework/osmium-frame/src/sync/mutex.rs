//! A recursive, FIFO-fair blocking mutex.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use crate::sync::SpinLock;
use crate::task::{self, Task};
use crate::trap::irqs_enabled;

struct MutexState {
    /// The owning task, compared by pointer identity.
    owner: Option<Arc<Task>>,
    /// Re-entry depth of the owner.
    count: usize,
    waiters: VecDeque<Arc<Task>>,
}

/// A blocking lock that the owner may take again; every re-acquisition
/// must be matched by a release.
///
/// On release with waiters present, ownership passes to the head waiter
/// *before* it is woken, so no third thread can slip in between the
/// wakeup and the head's return from `lock` and steal the mutex it was
/// promised.
pub struct Mutex<T: ?Sized> {
    state: SpinLock<MutexState>,
    val: UnsafeCell<T>,
}

impl<T> Mutex<T> {
    pub const fn new(val: T) -> Self {
        Self {
            state: SpinLock::new(MutexState {
                owner: None,
                count: 0,
                waiters: VecDeque::new(),
            }),
            val: UnsafeCell::new(val),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Exclusive access without locking; possible because the borrow
    /// checker proves no one else holds the mutex.
    pub fn get_mut(&mut self) -> &mut T {
        self.val.get_mut()
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        // Sleeping with interrupts off would deadlock the whole CPU, so
        // that is a contract violation, not an error to propagate.
        assert!(
            irqs_enabled(),
            "blocking mutex acquired with interrupts disabled"
        );
        let me = task::current();
        loop {
            {
                let mut state = self.state.lock_irq_disabled();
                match &state.owner {
                    None => {
                        state.owner = Some(me.clone());
                        state.count = 1;
                        return MutexGuard { mutex: self };
                    }
                    Some(owner) if Arc::ptr_eq(owner, &me) => {
                        state.count += 1;
                        return MutexGuard { mutex: self };
                    }
                    Some(_) => {
                        if !state.waiters.iter().any(|w| Arc::ptr_eq(w, &me)) {
                            state.waiters.push_back(me.clone());
                        }
                    }
                }
            }
            task::suspend();
            // Either we were handed ownership on release, or this is a
            // spurious wake; the re-check distinguishes the two.
            let state = self.state.lock_irq_disabled();
            if state
                .owner
                .as_ref()
                .is_some_and(|owner| Arc::ptr_eq(owner, &me))
            {
                return MutexGuard { mutex: self };
            }
        }
    }

    fn unlock(&self) {
        let mut state = self.state.lock_irq_disabled();
        let me = task::current();
        assert!(
            state
                .owner
                .as_ref()
                .is_some_and(|owner| Arc::ptr_eq(owner, &me)),
            "mutex released by a non-owner"
        );
        state.count -= 1;
        if state.count > 0 {
            return;
        }
        if let Some(next) = state.waiters.pop_front() {
            // Transfer ownership while still holding the state lock.
            state.owner = Some(next.clone());
            state.count = 1;
            drop(state);
            task::wake(&next);
        } else {
            state.owner = None;
        }
    }
}

// Safety: the value is only reachable through the guard.
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
}

impl<'a, T: ?Sized> Deref for MutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: we hold the mutex.
        unsafe { &*self.mutex.val.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: we hold the mutex.
        unsafe { &mut *self.mutex.val.get() }
    }
}

impl<'a, T: ?Sized> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

impl<'a, T: ?Sized> !Send for MutexGuard<'a, T> {}
