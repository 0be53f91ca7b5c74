//! A counting semaphore with interruptible, non-blocking, timed and
//! take-all waits, plus a termination state for end-of-stream signalling.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use core::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use crate::error::Error;
use crate::prelude::Result;
use crate::sync::{have_pending_signal, SpinLock};
use crate::task::{self, Task};
use crate::timer;

bitflags::bitflags! {
    pub struct WaitFlags: u32 {
        /// Return `Interrupted` when a deliverable signal is pending.
        const INTR = 1 << 0;
        /// Return `WouldBlock` instead of sleeping.
        const NONBLOCK = 1 << 8;
    }
}

/// Take every available unit instead of a fixed amount.
pub const TAKE_ALL: i64 = -1;

pub(super) struct Waiter {
    task: Arc<Task>,
    requested: i64,
    given: AtomicI64,
    signalled: AtomicBool,
    /// Pollers are woken on any availability but never granted units.
    is_poll: bool,
}

struct SemInner {
    count: i64,
    terminated: bool,
    waiters: VecDeque<Arc<Waiter>>,
}

pub struct Semaphore {
    inner: SpinLock<SemInner>,
}

impl Semaphore {
    pub const fn new(count: i64) -> Self {
        Self {
            inner: SpinLock::new(SemInner {
                count,
                terminated: false,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// The generic wait. `count` is the number of units wanted
    /// ([`TAKE_ALL`] for everything available); zero is refused. A zero
    /// `timeout_nanos` means no timeout. Returns the units granted —
    /// possibly zero, when the semaphore was terminated.
    pub fn wait_gen(&self, count: i64, flags: WaitFlags, timeout_nanos: u64) -> Result<usize> {
        if count == 0 || count < TAKE_ALL {
            return Err(Error::WouldBlock);
        }
        let deadline = (timeout_nanos != 0).then(|| timer::uptime_nanos() + timeout_nanos);
        let mut waiter: Option<Arc<Waiter>> = None;

        loop {
            {
                let mut inner = self.inner.lock_irq_disabled();

                if let Some(w) = &waiter {
                    if w.signalled.load(Ordering::Acquire) {
                        return Ok(w.given.load(Ordering::Acquire) as usize);
                    }
                }

                if inner.terminated && inner.count <= 0 {
                    remove_waiter(&mut inner, &waiter);
                    return Ok(0);
                }

                if inner.count > 0 {
                    let take = if count == TAKE_ALL {
                        inner.count
                    } else {
                        count.min(inner.count)
                    };
                    inner.count -= take;
                    remove_waiter(&mut inner, &waiter);
                    return Ok(take as usize);
                }

                if flags.contains(WaitFlags::NONBLOCK) {
                    remove_waiter(&mut inner, &waiter);
                    return Err(Error::WouldBlock);
                }

                if waiter.is_none() {
                    let w = Arc::new(Waiter {
                        task: task::current(),
                        requested: count,
                        given: AtomicI64::new(0),
                        signalled: AtomicBool::new(false),
                        is_poll: false,
                    });
                    inner.waiters.push_back(w.clone());
                    waiter = Some(w);
                }
            }

            if flags.contains(WaitFlags::INTR) && have_pending_signal() {
                let mut inner = self.inner.lock_irq_disabled();
                // A grant may have raced the signal; prefer the grant.
                if let Some(w) = &waiter {
                    if w.signalled.load(Ordering::Acquire) {
                        return Ok(w.given.load(Ordering::Acquire) as usize);
                    }
                }
                remove_waiter(&mut inner, &waiter);
                return Err(Error::Interrupted);
            }

            match deadline {
                Some(deadline) => {
                    if timer::uptime_nanos() >= deadline {
                        let mut inner = self.inner.lock_irq_disabled();
                        if let Some(w) = &waiter {
                            if w.signalled.load(Ordering::Acquire) {
                                return Ok(w.given.load(Ordering::Acquire) as usize);
                            }
                        }
                        remove_waiter(&mut inner, &waiter);
                        return Err(Error::TimedOut);
                    }
                    let entry = timer::schedule_wakeup(deadline);
                    task::suspend();
                    entry.cancel();
                }
                None => task::suspend(),
            }
        }
    }

    /// Waits for exactly one unit, uninterruptibly. Lock-style use; do
    /// not call on semaphores that can be terminated.
    pub fn wait(&self) {
        let granted = self.wait_gen(1, WaitFlags::empty(), 0).expect("plain wait failed");
        assert!(granted == 1, "waited on a terminated semaphore");
    }

    pub fn signal(&self, count: i64) {
        let mut to_wake = alloc::vec::Vec::new();
        {
            let mut inner = self.inner.lock_irq_disabled();
            if inner.terminated {
                return;
            }
            inner.count += count;

            // Walk the FIFO, granting each waiter what can be granted and
            // nudging the pollers; stop when the units run out.
            let mut index = 0;
            while index < inner.waiters.len() {
                if inner.count <= 0 {
                    break;
                }
                let w = inner.waiters[index].clone();
                if w.is_poll {
                    w.signalled.store(true, Ordering::Release);
                    inner.waiters.remove(index);
                    to_wake.push(w);
                    continue;
                }
                let give = w.requested.min(inner.count);
                inner.count -= give;
                w.given.store(give, Ordering::Release);
                w.signalled.store(true, Ordering::Release);
                inner.waiters.remove(index);
                to_wake.push(w);
            }
        }
        for w in to_wake {
            task::wake(&w.task);
        }
    }

    /// Marks the end of the stream: every current and future wait
    /// completes with zero units, without blocking.
    pub fn terminate(&self) {
        let mut to_wake = alloc::vec::Vec::new();
        {
            let mut inner = self.inner.lock_irq_disabled();
            inner.terminated = true;
            while let Some(w) = inner.waiters.pop_front() {
                w.signalled.store(true, Ordering::Release);
                to_wake.push(w);
            }
        }
        for w in to_wake {
            task::wake(&w.task);
        }
    }

    pub(super) fn is_free(&self) -> bool {
        let inner = self.inner.lock_irq_disabled();
        inner.terminated || inner.count > 0
    }

    pub(super) fn register_poller(&self) -> Arc<Waiter> {
        let w = Arc::new(Waiter {
            task: task::current(),
            requested: 0,
            given: AtomicI64::new(0),
            signalled: AtomicBool::new(false),
            is_poll: true,
        });
        self.inner.lock_irq_disabled().waiters.push_back(w.clone());
        w
    }

    pub(super) fn unregister_poller(&self, poller: &Arc<Waiter>) {
        self.inner
            .lock_irq_disabled()
            .waiters
            .retain(|w| !Arc::ptr_eq(w, poller));
    }
}

fn remove_waiter(inner: &mut SemInner, waiter: &Option<Arc<Waiter>>) {
    if let Some(w) = waiter {
        inner.waiters.retain(|other| !Arc::ptr_eq(other, w));
    }
}

#[if_cfg_ktest]
mod test {
    use super::*;
    use crate::error::Error;

    #[ktest]
    fn nonblocking_wait_on_empty() {
        let sem = Semaphore::new(0);
        assert_eq!(
            sem.wait_gen(1, WaitFlags::NONBLOCK, 0),
            Err(Error::WouldBlock)
        );
    }

    #[ktest]
    fn grants_up_to_available() {
        let sem = Semaphore::new(0);
        sem.signal(3);
        assert_eq!(sem.wait_gen(2, WaitFlags::empty(), 0), Ok(2));
        assert_eq!(sem.wait_gen(5, WaitFlags::NONBLOCK, 0), Ok(1));
    }

    #[ktest]
    fn take_all_drains() {
        let sem = Semaphore::new(4);
        assert_eq!(sem.wait_gen(TAKE_ALL, WaitFlags::empty(), 0), Ok(4));
        assert_eq!(
            sem.wait_gen(1, WaitFlags::NONBLOCK, 0),
            Err(Error::WouldBlock)
        );
    }

    #[ktest]
    fn terminated_waits_return_zero() {
        let sem = Semaphore::new(0);
        sem.terminate();
        assert_eq!(sem.wait_gen(1, WaitFlags::empty(), 0), Ok(0));
        // Signals after termination are discarded.
        sem.signal(1);
        assert_eq!(sem.wait_gen(1, WaitFlags::empty(), 0), Ok(0));
    }
}
