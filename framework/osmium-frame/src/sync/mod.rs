mod mutex;
mod poll;
mod semaphore;
mod spin;

pub use mutex::{Mutex, MutexGuard};
pub use poll::{poll_semaphores, POLL_MAX};
pub use semaphore::{Semaphore, WaitFlags};
pub use self::spin::{SpinLock, SpinLockGuard, SpinLockIrqDisabledGuard};

use core::sync::atomic::{AtomicUsize, Ordering};

/// A hook the kernel layer installs so that interruptible waits can learn
/// whether the current thread has a deliverable signal pending. Before it
/// is installed nothing is ever "pending".
static PENDING_SIGNAL_PROBE: AtomicUsize = AtomicUsize::new(0);

pub fn set_pending_signal_probe(probe: fn() -> bool) {
    PENDING_SIGNAL_PROBE.store(probe as usize, Ordering::Release);
}

pub(crate) fn have_pending_signal() -> bool {
    let probe = PENDING_SIGNAL_PROBE.load(Ordering::Acquire);
    if probe == 0 {
        return false;
    }
    // Safety: only ever stored from `set_pending_signal_probe`.
    let probe: fn() -> bool = unsafe { core::mem::transmute(probe) };
    probe()
}
