//! Waiting on any of a group of semaphores.

use alloc::vec::Vec;

use crate::error::Error;
use crate::prelude::Result;
use crate::sync::{have_pending_signal, Semaphore, WaitFlags};
use crate::task;
use crate::timer;

/// Most semaphores one poll may watch.
pub const POLL_MAX: usize = 1024;

/// Waits until at least one of `sems` is signallable or terminated, and
/// sets the matching bit in `bitmap` for each free entry. `None` entries
/// never become free. Returns how many are free; zero means the timeout
/// elapsed (or `NONBLOCK` found nothing). Bits are only ever set, never
/// cleared. Spurious wakeups are allowed: a "free" semaphore may be
/// drained by another thread before the caller gets to it, so acquire
/// with `NONBLOCK` afterwards.
pub fn poll_semaphores(
    sems: &[Option<&Semaphore>],
    bitmap: &mut [u8],
    flags: WaitFlags,
    timeout_nanos: u64,
) -> Result<usize> {
    if sems.len() > POLL_MAX {
        return Err(Error::InvalidArgs);
    }
    let deadline = (timeout_nanos != 0).then(|| timer::uptime_nanos() + timeout_nanos);

    loop {
        let mut free = 0;
        for (index, sem) in sems.iter().enumerate() {
            if let Some(sem) = sem {
                if sem.is_free() {
                    bitmap[index / 8] |= 1 << (index % 8);
                    free += 1;
                }
            }
        }
        if free > 0 {
            return Ok(free);
        }
        if flags.contains(WaitFlags::NONBLOCK) {
            return Ok(0);
        }
        if flags.contains(WaitFlags::INTR) && have_pending_signal() {
            return Err(Error::Interrupted);
        }
        if let Some(deadline) = deadline {
            if timer::uptime_nanos() >= deadline {
                return Ok(0);
            }
        }

        // Sleep registered on every semaphore; any signal or termination
        // wakes us for another scan.
        let pollers: Vec<_> = sems
            .iter()
            .copied()
            .flatten()
            .map(|sem| (sem, sem.register_poller()))
            .collect();

        // Availability may have appeared between the scan and the
        // registration; a wake would then already be pending, which the
        // wake counter turns into an immediate return from suspend.
        let any_free = sems
            .iter()
            .flatten()
            .any(|sem| sem.is_free());
        if !any_free {
            match deadline {
                Some(deadline) => {
                    let entry = timer::schedule_wakeup(deadline);
                    task::suspend();
                    entry.cancel();
                }
                None => task::suspend(),
            }
        }

        for (sem, poller) in &pollers {
            sem.unregister_poller(poller);
        }
    }
}
