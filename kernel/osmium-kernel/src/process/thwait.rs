//! The futex-style primitive: atomically sleep on an 8-byte user value,
//! and wake the sleepers whose condition a new value satisfies.
//!
//! The waiter list hangs off the physical frame's metadata, so threads
//! of different processes sharing a page (shared mappings) wait and wake
//! each other through it.

use osmium_frame::task;
use osmium_frame::vm::frame_pool::{self, PageBlocker};

use crate::prelude::*;
use crate::thread::have_ready_signals;

/// Wait conditions.
pub const THWAIT_EQUALS: i32 = 0;
pub const THWAIT_NEQUALS: i32 = 1;

fn condition_met(value: u64, compare: u64, not_equal: bool) -> bool {
    if not_equal {
        value != compare
    } else {
        value == compare
    }
}

/// Suspends until the value at `uptr` matches the condition, or a signal
/// becomes deliverable. The pointer must be 8-byte aligned and writable.
///
/// The value is *not* polled: updaters must call [`thread_signal`] after
/// writing, exactly like a futex wake.
pub fn thread_wait(uptr: Vaddr, op: i32, compare: u64) -> Result<()> {
    if op != THWAIT_EQUALS && op != THWAIT_NEQUALS {
        return_errno!(Errno::EINVAL);
    }
    if uptr & 7 != 0 {
        return_errno!(Errno::EINVAL);
    }
    let not_equal = op == THWAIT_NEQUALS;

    let space = current!().address_space();
    let page = space.get_user_page(uptr, true)?;
    let value_ptr = (page + (uptr & 0xFFF)) as *const u64;
    let info = frame_pool::user_page_info(page).expect("pinned page without metadata");

    let me = task::current();
    let read_value = || {
        // Safety: the page is pinned by the reference taken above.
        unsafe { core::ptr::read_volatile(value_ptr) }
    };

    {
        let mut blockers = info.blockers.lock_irq_disabled();
        if condition_met(read_value(), compare, not_equal) {
            drop(blockers);
            space.unref_user_page(page);
            return Ok(());
        }
        blockers.push(PageBlocker {
            offset: uptr as u64 & 0xFFF,
            compare,
            wait_not_equal: not_equal,
            waiter: me.clone(),
        });
    }

    loop {
        if condition_met(read_value(), compare, not_equal) || have_ready_signals() {
            break;
        }
        task::suspend();
    }

    info.blockers
        .lock_irq_disabled()
        .retain(|blocker| !Arc::ptr_eq(&blocker.waiter, &me));

    space.unref_user_page(page);
    Ok(())
}

/// Wakes every blocker on the slot at `uptr` whose condition is
/// satisfied by `new_value` (which the caller has already stored there).
pub fn thread_signal(uptr: Vaddr, new_value: u64) -> Result<()> {
    if uptr & 7 != 0 {
        return_errno!(Errno::EINVAL);
    }
    let space = current!().address_space();
    let page = space.get_user_page(uptr, true)?;
    let offset = uptr as u64 & 0xFFF;

    let info = frame_pool::user_page_info(page).expect("pinned page without metadata");
    let to_wake: Vec<_> = {
        let blockers = info.blockers.lock_irq_disabled();
        blockers
            .iter()
            .filter(|blocker| {
                blocker.offset == offset
                    && condition_met(new_value, blocker.compare, blocker.wait_not_equal)
            })
            .map(|blocker| blocker.waiter.clone())
            .collect()
    };
    for waiter in to_wake {
        task::wake(&waiter);
    }

    space.unref_user_page(page);
    Ok(())
}
