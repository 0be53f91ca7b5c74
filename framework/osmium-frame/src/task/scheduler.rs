//! The scheduler: per-CPU runqueues under one global lock.
//!
//! All queue state and every task's wake counter are mutated only while
//! the global scheduler spinlock is held. The lock is deliberately held
//! *across* the context switch: the thread that gets switched in releases
//! it, so no CPU can ever observe a half-saved thread in a runqueue. The
//! lock discipline is the raw acquire/release pair below rather than the
//! guard-based `SpinLock`, exactly because of that handoff.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use spin::Once;
use x86_64::instructions::interrupts;

use crate::arch;
use crate::config::SCHED_NUM_BANDS;
use crate::cpu::{self, Cpu};

use super::task::{Task, TaskOptions, __context_switch, Priority};

struct SchedInner {
    /// `queues[cpu][band]`, band 0 most urgent.
    queues: Vec<[VecDeque<Arc<Task>>; SCHED_NUM_BANDS]>,
    /// Which CPUs are currently in their idle loop.
    idling: Vec<bool>,
    /// Terminated-or-terminating detached tasks awaiting the cleanup
    /// thread.
    detached: Vec<Arc<Task>>,
    cleanup: Option<Arc<Task>>,
}

struct SchedLock {
    locked: AtomicBool,
    inner: UnsafeCell<SchedInner>,
}

// Safety: `inner` is only touched between acquire/release.
unsafe impl Sync for SchedLock {}

static SCHED: Once<SchedLock> = Once::new();

/// Round-robin assignment of new tasks to CPUs.
static NEXT_HOME: AtomicUsize = AtomicUsize::new(0);

fn sched() -> &'static SchedLock {
    SCHED.get().expect("scheduler not initialized")
}

/// Disables IRQs and takes the scheduler lock; returns whether IRQs were
/// enabled so release can restore them.
fn acquire() -> bool {
    let were_enabled = interrupts::are_enabled();
    if were_enabled {
        interrupts::disable();
    }
    let lock = sched();
    while lock
        .locked
        .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        core::hint::spin_loop();
    }
    were_enabled
}

fn release(irqs_were_enabled: bool) {
    sched().locked.store(false, Ordering::Release);
    if irqs_were_enabled {
        interrupts::enable();
    }
}

/// The guarded state; caller must hold the lock.
#[allow(clippy::mut_from_ref)]
unsafe fn inner() -> &'static mut SchedInner {
    &mut *sched().inner.get()
}

pub(crate) fn init_local() {
    let cpu = cpu::this_cpu();
    let startup = Task::new_current_flow(false);
    startup.home_cpu.store(cpu.index(), Ordering::SeqCst);
    // Safety: nothing else references this CPU's current slot yet.
    unsafe { *cpu.current_task.get() = Some(startup) };

    let idle = Task::new_idle().expect("failed to build the idle task");
    idle.home_cpu.store(cpu.index(), Ordering::SeqCst);
    cpu.idle_task.call_once(|| idle);
}

/// On an AP the startup flow itself becomes the idle loop, so the idle
/// task adopts the current stack.
pub(crate) fn init_local_ap() {
    let cpu = cpu::this_cpu();
    let idle = Task::new_current_flow(true);
    idle.home_cpu.store(cpu.index(), Ordering::SeqCst);
    cpu.idle_task.call_once(|| idle.clone());
    // Safety: as in init_local.
    unsafe { *cpu.current_task.get() = Some(idle) };
}

/// Builds the global queues and spawns the detached-cleanup thread. Must
/// run after the CPU table is final.
pub(crate) fn init_global() {
    let count = cpu::num_cpus().max(1);
    SCHED.call_once(|| SchedLock {
        locked: AtomicBool::new(false),
        inner: UnsafeCell::new(SchedInner {
            queues: (0..count)
                .map(|_| core::array::from_fn(|_| VecDeque::new()))
                .collect(),
            idling: alloc::vec![false; count],
            detached: Vec::new(),
            cleanup: None,
        }),
    });

    let cleanup = TaskOptions::new(cleanup_loop)
        .priority(Priority::High)
        .spawn()
        .expect("failed to spawn the cleanup thread");
    let prev = acquire();
    // Safety: lock held.
    unsafe { inner().cleanup = Some(cleanup) };
    release(prev);
}

/// The current task. Panics before `init_local`.
pub fn current() -> Arc<Task> {
    try_current().expect("no current task on this CPU yet")
}

pub fn try_current() -> Option<Arc<Task>> {
    if SCHED.get().is_none() {
        return None;
    }
    let cpu = cpu::this_cpu();
    // Reading our own current slot races only with our own dispatch.
    let _irq = crate::trap::disable_local();
    // Safety: per-CPU slot, interrupts off.
    unsafe { (*cpu.current_task.get()).clone() }
}

/// Enqueues at the tail of the task's band on its home CPU. Lock held.
unsafe fn enqueue_locked(task: Arc<Task>) {
    let home = task.home_cpu.load(Ordering::SeqCst);
    let band = task.band as usize;
    let state = inner();
    state.queues[home][band].push_back(task);
    // A sleeping home CPU has work now.
    if state.idling[home] && home != cpu::this_cpu().index() {
        state.idling[home] = false;
        cpu::wake_cpu(home);
    }
}

/// Picks the next runnable task for this CPU: highest non-empty band,
/// round-robin within the band. Falls back to the idle task.
unsafe fn pick_next(cpu: &'static Cpu) -> Arc<Task> {
    let state = inner();
    for band in 0..SCHED_NUM_BANDS {
        if let Some(task) = state.queues[cpu.index()][band].pop_front() {
            state.idling[cpu.index()] = false;
            return task;
        }
    }
    state.idling[cpu.index()] = true;
    cpu.idle_task.get().expect("idle task missing").clone()
}

/// Indicates a reason to wake the given thread. On the zero-to-one edge
/// of the wake counter the thread goes runnable; otherwise the increment
/// just pre-pays a future suspend.
pub fn wake(task: &Arc<Task>) {
    let prev = acquire();
    // Safety: lock held.
    unsafe {
        let state = task.sched_state();
        state.wake_counter += 1;
        if state.wake_counter == 1 && !task.has_exited() && !task.is_idle {
            enqueue_locked(task.clone());
        }
    }
    release(prev);
}

pub(crate) fn assign_home_cpu(task: &Arc<Task>) {
    let count = cpu::num_cpus().max(1);
    let home = NEXT_HOME.fetch_add(1, Ordering::Relaxed) % count;
    task.home_cpu.store(home, Ordering::SeqCst);
}

/// Consumes one wake reason; if none remain, yields until one arrives.
pub fn suspend() {
    let prev = acquire();
    let cpu = cpu::this_cpu();
    // Safety: current slot of our own CPU, lock held.
    let current = unsafe { (*cpu.current_task.get()).clone() }.expect("suspend with no task");
    // Safety: lock held.
    let state = unsafe { current.sched_state() };
    state.wake_counter -= 1;
    if state.wake_counter < 0 {
        // Only the idle flow may over-suspend.
        state.wake_counter = 0;
    }
    if state.wake_counter == 0 && !current.is_idle {
        dispatch(prev);
    } else {
        release(prev);
    }
}

/// Timer-tick preemption: the running thread goes to the back of its
/// band and the highest-priority work runs next.
pub fn preempt() {
    if SCHED.get().is_none() {
        // A tick can fire between timer calibration and scheduler
        // bring-up; there is nothing to switch to yet.
        crate::timer::rearm_quantum();
        return;
    }
    let prev = acquire();
    let cpu = cpu::this_cpu();
    // Safety: as in suspend.
    let current = unsafe { (*cpu.current_task.get()).clone() }.expect("preempt with no task");
    if current.is_idle {
        crate::timer::rearm_quantum();
        release(prev);
        return;
    }
    // Safety: lock held.
    unsafe { enqueue_locked(current) };
    dispatch(prev);
}

/// Voluntarily gives up the CPU but stays runnable.
pub fn yield_now() {
    preempt();
}

/// Terminates the calling thread: stores the return value, hands the
/// joiner (or the cleanup thread) its wake, and never returns.
pub fn exit(retval: usize) -> ! {
    let prev = acquire();
    let cpu = cpu::this_cpu();
    // Safety: as in suspend.
    let current = unsafe { (*cpu.current_task.get()).clone() }.expect("exit with no task");
    // Safety: lock held; retval is read only after `exited` is set.
    unsafe {
        current.set_retval(retval);
        current.exited.store(true, Ordering::Release);
        let state = current.sched_state();
        if let Some(joiner) = state.joiner.take() {
            wake_locked(&joiner);
        } else if state.detached {
            if let Some(cleanup) = inner().cleanup.clone() {
                wake_locked(&cleanup);
            }
        }
    }
    dispatch(prev);
    unreachable!("an exited task was dispatched again");
}

/// Blocks until `task` terminates and returns its exit value. Takes
/// ownership: the stack is freed when the last handle drops.
pub fn join(task: Arc<Task>) -> usize {
    loop {
        let prev = acquire();
        if task.has_exited() {
            release(prev);
            break;
        }
        // Safety: lock held.
        unsafe { task.sched_state().joiner = Some(current()) };
        release(prev);
        suspend();
    }
    // Safety: exited is set with Release ordering before any joiner wake.
    unsafe { task.retval() }
}

/// Renounces ownership; the cleanup thread reaps the task when it exits.
pub fn detach(task: Arc<Task>) {
    let prev = acquire();
    if task.has_exited() {
        release(prev);
        // Dropping the handle frees the task.
        return;
    }
    // Safety: lock held.
    unsafe {
        task.sched_state().detached = true;
        inner().detached.push(task);
    }
    release(prev);
}

/// Wake without taking the lock; caller already holds it.
unsafe fn wake_locked(task: &Arc<Task>) {
    let state = task.sched_state();
    state.wake_counter += 1;
    if state.wake_counter == 1 && !task.has_exited() && !task.is_idle {
        enqueue_locked(task.clone());
    }
}

/// The detached-task reaper.
fn cleanup_loop() {
    loop {
        super::suspend();
        let mut reaped = Vec::new();
        let prev = acquire();
        // Safety: lock held.
        unsafe {
            inner().detached.retain(|task| {
                if task.has_exited() {
                    reaped.push(task.clone());
                    false
                } else {
                    true
                }
            });
        }
        release(prev);
        // Last handles drop here, outside the lock.
        drop(reaped);
    }
}

/// Switches away from the current task. Called with the lock held; the
/// lock travels across the switch and is released by whatever runs next
/// on this CPU.
fn dispatch(irqs_were_enabled: bool) {
    let cpu = cpu::this_cpu();
    // Safety: lock held throughout.
    unsafe {
        let current = (*cpu.current_task.get()).clone().expect("dispatch with no task");
        let next = pick_next(cpu);
        if Arc::ptr_eq(&current, &next) {
            // Nothing better to run; keep going.
            crate::timer::rearm_quantum();
            release(irqs_were_enabled);
            return;
        }

        // Install the next thread's world: translation root, FS base and
        // the kernel stack the hardware will switch to on traps.
        let root = next.root().unwrap_or_else(crate::vm::page_table::kernel_root);
        if crate::vm::page_table::get_root() != root {
            crate::vm::page_table::set_root(root);
        } else {
            cpu::publish_current_root(root);
        }
        let stack_top = next.kstack.top();
        if stack_top != 0 {
            cpu.set_kernel_stack(stack_top);
        }

        let cur_ctx = current.ctx.get();
        let next_ctx = next.ctx.get();
        *cpu.current_task.get() = Some(next);
        // Park the outgoing handle where the incoming thread can drop it
        // once the switch is complete (never on the outgoing stack).
        debug_assert!((*cpu.prev_task.get()).is_none());
        *cpu.prev_task.get() = Some(current);

        crate::timer::rearm_quantum();
        __context_switch(cur_ctx, next_ctx);

        // We are back on this CPU (possibly a different one than where we
        // left off -- re-read). The lock is still held by convention.
        finish_switch_locked(irqs_were_enabled);
    }
}

/// Runs on the incoming side of every switch: drops the outgoing task's
/// parked handle and releases the lock.
unsafe fn finish_switch_locked(irqs_were_enabled: bool) {
    let cpu = cpu::this_cpu();
    let prev_task = (*cpu.prev_task.get()).take();
    release(irqs_were_enabled);
    drop(prev_task);
}

/// First code of every fresh kernel thread: finish the switch protocol,
/// enable interrupts, run the payload.
pub(super) extern "C" fn kernel_task_entry() -> ! {
    // Safety: we were just switched to, so the lock is held.
    unsafe { finish_switch_locked(true) };
    let task = current();
    // Safety: the spawn path set the function and nobody took it yet.
    let func = unsafe { task.take_func() }.expect("fresh task without a function");
    func();
    exit(0);
}

/// Entry of a dedicated idle task (the BSP case; APs adopt their startup
/// flow instead).
pub(super) extern "C" fn idle_task_entry() -> ! {
    // Safety: as above.
    unsafe { finish_switch_locked(true) };
    idle_loop();
}

/// The idle loop: run anything runnable, otherwise halt until an
/// interrupt. The interrupt window is closed between the queue check and
/// the `hlt`, so a wake IPI cannot slip through unseen.
pub fn idle_loop() -> ! {
    loop {
        interrupts::disable();
        let prev = acquire();
        let cpu = cpu::this_cpu();
        let has_work = {
            // Safety: lock held.
            let state = unsafe { inner() };
            state.queues[cpu.index()].iter().any(|q| !q.is_empty())
        };
        if has_work {
            dispatch(prev);
            // Returned from dispatch: we are idle again, IRQs still off.
        } else {
            // Safety: lock held.
            unsafe { inner().idling[cpu.index()] = true };
            release(false);
            arch::idle_wait();
        }
    }
}
