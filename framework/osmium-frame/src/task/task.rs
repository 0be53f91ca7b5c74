//! The kernel thread object.

use alloc::boxed::Box;
use alloc::sync::Arc;

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::config::KERNEL_STACK_SIZE;
use crate::prelude::*;
use crate::vm::Paddr;

core::arch::global_asm!(include_str!("switch.S"));

extern "C" {
    pub(super) fn __context_switch(cur: *mut TaskContext, nxt: *const TaskContext);
}

/// Callee-saved registers, the only state a cooperative switch keeps.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub(super) struct CalleeRegs {
    pub rsp: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub(super) struct TaskContext {
    pub regs: CalleeRegs,
    pub rip: usize,
}

/// A kernel stack. The scheduler and the user-entry path treat the top
/// as the landing area for traps.
pub(super) struct KernelStack {
    buf: Box<[u8]>,
}

impl KernelStack {
    fn new() -> Result<Self> {
        Ok(Self {
            buf: alloc::vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice(),
        })
    }

    /// A stack record for a flow that already runs on a stack of its own
    /// (the boot flow, AP startup flows).
    fn adopted() -> Self {
        Self { buf: Box::new([]) }
    }

    pub(super) fn top(&self) -> Vaddr {
        if self.buf.is_empty() {
            // Adopted stacks have no recorded extent; callers skip the
            // TSS update for them (such flows never enter user mode).
            return 0;
        }
        self.buf.as_ptr() as Vaddr + self.buf.len()
    }
}

/// Priority bands. Lower value = more urgent; system threads use `High`
/// so user load cannot starve the timer or the cleanup thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    High = 0,
    Normal = 1,
    Low = 2,
    Idle = 3,
}

/// Scheduler-owned mutable state; only ever touched under the global
/// scheduler lock (see scheduler.rs).
pub(super) struct SchedState {
    /// The wake counter: `suspend` decrements and sleeps at zero, `wake`
    /// increments and enqueues on the 0 -> 1 edge. A wake that arrives
    /// before the suspend simply pre-consumes it.
    pub wake_counter: i64,
    pub joiner: Option<Arc<Task>>,
    pub detached: bool,
}

/// A kernel thread.
///
/// User threads are kernel threads whose function enters user mode; the
/// kernel layer hangs its own thread object off `data`.
pub struct Task {
    pub(super) kstack: KernelStack,
    pub(super) ctx: UnsafeCell<TaskContext>,
    func: UnsafeCell<Option<Box<dyn FnOnce() + Send>>>,
    data: Box<dyn Any + Send + Sync>,
    /// Translation root to install when this task runs; zero means the
    /// shared kernel root.
    root: AtomicU64,
    pub(super) band: Priority,
    /// The CPU whose runqueue this task goes back to.
    pub(super) home_cpu: AtomicUsize,
    pub(super) sched: UnsafeCell<SchedState>,
    pub(super) exited: AtomicBool,
    retval: UnsafeCell<usize>,
    pub(super) is_idle: bool,
}

// Safety: the UnsafeCell fields are guarded by the scheduler lock
// (`sched`, `ctx`) or written once before any sharing (`func`, `retval`).
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

impl Task {
    /// The scheduler-owned state; caller must hold the scheduler lock.
    #[allow(clippy::mut_from_ref)]
    pub(super) unsafe fn sched_state(&self) -> &mut SchedState {
        &mut *self.sched.get()
    }

    pub(super) unsafe fn take_func(&self) -> Option<Box<dyn FnOnce() + Send>> {
        (*self.func.get()).take()
    }

    pub(super) unsafe fn set_retval(&self, retval: usize) {
        *self.retval.get() = retval;
    }

    pub(super) unsafe fn retval(&self) -> usize {
        *self.retval.get()
    }

    /// The per-task payload attached at spawn time.
    pub fn data(&self) -> &(dyn Any + Send + Sync) {
        &*self.data
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    /// Sets the translation root installed whenever this task is
    /// dispatched. Zero restores the kernel root.
    pub fn set_root(&self, root: Paddr) {
        self.root.store(root as u64, Ordering::SeqCst);
    }

    pub fn root(&self) -> Option<Paddr> {
        match self.root.load(Ordering::SeqCst) {
            0 => None,
            root => Some(root as Paddr),
        }
    }

    pub(super) fn new_current_flow(is_idle: bool) -> Arc<Task> {
        Arc::new(Task {
            kstack: KernelStack::adopted(),
            ctx: UnsafeCell::new(TaskContext::default()),
            func: UnsafeCell::new(None),
            data: Box::new(()),
            root: AtomicU64::new(0),
            band: if is_idle { Priority::Idle } else { Priority::High },
            home_cpu: AtomicUsize::new(0),
            sched: UnsafeCell::new(SchedState {
                wake_counter: 1,
                joiner: None,
                detached: false,
            }),
            exited: AtomicBool::new(false),
            retval: UnsafeCell::new(0),
            is_idle,
        })
    }

    pub(super) fn new_idle() -> Result<Arc<Task>> {
        let task = Task::build(
            Box::new(|| unreachable!("idle entry is replaced below")),
            Box::new(()),
            Priority::Idle,
            true,
        )?;
        Ok(task)
    }

    fn build(
        func: Box<dyn FnOnce() + Send>,
        data: Box<dyn Any + Send + Sync>,
        band: Priority,
        is_idle: bool,
    ) -> Result<Arc<Task>> {
        let kstack = KernelStack::new()?;
        // Emulate a call: at entry, rsp is 8 past a 16-byte boundary.
        let stack_top = (kstack.top() & !0xF) - 8;
        let entry = if is_idle {
            super::scheduler::idle_task_entry as usize
        } else {
            super::scheduler::kernel_task_entry as usize
        };
        let mut ctx = TaskContext::default();
        ctx.rip = entry;
        ctx.regs.rsp = stack_top as u64;

        Ok(Arc::new(Task {
            kstack,
            ctx: UnsafeCell::new(ctx),
            func: UnsafeCell::new(Some(func)),
            data,
            root: AtomicU64::new(0),
            band,
            home_cpu: AtomicUsize::new(0),
            sched: UnsafeCell::new(SchedState {
                wake_counter: 0,
                joiner: None,
                detached: false,
            }),
            exited: AtomicBool::new(false),
            retval: UnsafeCell::new(0),
            is_idle,
        }))
    }
}

/// Options for spawning a kernel thread.
pub struct TaskOptions {
    func: Option<Box<dyn FnOnce() + Send>>,
    data: Option<Box<dyn Any + Send + Sync>>,
    priority: Priority,
}

impl TaskOptions {
    pub fn new<F>(func: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            func: Some(Box::new(func)),
            data: None,
            priority: Priority::Normal,
        }
    }

    pub fn data<T>(mut self, data: T) -> Self
    where
        T: Any + Send + Sync,
    {
        self.data = Some(Box::new(data));
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Builds the task without scheduling it.
    pub fn build(self) -> Result<Arc<Task>> {
        Task::build(
            self.func.expect("a task needs a function"),
            self.data.unwrap_or_else(|| Box::new(())),
            self.priority,
            false,
        )
    }

    /// Builds the task and makes it runnable. The caller owns the
    /// returned handle and must eventually `join` or `detach` it.
    pub fn spawn(self) -> Result<Arc<Task>> {
        let task = self.build()?;
        super::scheduler::assign_home_cpu(&task);
        super::scheduler::wake(&task);
        Ok(task)
    }
}
