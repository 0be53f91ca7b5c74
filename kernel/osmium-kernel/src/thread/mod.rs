//! Kernel-side thread objects.
//!
//! Every thread is an `osmium_frame` task; threads belonging to a process
//! additionally carry a [`Thread`] in the task's data slot, holding the
//! thread id, the process backlink and the per-thread signal state.

use osmium_frame::task::{self, Priority, Task, TaskOptions};
use spin::Once;

use crate::prelude::*;
use crate::process::signal::sig_info::SigInfo;
use crate::process::signal::sig_num::{SigNum, SIG_NUM};
use crate::process::signal::sig_set::SigSet;
use crate::process::Process;

/// Thread id, unique within one process.
pub type Thid = i32;

/// Per-thread signal state: the pending set with its info slots and the
/// blocked mask, under one lock so delivery and the ready-check see a
/// consistent pair.
pub struct ThreadSigState {
    pub pending: SigSet,
    pub info: [SigInfo; SIG_NUM],
    pub blocked: SigSet,
}

pub struct Thread {
    thid: Thid,
    proc: Weak<Process>,
    task: Once<Arc<Task>>,
    pub(crate) sig: SpinLock<ThreadSigState>,
}

impl Thread {
    pub(crate) fn new(thid: Thid, proc: Weak<Process>) -> Arc<Self> {
        Arc::new(Self {
            thid,
            proc,
            task: Once::new(),
            sig: SpinLock::new(ThreadSigState {
                pending: SigSet::new_empty(),
                info: [SigInfo::default(); SIG_NUM],
                blocked: SigSet::new_empty(),
            }),
        })
    }

    pub fn thid(&self) -> Thid {
        self.thid
    }

    pub fn process(&self) -> Option<Arc<Process>> {
        self.proc.upgrade()
    }

    pub(crate) fn bind_task(&self, task: Arc<Task>) {
        self.task.call_once(|| task);
    }

    pub fn task(&self) -> &Arc<Task> {
        self.task.get().expect("thread has no task bound")
    }

    /// The thread object of the calling task, if it belongs to a process.
    /// The task holds its thread weakly (the process's thread table owns
    /// it), so this returns `None` once the thread has been torn down.
    pub fn current() -> Option<Arc<Thread>> {
        let task = task::try_current()?;
        task.data().downcast_ref::<Weak<Thread>>()?.upgrade()
    }

    /// Posts a signal directly to this thread's pending set. Delivery
    /// policy (ignore-dropping, dedup, waking) lives in the signal
    /// module; this is the raw recording step.
    pub(crate) fn post_signal(&self, info: SigInfo) -> bool {
        let signum = info.signum();
        let mut sig = self.sig.lock_irq_disabled();
        if sig.pending.contains(signum) {
            return false;
        }
        sig.pending.add(signum);
        sig.info[signum.as_usize()] = info;
        true
    }

    /// Applies a new blocked mask, keeping the never-blockable signals
    /// clear.
    pub fn set_blocked(&self, blocked: SigSet) {
        self.sig.lock_irq_disabled().blocked = blocked.without_unblockable();
    }

    pub fn blocked(&self) -> SigSet {
        self.sig.lock_irq_disabled().blocked
    }

    /// Spawns the kernel task that carries a process thread. The task
    /// inherits the process translation root before it first runs.
    pub(crate) fn spawn<F>(
        self: &Arc<Self>,
        proc: &Arc<Process>,
        func: F,
    ) -> Result<Arc<Task>>
    where
        F: FnOnce() + Send + 'static,
    {
        let task = TaskOptions::new(func)
            .data(Arc::downgrade(self))
            .priority(Priority::Normal)
            .build()
            .map_err(Error::from)?;
        task.set_root(proc.address_space().root_paddr());
        self.bind_task(task.clone());
        osmium_frame::task::run(&task);
        Ok(task)
    }
}

/// Pops the next deliverable signal for the calling thread, consuming
/// process-pending signals before thread-pending ones.
pub(crate) fn take_ready_signal(thread: &Arc<Thread>) -> Option<SigInfo> {
    let proc = thread.process()?;
    let blocked = thread.blocked();

    {
        let mut proc_sig = proc.sig.lock_irq_disabled();
        let ready = proc_sig.pending & !blocked;
        if let Some(signum) = ready.lowest() {
            let info = proc_sig.info[signum.as_usize()];
            proc_sig.pending.remove(signum);
            return Some(info);
        }
    }

    let mut sig = thread.sig.lock_irq_disabled();
    let ready = sig.pending & !blocked;
    if let Some(signum) = ready.lowest() {
        let info = sig.info[signum.as_usize()];
        sig.pending.remove(signum);
        return Some(info);
    }
    None
}

/// Whether the calling thread has a deliverable signal. Installed into
/// the frame as the probe that makes blocking waits interruptible.
pub(crate) fn have_ready_signals() -> bool {
    let Some(thread) = Thread::current() else {
        return false;
    };
    let Some(proc) = thread.process() else {
        return false;
    };
    let blocked = thread.blocked();
    let pending = thread.sig.lock_irq_disabled().pending
        | proc.sig.lock_irq_disabled().pending;
    !(pending & !blocked).is_empty()
}
