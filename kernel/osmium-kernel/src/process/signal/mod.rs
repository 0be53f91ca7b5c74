//! Signal state and delivery.
//!
//! Delivery is two-phase: `deliver_to_process`/`deliver_to_thread` record
//! the signal (unless it is effectively ignored or already pending) and
//! poke the CPUs and threads that might act on it; the acting thread then
//! consumes it on its next return to user mode, in `dispatch`.

pub mod dispatch;
pub mod sig_action;
pub mod sig_info;
pub mod sig_num;
pub mod sig_set;

use osmium_frame::cpu;
use osmium_frame::task;

use crate::prelude::*;
use crate::thread::Thread;

use sig_action::{SIG_IGN, SIG_FIRST_HANDLER_ADDR};
use sig_info::SigInfo;
use sig_num::{SigNum, SIGTHKILL, SIG_NUM};
use sig_set::SigSet;

use super::Process;

/// Per-process pending signals, delivered to whichever thread takes them
/// first.
pub struct ProcSigState {
    pub pending: SigSet,
    pub info: [SigInfo; SIG_NUM],
}

impl Default for ProcSigState {
    fn default() -> Self {
        Self {
            pending: SigSet::new_empty(),
            info: [SigInfo::default(); SIG_NUM],
        }
    }
}

/// Hooks the pending-signal probe into the frame so blocking primitives
/// can honor their interruptible flag; also installs the signal-return
/// trampoline in the shared user-aux window.
pub(crate) fn init() {
    osmium_frame::sync::set_pending_signal_probe(crate::thread::have_ready_signals);
    dispatch::init_sigreturn_trampoline();
}

/// Should the signal be recorded at all? Effectively-ignored signals are
/// dropped at delivery time, and PID 1 only ever sees signals it has a
/// real handler for.
fn should_record(proc: &Arc<Process>, signum: SigNum) -> bool {
    let dispositions = proc.dispositions.lock_irq_disabled();
    let raw_handler = dispositions.get(signum).handler;
    if proc.pid() == 1 && raw_handler < SIG_FIRST_HANDLER_ADDR && signum != SIGTHKILL {
        return false;
    }
    dispositions.effective_handler(signum) != SIG_IGN
}

/// Delivers a signal to a process: record once, then chase every CPU
/// running this address space and wake the process's threads so one of
/// them picks the signal up.
pub fn deliver_to_process(proc: &Arc<Process>, info: SigInfo) {
    let signum = info.signum();
    if signum == SIGTHKILL {
        // Thread-kill is only meaningful aimed at one thread.
        return;
    }
    if !should_record(proc, signum) {
        return;
    }

    let recorded = {
        let mut sig = proc.sig.lock_irq_disabled();
        if sig.pending.contains(signum) {
            false
        } else {
            sig.pending.add(signum);
            sig.info[signum.as_usize()] = info;
            true
        }
    };
    if recorded {
        cpu::notify_signalled_root(proc.address_space().root_paddr());
        wake_threads(proc);
    }
}

/// Delivers a signal to one thread.
pub fn deliver_to_thread(thread: &Arc<Thread>, info: SigInfo) {
    let Some(proc) = thread.process() else {
        return;
    };
    let signum = info.signum();
    if !should_record(&proc, signum) {
        return;
    }
    if thread.post_signal(info) {
        cpu::notify_signalled_root(proc.address_space().root_paddr());
        task::wake(thread.task());
    }
}

/// Wakes every thread of the process; a wake that arrives outside a
/// suspend is absorbed by the wake counter.
pub(crate) fn wake_threads(proc: &Arc<Process>) {
    let threads = proc.threads.lock();
    for thread in threads.values() {
        task::wake(thread.task());
    }
}
