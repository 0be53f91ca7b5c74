//! The global process table.
//!
//! One mutex guards the table itself and the cross-process identity
//! fields (parent, pgid, sid): those may only change while the table is
//! locked, which is what keeps the group/session rules globally
//! consistent.

use crate::prelude::*;

use super::signal::sig_info::{SigInfo, CLD_EXITED, CLD_KILLED};
use super::signal::sig_num::SIGCHLD;
use super::{wait_status, Pid, Process, PROC_MAX};

lazy_static! {
    static ref PROCESS_TABLE: Mutex<BTreeMap<Pid, Arc<Process>>> = Mutex::new(BTreeMap::new());
}

pub(super) fn table() -> MutexGuard<'static, BTreeMap<Pid, Arc<Process>>> {
    PROCESS_TABLE.lock()
}

/// Allocates the lowest free PID and inserts the process. The insert and
/// the allocation are one critical section, so two creators cannot pick
/// the same PID.
pub(super) fn insert_new(make: impl FnOnce(Pid) -> Arc<Process>) -> Result<Arc<Process>> {
    let mut table = table();
    let mut pid: Pid = 1;
    for (&used, _) in table.iter() {
        if used != pid {
            break;
        }
        pid += 1;
    }
    if pid >= PROC_MAX {
        return_errno_with_message!(Errno::EAGAIN, "process table full");
    }
    let proc = make(pid);
    table.insert(pid, proc.clone());
    Ok(proc)
}

pub fn get(pid: Pid) -> Option<Arc<Process>> {
    table().get(&pid).cloned()
}

/// Exit-time bookkeeping that must be atomic with respect to the table:
/// reparent the children to PID 1, then tell the parent (SIGCHLD and its
/// wait condition).
pub(super) fn on_process_exit(proc: &Arc<Process>, ws: i32) {
    let table = table();
    for (_, other) in table.iter() {
        if other.parent_pid() == proc.pid() && other.pid() != proc.pid() {
            other.set_parent_pid(1);
        }
    }

    let parent = table.get(&proc.parent_pid()).cloned();
    drop(table);

    if let Some(parent) = parent {
        let mut info = SigInfo::new(
            SIGCHLD,
            if wait_status::is_exited(ws) {
                CLD_EXITED
            } else {
                CLD_KILLED
            },
        );
        info.si_pid = proc.pid();
        info.si_status = ws;
        super::signal::deliver_to_process(&parent, info);
        parent.notify_child_change();
    }
}
