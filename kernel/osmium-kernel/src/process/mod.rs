//! Processes: identity, lifecycle, fork and wait.

pub mod mem;
pub mod signal;
pub mod table;
pub mod thwait;
pub mod wait_status;

use osmium_frame::sync::{Semaphore, WaitFlags};
use osmium_frame::task;
use osmium_frame::user::{ReturnReason, UserContext, PF_FETCH, PF_WRITE};

use crate::fs::file_table::FileTable;
use crate::fs::vfs::path::PathWalker;
use crate::prelude::*;
use crate::syscall;
use crate::thread::{Thid, Thread};

use self::mem::{AddressSpace, FaultAccess};
use self::signal::sig_action::SigDispositions;
use self::signal::sig_info::{SigInfo, SI_USER};
use self::signal::sig_num::{SigNum, SIGKILL, SIGTHKILL};
use self::signal::ProcSigState;

pub type Pid = i32;

/// Largest PID (exclusive) the table will hand out.
pub const PROC_MAX: Pid = 1 << 24;

/// Real, effective and saved IDs.
#[derive(Debug, Clone, Copy, Default)]
pub struct Credentials {
    pub ruid: u32,
    pub euid: u32,
    pub suid: u32,
    pub rgid: u32,
    pub egid: u32,
    pub sgid: u32,
}

/// Root and working directory, under one lock so a path walk sees a
/// consistent pair.
pub struct DirState {
    pub root: PathWalker,
    pub cwd: PathWalker,
}

pub struct Process {
    pid: Pid,
    /// Parent PID; becomes 1 when the parent dies. Writes only under the
    /// process-table lock.
    parent: core::sync::atomic::AtomicI32,
    /// Group and session, also guarded by the process-table lock.
    pgid: core::sync::atomic::AtomicI32,
    sid: core::sync::atomic::AtomicI32,

    addr_space: AddressSpace,
    creds: SpinLock<Credentials>,
    umask: core::sync::atomic::AtomicU32,

    pub(crate) sig: SpinLock<ProcSigState>,
    pub(crate) dispositions: SpinLock<SigDispositions>,

    pub(crate) dirs: Mutex<DirState>,
    pub(crate) files: Mutex<FileTable>,

    pub(crate) threads: Mutex<BTreeMap<Thid, Arc<Thread>>>,
    next_thid: core::sync::atomic::AtomicI32,

    wstatus: core::sync::atomic::AtomicI32,
    terminated: core::sync::atomic::AtomicBool,
    /// Signalled once per child status change; `wait` re-scans after
    /// each unit.
    child_wait: Semaphore,
}

impl Process {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn parent_pid(&self) -> Pid {
        self.parent.load(core::sync::atomic::Ordering::SeqCst)
    }

    pub(crate) fn set_parent_pid(&self, parent: Pid) {
        self.parent.store(parent, core::sync::atomic::Ordering::SeqCst);
    }

    pub fn pgid(&self) -> Pid {
        self.pgid.load(core::sync::atomic::Ordering::SeqCst)
    }

    pub fn sid(&self) -> Pid {
        self.sid.load(core::sync::atomic::Ordering::SeqCst)
    }

    pub fn address_space(&self) -> &AddressSpace {
        &self.addr_space
    }

    pub fn credentials(&self) -> Credentials {
        *self.creds.lock_irq_disabled()
    }

    pub fn umask(&self) -> u32 {
        self.umask.load(core::sync::atomic::Ordering::SeqCst)
    }

    pub fn has_terminated(&self) -> bool {
        self.terminated.load(core::sync::atomic::Ordering::SeqCst)
    }

    pub fn wait_status(&self) -> i32 {
        self.wstatus.load(core::sync::atomic::Ordering::SeqCst)
    }

    pub(crate) fn notify_child_change(&self) {
        self.child_wait.signal(1);
    }

    fn alloc_thid(&self) -> Thid {
        self.next_thid
            .fetch_add(1, core::sync::atomic::Ordering::SeqCst)
    }
}

/// The process of the calling thread. Panics on pure kernel threads.
pub fn current() -> Arc<Process> {
    Thread::current()
        .and_then(|thread| thread.process())
        .expect("no current process")
}

// ---------------------------------------------------------------------
// Creation
// ---------------------------------------------------------------------

/// Creates a process the way `fork` needs it: a fresh address space and
/// PID, everything else inherited from the calling process (or kernel
/// defaults when there is none), and one thread (thid 1) that assumes
/// the new identity and runs `func`.
pub fn create_process<F, S>(func: F, setup: S) -> Result<Arc<Process>>
where
    F: FnOnce() + Send + 'static,
    S: FnOnce(&Arc<Process>) -> Result<()>,
{
    let parent = Thread::current().and_then(|thread| thread.process());

    let addr_space = AddressSpace::new()?;

    let (creds, umask, dirs, files, dispositions, parent_pid, pgid, sid) = match &parent {
        Some(parent) => {
            let dirs = {
                let parent_dirs = parent.dirs.lock();
                DirState {
                    root: parent_dirs.root.clone(),
                    cwd: parent_dirs.cwd.clone(),
                }
            };
            (
                parent.credentials(),
                parent.umask(),
                dirs,
                parent.files.lock().clone_for_fork(),
                parent.dispositions.lock_irq_disabled().clone(),
                parent.pid(),
                parent.pgid(),
                parent.sid(),
            )
        }
        None => (
            Credentials::default(),
            0o022,
            DirState {
                root: crate::fs::root_walker(),
                cwd: crate::fs::root_walker(),
            },
            FileTable::new(),
            SigDispositions::default(),
            1,
            1,
            1,
        ),
    };

    let proc = table::insert_new(|pid| {
        Arc::new(Process {
            pid,
            parent: core::sync::atomic::AtomicI32::new(parent_pid),
            pgid: core::sync::atomic::AtomicI32::new(pgid),
            sid: core::sync::atomic::AtomicI32::new(sid),
            addr_space,
            creds: SpinLock::new(creds),
            umask: core::sync::atomic::AtomicU32::new(umask),
            sig: SpinLock::new(ProcSigState::default()),
            dispositions: SpinLock::new(dispositions),
            dirs: Mutex::new(dirs),
            files: Mutex::new(files),
            threads: Mutex::new(BTreeMap::new()),
            next_thid: core::sync::atomic::AtomicI32::new(1),
            wstatus: core::sync::atomic::AtomicI32::new(0),
            terminated: core::sync::atomic::AtomicBool::new(false),
            child_wait: Semaphore::new(0),
        })
    })?;

    // Thread id 1 is reserved here, before the thread can possibly run,
    // so the new thread can never fail to register itself.
    let thid = proc.alloc_thid();
    let thread = Thread::new(thid, Arc::downgrade(&proc));
    proc.threads.lock().insert(thid, thread.clone());

    // Populate the child before its first thread can possibly run.
    setup(&proc)?;

    let task = thread.spawn(&proc, func)?;
    // The process keeps the thread object; the task itself is reaped by
    // the cleanup thread when it exits.
    task::detach(task);

    Ok(proc)
}

/// `fork`: a new process whose first thread re-enters user mode from the
/// parent's saved syscall frame, with rax = 0.
pub fn fork(parent_ctx: &UserContext) -> Result<Pid> {
    let mut child_ctx = *parent_ctx;
    child_ctx.rax = 0;

    let parent = current();
    let proc = create_process(
        move || {
            user_thread_loop(child_ctx);
        },
        |child| {
            // Mirror our address space into the child before its thread
            // is woken: shared descriptors, private pages downgraded to
            // copy-on-write on both sides.
            parent.address_space().fork_into(child.address_space())
        },
    )?;
    Ok(proc.pid())
}

/// Spawns PID 1: loads the executable at `path` (from the initrd) and
/// enters it.
pub fn spawn_init(path: &str) -> Result<Arc<Process>> {
    let path: String = path.to_string();
    create_process(
        move || {
            let ctx = match crate::loader::load_program(&path) {
                Ok(ctx) => ctx,
                Err(err) => panic!("failed to load {}: {:?}", path, err),
            };
            user_thread_loop(ctx);
        },
        |_| Ok(()),
    )
}

/// Creates an additional user thread in the calling process, entering
/// user mode at `entry` with the given stack and argument.
pub fn spawn_user_thread(entry: u64, user_rsp: u64, arg: u64) -> Result<Thid> {
    let proc = current();
    if proc.has_terminated() {
        return_errno!(Errno::ESRCH);
    }
    let thid = proc.alloc_thid();
    let thread = Thread::new(thid, Arc::downgrade(&proc));
    proc.threads.lock().insert(thid, thread.clone());

    let mut ctx = UserContext::new();
    ctx.rip = entry;
    ctx.rsp = user_rsp;
    ctx.rdi = arg;
    let task = thread.spawn(&proc, move || {
        user_thread_loop(ctx);
    })?;
    task::detach(task);
    Ok(thid)
}

// ---------------------------------------------------------------------
// The user thread loop
// ---------------------------------------------------------------------

/// The kernel side of every user thread: run user code, service whatever
/// it trapped for, deliver signals, repeat.
pub fn user_thread_loop(mut ctx: UserContext) -> ! {
    loop {
        match ctx.execute() {
            ReturnReason::Syscall => {
                syscall::handle_syscall(&mut ctx);
            }
            ReturnReason::PageFault { addr, error_code } => {
                let access = if error_code & PF_FETCH != 0 {
                    FaultAccess::Exec
                } else if error_code & PF_WRITE != 0 {
                    FaultAccess::Write
                } else {
                    FaultAccess::Read
                };
                if let Err(siginfo) = current!().address_space().handle_page_fault(addr, access)
                {
                    deliver_fault_signal(siginfo);
                }
            }
            ReturnReason::Exception { vector, error_code } => {
                let mut info = SigInfo::new(exception_signal(vector), 0);
                info.si_errno = error_code as i32;
                info.si_addr = ctx.rip;
                deliver_fault_signal(info);
            }
            ReturnReason::Interrupted => {}
        }
        signal::dispatch::handle_pending_signals(&mut ctx);
    }
}

fn deliver_fault_signal(info: SigInfo) {
    let thread = Thread::current().expect("fault outside a user thread");
    signal::deliver_to_thread(&thread, info);
    // A fault signal that the thread blocks or ignores would re-fault
    // forever; forcing the kill mirrors the no-way-out nature of the
    // situation.
    if !crate::thread::have_ready_signals() {
        do_exit(wait_status::ws_signalled(info.signum()));
    }
}

fn exception_signal(vector: u8) -> SigNum {
    use self::signal::sig_num::*;
    match vector {
        0 | 16 | 19 => SIGFPE,
        3 => SIGTRAP,
        6 => SIGILL,
        13 => SIGSEGV,
        17 => SIGBUS,
        _ => SIGILL,
    }
}

// ---------------------------------------------------------------------
// Exit and wait
// ---------------------------------------------------------------------

/// Terminates the whole process with the given wait status. The first
/// caller wins; everyone else just exits their thread.
pub fn do_exit(ws: i32) -> ! {
    let thread = Thread::current().expect("process exit from a kernel thread");
    let proc = thread.process().expect("thread without a process");

    if !proc
        .terminated
        .swap(true, core::sync::atomic::Ordering::SeqCst)
    {
        proc.wstatus.store(ws, core::sync::atomic::Ordering::SeqCst);

        // Everyone else gets the thread-kill treatment.
        {
            let threads = proc.threads.lock();
            for (&thid, other) in threads.iter() {
                if thid != thread.thid() {
                    other.post_signal(SigInfo::new(SIGTHKILL, SI_USER));
                    task::wake(other.task());
                }
            }
        }

        proc.files.lock().clear();

        // Reparenting and parent notification happen exactly once, at
        // the terminated transition, under the table lock.
        table::on_process_exit(&proc, ws);
    }

    exit_thread(0)
}

/// Terminates just the calling thread. The last thread out turns the
/// lights off for the process.
pub fn exit_thread(retval: u64) -> ! {
    let thread = Thread::current().expect("thread exit from a kernel thread");
    let proc = thread.process().expect("thread without a process");

    let remaining = {
        let mut threads = proc.threads.lock();
        threads.remove(&thread.thid());
        threads.len()
    };

    if remaining == 0 && !proc.has_terminated() {
        // The process ends when its last thread does.
        if !proc
            .terminated
            .swap(true, core::sync::atomic::Ordering::SeqCst)
        {
            proc.wstatus
                .store(wait_status::ws_exited(0), core::sync::atomic::Ordering::SeqCst);
            proc.files.lock().clear();
            table::on_process_exit(&proc, wait_status::ws_exited(0));
        }
    }

    task::exit(retval as usize)
}

/// Detaches a thread of the current process. The underlying kernel task
/// is always detached; this is the user-visible bookkeeping.
pub fn detach_thread(thid: Thid) -> Result<()> {
    let proc = current();
    let threads = proc.threads.lock();
    if !threads.contains_key(&thid) {
        return_errno!(Errno::ESRCH);
    }
    Ok(())
}

bitflags! {
    pub struct WaitFlagsUser: i32 {
        const WNOHANG = 1 << 0;
        const WDETACH = 1 << 1;
        const WUNTRACED = 1 << 2;
        const WCONTINUED = 1 << 3;
    }
}

/// Waits for a child matching `pid` (positive PID, 0 for the caller's
/// group, -1 for any child, below -1 for group `-pid`). Returns the
/// reaped child and its status, or (0, 0) when `WNOHANG` found only
/// running children.
pub fn do_wait(pid: Pid, flags: WaitFlagsUser) -> Result<(Pid, i32)> {
    let me = current();

    loop {
        let mut found_running = false;
        {
            let mut table = table::table();
            let mut reap: Option<Pid> = None;
            for (&other_pid, other) in table.iter() {
                if other.parent_pid() != me.pid() || other_pid == me.pid() {
                    continue;
                }
                let matches = if pid > 0 {
                    other_pid == pid
                } else if pid == 0 {
                    other.pgid() == me.pgid()
                } else if pid == -1 {
                    true
                } else {
                    other.pgid() == -pid
                };
                if !matches {
                    continue;
                }
                if other.has_terminated() {
                    reap = Some(other_pid);
                    break;
                }
                found_running = true;
            }
            if let Some(child_pid) = reap {
                let child = table.remove(&child_pid).expect("reaped child vanished");
                return Ok((child_pid, child.wait_status()));
            }
        }

        if !found_running {
            return_errno!(Errno::ECHILD);
        }
        if flags.contains(WaitFlagsUser::WNOHANG) {
            return Ok((0, 0));
        }
        me.child_wait
            .wait_gen(1, WaitFlags::INTR, 0)
            .map_err(Error::from)?;
    }
}

// ---------------------------------------------------------------------
// Sessions and groups
// ---------------------------------------------------------------------

/// `setsid`: the caller becomes the leader of a new session and group.
/// Refused while the caller leads (or shares the id of) an existing
/// group.
pub fn set_session_id() -> Result<Pid> {
    let me = current();
    let table = table::table();
    for (_, other) in table.iter() {
        if other.pgid() == me.pid() && other.pid() != me.pid() {
            return_errno!(Errno::EPERM);
        }
    }
    if me.pgid() == me.pid() {
        return_errno_with_message!(Errno::EPERM, "already a group leader");
    }
    me.sid.store(me.pid(), core::sync::atomic::Ordering::SeqCst);
    me.pgid.store(me.pid(), core::sync::atomic::Ordering::SeqCst);
    Ok(me.pid())
}

/// `setpgid` with the standard POSIX constraints, all checked under the
/// table lock.
pub fn set_process_group(pid: Pid, pgid: Pid) -> Result<()> {
    if pgid < 0 {
        return_errno!(Errno::EINVAL);
    }
    let me = current();
    let table = table::table();

    let target = if pid == 0 {
        me.clone()
    } else {
        table.get(&pid).cloned().ok_or(Error::new(Errno::ESRCH))?
    };
    // Only ourselves or our children.
    if target.pid() != me.pid() && target.parent_pid() != me.pid() {
        return_errno!(Errno::ESRCH);
    }
    if target.sid() != me.sid() {
        return_errno!(Errno::EPERM);
    }
    // A session leader may not move.
    if target.pid() == target.sid() {
        return_errno!(Errno::EPERM);
    }

    let pgid = if pgid == 0 { target.pid() } else { pgid };
    if pgid != target.pid() {
        // Joining an existing group: it must live in the same session.
        let in_session = table
            .iter()
            .any(|(_, other)| other.pgid() == pgid && other.sid() == target.sid());
        if !in_session {
            return_errno!(Errno::EPERM);
        }
    }
    target.pgid.store(pgid, core::sync::atomic::Ordering::SeqCst);
    Ok(())
}

// ---------------------------------------------------------------------
// kill
// ---------------------------------------------------------------------

fn may_signal(sender: &Credentials, target: &Arc<Process>) -> bool {
    if sender.euid == 0 {
        return true;
    }
    let creds = target.credentials();
    sender.euid == creds.ruid || sender.euid == creds.euid || sender.ruid == creds.ruid
}

/// `kill`: signal one process, a group, or (for -1) everything except
/// PID 1 and the caller. `signo` 0 probes permissions only.
pub fn kill(pid: Pid, signo: i32) -> Result<()> {
    let signum = if signo == 0 {
        None
    } else {
        Some(SigNum::try_from_i32(signo)?)
    };
    let me = current();
    let my_creds = me.credentials();

    let mut info = match signum {
        Some(signum) => SigInfo::new(signum, SI_USER),
        None => SigInfo::new(SIGKILL, SI_USER),
    };
    info.si_pid = me.pid();
    info.si_uid = my_creds.ruid;

    let targets: Vec<Arc<Process>> = {
        let table = table::table();
        table
            .iter()
            .filter(|(&other_pid, other)| {
                if pid > 0 {
                    other_pid == pid
                } else if pid == 0 {
                    other.pgid() == me.pgid()
                } else if pid == -1 {
                    other_pid != 1 && other_pid != me.pid()
                } else {
                    other.pgid() == -pid
                }
            })
            .map(|(_, other)| other.clone())
            .collect()
    };

    let mut result = Err(Error::new(Errno::ESRCH));
    for target in targets {
        if !may_signal(&my_creds, &target) {
            if result.is_err() {
                result = Err(Error::new(Errno::EPERM));
            }
            continue;
        }
        if let Some(_signum) = signum {
            signal::deliver_to_process(&target, info);
        }
        result = Ok(());
    }
    result
}
