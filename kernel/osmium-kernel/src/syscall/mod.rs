//! The syscall table and dispatcher.
//!
//! The ABI is register-passing: the call number in rax, arguments in
//! rdi/rsi/rdx/r10/r8/r9, the result (negated errno on failure) back in
//! rax. The dispatcher runs on the thread's kernel side with the full
//! banked user context available, which is what fork and exit need.

use osmium_frame::user::UserContext;

use crate::prelude::*;

mod close;
mod dup3;
mod exit;
mod fork;
mod getpid;
mod kill;
mod mmap;
mod mprotect;
mod munmap;
mod openat;
mod pread;
mod pwrite;
mod raise;
mod read;
mod sessions;
mod sigaction;
mod sigmask;
mod thread_ops;
mod thwait;
mod waitpid;
mod write;

pub const SYS_EXIT: u64 = 0;
pub const SYS_SIGACTION: u64 = 1;
pub const SYS_SIGMASK: u64 = 2;
pub const SYS_FORK: u64 = 3;
pub const SYS_OPENAT: u64 = 4;
pub const SYS_CLOSE: u64 = 5;
pub const SYS_READ: u64 = 6;
pub const SYS_WRITE: u64 = 7;
pub const SYS_PREAD: u64 = 8;
pub const SYS_PWRITE: u64 = 9;
pub const SYS_GETPID: u64 = 10;
pub const SYS_GETPPID: u64 = 11;
pub const SYS_WAITPID: u64 = 12;
pub const SYS_SETSID: u64 = 13;
pub const SYS_GETSID: u64 = 14;
pub const SYS_SETPGID: u64 = 15;
pub const SYS_GETPGRP: u64 = 16;
pub const SYS_KILL: u64 = 17;
pub const SYS_DUP3: u64 = 18;
pub const SYS_THREAD_SELF: u64 = 19;
pub const SYS_RAISE: u64 = 20;
pub const SYS_MMAP: u64 = 21;
pub const SYS_THREAD_EXIT: u64 = 22;
pub const SYS_MUNMAP: u64 = 23;
pub const SYS_MPROTECT: u64 = 24;
pub const SYS_THREAD_DETACH: u64 = 25;
pub const SYS_THREAD_WAIT: u64 = 26;
pub const SYS_THREAD_SIGNAL: u64 = 27;
pub const SYS_THREAD_CREATE: u64 = 28;

pub(crate) fn init() {
    debug!("syscall: table covers numbers 0..={}", SYS_THREAD_CREATE);
}

fn result_to_retval(result: Result<isize>) -> u64 {
    match result {
        Ok(value) => value as u64,
        Err(err) => err.as_retval() as u64,
    }
}

/// Dispatches the syscall banked in `ctx` and stores the return value.
pub fn handle_syscall(ctx: &mut UserContext) {
    let num = ctx.rax;
    let a = [ctx.rdi, ctx.rsi, ctx.rdx, ctx.r10, ctx.r8, ctx.r9];

    let retval = match num {
        SYS_EXIT => exit::sys_exit(a[0] as i32),
        SYS_SIGACTION => {
            result_to_retval(sigaction::sys_sigaction(a[0] as i32, a[1] as Vaddr, a[2] as Vaddr))
        }
        // sigmask returns the old mask, never an error value.
        SYS_SIGMASK => sigmask::sys_sigmask(a[0] as i32, a[1]),
        SYS_FORK => result_to_retval(fork::sys_fork(ctx)),
        SYS_OPENAT => result_to_retval(openat::sys_openat(
            a[0] as i32,
            a[1] as Vaddr,
            a[2] as u32,
            a[3] as u32,
        )),
        SYS_CLOSE => result_to_retval(close::sys_close(a[0] as i32)),
        SYS_READ => result_to_retval(read::sys_read(a[0] as i32, a[1] as Vaddr, a[2] as usize)),
        SYS_WRITE => result_to_retval(write::sys_write(a[0] as i32, a[1] as Vaddr, a[2] as usize)),
        SYS_PREAD => result_to_retval(pread::sys_pread(
            a[0] as i32,
            a[1] as Vaddr,
            a[2] as usize,
            a[3],
        )),
        SYS_PWRITE => result_to_retval(pwrite::sys_pwrite(
            a[0] as i32,
            a[1] as Vaddr,
            a[2] as usize,
            a[3],
        )),
        SYS_GETPID => result_to_retval(getpid::sys_getpid()),
        SYS_GETPPID => result_to_retval(getpid::sys_getppid()),
        SYS_WAITPID => result_to_retval(waitpid::sys_waitpid(
            a[0] as i32,
            a[1] as Vaddr,
            a[2] as i32,
        )),
        SYS_SETSID => result_to_retval(sessions::sys_setsid()),
        SYS_GETSID => result_to_retval(sessions::sys_getsid()),
        SYS_SETPGID => result_to_retval(sessions::sys_setpgid(a[0] as i32, a[1] as i32)),
        SYS_GETPGRP => result_to_retval(sessions::sys_getpgrp()),
        SYS_KILL => result_to_retval(kill::sys_kill(a[0] as i32, a[1] as i32)),
        SYS_DUP3 => result_to_retval(dup3::sys_dup3(a[0] as i32, a[1] as i32, a[2] as i32)),
        SYS_THREAD_SELF => result_to_retval(thread_ops::sys_thread_self()),
        SYS_RAISE => result_to_retval(raise::sys_raise(a[0] as i32)),
        SYS_MMAP => result_to_retval(mmap::sys_mmap(
            a[0] as Vaddr,
            a[1] as usize,
            a[2] as u32,
            a[3] as u32,
            a[4] as i32,
            a[5],
        )),
        SYS_THREAD_EXIT => thread_ops::sys_thread_exit(a[0]),
        SYS_MUNMAP => result_to_retval(munmap::sys_munmap(a[0] as Vaddr, a[1] as usize)),
        SYS_MPROTECT => result_to_retval(mprotect::sys_mprotect(
            a[0] as Vaddr,
            a[1] as usize,
            a[2] as u32,
        )),
        SYS_THREAD_DETACH => result_to_retval(thread_ops::sys_thread_detach(a[0] as i32)),
        SYS_THREAD_WAIT => {
            result_to_retval(thwait::sys_thread_wait(a[0] as Vaddr, a[1] as i32, a[2]))
        }
        SYS_THREAD_SIGNAL => result_to_retval(thwait::sys_thread_signal(a[0] as Vaddr, a[1])),
        SYS_THREAD_CREATE => {
            result_to_retval(thread_ops::sys_thread_create(a[0], a[1], a[2]))
        }
        _ => invalid_syscall(),
    };

    ctx.rax = retval;
}

/// An unknown number raises SIGSYS and fails with ENOSYS.
fn invalid_syscall() -> u64 {
    use crate::process::signal::sig_info::SigInfo;
    use crate::process::signal::sig_num::SIGSYS;

    if let Some(thread) = crate::thread::Thread::current() {
        crate::process::signal::deliver_to_thread(&thread, SigInfo::new(SIGSYS, 0));
    }
    Error::new(Errno::ENOSYS).as_retval() as u64
}
