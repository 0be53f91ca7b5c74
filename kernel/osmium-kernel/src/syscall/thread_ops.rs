use crate::prelude::*;
use crate::process;
use crate::thread::Thread;

pub fn sys_thread_self() -> Result<isize> {
    let thread = Thread::current().ok_or(Error::new(Errno::EINVAL))?;
    Ok(thread.thid() as isize)
}

pub fn sys_thread_exit(retval: u64) -> ! {
    process::exit_thread(retval);
}

pub fn sys_thread_detach(thid: i32) -> Result<isize> {
    process::detach_thread(thid)?;
    Ok(0)
}

/// Starts another user thread in the calling process: entry point,
/// initial stack pointer, and one argument (arriving in rdi).
pub fn sys_thread_create(entry: u64, stack: u64, arg: u64) -> Result<isize> {
    let thid = process::spawn_user_thread(entry, stack, arg)?;
    Ok(thid as isize)
}
