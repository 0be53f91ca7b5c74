use crate::prelude::*;
use crate::process::thwait;

pub fn sys_thread_wait(uptr: Vaddr, op: i32, compare: u64) -> Result<isize> {
    thwait::thread_wait(uptr, op, compare)?;
    Ok(0)
}

pub fn sys_thread_signal(uptr: Vaddr, new_value: u64) -> Result<isize> {
    thwait::thread_signal(uptr, new_value)?;
    Ok(0)
}
