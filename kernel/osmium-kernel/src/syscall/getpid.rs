use crate::prelude::*;

pub fn sys_getpid() -> Result<isize> {
    Ok(current!().pid() as isize)
}

pub fn sys_getppid() -> Result<isize> {
    Ok(current!().parent_pid() as isize)
}
