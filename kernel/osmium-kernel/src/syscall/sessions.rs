use crate::prelude::*;
use crate::process;

pub fn sys_setsid() -> Result<isize> {
    Ok(process::set_session_id()? as isize)
}

pub fn sys_getsid() -> Result<isize> {
    Ok(current!().sid() as isize)
}

pub fn sys_setpgid(pid: i32, pgid: i32) -> Result<isize> {
    process::set_process_group(pid, pgid)?;
    Ok(0)
}

pub fn sys_getpgrp() -> Result<isize> {
    Ok(current!().pgid() as isize)
}
