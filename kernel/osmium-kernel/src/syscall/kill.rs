use crate::prelude::*;
use crate::process;

pub fn sys_kill(pid: i32, signo: i32) -> Result<isize> {
    process::kill(pid, signo)?;
    Ok(0)
}
