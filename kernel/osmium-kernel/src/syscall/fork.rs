use osmium_frame::user::UserContext;

use crate::prelude::*;
use crate::process;

/// The classic: the child re-enters user mode from a copy of the saved
/// syscall frame with rax forced to zero, the parent gets the child PID.
pub fn sys_fork(ctx: &UserContext) -> Result<isize> {
    let pid = process::fork(ctx)?;
    Ok(pid as isize)
}
