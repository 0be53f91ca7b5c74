use crate::prelude::*;
use crate::process::{self, WaitFlagsUser};
use crate::util::user;

pub fn sys_waitpid(pid: i32, uwstatus: Vaddr, flags: i32) -> Result<isize> {
    let flags = WaitFlagsUser::from_bits_truncate(flags);
    let (child, wstatus) = process::do_wait(pid, flags)?;
    if child > 0 && uwstatus != 0 {
        user::write_val(uwstatus, &wstatus)?;
    }
    Ok(child as isize)
}
