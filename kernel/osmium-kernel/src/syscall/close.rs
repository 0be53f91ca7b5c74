use crate::prelude::*;

pub fn sys_close(fd: i32) -> Result<isize> {
    current!().files.lock().close(fd)?;
    Ok(0)
}
