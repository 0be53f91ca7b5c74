use crate::prelude::*;
use crate::util::user;

use super::read::FILEOP_BUFFER_MAX;

pub fn sys_write(fd: i32, ubuf: Vaddr, size: usize) -> Result<isize> {
    let size = size.min(FILEOP_BUFFER_MAX);
    let mut buffer = vec![0u8; size];
    user::read_bytes(ubuf, &mut buffer)?;

    let fp = current!()
        .files
        .lock()
        .get(fd)
        .ok_or(Error::new(Errno::EBADF))?;
    let count = fp.write(&buffer)?;
    Ok(count as isize)
}
