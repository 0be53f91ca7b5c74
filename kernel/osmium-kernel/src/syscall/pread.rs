use crate::prelude::*;
use crate::util::user;

use super::read::FILEOP_BUFFER_MAX;

pub fn sys_pread(fd: i32, ubuf: Vaddr, size: usize, offset: u64) -> Result<isize> {
    let size = size.min(FILEOP_BUFFER_MAX);
    let fp = current!()
        .files
        .lock()
        .get(fd)
        .ok_or(Error::new(Errno::EBADF))?;

    let mut buffer = vec![0u8; size];
    let count = fp.pread(&mut buffer, offset)?;
    if count > 0 {
        user::write_bytes(ubuf, &buffer[..count])?;
    }
    Ok(count as isize)
}
