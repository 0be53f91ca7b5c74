use crate::prelude::*;
use crate::util::user;

/// Largest single transfer; bigger requests are clipped, as a bound on
/// the bounce buffer.
pub const FILEOP_BUFFER_MAX: usize = 0x40_0000;

pub fn sys_read(fd: i32, ubuf: Vaddr, size: usize) -> Result<isize> {
    let size = size.min(FILEOP_BUFFER_MAX);
    let fp = current!()
        .files
        .lock()
        .get(fd)
        .ok_or(Error::new(Errno::EBADF))?;

    let mut buffer = vec![0u8; size];
    let count = fp.read(&mut buffer)?;
    if count > 0 {
        user::write_bytes(ubuf, &buffer[..count])?;
    }
    Ok(count as isize)
}
