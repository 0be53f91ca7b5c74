use crate::prelude::*;
use crate::process::mem::{MmapFlags, ProtFlags};

pub const MAP_FAILED: u64 = u64::MAX;

pub fn sys_mmap(
    addr: Vaddr,
    length: usize,
    prot: u32,
    flags: u32,
    fd: i32,
    offset: u64,
) -> Result<isize> {
    let prot = ProtFlags::from_bits(prot).ok_or(Error::new(Errno::EINVAL))?;
    let flags = MmapFlags::from_bits(flags).ok_or(Error::new(Errno::EINVAL))?;

    let proc = current!();
    let file_inode = if flags.contains(MmapFlags::ANON) {
        if fd != -1 {
            return_errno!(Errno::EINVAL);
        }
        None
    } else {
        let fp = proc.files.lock().get(fd).ok_or(Error::new(Errno::EBADF))?;
        Some((fp.inode().clone(), fp.oflags()))
    };

    let result = proc
        .address_space()
        .mmap(addr, length, prot, flags, file_inode, offset)?;
    Ok(result as isize)
}
