use crate::prelude::*;
use crate::process::mem::ProtFlags;

pub fn sys_mprotect(addr: Vaddr, length: usize, prot: u32) -> Result<isize> {
    let prot = ProtFlags::from_bits(prot).ok_or(Error::new(Errno::EINVAL))?;
    current!().address_space().mprotect(addr, length, prot)?;
    Ok(0)
}
