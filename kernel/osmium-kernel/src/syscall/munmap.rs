use crate::prelude::*;

pub fn sys_munmap(addr: Vaddr, length: usize) -> Result<isize> {
    current!().address_space().munmap(addr, length)?;
    Ok(0)
}
