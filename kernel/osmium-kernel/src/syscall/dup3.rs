use crate::prelude::*;

/// Duplicates `oldfd`. A `newfd` of -1 allocates the lowest free
/// descriptor; equal descriptors are an invalid argument (the in-header
/// contract here, deliberately stricter than elsewhere).
pub fn sys_dup3(oldfd: i32, newfd: i32, cloexec: i32) -> Result<isize> {
    if oldfd == newfd {
        return_errno!(Errno::EINVAL);
    }
    let proc = current!();
    let mut files = proc.files.lock();
    let fp = files.get(oldfd).ok_or(Error::new(Errno::EBADF))?;

    let fd = if newfd == -1 {
        let fd = files.reserve().ok_or(Error::new(Errno::EMFILE))?;
        files.set(fd, Some(fp), cloexec != 0);
        fd
    } else {
        files.dup_into(newfd, fp, cloexec != 0)?
    };
    Ok(fd as isize)
}
