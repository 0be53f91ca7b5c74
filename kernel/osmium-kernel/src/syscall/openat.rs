use crate::fs::vfs::file::{self, OpenFlags};
use crate::prelude::*;
use crate::util::user;

/// The dirfd value meaning "relative to the working directory".
pub const AT_FDCWD: i32 = 0xFFFF;

pub fn sys_openat(dirfd: i32, upath: Vaddr, oflags: u32, mode: u32) -> Result<isize> {
    let path = user::read_cstring(upath)?;
    let oflags = OpenFlags::from_bits_truncate(oflags);

    let proc = current!();
    let creds = proc.credentials();

    // Reserve the descriptor first so a failed open does not leave a
    // gap another thread may race for.
    let fd = {
        let mut files = proc.files.lock();
        files.reserve().ok_or(Error::new(Errno::EMFILE))?
    };

    let start = if dirfd == AT_FDCWD {
        proc.dirs.lock().cwd.clone()
    } else {
        match proc.files.lock().get(dirfd) {
            Some(dirfp) => dirfp.walker().clone(),
            None => {
                proc.files.lock().set(fd, None, false);
                return_errno!(Errno::EBADF);
            }
        }
    };
    let root = proc.dirs.lock().root.clone();

    match file::open(&start, &root, &creds, proc.umask(), &path, oflags, mode) {
        Ok(fp) => {
            proc.files
                .lock()
                .set(fd, Some(fp), oflags.contains(OpenFlags::CLOEXEC));
            Ok(fd as isize)
        }
        Err(err) => {
            proc.files.lock().set(fd, None, false);
            Err(err)
        }
    }
}
