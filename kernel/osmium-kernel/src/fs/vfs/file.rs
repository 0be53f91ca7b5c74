//! Open file descriptions.

use crate::prelude::*;
use crate::process::Credentials;

use super::dentry;
use super::inode::{Access, Inode, InodeFlags, MODE_REGULAR};
use super::path::{self, PathWalker};

bitflags! {
    pub struct OpenFlags: u32 {
        const WRONLY   = 1 << 0;
        const RDONLY   = 1 << 1;
        const APPEND   = 1 << 2;
        const CREAT    = 1 << 3;
        const EXCL     = 1 << 4;
        const NOCTTY   = 1 << 5;
        const TRUNC    = 1 << 6;
        const NONBLOCK = 1 << 8;
        const CLOEXEC  = 1 << 11;
    }
}

impl OpenFlags {
    pub fn readable(self) -> bool {
        self.contains(OpenFlags::RDONLY)
    }

    pub fn writable(self) -> bool {
        self.contains(OpenFlags::WRONLY)
    }
}

pub const SEEK_SET: i32 = 0;
pub const SEEK_END: i32 = 1;
pub const SEEK_CUR: i32 = 2;

/// An open file description: the walker (holding the inode), the open
/// flags, and the offset with the mutex that makes read/write/seek
/// atomic per description. Sharing is by `Arc` (dup); `clone_for_fork`
/// makes the separate description fork semantics ask for.
pub struct File {
    walker: PathWalker,
    oflags: OpenFlags,
    pos: Mutex<i64>,
}

impl File {
    pub fn new(walker: PathWalker, oflags: OpenFlags) -> Arc<Self> {
        Arc::new(Self {
            walker,
            oflags,
            pos: Mutex::new(0),
        })
    }

    pub fn inode(&self) -> &Arc<Inode> {
        self.walker.current()
    }

    pub fn walker(&self) -> &PathWalker {
        &self.walker
    }

    pub fn oflags(&self) -> OpenFlags {
        self.oflags
    }

    /// A distinct description with the same flags and current offset.
    pub fn clone_for_fork(&self) -> Arc<Self> {
        Arc::new(Self {
            walker: self.walker.clone(),
            oflags: self.oflags,
            pos: Mutex::new(*self.pos.lock()),
        })
    }

    /// Position-explicit read; no offset lock involved.
    pub fn pread(&self, buf: &mut [u8], pos: u64) -> Result<usize> {
        if !self.oflags.readable() {
            return_errno!(Errno::EBADF);
        }
        self.inode().read_at(buf, pos)
    }

    pub fn pwrite(&self, buf: &[u8], pos: u64) -> Result<usize> {
        if !self.oflags.writable() {
            return_errno!(Errno::EBADF);
        }
        self.inode().write_at(buf, pos)
    }

    /// Read at the current offset, advancing it. Non-seekable files skip
    /// the offset lock entirely, as their reads may block.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if !self.inode().flags().contains(InodeFlags::SEEKABLE) {
            return self.pread(buf, 0);
        }
        if !self.oflags.readable() {
            return_errno!(Errno::EBADF);
        }
        let mut pos = self.pos.lock();
        let result = self.pread(buf, *pos as u64)?;
        *pos += result as i64;
        Ok(result)
    }

    /// Write at the current offset; `O_APPEND` refreshes the end under
    /// the same lock, so appenders never interleave into each other.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        if !self.inode().flags().contains(InodeFlags::SEEKABLE) {
            return self.pwrite(buf, 0);
        }
        if !self.oflags.writable() {
            return_errno!(Errno::EBADF);
        }
        let mut pos = self.pos.lock();
        if self.oflags.contains(OpenFlags::APPEND) {
            let end = self.inode().size();
            self.pwrite(buf, end)
        } else {
            let result = self.pwrite(buf, *pos as u64)?;
            *pos += result as i64;
            Ok(result)
        }
    }

    pub fn seek(&self, offset: i64, whence: i32) -> Result<i64> {
        if !self.inode().flags().contains(InodeFlags::SEEKABLE) {
            return_errno!(Errno::ESPIPE);
        }
        let mut pos = self.pos.lock();
        let target = match whence {
            SEEK_SET => offset,
            SEEK_CUR => *pos + offset,
            SEEK_END => self.inode().size() as i64 + offset,
            _ => return_errno!(Errno::EINVAL),
        };
        if target < 0 {
            return_errno!(Errno::EINVAL);
        }
        *pos = target;
        Ok(target)
    }
}

/// Opens (or creates) the file at `path`. `start` is where relative
/// paths begin; `root`/`creds`/`umask` come from the opening process.
pub fn open(
    start: &PathWalker,
    root: &PathWalker,
    creds: &Credentials,
    umask: u32,
    path: &str,
    oflags: OpenFlags,
    mode: u32,
) -> Result<Arc<File>> {
    if !oflags.readable() && !oflags.writable() {
        // Neither access bit: not a meaningful description.
        return_errno!(Errno::EINVAL);
    }

    let mut walker = start.clone();
    walker.walk(path::dir_name(path), root, creds)?;
    let base = path::base_name(path);
    if base.is_empty() || base == "." || base == ".." {
        return_errno!(Errno::EINVAL);
    }

    let dir = walker.current().clone();
    let mut dir_rights = Access::EXEC;
    if oflags.contains(OpenFlags::CREAT) {
        dir_rights |= Access::WRITE;
    }
    if !dir.check_access(creds, dir_rights) {
        return_errno!(Errno::EACCES);
    }

    let dentry = dentry::get(&dir, base)?;
    let inode = match dentry.target() {
        None if oflags.contains(OpenFlags::CREAT) => {
            // Creation and the existence check are one critical section
            // inside make_node, so two racing creators with O_EXCL see
            // exactly one success.
            let file_mode = (mode & 0o777 & !umask) | MODE_REGULAR;
            match dentry::make_node(&dir, base, file_mode) {
                Err(err)
                    if err.error() == Errno::EEXIST && !oflags.contains(OpenFlags::EXCL) =>
                {
                    // Lost the race benignly; open what won.
                    dentry::lookup_inode(&dir, base)?
                }
                other => other?,
            }
        }
        None => return_errno!(Errno::ENOENT),
        Some(_) if oflags.contains(OpenFlags::EXCL) && oflags.contains(OpenFlags::CREAT) => {
            return_errno!(Errno::EEXIST);
        }
        Some(target) => {
            let inode = super::inode::get(dir.fs(), target)?;
            let mut rights = Access::empty();
            if oflags.readable() {
                rights |= Access::READ;
            }
            if oflags.writable() {
                rights |= Access::WRITE;
            }
            if !inode.check_access(creds, rights) {
                return_errno!(Errno::EACCES);
            }
            inode
        }
    };

    walker.walk_to(inode);
    Ok(File::new(walker, oflags))
}
