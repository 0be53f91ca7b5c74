//! Path resolution.

use crate::prelude::*;
use crate::process::Credentials;

use super::dentry;
use super::inode::{self, Access, Inode};

/// The state of a path walk: a reference to the directory (or file) the
/// walk currently stands on.
#[derive(Clone)]
pub struct PathWalker {
    current: Arc<Inode>,
}

impl PathWalker {
    pub fn new(start: Arc<Inode>) -> Self {
        Self { current: start }
    }

    pub fn current(&self) -> &Arc<Inode> {
        &self.current
    }

    pub fn into_inode(self) -> Arc<Inode> {
        self.current
    }

    /// Steps directly onto a known inode.
    pub fn walk_to(&mut self, inode: Arc<Inode>) {
        self.current = inode;
    }

    /// Walks `path` relative to the current position. A leading `/`
    /// rebases to the caller-provided root; `.` stays put; `..` follows
    /// the recorded parent inode number. Every traversed component must
    /// be a directory the credentials may search.
    pub fn walk(&mut self, path: &str, root: &PathWalker, creds: &Credentials) -> Result<()> {
        if path.is_empty() {
            // Empty paths must not resolve.
            return_errno!(Errno::ENOENT);
        }

        let mut rest = path;
        if let Some(stripped) = rest.strip_prefix('/') {
            self.current = root.current.clone();
            rest = stripped;
        }

        for component in rest.split('/') {
            if !self.current.is_dir() {
                return_errno!(Errno::ENOTDIR);
            }
            if !self.current.check_access(creds, Access::EXEC) {
                return_errno!(Errno::EACCES);
            }
            match component {
                "" | "." => continue,
                ".." => {
                    let parent =
                        inode::get(self.current.fs(), self.current.parent_ino())?;
                    self.current = parent;
                }
                name => {
                    self.current = dentry::lookup_inode(&self.current, name)?;
                }
            }
        }
        Ok(())
    }
}

/// The final component of `path`; empty for paths ending in `/`.
pub fn base_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(index) => &path[index + 1..],
        None => path,
    }
}

/// Everything before the final component: `"."` for bare names, `"/"`
/// at the root.
pub fn dir_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(index) => &path[..index],
        None => ".",
    }
}

#[if_cfg_ktest]
mod test {
    use super::*;

    #[ktest]
    fn split_of_absolute_paths() {
        assert_eq!(dir_name("/initrd/test"), "/initrd");
        assert_eq!(base_name("/initrd/test"), "test");
        assert_eq!(dir_name("/test"), "/");
        assert_eq!(base_name("/test"), "test");
    }

    #[ktest]
    fn split_of_relative_paths() {
        assert_eq!(dir_name("test"), ".");
        assert_eq!(base_name("test"), "test");
        assert_eq!(dir_name("a/b"), "a");
        assert_eq!(base_name("a/b"), "b");
    }
}
