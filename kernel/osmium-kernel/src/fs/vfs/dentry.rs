//! Directory entries and the interning dentry cache.
//!
//! A dentry associates (filesystem, parent inode number, name) with a
//! target inode number. Misses that the driver answers with `ENOENT`
//! are cached negatively; creation replaces the negative entry under
//! the same lock that checked it, which is what makes `O_EXCL` honest.

use crate::prelude::*;

use super::inode::{self, Inode, NodeInit};
use super::FileSystem;

bitflags! {
    pub struct DentryFlags: u32 {
        /// The cache is the only copy of this association (memory-only
        /// filesystems); it must never be evicted.
        const NO_CACHE = 1 << 0;
    }
}

pub struct Dentry {
    fs_id: u64,
    parent_ino: u64,
    name: String,
    /// `None` is a cached negative result.
    target: Option<u64>,
    flags: DentryFlags,
}

impl Dentry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> Option<u64> {
        self.target
    }
}

lazy_static! {
    static ref DENTRY_CACHE: Mutex<BTreeMap<(u64, u64, String), Arc<Dentry>>> =
        Mutex::new(BTreeMap::new());
}

/// Looks `name` up under `dir`, asking the driver on a miss. Returns the
/// dentry, which may be negative.
pub fn get(dir: &Inode, name: &str) -> Result<Arc<Dentry>> {
    if !dir.is_dir() {
        return_errno!(Errno::ENOTDIR);
    }
    let key = (dir.fs().id(), dir.ino(), name.to_string());
    let mut cache = DENTRY_CACHE.lock();

    if let Some(dentry) = cache.get(&key) {
        return Ok(dentry.clone());
    }

    let (target, flags) = match dir.fs().driver().load_dentry(dir, name) {
        Ok(ino) => (Some(ino), DentryFlags::empty()),
        Err(err) if err.error() == Errno::ENOENT => (None, DentryFlags::empty()),
        Err(err) => return Err(err),
    };
    let dentry = Arc::new(Dentry {
        fs_id: dir.fs().id(),
        parent_ino: dir.ino(),
        name: name.to_string(),
        target,
        flags,
    });
    cache.insert(key, dentry.clone());
    Ok(dentry)
}

/// Resolves a lookup to an inode, turning negative entries into ENOENT.
pub fn lookup_inode(dir: &Inode, name: &str) -> Result<Arc<Inode>> {
    let dentry = get(dir, name)?;
    let Some(target) = dentry.target() else {
        return_errno!(Errno::ENOENT);
    };
    inode::get(dir.fs(), target)
}

/// Creates a new node under `dir`, atomically with respect to the two
/// caches: both locks are taken (inode cache first), the name is
/// re-checked, the driver commits, and then both the inode and the
/// dentry are inserted before either lock drops.
pub fn make_node(dir: &Inode, name: &str, mode: u32) -> Result<Arc<Inode>> {
    if !dir.is_dir() {
        return_errno!(Errno::ENOTDIR);
    }
    if name.is_empty() || name.contains('/') {
        return_errno!(Errno::EINVAL);
    }

    // Lock order: inode cache before dentry cache, everywhere.
    let fs: Arc<FileSystem> = dir.fs().clone();
    let _inode_cache = super::inode::lock_cache();
    let mut cache = DENTRY_CACHE.lock();
    let key = (fs.id(), dir.ino(), name.to_string());

    if let Some(existing) = cache.get(&key) {
        if existing.target().is_some() {
            return_errno!(Errno::EEXIST);
        }
        // A negative entry is about to be overwritten by the creation.
    } else if dir.fs().driver().load_dentry(dir, name).is_ok() {
        return_errno!(Errno::EEXIST);
    }

    let (ino, init): (u64, NodeInit) = fs.driver().make_node(dir, name, mode)?;
    let inode = inode::intern_new(&fs, ino, init);

    cache.insert(
        key,
        Arc::new(Dentry {
            fs_id: fs.id(),
            parent_ino: dir.ino(),
            name: name.to_string(),
            target: Some(ino),
            flags: DentryFlags::NO_CACHE,
        }),
    );
    Ok(inode)
}
