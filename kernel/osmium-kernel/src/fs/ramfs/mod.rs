//! A memory-only filesystem.
//!
//! File content lives purely in the page cache and directory content
//! purely in the dentry cache, so loading anything "from disk" either
//! means zero-filling (pages) or reporting a miss (dentries). Nothing
//! may be evicted, which `evictable` announces to the caches.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::fs::vfs::inode::{
    Inode, InodeFlags, NodeInit, MODE_DIRECTORY, MODE_REGULAR, MODE_STICKY, MODE_TYPE_MASK,
};
use crate::fs::vfs::{FileSystem, FsDriver};
use crate::prelude::*;

pub const ROOT_INO: u64 = 2;
const FIRST_DYNAMIC_INO: u64 = 8;

/// Per-mount driver data: the inode number allocator.
struct RamfsData {
    next_ino: AtomicU64,
}

pub struct RamFs;

impl FsDriver for RamFs {
    fn name(&self) -> &'static str {
        "ramfs"
    }

    fn mount(&self, image: &str, options: Option<&str>) -> Result<Box<dyn Any + Send + Sync>> {
        if options.is_some() {
            // No options are supported.
            return_errno!(Errno::EINVAL);
        }
        if !image.is_empty() {
            // Only the empty string names a ramfs image.
            return_errno!(Errno::EINVAL);
        }
        Ok(Box::new(RamfsData {
            next_ino: AtomicU64::new(FIRST_DYNAMIC_INO),
        }))
    }

    fn root_ino(&self, _fs: &FileSystem) -> u64 {
        ROOT_INO
    }

    fn load_inode(&self, _fs: &Arc<FileSystem>, ino: u64) -> Result<NodeInit> {
        if ino != ROOT_INO {
            // Every other inode is created through make_node and then
            // pinned in the cache; a miss on one is a contract breach.
            panic!("ramfs asked to load dynamic inode {}", ino);
        }
        Ok(NodeInit {
            mode: MODE_DIRECTORY | MODE_STICKY | 0o755,
            uid: 0,
            gid: 0,
            // The root can be reloaded any time, so it need not stay
            // cached.
            flags: InodeFlags::NO_CACHE,
            parent_ino: ROOT_INO,
            size: 0,
            drvdata: Box::new(()),
        })
    }

    fn load_dentry(&self, _dir: &Inode, _name: &str) -> Result<u64> {
        // A cache miss can only mean the entry does not exist.
        return_errno!(Errno::ENOENT);
    }

    fn make_node(&self, dir: &Inode, _name: &str, mode: u32) -> Result<(u64, NodeInit)> {
        let data = dir
            .fs()
            .drvdata()
            .downcast_ref::<RamfsData>()
            .expect("ramfs mount data");
        let ino = data.next_ino.fetch_add(1, Ordering::SeqCst);

        let mut flags = InodeFlags::empty();
        if mode & MODE_TYPE_MASK == MODE_REGULAR {
            flags |= InodeFlags::SEEKABLE;
        }
        let parent_ino = dir.ino();
        Ok((
            ino,
            NodeInit {
                mode,
                uid: 0,
                gid: 0,
                flags,
                parent_ino,
                size: 0,
                drvdata: Box::new(()),
            },
        ))
    }

    fn load_page(&self, _inode: &Inode, _offset: u64, buffer: &mut [u8]) -> Result<()> {
        // Nothing is ever "already on disk"; fresh pages read zero.
        buffer.fill(0);
        Ok(())
    }

    fn evictable(&self) -> bool {
        false
    }
}
