//! Inodes and the interning cache.
//!
//! Identity is (filesystem instance, inode number); the cache guarantees
//! at most one object per identity. Cacheable inodes are pinned by the
//! cache even with no outside references and only leave it through the
//! eviction hook; non-cacheable ones are tracked weakly and die with
//! their last reference.

use core::sync::atomic::{AtomicU64, Ordering};

use osmium_frame::vm::frame_pool::{self, PoolMask};

use crate::prelude::*;
use crate::process::Credentials;

use super::page_cache::PageCache;
use super::FileSystem;

pub const MODE_SETUID: u32 = 0o4000;
pub const MODE_SETGID: u32 = 0o2000;
pub const MODE_STICKY: u32 = 0o1000;

pub const MODE_REGULAR: u32 = 0;
pub const MODE_DIRECTORY: u32 = 0x1000;
pub const MODE_TYPE_MASK: u32 = 0xF000;

bitflags! {
    pub struct InodeFlags: u32 {
        /// Positioned reads and writes make sense.
        const SEEKABLE = 1 << 0;
        /// Must not stay cached once unreferenced.
        const NO_CACHE = 1 << 1;
    }
}

bitflags! {
    pub struct Access: u32 {
        const EXEC  = 1 << 0;
        const WRITE = 1 << 1;
        const READ  = 1 << 2;
    }
}

/// What a driver reports about an inode when the cache constructs it.
pub struct NodeInit {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub flags: InodeFlags,
    /// The inode number of the containing directory; directories record
    /// their parent by number, never by pointer, which is what keeps the
    /// inode/dentry graph acyclic.
    pub parent_ino: u64,
    pub size: u64,
    pub drvdata: Box<dyn Any + Send + Sync>,
}

pub struct Inode {
    fs: Arc<FileSystem>,
    ino: u64,
    mode: u32,
    uid: u32,
    gid: u32,
    flags: InodeFlags,
    parent_ino: u64,
    /// File size; grows monotonically under concurrent writers via
    /// compare-and-swap in the page-cache layer.
    size: AtomicU64,
    page_cache: PageCache,
    drvdata: Box<dyn Any + Send + Sync>,
}

impl Inode {
    pub fn fs(&self) -> &Arc<FileSystem> {
        &self.fs
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }

    pub fn file_type(&self) -> u32 {
        self.mode & MODE_TYPE_MASK
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == MODE_DIRECTORY
    }

    pub fn is_regular(&self) -> bool {
        self.file_type() == MODE_REGULAR
    }

    pub fn flags(&self) -> InodeFlags {
        self.flags
    }

    pub fn parent_ino(&self) -> u64 {
        self.parent_ino
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    pub fn page_cache(&self) -> &PageCache {
        &self.page_cache
    }

    pub fn drvdata(&self) -> &(dyn Any + Send + Sync) {
        &*self.drvdata
    }

    /// Grows the recorded size to at least `new_end`; never shrinks.
    pub(crate) fn grow_size(&self, new_end: u64) {
        let mut current = self.size.load(Ordering::SeqCst);
        while current < new_end {
            match self.size.compare_exchange(
                current,
                new_end,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(seen) => current = seen,
            }
        }
    }

    /// Classic owner/group/other permission check.
    pub fn check_access(&self, creds: &Credentials, access: Access) -> bool {
        if creds.euid == 0 {
            return true;
        }
        let shift = if creds.euid == self.uid {
            6
        } else if creds.egid == self.gid {
            3
        } else {
            0
        };
        let granted = (self.mode >> shift) & 0o7;
        granted & access.bits() == access.bits()
    }

    /// Reads file content through the page cache. Regular files clip to
    /// the current size; directories refuse.
    pub fn read_at(&self, buf: &mut [u8], pos: u64) -> Result<usize> {
        if self.is_dir() {
            return_errno!(Errno::EISDIR);
        }
        if !self.is_regular() {
            return_errno!(Errno::EINVAL);
        }
        let size = self.size();
        if pos >= size {
            return Ok(0);
        }
        let len = buf.len().min((size - pos) as usize);
        self.page_cache.read(self, pos, &mut buf[..len])?;
        Ok(len)
    }

    /// Writes through the page cache, growing the size first so a
    /// concurrent reader never sees bytes past the recorded end.
    pub fn write_at(&self, buf: &[u8], pos: u64) -> Result<usize> {
        if self.is_dir() {
            return_errno!(Errno::EISDIR);
        }
        if !self.is_regular() {
            return_errno!(Errno::EINVAL);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        self.grow_size(pos + buf.len() as u64);
        self.page_cache.write(self, pos, buf)?;
        Ok(buf.len())
    }
}

/// A cache slot: cacheable inodes are held strongly (they survive a
/// refcount of zero), non-cacheable ones weakly.
pub(super) enum CacheSlot {
    Pinned(Arc<Inode>),
    Tracked(Weak<Inode>),
}

lazy_static! {
    static ref INODE_CACHE: Mutex<BTreeMap<(u64, u64), CacheSlot>> = Mutex::new(BTreeMap::new());
}

/// Interned lookup: find the inode or construct it by asking the driver.
pub fn get(fs: &Arc<FileSystem>, ino: u64) -> Result<Arc<Inode>> {
    let mut cache = INODE_CACHE.lock();
    let key = (fs.id(), ino);

    if let Some(slot) = cache.get(&key) {
        match slot {
            CacheSlot::Pinned(inode) => return Ok(inode.clone()),
            CacheSlot::Tracked(weak) => {
                if let Some(inode) = weak.upgrade() {
                    return Ok(inode);
                }
                // The last reference died; fall through and reload.
            }
        }
    }

    let init = fs.driver().load_inode(fs, ino)?;
    let inode = construct(fs, ino, init);
    insert_locked(&mut cache, key, &inode);
    Ok(inode)
}

fn construct(fs: &Arc<FileSystem>, ino: u64, init: NodeInit) -> Arc<Inode> {
    Arc::new(Inode {
        fs: fs.clone(),
        ino,
        mode: init.mode,
        uid: init.uid,
        gid: init.gid,
        flags: init.flags,
        parent_ino: init.parent_ino,
        size: AtomicU64::new(init.size),
        page_cache: PageCache::new(),
        drvdata: init.drvdata,
    })
}

fn insert_locked(
    cache: &mut BTreeMap<(u64, u64), CacheSlot>,
    key: (u64, u64),
    inode: &Arc<Inode>,
) {
    let slot = if inode.flags().contains(InodeFlags::NO_CACHE) {
        CacheSlot::Tracked(Arc::downgrade(inode))
    } else {
        CacheSlot::Pinned(inode.clone())
    };
    cache.insert(key, slot);
}

/// Holds the inode-cache lock for the span of a node creation; the lock
/// is recursive, so `intern_new` may re-enter below this.
pub(super) fn lock_cache() -> MutexGuard<'static, BTreeMap<(u64, u64), CacheSlot>> {
    INODE_CACHE.lock()
}

/// Used by node creation, which must insert under its own lock pairing.
pub(super) fn intern_new(fs: &Arc<FileSystem>, ino: u64, init: NodeInit) -> Arc<Inode> {
    let mut cache = INODE_CACHE.lock();
    let inode = construct(fs, ino, init);
    insert_locked(&mut cache, (fs.id(), ino), &inode);
    inode
}

/// The inode-pool reclaimer: drop cached inodes nobody references, for
/// filesystems whose content can be reloaded. Returns whether anything
/// was freed.
fn reclaim_unreferenced() -> bool {
    // Reclaim may be triggered from allocation paths that cannot block;
    // those just miss out on this reserve.
    if !osmium_frame::trap::irqs_enabled() || osmium_frame::task::try_current().is_none() {
        return false;
    }
    let mut cache = INODE_CACHE.lock();
    let mut victims = Vec::new();
    for (&key, slot) in cache.iter() {
        match slot {
            CacheSlot::Pinned(inode) => {
                if Arc::strong_count(inode) == 1 && inode.fs().driver().evictable() {
                    victims.push(key);
                }
            }
            CacheSlot::Tracked(weak) => {
                if weak.strong_count() == 0 {
                    victims.push(key);
                }
            }
        }
    }
    let any = !victims.is_empty();
    for key in victims {
        cache.remove(&key);
    }
    any
}

pub(crate) fn init_reclaimer() {
    frame_pool::register_reclaimer(PoolMask::INODES, reclaim_unreferenced);
}
