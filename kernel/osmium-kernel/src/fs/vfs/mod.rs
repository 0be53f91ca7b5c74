//! The VFS core: driver contract, interned inode/dentry caches, the
//! per-inode page cache, path walking and open file descriptions.

pub mod dentry;
pub mod file;
pub mod inode;
pub mod page_cache;
pub mod path;

use crate::prelude::*;

use self::inode::{Inode, NodeInit};

/// The driver contract every filesystem implements. All hooks return
/// kernel errors which the VFS passes through to syscalls unchanged.
pub trait FsDriver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Mounts an instance; returns the per-filesystem driver data.
    fn mount(&self, image: &str, options: Option<&str>) -> Result<Box<dyn Any + Send + Sync>>;

    /// The inode number of the root directory.
    fn root_ino(&self, fs: &FileSystem) -> u64;

    /// Describes the inode with the given number so the cache can
    /// construct it.
    fn load_inode(&self, fs: &Arc<FileSystem>, ino: u64) -> Result<NodeInit>;

    /// Resolves `name` under `dir` to a target inode number; `ENOENT`
    /// misses may be cached negatively.
    fn load_dentry(&self, dir: &Inode, name: &str) -> Result<u64>;

    /// Commits a new child of `dir`: assigns an inode number and
    /// describes the new inode. Runs with both cache locks held; the
    /// caller has already ruled out a name collision.
    fn make_node(&self, dir: &Inode, name: &str, mode: u32) -> Result<(u64, NodeInit)>;

    /// Fills one whole page of file content; bytes past the end of file
    /// must read zero.
    fn load_page(&self, inode: &Inode, offset: u64, buffer: &mut [u8]) -> Result<()>;

    /// Whether zero-reference inodes of this filesystem may be evicted
    /// to reclaim memory. Memory-only filesystems keep their data in
    /// the caches and must answer no.
    fn evictable(&self) -> bool {
        true
    }
}

/// One mounted filesystem instance. Identity (for the cache keys) is the
/// instance id, not the driver.
pub struct FileSystem {
    id: u64,
    driver: Arc<dyn FsDriver>,
    drvdata: Box<dyn Any + Send + Sync>,
}

impl FileSystem {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn driver(&self) -> &dyn FsDriver {
        &*self.driver
    }

    pub fn drvdata(&self) -> &(dyn Any + Send + Sync) {
        &*self.drvdata
    }

    pub fn root_inode(self: &Arc<Self>) -> Result<Arc<Inode>> {
        inode::get(self, self.driver.root_ino(self))
    }
}

lazy_static! {
    /// Registered drivers by name.
    static ref DRIVER_MAP: Mutex<BTreeMap<&'static str, Arc<dyn FsDriver>>> =
        Mutex::new(BTreeMap::new());
}

static NEXT_FS_ID: core::sync::atomic::AtomicU64 = core::sync::atomic::AtomicU64::new(1);

pub fn register_driver(driver: Arc<dyn FsDriver>) -> Result<()> {
    let mut map = DRIVER_MAP.lock();
    if map.contains_key(driver.name()) {
        return_errno!(Errno::EEXIST);
    }
    map.insert(driver.name(), driver);
    Ok(())
}

/// Mounts a filesystem by driver name.
pub fn create_filesystem(
    fsname: &str,
    image: &str,
    options: Option<&str>,
) -> Result<Arc<FileSystem>> {
    let driver = DRIVER_MAP
        .lock()
        .get(fsname)
        .cloned()
        .ok_or(Error::new(Errno::EINVAL))?;
    let drvdata = driver.mount(image, options)?;
    Ok(Arc::new(FileSystem {
        id: NEXT_FS_ID.fetch_add(1, core::sync::atomic::Ordering::SeqCst),
        driver,
        drvdata,
    }))
}
