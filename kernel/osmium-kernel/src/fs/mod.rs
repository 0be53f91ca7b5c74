//! Filesystem layer: VFS core, ramfs, initrd unpacking, file tables.

pub mod file_table;
pub mod initrd;
pub mod ramfs;
pub mod vfs;

use osmium_frame::kernel_init_action;
use spin::Once;

use crate::prelude::*;
use crate::process::Credentials;

use self::vfs::dentry;
use self::vfs::inode::{Access, MODE_DIRECTORY};
use self::vfs::path::{self, PathWalker};

pub const KIA_VFS_DRIVERS: &str = "vfsDrivers";
pub const KIA_VFS_KERNEL_ROOT: &str = "vfsKernelRoot";
pub const KIA_INITRD: &str = "initrd";

static KERNEL_ROOT: Once<PathWalker> = Once::new();

fn drivers_init() {
    vfs::register_driver(Arc::new(ramfs::RamFs)).expect("ramfs registration failed");
    vfs::inode::init_reclaimer();
}

kernel_init_action!(KIA_VFS_DRIVERS, drivers_init);

fn kernel_root_init() {
    let rootfs = vfs::create_filesystem("ramfs", "", None)
        .expect("failed to create the kernel root filesystem");
    let root = rootfs
        .root_inode()
        .expect("failed to load the kernel root inode");
    KERNEL_ROOT.call_once(|| PathWalker::new(root));
}

kernel_init_action!(KIA_VFS_KERNEL_ROOT, kernel_root_init, KIA_VFS_DRIVERS);

fn initrd_init() {
    initrd::unpack();
}

kernel_init_action!(KIA_INITRD, initrd_init, KIA_VFS_KERNEL_ROOT);

/// A walker standing on the kernel root directory.
pub fn root_walker() -> PathWalker {
    KERNEL_ROOT
        .get()
        .expect("kernel root not initialized")
        .clone()
}

/// Creates a directory at `path` (relative to `start`), applying the
/// usual write/search checks on the parent.
pub fn create_directory(
    start: &PathWalker,
    creds: &Credentials,
    path: &str,
    mode: u32,
) -> Result<()> {
    let mut walker = start.clone();
    walker.walk(path::dir_name(path), start, creds)?;
    let base = path::base_name(path);
    if base.is_empty() {
        return_errno!(Errno::EINVAL);
    }
    let dir = walker.current();
    if !dir.check_access(creds, Access::WRITE | Access::EXEC) {
        return_errno!(Errno::EACCES);
    }
    dentry::make_node(dir, base, (mode & 0o777) | MODE_DIRECTORY)?;
    Ok(())
}
