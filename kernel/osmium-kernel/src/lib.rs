//! Kernel services of Osmium: processes and their address spaces, signal
//! delivery, the VFS core (inode/dentry caches, page cache, path walker),
//! the in-memory filesystem and initrd, the ELF loader, and the syscall
//! table. Everything here sits on top of `osmium-frame`.

#![no_std]
#![allow(dead_code)]
#![feature(negative_impls)]

extern crate alloc;
#[macro_use]
extern crate ktest;

pub mod error;
pub mod fs;
pub mod loader;
pub mod prelude;
pub mod process;
pub mod syscall;
pub mod thread;
pub mod util;

use osmium_frame::kernel_init_action;

pub const KIA_KERNEL_SERVICES: &str = "kernelServices";

fn kernel_services_init() {
    process::signal::init();
    syscall::init();
}

kernel_init_action!(
    KIA_KERNEL_SERVICES,
    kernel_services_init,
    fs::KIA_VFS_KERNEL_ROOT,
);

/// Spawns PID 1 from the unpacked initrd and never returns failure
/// quietly: a kernel without `init` cannot run.
pub fn spawn_init_process(path: &str) {
    process::spawn_init(path).expect("failed to start the init process");
}
