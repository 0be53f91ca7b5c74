//! The unsafe core of the Osmium kernel.
//!
//! This crate owns everything that touches hardware or raw memory: the boot
//! hand-off, the physical frame pool and page tables, the kernel heap, the
//! per-CPU descriptors and inter-processor messaging, the scheduler and its
//! kernel-thread lifecycle, the trap/IRQ plumbing, and the blocking
//! primitives built on top of the scheduler. The policy layers (processes,
//! signals, the VFS, syscalls) live in `osmium-kernel` and only reach the
//! hardware through the interfaces exported here.

#![no_std]
#![allow(dead_code)]
#![feature(negative_impls)]
#![feature(alloc_error_handler)]

extern crate alloc;
#[macro_use]
extern crate ktest;

pub mod arch;
pub mod boot;
pub mod config;
pub mod cpu;
mod error;
pub mod init_action;
pub mod logger;
pub mod prelude;
pub mod sync;
pub mod task;
pub mod timer;
pub mod trap;
pub mod user;
pub mod vm;

use core::panic::PanicInfo;
use core::sync::atomic::{AtomicBool, Ordering};

pub use self::error::Error;
pub use self::prelude::Result;

/// Bring the frame up on the bootstrap CPU.
///
/// The order matters: the heap must exist before the frame pool allocates
/// its per-page metadata, the frame pool must exist before page tables can
/// grow, and traps must be in place before the APIC timer is calibrated.
pub fn init(boot_info_paddr: usize) {
    logger::init();
    vm::heap_allocator::init();
    boot::init(boot_info_paddr);
    vm::frame_pool::init();
    vm::page_table::init();
    trap::init();
    cpu::init_bsp();
    task::init_local();
    timer::init();
    cpu::register_cpus();
    task::init_global();
    cpu::start_aps();
}

static PANICKING: AtomicBool = AtomicBool::new(false);

/// The frame's panic path: log the diagnostic, then halt every CPU.
///
/// Reserved for contract violations (a broken recursive map, a double
/// fault, impossible scheduler state). The kernel binary forwards its
/// `#[panic_handler]` here.
pub fn panic_handler(info: &PanicInfo) -> ! {
    // A panic inside the panic path would recurse through the logger.
    if !PANICKING.swap(true, Ordering::SeqCst) {
        log::error!("[panic] {}", info);
        cpu::halt_others();
    }
    loop {
        x86_64::instructions::interrupts::disable();
        x86_64::instructions::hlt();
    }
}

#[if_cfg_ktest]
mod test {
    #[ktest]
    fn trivial_assertion() {
        assert_eq!(0, 0);
    }
}
