//! The Osmium kernel binary: boot entry, ordered initialization, PID 1.

#![no_std]
#![no_main]

extern crate alloc;
// Linked for its init actions (VFS, initrd, kernel services).
extern crate osmium_kernel;

use core::panic::PanicInfo;

use osmium_frame::boot::BootInfo;
use osmium_frame::task;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    osmium_frame::panic_handler(info);
}

/// The bootloader jumps here (the address it finds in the hand-off
/// structure's `kernel_main`), passing that same structure back.
#[no_mangle]
pub extern "C" fn kmain(boot_info: *const BootInfo) -> ! {
    osmium_frame::init(boot_info as usize);

    // Everything above was strictly ordered by hand; from here the
    // subsystems declare their own ordering.
    osmium_frame::init_action::run_init_actions();

    #[cfg(ktest)]
    ktest::run_ktests();

    log::info!("osmium: starting init");
    osmium_kernel::spawn_init_process("/initrd/init");

    // The boot flow has nothing left to do; it only wakes again if
    // someone explicitly asks it to.
    loop {
        task::suspend();
    }
}
