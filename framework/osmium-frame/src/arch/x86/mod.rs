pub mod apic;
pub mod device;
pub mod mm;

use x86_64::registers::model_specific::FsBase;
use x86_64::VirtAddr;

/// Reads the time-stamp counter.
#[inline]
pub fn read_tsc() -> u64 {
    // Safety: `rdtsc` has no memory effects.
    unsafe { core::arch::x86_64::_rdtsc() }
}

#[inline]
pub fn set_fs_base(fs_base: u64) {
    FsBase::write(VirtAddr::new(fs_base));
}

/// Enables interrupts and halts until the next one arrives. The `sti; hlt`
/// pair is a single interrupt window, so a wake IPI sent just before cannot
/// be lost.
#[inline]
pub fn idle_wait() {
    x86_64::instructions::interrupts::enable_and_hlt();
}
