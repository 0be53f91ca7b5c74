//! Trap, interrupt and syscall entry plumbing.
//!
//! Kernel-mode traps are handled in place on the current stack. Traps and
//! syscalls arriving from user mode instead bank the full user register
//! state into the thread's [`UserContext`](crate::user::UserContext) and
//! return to the kernel code that entered user mode, so that signal
//! dispatch and preemption always see a complete register image.

pub mod handler;
pub mod irq;

pub use irq::{disable_local, irqs_enabled, register_irq_callback, DisabledLocalIrqGuard, IrqContext};

/// APIC timer tick.
pub const VECTOR_TIMER: u8 = 0x40;
/// Wake a halted CPU; the handler body is empty on purpose.
pub const VECTOR_IPI_WAKE: u8 = 0x41;
/// Drain the per-CPU message inbox.
pub const VECTOR_IPI_MESSAGE: u8 = 0x42;
pub const VECTOR_SPURIOUS: u8 = 0xFF;

pub(crate) fn init() {
    irq::init();
    handler::init();
}
