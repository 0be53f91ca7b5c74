//! Entering and leaving user mode.
//!
//! A user thread's register image lives in its [`UserContext`]. The kernel
//! side of the thread loops on [`UserContext::execute`], which drops into
//! user mode and comes back whenever the user code traps: on a syscall,
//! an exception (most importantly a page fault), or a hardware interrupt.
//! Signal dispatch works by editing the context between `execute` calls.

use crate::arch;
use crate::arch::x86::apic;
use crate::trap::irq::{self, IrqContext};

extern "C" {
    fn __enter_user(ctx: *mut UserContext);
}

/// Why `execute` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnReason {
    /// The `syscall` instruction; arguments are in the banked registers.
    Syscall,
    /// A CPU exception other than a page fault.
    Exception { vector: u8, error_code: u64 },
    /// A page fault, with the faulting address and the hardware error code.
    PageFault { addr: usize, error_code: u64 },
    /// A hardware interrupt arrived; it has already been dispatched.
    Interrupted,
}

pub const PF_PRESENT: u64 = 1 << 0;
pub const PF_WRITE: u64 = 1 << 1;
pub const PF_USER: u64 = 1 << 2;
pub const PF_FETCH: u64 = 1 << 4;

const REASON_SYSCALL: u64 = 0;
const REASON_TRAP: u64 = 1;

const PAGE_FAULT_VECTOR: u64 = 14;

/// The complete user-visible register state of a thread.
///
/// The field order and size are part of the contract with trap.S; the
/// assembly addresses fields by fixed offsets from the start.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct UserContext {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,
    pub fs_base: u64,
    reason: u64,
    vector: u64,
    error_code: u64,
    cr2: u64,
    /// FXSAVE image, banked at the user boundary. The kernel itself is
    /// compiled soft-float, so nothing clobbers user FPU state between
    /// the fxsave on entry and the fxrstor on the way back out.
    pub fpu: FpuArea,
}

/// A 512-byte FXSAVE area.
#[derive(Debug, Clone, Copy)]
#[repr(C, align(16))]
pub struct FpuArea {
    bytes: [u8; 512],
}

impl FpuArea {
    /// x87 control word: all exceptions masked, 64-bit precision.
    const DEFAULT_FCW: u16 = 0x037F;
    /// MXCSR: all SSE exceptions masked.
    const DEFAULT_MXCSR: u32 = 0x1F80;

    pub fn as_bytes(&self) -> &[u8; 512] {
        &self.bytes
    }

    /// The state a fresh user context starts from.
    pub fn reset(&mut self) {
        self.bytes = [0; 512];
        self.bytes[0..2].copy_from_slice(&Self::DEFAULT_FCW.to_le_bytes());
        self.bytes[24..28].copy_from_slice(&Self::DEFAULT_MXCSR.to_le_bytes());
    }
}

impl Default for FpuArea {
    fn default() -> Self {
        let mut area = Self { bytes: [0; 512] };
        area.reset();
        area
    }
}

/// RFLAGS for fresh user entries: interrupts on, reserved bit 1 set.
pub const USER_RFLAGS: u64 = 0x202;

impl UserContext {
    pub fn new() -> Self {
        Self {
            rflags: USER_RFLAGS,
            ..Self::default()
        }
    }

    /// Runs this context in user mode until it traps back.
    ///
    /// Must be called from the kernel thread that owns the context, with
    /// interrupts enabled.
    pub fn execute(&mut self) -> ReturnReason {
        debug_assert!(irq::irqs_enabled());
        self.rflags |= USER_RFLAGS;
        arch::set_fs_base(self.fs_base);

        // Interrupts stay off from the FPU restore until the iretq loads
        // the user RFLAGS: a preemption in between would let another
        // thread clobber the just-restored FPU state. The entry paths
        // come back with interrupts still masked, so the save below is
        // protected the same way.
        x86_64::instructions::interrupts::disable();

        // Safety: the context is a complete register image; trap.S banks
        // the registers back into it before returning here. The FPU image
        // is a valid FXSAVE area by construction.
        unsafe {
            core::arch::asm!("fxrstor64 [{}]", in(reg) self.fpu.bytes.as_ptr(),
                options(nostack, readonly));
            __enter_user(self as *mut UserContext);
            core::arch::asm!("fxsave64 [{}]", in(reg) self.fpu.bytes.as_mut_ptr(),
                options(nostack));
        }

        // Back from user mode with interrupts masked by the entry path.
        let reason = match self.reason {
            REASON_SYSCALL => ReturnReason::Syscall,
            REASON_TRAP if self.vector >= 32 => {
                if self.vector as u8 != crate::trap::VECTOR_SPURIOUS {
                    apic::eoi();
                }
                ReturnReason::Interrupted
            }
            REASON_TRAP if self.vector == PAGE_FAULT_VECTOR => ReturnReason::PageFault {
                addr: self.cr2 as usize,
                error_code: self.error_code,
            },
            _ => ReturnReason::Exception {
                vector: self.vector as u8,
                error_code: self.error_code,
            },
        };

        x86_64::instructions::interrupts::enable();

        if let ReturnReason::Interrupted = reason {
            // The tick handler may preempt us right here, exactly as it
            // would preempt a thread interrupted in kernel mode.
            irq::dispatch(&IrqContext {
                vector: self.vector as u8,
                from_user: true,
            });
        }

        reason
    }
}

const _: () = {
    assert!(core::mem::offset_of!(UserContext, rip) == 0x78);
    assert!(core::mem::offset_of!(UserContext, rsp) == 0x80);
    assert!(core::mem::offset_of!(UserContext, rflags) == 0x88);
    assert!(core::mem::offset_of!(UserContext, fs_base) == 0x90);
    assert!(core::mem::offset_of!(UserContext, reason) == 0x98);
    assert!(core::mem::offset_of!(UserContext, vector) == 0xA0);
    assert!(core::mem::offset_of!(UserContext, error_code) == 0xA8);
    assert!(core::mem::offset_of!(UserContext, cr2) == 0xB0);
};
