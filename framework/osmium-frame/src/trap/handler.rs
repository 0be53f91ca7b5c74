//! IDT construction and the kernel-mode trap handler.

use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Once;
use x86_64::registers::model_specific::{Efer, EferFlags, LStar, SFMask, Star};
use x86_64::registers::rflags::RFlags;
use x86_64::structures::idt::InterruptDescriptorTable;
use x86_64::VirtAddr;

use super::irq::{self, IrqContext};
use crate::arch::x86::apic;

core::arch::global_asm!(include_str!("trap.S"));

extern "C" {
    static __vector_table: [usize; VECTOR_LIST.len()];
    fn __syscall_entry();
}

/// The vectors for which trap.S emits stubs, in table order.
const VECTOR_LIST: [u8; 25] = [
    0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20,
    super::VECTOR_TIMER,
    super::VECTOR_IPI_WAKE,
    super::VECTOR_IPI_MESSAGE,
    super::VECTOR_SPURIOUS,
];

/// Index into the per-CPU IST used for double faults; a broken kernel
/// stack must not take the fault handler down with it.
pub(crate) const DOUBLE_FAULT_IST_INDEX: u16 = 0;

static IDT: Once<InterruptDescriptorTable> = Once::new();

pub(crate) fn init() {
    IDT.call_once(|| {
        let mut idt = InterruptDescriptorTable::new();
        // Safety: each address is the matching trap.S stub, which follows
        // the interrupt calling contract; `__vector_table` is in table
        // order with respect to VECTOR_LIST.
        unsafe {
            let stub = |i: usize| {
                // Safety: the extern static is a fixed table emitted by
                // trap.S.
                unsafe { VirtAddr::new(__vector_table[i] as u64) }
            };
            idt.divide_error.set_handler_addr(stub(0));
            idt.debug.set_handler_addr(stub(1));
            idt.non_maskable_interrupt.set_handler_addr(stub(2));
            idt.breakpoint.set_handler_addr(stub(3));
            idt.overflow.set_handler_addr(stub(4));
            idt.bound_range_exceeded.set_handler_addr(stub(5));
            idt.invalid_opcode.set_handler_addr(stub(6));
            idt.device_not_available.set_handler_addr(stub(7));
            idt.double_fault
                .set_handler_addr(stub(8))
                .set_stack_index(DOUBLE_FAULT_IST_INDEX);
            idt.invalid_tss.set_handler_addr(stub(10));
            idt.segment_not_present.set_handler_addr(stub(11));
            idt.stack_segment_fault.set_handler_addr(stub(12));
            idt.general_protection_fault.set_handler_addr(stub(13));
            idt.page_fault.set_handler_addr(stub(14));
            idt.x87_floating_point.set_handler_addr(stub(16));
            idt.alignment_check.set_handler_addr(stub(17));
            idt.machine_check.set_handler_addr(stub(18));
            idt.simd_floating_point.set_handler_addr(stub(19));
            idt.virtualization.set_handler_addr(stub(20));
            idt[super::VECTOR_TIMER as usize].set_handler_addr(stub(21));
            idt[super::VECTOR_IPI_WAKE as usize].set_handler_addr(stub(22));
            idt[super::VECTOR_IPI_MESSAGE as usize].set_handler_addr(stub(23));
            idt[super::VECTOR_SPURIOUS as usize].set_handler_addr(stub(24));
        }
        idt
    });
    load();
}

/// Loads the shared IDT on the calling CPU.
pub(crate) fn load() {
    IDT.get().expect("IDT not built").load();
}

/// Programs the `syscall` MSRs on the calling CPU. The GDT selector layout
/// comes from the cpu module.
pub(crate) fn init_syscall_msrs(
    kernel_cs: x86_64::structures::gdt::SegmentSelector,
    kernel_ss: x86_64::structures::gdt::SegmentSelector,
    user_cs: x86_64::structures::gdt::SegmentSelector,
    user_ss: x86_64::structures::gdt::SegmentSelector,
) {
    // Safety: selectors refer to the GDT installed on this CPU; the entry
    // point is the trap.S stub.
    unsafe {
        Efer::update(|flags| flags.insert(EferFlags::SYSTEM_CALL_EXTENSIONS));
        Star::write(user_cs, user_ss, kernel_cs, kernel_ss).unwrap();
        LStar::write(VirtAddr::new(__syscall_entry as usize as u64));
        SFMask::write(
            RFlags::INTERRUPT_FLAG | RFlags::DIRECTION_FLAG | RFlags::TRAP_FLAG,
        );
    }
}

/// The full register frame a kernel-mode trap leaves on the stack.
/// Field order matches the push sequence in trap.S.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct KernelTrapFrame {
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
    pub vector: u64,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

static KERNEL_TRAP_COUNT: AtomicUsize = AtomicUsize::new(0);

#[no_mangle]
extern "C" fn __kernel_trap_handler(frame: *mut KernelTrapFrame) {
    // Safety: trap.S passes a pointer to the frame it just pushed.
    let frame = unsafe { &mut *frame };
    KERNEL_TRAP_COUNT.fetch_add(1, Ordering::Relaxed);

    let vector = frame.vector as u8;
    if vector >= 32 {
        if vector != super::VECTOR_SPURIOUS {
            // Acknowledge first: the tick callback may context-switch away
            // and must not hold up further interrupts on this CPU.
            apic::eoi();
            irq::dispatch(&IrqContext {
                vector,
                from_user: false,
            });
        }
        return;
    }

    // Kernel-mode exceptions are contract violations: the kernel never
    // dereferences user addresses directly (user copies go through the
    // direct map), so there is no fixup path to search.
    panic!(
        "kernel-mode exception {} (error code {:#x}) at {:#x}, cr2={:#x}\n{:#x?}",
        vector,
        frame.error_code,
        frame.rip,
        x86_64::registers::control::Cr2::read().as_u64(),
        frame,
    );
}
