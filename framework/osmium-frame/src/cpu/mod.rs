//! The CPU subsystem: per-CPU descriptors, AP bring-up, and
//! inter-processor messaging.

mod ap_boot;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spin::Once;
use x86_64::instructions::segmentation::{Segment, CS, DS, ES, SS};
use x86_64::instructions::tables::load_tss;
use x86_64::registers::model_specific::GsBase;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

use crate::arch::x86::apic;
use crate::config::{KERNEL_HALF_BASE, KERNEL_STACK_SIZE, MAX_CPUS};
use crate::sync::SpinLock;
use crate::task::Task;
use crate::trap::{self, handler, IrqContext};
use crate::vm::{Paddr, Vaddr};

/// The assembly-visible head of the CPU descriptor. trap.S addresses
/// these fields gs-relative by fixed offset; do not reorder.
#[repr(C)]
struct CpuAsmHeader {
    /// gs:0x00 — points back at the containing `Cpu`.
    self_ptr: *const Cpu,
    /// gs:0x08 — the `UserContext` being executed, while in user mode.
    current_uctx: UnsafeCell<u64>,
    /// gs:0x10 — reserved.
    _reserved: u64,
    /// gs:0x18 — kernel stack position to return to from user mode.
    kernel_ret_rsp: UnsafeCell<u64>,
    /// gs:0x20 — scratch slot for the entry paths.
    scratch: UnsafeCell<u64>,
    /// gs:0x28 — address of this CPU's TSS.rsp0 field.
    tss_rsp0_ptr: *mut u64,
}

/// One message crossing CPUs. The sender suspends until `ack`.
pub(crate) struct CpuMessage {
    kind: MessageKind,
    ack: AtomicBool,
    waiter: SpinLock<Option<Arc<Task>>>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum MessageKind {
    /// Invalidate one page, if this CPU currently uses the given root.
    InvlpgPage { root: Paddr, vaddr: Vaddr },
    /// Invalidate the whole TLB, if this CPU currently uses the root.
    InvlpgAll { root: Paddr },
    /// A signal was posted for something this CPU may be running; the
    /// interrupt alone forces the running thread through its signal
    /// check, so there is nothing to do beyond acknowledging.
    SignalDelivered,
    /// Panic path: stop executing. Never acknowledged.
    Halt,
}

/// A per-core descriptor.
pub struct Cpu {
    asm: CpuAsmHeader,
    index: usize,
    apic_id: u32,
    /// The root this CPU has loaded (or is about to load). Shootdown
    /// senders consult this, so it is published before CR3 is written.
    current_root: AtomicU64,
    /// Inbox of cross-CPU messages.
    inbox: SpinLock<alloc::collections::VecDeque<Arc<CpuMessage>>>,
    /// The task currently running here. Only touched by the scheduler,
    /// under the scheduler lock or from this CPU itself.
    pub(crate) current_task: UnsafeCell<Option<Arc<Task>>>,
    /// The outgoing task of an in-progress context switch, parked here so
    /// the incoming thread can drop the handle off the outgoing stack.
    pub(crate) prev_task: UnsafeCell<Option<Arc<Task>>>,
    /// This CPU's idle task.
    pub(crate) idle_task: Once<Arc<Task>>,
    tss: *mut TaskStateSegment,
}

// Safety: fields with interior mutability are guarded as documented on
// each; the raw pointers are immutable after init.
unsafe impl Sync for Cpu {}
unsafe impl Send for Cpu {}

static CPUS: Once<Vec<&'static Cpu>> = Once::new();
static BSP_ONLY: Once<&'static Cpu> = Once::new();

impl Cpu {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn apic_id(&self) -> u32 {
        self.apic_id
    }

    /// Sets TSS.rsp0 (and the syscall landing stack) for the next thread.
    pub(crate) fn set_kernel_stack(&self, stack_top: Vaddr) {
        // Safety: the TSS is leaked at init and only written by the CPU
        // that owns it, during a context switch.
        unsafe {
            (*self.tss).privilege_stack_table[0] = VirtAddr::new(stack_top as u64);
        }
    }
}

/// The descriptor of the calling CPU, via the GS base set up at init.
pub fn this_cpu() -> &'static Cpu {
    let ptr: *const Cpu;
    // Safety: GS base points at a leaked Cpu for the lifetime of the
    // kernel once init_bsp/init_ap ran on this core.
    unsafe {
        core::arch::asm!("mov {}, gs:[0]", out(reg) ptr, options(nostack, preserves_flags));
    }
    debug_assert!(!ptr.is_null());
    unsafe { &*ptr }
}

pub fn num_cpus() -> usize {
    CPUS.get().map_or(1, |cpus| cpus.len())
}

pub fn cpu_at(index: usize) -> &'static Cpu {
    CPUS.get().expect("CPU table not built")[index]
}

pub fn all_cpus() -> &'static [&'static Cpu] {
    CPUS.get().map_or(&[], |cpus| cpus.as_slice())
}

/// Publishes the root this CPU is about to load.
pub(crate) fn publish_current_root(root: Paddr) {
    if let Some(cpus) = CPUS.get() {
        cpus[this_cpu().index].current_root.store(root as u64, Ordering::SeqCst);
    } else if let Some(bsp) = BSP_ONLY.get() {
        bsp.current_root.store(root as u64, Ordering::SeqCst);
    }
}

fn build_cpu(index: usize, apic_id: u32) -> &'static Cpu {
    let tss = Box::leak(Box::new(TaskStateSegment::new()));

    // The double-fault handler gets its own known-good stack.
    let ist_stack = Box::leak(Box::new([0u8; 4 * 4096]));
    tss.interrupt_stack_table[handler::DOUBLE_FAULT_IST_INDEX as usize] =
        VirtAddr::new(ist_stack.as_ptr() as u64 + ist_stack.len() as u64);

    let tss_rsp0_ptr = &mut tss.privilege_stack_table[0] as *mut VirtAddr as *mut u64;

    let cpu = Box::leak(Box::new(Cpu {
        asm: CpuAsmHeader {
            self_ptr: core::ptr::null(),
            current_uctx: UnsafeCell::new(0),
            _reserved: 0,
            kernel_ret_rsp: UnsafeCell::new(0),
            scratch: UnsafeCell::new(0),
            tss_rsp0_ptr,
        },
        index,
        apic_id,
        current_root: AtomicU64::new(crate::vm::page_table::kernel_root() as u64),
        inbox: SpinLock::new(alloc::collections::VecDeque::new()),
        current_task: UnsafeCell::new(None),
        prev_task: UnsafeCell::new(None),
        idle_task: Once::new(),
        tss,
    }));
    cpu.asm.self_ptr = cpu as *const Cpu;
    cpu
}

/// Builds and loads the GDT/TSS pair for the calling CPU, points GS at
/// its descriptor, and programs the syscall MSRs. The selector layout is
/// part of the contract with trap.S (user CS 0x23, user SS 0x1B).
fn install_cpu(cpu: &'static Cpu) {
    let gdt = Box::leak(Box::new(GlobalDescriptorTable::new()));
    let kernel_cs = gdt.add_entry(Descriptor::kernel_code_segment());
    let kernel_ss = gdt.add_entry(Descriptor::kernel_data_segment());
    let user_ss = gdt.add_entry(Descriptor::user_data_segment());
    let user_cs = gdt.add_entry(Descriptor::user_code_segment());
    // Safety: the TSS is leaked, so the reference lives forever.
    let tss_sel = gdt.add_entry(Descriptor::tss_segment(unsafe { &*cpu.tss }));
    gdt.load();

    debug_assert_eq!(kernel_cs, SegmentSelector::new(1, x86_64::PrivilegeLevel::Ring0));
    debug_assert_eq!(user_cs.0, 0x23);
    debug_assert_eq!(user_ss.0, 0x1B);

    // Safety: selectors refer to the GDT just loaded.
    unsafe {
        CS::set_reg(kernel_cs);
        SS::set_reg(kernel_ss);
        DS::set_reg(SegmentSelector(0));
        ES::set_reg(SegmentSelector(0));
        load_tss(tss_sel);
    }

    GsBase::write(VirtAddr::new(cpu as *const Cpu as u64));

    handler::load();
    handler::init_syscall_msrs(kernel_cs, kernel_ss, user_cs, user_ss);
    apic::enable();
}

/// Boot-CPU initialization; the IPI vectors are hooked up here too.
pub(crate) fn init_bsp() {
    apic::init();
    let bsp = build_cpu(0, apic::local_id());
    BSP_ONLY.call_once(|| bsp);
    install_cpu(bsp);

    trap::register_irq_callback(trap::VECTOR_IPI_MESSAGE, |_ctx: &IrqContext| {
        process_messages();
    });
    // The wake vector exists only to kick a CPU out of `hlt`.
    trap::register_irq_callback(trap::VECTOR_IPI_WAKE, |_ctx: &IrqContext| {});
}

// ---------------------------------------------------------------------
// Messaging
// ---------------------------------------------------------------------

fn deliver(target: &'static Cpu, message: Arc<CpuMessage>) {
    target.inbox.lock_irq_disabled().push_back(message);
    apic::send_ipi(target.apic_id, trap::VECTOR_IPI_MESSAGE);
}

/// Sends a message and suspends until the target acknowledges it.
fn send_and_wait(target: &'static Cpu, kind: MessageKind) {
    let message = Arc::new(CpuMessage {
        kind,
        ack: AtomicBool::new(false),
        waiter: SpinLock::new(crate::task::try_current()),
    });
    deliver(target, message.clone());

    while !message.ack.load(Ordering::Acquire) {
        if crate::task::try_current().is_some() {
            crate::task::suspend();
        } else {
            core::hint::spin_loop();
        }
    }
}

/// Drains the calling CPU's inbox; runs in the message-IPI handler.
pub(crate) fn process_messages() {
    let cpu = this_cpu();
    loop {
        let Some(message) = cpu.inbox.lock_irq_disabled().pop_front() else {
            return;
        };
        match message.kind {
            MessageKind::InvlpgPage { root, vaddr } => {
                if cpu.current_root.load(Ordering::SeqCst) == root as u64 {
                    crate::arch::x86::mm::tlb_flush(vaddr);
                }
            }
            MessageKind::InvlpgAll { root } => {
                if cpu.current_root.load(Ordering::SeqCst) == root as u64 {
                    crate::arch::x86::mm::tlb_flush_all();
                }
            }
            MessageKind::SignalDelivered => {}
            MessageKind::Halt => loop {
                x86_64::instructions::interrupts::disable();
                x86_64::instructions::hlt();
            },
        }
        message.ack.store(true, Ordering::Release);
        let waiter = message.waiter.lock_irq_disabled().take();
        if let Some(waiter) = waiter {
            crate::task::wake(&waiter);
        }
    }
}

/// Invalidate one page on every CPU whose published root matches (all
/// CPUs for kernel-half addresses, which every root shares).
pub(crate) fn shootdown_page(root: Paddr, vaddr: Vaddr) {
    let Some(cpus) = CPUS.get() else {
        return;
    };
    let me = this_cpu().index;
    for cpu in cpus.iter() {
        if cpu.index == me {
            continue;
        }
        let matches = vaddr >= KERNEL_HALF_BASE
            || cpu.current_root.load(Ordering::SeqCst) == root as u64;
        if matches {
            send_and_wait(cpu, MessageKind::InvlpgPage { root, vaddr });
        }
    }
}

/// Full-TLB shootdown for a root.
pub(crate) fn shootdown_all(root: Paddr) {
    let Some(cpus) = CPUS.get() else {
        return;
    };
    let me = this_cpu().index;
    for cpu in cpus.iter() {
        if cpu.index != me && cpu.current_root.load(Ordering::SeqCst) == root as u64 {
            send_and_wait(cpu, MessageKind::InvlpgAll { root });
        }
    }
}

/// Tells every CPU running on `root` that a signal is now pending there.
pub fn notify_signalled_root(root: Paddr) {
    let Some(cpus) = CPUS.get() else {
        return;
    };
    let me = this_cpu().index;
    for cpu in cpus.iter() {
        if cpu.index != me && cpu.current_root.load(Ordering::SeqCst) == root as u64 {
            send_and_wait(cpu, MessageKind::SignalDelivered);
        }
    }
}

/// Kicks a halted CPU awake.
pub(crate) fn wake_cpu(index: usize) {
    if let Some(cpus) = CPUS.get() {
        apic::send_ipi(cpus[index].apic_id, trap::VECTOR_IPI_WAKE);
    }
}

/// Panic path: stop all other CPUs, without waiting for anything.
pub(crate) fn halt_others() {
    let Some(cpus) = CPUS.get() else {
        return;
    };
    let me = this_cpu().index;
    for cpu in cpus.iter() {
        if cpu.index != me {
            deliver(
                cpu,
                Arc::new(CpuMessage {
                    kind: MessageKind::Halt,
                    ack: AtomicBool::new(false),
                    waiter: SpinLock::new(None),
                }),
            );
        }
    }
}

// ---------------------------------------------------------------------
// AP bring-up
// ---------------------------------------------------------------------

/// Discovers the application processors and finalizes the CPU table.
/// Must run before the scheduler sizes its per-CPU queues.
pub(crate) fn register_cpus() {
    let apic_ids = ap_boot::detect_aps();
    let bsp = *BSP_ONLY.get().unwrap();

    let mut cpus: Vec<&'static Cpu> = Vec::new();
    cpus.push(bsp);
    for (offset, apic_id) in apic_ids.iter().copied().enumerate() {
        if cpus.len() >= MAX_CPUS {
            log::warn!("cpu: ignoring CPUs beyond the configured maximum");
            break;
        }
        cpus.push(build_cpu(offset + 1, apic_id));
    }
    CPUS.call_once(|| cpus);
}

/// Boots every registered AP. The scheduler must be up: the APs dive
/// straight into their idle loops.
pub(crate) fn start_aps() {
    let count = num_cpus();
    if count > 1 {
        ap_boot::start_all();
    }
    log::info!("cpu: {} CPUs online", count);
}

/// Rust-side entry for an application processor, jumped to from the
/// trampoline on its fresh kernel stack.
pub(crate) fn ap_main(index: usize) -> ! {
    let cpu = cpu_at(index);
    install_cpu(cpu);
    crate::vm::page_table::set_root(crate::vm::page_table::kernel_root());
    crate::task::init_local_ap();
    crate::timer::init_local();
    ap_boot::signal_online();
    // Become this CPU's idle loop; the scheduler takes over from here.
    crate::task::idle_loop();
}

pub(crate) const AP_KERNEL_STACK_SIZE: usize = KERNEL_STACK_SIZE;
