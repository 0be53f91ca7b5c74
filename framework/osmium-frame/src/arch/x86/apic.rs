//! The local xAPIC, accessed through its MMIO register block.

use spin::Once;
use volatile::Volatile;
use x86_64::registers::model_specific::Msr;

use crate::vm::page_table;

const IA32_APIC_BASE: u32 = 0x1B;
const APIC_BASE_MASK: u64 = 0xF_FFFF_F000;

/// Register offsets within the 4 KiB xAPIC window.
const REG_ID: usize = 0x20;
const REG_EOI: usize = 0xB0;
const REG_SPURIOUS: usize = 0xF0;
const REG_ICR_LOW: usize = 0x300;
const REG_ICR_HIGH: usize = 0x310;
const REG_LVT_TIMER: usize = 0x320;
const REG_TIMER_INIT_COUNT: usize = 0x380;
const REG_TIMER_CURRENT_COUNT: usize = 0x390;
const REG_TIMER_DIVIDE: usize = 0x3E0;

static APIC_MMIO_BASE: Once<usize> = Once::new();

/// Maps the xAPIC register window; call once on the BSP before any other
/// function here runs on any CPU (the window is shared by all of them).
pub(crate) fn init() {
    // Safety: reading IA32_APIC_BASE is side-effect free.
    let base_phys = unsafe { Msr::new(IA32_APIC_BASE).read() } & APIC_BASE_MASK;
    let base = page_table::map_phys(
        base_phys as usize,
        0x1000,
        crate::vm::MapFlags::WRITE | crate::vm::MapFlags::NO_CACHE,
    )
    .expect("failed to map the xAPIC window");
    APIC_MMIO_BASE.call_once(|| base);
    enable();
}

/// Sets the spurious-interrupt vector and the software-enable bit. Each CPU
/// runs this for its own local APIC.
pub(crate) fn enable() {
    write(REG_SPURIOUS, 0x100 | crate::trap::VECTOR_SPURIOUS as u32);
}

fn reg(offset: usize) -> Volatile<&'static mut u32> {
    let base = *APIC_MMIO_BASE.get().expect("xAPIC not mapped yet");
    // Safety: the window is mapped uncached in `init` and offsets are the
    // architecturally defined registers.
    Volatile::new(unsafe { &mut *((base + offset) as *mut u32) })
}

pub(crate) fn read(offset: usize) -> u32 {
    reg(offset).read()
}

pub(crate) fn write(offset: usize, value: u32) {
    reg(offset).write(value);
}

/// The local APIC ID of the calling CPU.
pub(crate) fn local_id() -> u32 {
    read(REG_ID) >> 24
}

pub(crate) fn eoi() {
    write(REG_EOI, 0);
}

/// Sends a fixed-vector IPI to the CPU with the given APIC ID.
pub(crate) fn send_ipi(apic_id: u32, vector: u8) {
    write(REG_ICR_HIGH, apic_id << 24);
    write(REG_ICR_LOW, vector as u32);
    while read(REG_ICR_LOW) & (1 << 12) != 0 {
        core::hint::spin_loop();
    }
}

/// INIT IPI, the first step of waking an application processor.
pub(crate) fn send_init(apic_id: u32) {
    write(REG_ICR_HIGH, apic_id << 24);
    write(REG_ICR_LOW, 0x0000_4500);
}

/// STARTUP IPI pointing at `vector << 12` in low memory.
pub(crate) fn send_sipi(apic_id: u32, vector: u8) {
    write(REG_ICR_HIGH, apic_id << 24);
    write(REG_ICR_LOW, 0x0000_4600 | vector as u32);
}

/// Divide-by-16, matching the calibration in the timer module.
pub(crate) fn set_timer_divide_16() {
    write(REG_TIMER_DIVIDE, 0x3);
}

pub(crate) fn set_lvt_timer(value: u32) {
    write(REG_LVT_TIMER, value);
}

pub(crate) fn set_timer_init_count(value: u32) {
    write(REG_TIMER_INIT_COUNT, value);
}

pub(crate) fn timer_current_count() -> u32 {
    read(REG_TIMER_CURRENT_COUNT)
}
