//! Waking the application processors.
//!
//! The 16-bit trampoline in ap_boot.S is copied to low memory together
//! with a temporary GDT, an identity-mapping PML4 and a data page used to
//! handshake with each AP in turn.

use alloc::vec::Vec;

use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use acpi::platform::ProcessorState;
use acpi::{AcpiHandler, AcpiTables, PhysicalMapping};

use crate::arch::x86::apic;
use crate::config::{AP_TRAMPOLINE_CODE, AP_TRAMPOLINE_DATA, ENTRY_COUNT, PAGE_SIZE};
use crate::vm::page_table::{self, MapFlags};
use crate::vm::Paddr;

core::arch::global_asm!(include_str!("ap_boot.S"));

extern "C" {
    fn __ap_trampoline_start();
    fn __ap_trampoline_end();
}

/// Low-memory layout, continuing the trampoline code/data convention.
const LOW_PML4: Paddr = 0xC000;
const LOW_GDT: Paddr = 0xD000;
const LOW_PDPT: Paddr = 0xE000;
const LOW_PD: Paddr = 0xF000;

/// The handshake page at 0xB000; offsets are shared with ap_boot.S.
#[repr(C, packed)]
struct TrampolineData {
    flag_ap2bsp: u32,  // 0x00
    flag_bsp2ap: u32,  // 0x04
    flag_ap_done: u32, // 0x08
    _pad0: u32,
    gdt_limit: u16, // 0x10
    gdt_base: u32,  // 0x12
    _pad1: [u8; 10],
    pml4_phys: u32, // 0x20
    _pad2: u32,
    entry64: u64,   // 0x28
    stack_top: u64, // 0x30
}

#[derive(Clone)]
struct DirectAcpiHandler;

impl AcpiHandler for DirectAcpiHandler {
    unsafe fn map_physical_region<T>(
        &self,
        physical_address: usize,
        size: usize,
    ) -> PhysicalMapping<Self, T> {
        // ACPI tables live outside the usable regions, so each one gets a
        // (never reclaimed) kernel window.
        let vaddr = page_table::map_phys(physical_address, size, MapFlags::empty())
            .expect("failed to map ACPI table");
        PhysicalMapping::new(
            physical_address,
            NonNull::new(vaddr as *mut T).unwrap(),
            size,
            size,
            self.clone(),
        )
    }

    fn unmap_physical_region<T>(_region: &PhysicalMapping<Self, T>) {}
}

/// Reads the MADT for the APIC IDs of every enabled AP.
pub(super) fn detect_aps() -> Vec<u32> {
    let Some(rsdp) = crate::boot::rsdp_phys() else {
        log::info!("cpu: no RSDP from the bootloader, staying uniprocessor");
        return Vec::new();
    };
    // Safety: the bootloader vouches for the RSDP address.
    let tables = match unsafe { AcpiTables::from_rsdp(DirectAcpiHandler, rsdp as usize) } {
        Ok(tables) => tables,
        Err(err) => {
            log::warn!("cpu: ACPI parse failed ({:?}), staying uniprocessor", err);
            return Vec::new();
        }
    };
    let Ok(platform_info) = tables.platform_info() else {
        return Vec::new();
    };
    let Some(processor_info) = platform_info.processor_info else {
        return Vec::new();
    };

    let bsp_apic_id = apic::local_id();
    processor_info
        .application_processors
        .iter()
        .filter(|ap| ap.state == ProcessorState::WaitingForSipi)
        .map(|ap| ap.local_apic_id)
        .filter(|&id| id != bsp_apic_id)
        .collect()
}

/// Index of the AP currently being started; read by `ap_entry_asm`.
static BOOTING_INDEX: AtomicUsize = AtomicUsize::new(0);
static ONLINE_FLAG: AtomicUsize = AtomicUsize::new(0);

extern "C" fn ap_entry_asm() -> ! {
    let index = BOOTING_INDEX.load(Ordering::SeqCst);
    super::ap_main(index);
}

pub(super) fn signal_online() {
    ONLINE_FLAG.store(1, Ordering::SeqCst);
}

/// Boots every registered AP, one at a time.
pub(super) fn start_all() {
    let window = page_table::map_phys(AP_TRAMPOLINE_CODE, 0x6000, MapFlags::WRITE)
        .expect("failed to map the trampoline area");
    let low = |paddr: Paddr| window + (paddr - AP_TRAMPOLINE_CODE);

    // Trampoline code page.
    let code_len = __ap_trampoline_end as usize - __ap_trampoline_start as usize;
    assert!(code_len <= PAGE_SIZE);
    // Safety: the window maps the conventional low pages, which nothing
    // else uses at this point.
    unsafe {
        core::ptr::copy_nonoverlapping(
            __ap_trampoline_start as usize as *const u8,
            low(AP_TRAMPOLINE_CODE) as *mut u8,
            code_len,
        );
    }

    // Temporary GDT: null, 64-bit code, data.
    let gdt = low(LOW_GDT) as *mut u64;
    // Safety: as above.
    unsafe {
        gdt.write(0);
        gdt.add(1).write(0x0020_9A00_0000_0000);
        gdt.add(2).write(0x0000_9200_0000_0000);
    }

    // Identity-map the first gigabyte with 2 MiB pages, and pull in the
    // shared upper half so the trampoline can jump to the kernel entry.
    // Safety: writes go through the mapped window into otherwise unused
    // low pages.
    unsafe {
        let pml4 = low(LOW_PML4) as *mut u64;
        core::ptr::write_bytes(pml4 as *mut u8, 0, PAGE_SIZE);
        pml4.write(LOW_PDPT as u64 | 0x3);

        // The kernel root predates the frame pool, so it gets its own
        // window rather than a direct-map pointer.
        let root_window =
            page_table::map_phys(page_table::kernel_root(), PAGE_SIZE, MapFlags::empty())
                .expect("failed to map the kernel root");
        let kernel_top = root_window as *const u64;
        for index in ENTRY_COUNT / 2..ENTRY_COUNT {
            pml4.add(index).write(kernel_top.add(index).read());
        }

        let pdpt = low(LOW_PDPT) as *mut u64;
        core::ptr::write_bytes(pdpt as *mut u8, 0, PAGE_SIZE);
        pdpt.write(LOW_PD as u64 | 0x3);

        let pd = low(LOW_PD) as *mut u64;
        for i in 0..ENTRY_COUNT {
            pd.add(i).write((i as u64 * 0x20_0000) | 0x83);
        }
    }

    let data = low(AP_TRAMPOLINE_DATA) as *mut TrampolineData;
    let sipi_vector = (AP_TRAMPOLINE_CODE >> 12) as u8;

    for cpu in super::all_cpus().iter().skip(1) {
        // A fresh kernel stack for the AP's startup flow.
        let stack = alloc::vec![0u8; super::AP_KERNEL_STACK_SIZE].leak();
        let stack_top = stack.as_ptr() as u64 + stack.len() as u64;

        BOOTING_INDEX.store(cpu.index(), Ordering::SeqCst);
        ONLINE_FLAG.store(0, Ordering::SeqCst);

        // Safety: window-mapped data page; the AP only reads it after the
        // SIPI below.
        unsafe {
            core::ptr::write_volatile(
                data,
                TrampolineData {
                    flag_ap2bsp: 0,
                    flag_bsp2ap: 0,
                    flag_ap_done: 0,
                    _pad0: 0,
                    gdt_limit: 23,
                    gdt_base: LOW_GDT as u32,
                    _pad1: [0; 10],
                    pml4_phys: LOW_PML4 as u32,
                    _pad2: 0,
                    entry64: ap_entry_asm as usize as u64,
                    stack_top,
                },
            );
        }

        log::info!("cpu: starting AP {} (APIC id {})", cpu.index(), cpu.apic_id());

        apic::send_init(cpu.apic_id());
        crate::timer::busy_wait_nanos(10_000_000);
        apic::send_sipi(cpu.apic_id(), sipi_vector);
        crate::timer::busy_wait_nanos(200_000);
        // Safety: volatile poll of the handshake flag.
        if unsafe { core::ptr::read_volatile(core::ptr::addr_of!((*data).flag_ap2bsp)) } == 0 {
            apic::send_sipi(cpu.apic_id(), sipi_vector);
        }
        while unsafe { core::ptr::read_volatile(core::ptr::addr_of!((*data).flag_ap2bsp)) } == 0 {
            core::hint::spin_loop();
        }

        // Let the AP proceed past the trampoline, then wait until it has
        // read everything it needs from the data page.
        unsafe {
            core::ptr::write_volatile(core::ptr::addr_of_mut!((*data).flag_bsp2ap), 1);
        }
        while unsafe { core::ptr::read_volatile(core::ptr::addr_of!((*data).flag_ap_done)) } == 0 {
            core::hint::spin_loop();
        }

        // Finally wait for the Rust side to finish its local init, so the
        // shared BOOTING_INDEX can be reused.
        while ONLINE_FLAG.load(Ordering::SeqCst) == 0 {
            core::hint::spin_loop();
        }
    }
}
